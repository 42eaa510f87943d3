use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;

use super::blockchain::Block;
use super::blockchain::Transaction;
use crate::header_chain::HeaderChain;
use crate::peers::PeerGroup;
use crate::pool::ObjectPool;
use crate::pool::BLOCK_RELAYED_CACHE_SIZE;
use crate::pool::TX_RELAYED_CACHE_SIZE;
use crate::relay_log::RelayLog;
use crate::relay_peer::RelayClientGroup;
use crate::trusted::TrustedPeer;

/// Queue of pending lines for the status printer. Everything the operator is
/// supposed to see goes through here; the printer owns stdout.
#[derive(Clone, Debug, Default)]
pub struct TuiLogger {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl TuiLogger {
    pub fn log_line(&self, line: impl Into<String>) {
        self.lines
            .lock()
            .unwrap_or_else(|e| panic!("Failed to lock TUI line queue: {}", e))
            .push_back(line.into());
    }

    pub fn drain(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|e| panic!("Failed to lock TUI line queue: {}", e))
            .drain(..)
            .collect()
    }
}

/// Connection bookkeeping for an operator-added peer class that reconnects on
/// its own: relay peers and outbound Bitcoin P2P peers each get one of these.
#[derive(Clone, Debug, Default)]
pub struct ReconnectRegistry {
    connected: Arc<Mutex<HashSet<SocketAddr>>>,
    waiting_on_reconnection: Arc<Mutex<HashSet<SocketAddr>>>,
    marked_for_disconnect: Arc<Mutex<HashSet<SocketAddr>>>,
}

impl ReconnectRegistry {
    /// Register an address that is about to be dialed. Clears any stale
    /// removal mark left over from an earlier `-` command.
    pub fn note_waiting(&self, address: SocketAddr) {
        self.marked_for_disconnect.lock().unwrap().remove(&address);
        self.waiting_on_reconnection.lock().unwrap().insert(address);
    }

    pub fn note_connected(&self, address: SocketAddr) {
        self.connected.lock().unwrap().insert(address);
        self.waiting_on_reconnection.lock().unwrap().remove(&address);
    }

    /// Record a disconnect. Returns true iff the caller should schedule a
    /// reconnection attempt.
    pub fn note_disconnected(&self, address: SocketAddr) -> bool {
        self.connected.lock().unwrap().remove(&address);
        if self.marked_for_disconnect.lock().unwrap().contains(&address) {
            return false;
        }
        self.waiting_on_reconnection.lock().unwrap().insert(address);
        true
    }

    pub fn mark_for_disconnect(&self, address: SocketAddr) {
        self.marked_for_disconnect.lock().unwrap().insert(address);
    }

    /// Whether the address is currently connected or awaiting reconnection.
    pub fn is_known(&self, address: &SocketAddr) -> bool {
        self.connected.lock().unwrap().contains(address)
            || self.waiting_on_reconnection.lock().unwrap().contains(address)
    }

    pub fn connected_snapshot(&self) -> Vec<SocketAddr> {
        self.connected.lock().unwrap().iter().copied().collect()
    }

    pub fn waiting_snapshot(&self) -> Vec<SocketAddr> {
        self.waiting_on_reconnection
            .lock()
            .unwrap()
            .iter()
            .copied()
            .collect()
    }
}

pub type TrustedPeerMap = Arc<Mutex<HashMap<IpAddr, Arc<TrustedPeer>>>>;

/// Everything the relay engine's tasks share. Cloning is cheap; all fields
/// are handles onto the same underlying state.
#[derive(Clone)]
pub struct NodeState {
    pub block_pool: Arc<ObjectPool<Block>>,
    pub tx_pool: Arc<ObjectPool<Transaction>>,

    /// Outbound sessions of all trusted validators; `provide_object` pushes
    /// unvetted data here.
    pub trusted_outbound_peers: PeerGroup,

    /// Untrusted clients subscribed to blocks, and the subset additionally
    /// subscribed to transactions.
    pub blocks_clients: PeerGroup,
    pub txn_clients: PeerGroup,

    pub relay_clients: RelayClientGroup,

    pub header_chain: Arc<Mutex<HeaderChain>>,
    pub relay_log: Arc<RelayLog>,

    pub trusted_peers: TrustedPeerMap,
    pub relay_peer_registry: ReconnectRegistry,
    pub outbound_p2p_registry: ReconnectRegistry,

    pub logger: TuiLogger,
}

impl NodeState {
    pub fn new(relay_log: RelayLog, logger: TuiLogger) -> Self {
        let trusted_outbound_peers = PeerGroup::default();
        let block_pool = Arc::new(ObjectPool::new(
            BLOCK_RELAYED_CACHE_SIZE,
            trusted_outbound_peers.clone(),
        ));
        let tx_pool = Arc::new(ObjectPool::new(
            TX_RELAYED_CACHE_SIZE,
            trusted_outbound_peers.clone(),
        ));

        Self {
            block_pool,
            tx_pool,
            trusted_outbound_peers,
            blocks_clients: PeerGroup::default(),
            txn_clients: PeerGroup::default(),
            relay_clients: RelayClientGroup::default(),
            header_chain: Arc::new(Mutex::new(HeaderChain::new())),
            relay_log: Arc::new(relay_log),
            trusted_peers: Arc::new(Mutex::new(HashMap::new())),
            relay_peer_registry: ReconnectRegistry::default(),
            outbound_p2p_registry: ReconnectRegistry::default(),
            logger,
        }
    }

    /// Start the per-pool TTL eviction tasks. Called once after construction.
    pub fn spawn_pool_eviction_tasks(&self) {
        self.block_pool.spawn_eviction_task();
        self.tx_pool.spawn_eviction_task();
    }
}
