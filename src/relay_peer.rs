use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt::Debug;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::bail;
use anyhow::Result;
use futures::sink::SinkExt;
use futures::stream::TryStream;
use futures::stream::TryStreamExt;
use futures::FutureExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::select;
use tokio::sync::mpsc;
use tokio_serde::formats::Bincode;
use tokio_serde::formats::SymmetricalBincode;
use tokio_serde::SymmetricallyFramed;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::connect_to_peers::codec_rules;
use crate::models::blockchain::Block;
use crate::models::blockchain::Transaction;
use crate::models::peer::own_subversion;
use crate::models::relay::RelayMessage;
use crate::models::state::NodeState;
use crate::peer_loop::handle_untrusted_block;
use crate::peer_loop::handle_untrusted_transaction;
use crate::peers::PEER_OUTBOUND_CHANNEL_CAPACITY;
use crate::trusted::force_disconnect_all_trusted;

pub(crate) type RelayStream<S> =
    SymmetricallyFramed<Framed<S, LengthDelimitedCodec>, RelayMessage, Bincode<RelayMessage, RelayMessage>>;

pub(crate) fn framed_relay_stream<S>(stream: S) -> RelayStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    SymmetricallyFramed::new(Framed::new(stream, codec_rules()), SymmetricalBincode::default())
}

static NEXT_RELAY_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

/// Outbound queue of one inbound relay-protocol client.
#[derive(Clone, Debug)]
pub struct RelayClientHandle {
    id: u64,
    address: SocketAddr,
    sender: mpsc::Sender<RelayMessage>,
}

impl RelayClientHandle {
    pub fn new(address: SocketAddr, sender: mpsc::Sender<RelayMessage>) -> Self {
        Self {
            id: NEXT_RELAY_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            address,
            sender,
        }
    }

    pub fn channel(address: SocketAddr) -> (Self, mpsc::Receiver<RelayMessage>) {
        let (tx, rx) = mpsc::channel(PEER_OUTBOUND_CHANNEL_CAPACITY);
        (Self::new(address, tx), rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Every client connected on the relay-protocol port. Deduplication on this
/// channel is the relay codec's own concern; the engine just fans out.
#[derive(Clone, Debug, Default)]
pub struct RelayClientGroup {
    clients: Arc<Mutex<HashMap<u64, RelayClientHandle>>>,
}

impl RelayClientGroup {
    pub fn add(&self, client: RelayClientHandle) {
        self.clients.lock().unwrap().insert(client.id, client);
    }

    pub fn remove(&self, client_id: u64) {
        self.clients.lock().unwrap().remove(&client_id);
    }

    pub fn size(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn client_ips(&self) -> HashSet<IpAddr> {
        self.clients
            .lock()
            .unwrap()
            .values()
            .map(|client| client.address.ip())
            .collect()
    }

    pub fn send_block(&self, block: &Block) {
        self.broadcast(RelayMessage::Block(Box::new(block.clone())));
    }

    pub fn send_transaction(&self, transaction: &Transaction) {
        self.broadcast(RelayMessage::Transaction(Box::new(transaction.clone())));
    }

    fn broadcast(&self, message: RelayMessage) {
        let snapshot: Vec<RelayClientHandle> =
            self.clients.lock().unwrap().values().cloned().collect();
        for client in snapshot {
            if let Err(e) = client.sender.try_send(message.clone()) {
                trace!("Dropping relay message to {}: {}", client.address, e);
            }
        }
    }
}

/// Dial a sibling relay node on the compact side channel and keep the link
/// alive: any disconnect schedules a redial in a second unless the operator
/// marked the peer for removal.
pub fn spawn_relay_peer_connection(state: NodeState, address: SocketAddr) {
    state.relay_peer_registry.note_waiting(address);
    tokio::spawn(async move {
        loop {
            let state_clone = state.clone();
            let panic_result = std::panic::AssertUnwindSafe(async {
                match tokio::net::TcpStream::connect(address).await {
                    Err(e) => {
                        warn!("Failed to reach relay peer {}: {}", address, e);
                    }
                    Ok(stream) => match run_relay_peer_client(stream, state_clone, address).await {
                        Ok(()) => info!("Relay peer {} closed connection", address),
                        Err(e) => debug!("Relay peer connection {} failed: {:#}", address, e),
                    },
                }
            })
            .catch_unwind()
            .await;
            if panic_result.is_err() {
                state
                    .logger
                    .log_line(format!("Uncaught panic in relay peer task for {address}"));
            }

            if !state.relay_peer_registry.note_disconnected(address) {
                break;
            }
            tokio::time::sleep(crate::RECONNECT_DELAY).await;
        }
    });
}

async fn run_relay_peer_client<S>(stream: S, state: NodeState, address: SocketAddr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Debug + Unpin,
{
    let mut framed = framed_relay_stream(stream);
    framed.send(RelayMessage::Version(own_subversion())).await?;
    match framed.try_next().await? {
        Some(RelayMessage::Version(subversion)) => {
            info!("Relay peer {} is up: {}", address, subversion);
        }
        other => bail!("Expected relay version message, got {:?}", other),
    }
    state.relay_peer_registry.note_connected(address);

    relay_peer_loop(framed, state, address).await
}

/// Receive loop of the outbound relay-peer link. Block headers and
/// transactions are not shipped on the side channel; stats lines accumulate
/// and ride along with the next block's log entry.
pub(crate) async fn relay_peer_loop<S>(mut peer: S, state: NodeState, address: SocketAddr) -> Result<()>
where
    S: TryStream<Ok = RelayMessage> + Unpin,
    <S as TryStream>::Error: std::error::Error + Send + Sync + 'static,
{
    let mut recv_stats = String::new();
    loop {
        match peer.try_next().await? {
            None => break,
            Some(RelayMessage::Stats(lines)) => {
                for line in lines.lines() {
                    recv_stats.push_str("STATS: ");
                    recv_stats.push_str(line);
                    recv_stats.push('\n');
                }
            }
            Some(RelayMessage::Block(block)) => {
                let stats = std::mem::take(&mut recv_stats);
                let state = state.clone();
                tokio::spawn(async move {
                    handle_relay_peer_block(state, *block, address, stats).await;
                });
            }
            Some(RelayMessage::BlockHeader(_)) | Some(RelayMessage::Transaction(_)) => (),
            Some(RelayMessage::Version(_)) => {
                trace!("Ignoring repeated version from relay peer {}", address);
            }
        }
    }
    Ok(())
}

/// A sibling relay node shipped us a full block: echo it to our own relay
/// clients, push it to the validators, broadcast to block clients, and log.
/// If its header does not connect, our chain view has drifted from what the
/// relay peer ships; bounce every trusted connection to resync.
pub(crate) async fn handle_relay_peer_block(
    state: NodeState,
    block: Block,
    address: SocketAddr,
    stats: String,
) {
    let hash = block.hash();
    state.relay_clients.send_block(&block);
    state.block_pool.provide_object(block.clone());
    state.block_pool.inv_good(&state.blocks_clients, hash);
    state
        .relay_log
        .log_block_relay(hash, "relay peer", address.ip(), Some(&stats))
        .await;

    let added = state.header_chain.lock().unwrap().add_header(&block.header);
    if let Err(e) = added {
        warn!("Failed to connect header from relay peer {}: {}", address, e);
        state.logger.log_line(format!(
            "WARNING: Exception adding block from relay peer {address}"
        ));
        force_disconnect_all_trusted(&state);
    }
}

/// One inbound connection on the relay-protocol port. Outbound direction is
/// the echo feed; inbound blocks and transactions go through the same
/// untrusted ingress logic as the P2P ports, tagged as relay-protocol
/// traffic.
pub async fn answer_relay_client_wrapper(
    stream: tokio::net::TcpStream,
    state: NodeState,
    peer_address: SocketAddr,
) {
    let (handle, outbound_rx) = RelayClientHandle::channel(peer_address);
    let client_id = handle.id();
    state.relay_clients.add(handle);

    let state_clone = state.clone();
    let mut inner_ret: Result<()> = Ok(());
    let panic_result = std::panic::AssertUnwindSafe(async {
        inner_ret = answer_relay_client(stream, state_clone, peer_address, outbound_rx).await;
    })
    .catch_unwind()
    .await;
    if panic_result.is_err() {
        state
            .logger
            .log_line(format!("Uncaught panic in relay client task for {peer_address}"));
    }

    state.relay_clients.remove(client_id);
    match inner_ret {
        Ok(()) => info!("Relay client {} disconnected", peer_address),
        Err(e) => debug!("Relay client connection {} failed: {:#}", peer_address, e),
    }
}

async fn answer_relay_client<S>(
    stream: S,
    state: NodeState,
    peer_address: SocketAddr,
    mut outbound_rx: mpsc::Receiver<RelayMessage>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Debug + Unpin,
{
    let mut framed = framed_relay_stream(stream);
    match framed.try_next().await? {
        Some(RelayMessage::Version(subversion)) => {
            info!("Relay client {} connected: {}", peer_address, subversion);
        }
        other => bail!("Expected relay version message, got {:?}", other),
    }
    framed.send(RelayMessage::Version(own_subversion())).await?;

    loop {
        select! {
            message = framed.try_next() => {
                match message? {
                    None => break,
                    Some(RelayMessage::Block(block)) => {
                        let state = state.clone();
                        let remote = peer_address.ip();
                        tokio::spawn(async move {
                            handle_untrusted_block(state, *block, "relay SPV", remote).await;
                        });
                    }
                    Some(RelayMessage::Transaction(transaction)) => {
                        handle_untrusted_transaction(&state, *transaction);
                    }
                    Some(message) => {
                        trace!("Ignoring {} from relay client {}", message.get_type(), peer_address);
                    }
                }
            }
            Some(outgoing) = outbound_rx.recv() => {
                framed.send(outgoing).await?;
            }
        }
    }
    Ok(())
}
