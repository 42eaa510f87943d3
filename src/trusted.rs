use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use futures::sink::Sink;
use futures::sink::SinkExt;
use futures::stream::TryStreamExt;
use futures::FutureExt;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::connect_to_peers::expect_version;
use crate::connect_to_peers::framed_peer_stream;
use crate::models::peer::own_subversion;
use crate::models::peer::GetHeadersRequest;
use crate::models::peer::HandshakeData;
use crate::models::peer::InventoryKind;
use crate::models::peer::PeerMessage;
use crate::models::state::NodeState;
use crate::peers::PeerHandle;

/// One trusted validator, managed as two simultaneous TCP sessions to the
/// same address: an inbound session we only listen on (its inv/tx/block
/// traffic signals acceptance) and an outbound session we push unvetted data
/// to. The split keeps unvetted data out of the acceptance path: the inbound
/// session belongs to no peer group, and the outbound session is driven by
/// the headers download.
pub struct TrustedPeer {
    address: SocketAddr,
    state: NodeState,
    sessions: Mutex<TrustedSessions>,
    /// Status-panel flags only; inherently racy and not used for decisions.
    inbound_connected: AtomicBool,
    outbound_connected: AtomicBool,
    closed_permanently: AtomicBool,
}

#[derive(Default)]
struct TrustedSessions {
    inbound: Option<SessionHandle>,
    outbound: Option<SessionHandle>,
}

struct SessionHandle {
    task: JoinHandle<()>,
    /// Id of the outbound session's membership in the trusted peer group.
    group_peer_id: Option<u64>,
}

impl TrustedPeer {
    /// Create the connection pair, register it under the validator's IP, and
    /// start connecting.
    pub fn add(state: &NodeState, address: SocketAddr) -> Arc<Self> {
        let peer = Arc::new(Self {
            address,
            state: state.clone(),
            sessions: Mutex::new(TrustedSessions::default()),
            inbound_connected: AtomicBool::new(false),
            outbound_connected: AtomicBool::new(false),
            closed_permanently: AtomicBool::new(false),
        });
        state
            .trusted_peers
            .lock()
            .unwrap()
            .insert(address.ip(), peer.clone());
        peer.connect();
        peer
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_inbound_connected(&self) -> bool {
        self.inbound_connected.load(Ordering::Relaxed)
    }

    pub fn is_outbound_connected(&self) -> bool {
        self.outbound_connected.load(Ordering::Relaxed)
    }

    pub fn has_live_sessions(&self) -> bool {
        let sessions = self.lock_sessions();
        sessions.inbound.is_some() || sessions.outbound.is_some()
    }

    fn connect(self: &Arc<Self>) {
        self.disconnect_sessions();

        let mut sessions = self.lock_sessions();

        let inbound_task = tokio::spawn(run_inbound_session(Arc::clone(self)));
        sessions.inbound = Some(SessionHandle {
            task: inbound_task,
            group_peer_id: None,
        });

        // Join the trusted group before the socket is up; pushes that happen
        // in between queue on the channel and flush once connected.
        let (handle, outbound_rx) = PeerHandle::channel(self.address);
        let group_peer_id = handle.id();
        self.state.trusted_outbound_peers.add(handle);
        let outbound_task = tokio::spawn(run_outbound_session(Arc::clone(self), outbound_rx));
        sessions.outbound = Some(SessionHandle {
            task: outbound_task,
            group_peer_id: Some(group_peer_id),
        });
    }

    /// Tear down whatever halves are up. Safe to call redundantly.
    fn disconnect_sessions(&self) {
        let mut sessions = self.lock_sessions();

        if let Some(session) = sessions.inbound.take() {
            session.task.abort();
        }
        self.inbound_connected.store(false, Ordering::Relaxed);

        if let Some(session) = sessions.outbound.take() {
            session.task.abort();
            if let Some(peer_id) = session.group_peer_id {
                self.state.trusted_outbound_peers.remove(peer_id);
            }
        }
        self.outbound_connected.store(false, Ordering::Relaxed);
    }

    /// Either session dropped: close both and, unless the operator removed
    /// this validator, try again in a second.
    pub fn on_disconnect(self: &Arc<Self>) {
        self.disconnect_sessions();

        if self.closed_permanently.load(Ordering::Relaxed) {
            return;
        }

        let peer = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(crate::RECONNECT_DELAY).await;
            if peer.closed_permanently.load(Ordering::Relaxed) {
                return;
            }
            let reconnect_needed = {
                let sessions = peer.lock_sessions();
                sessions.inbound.is_none() || sessions.outbound.is_none()
            };
            // A concurrently scheduled attempt may have beaten us to it.
            if reconnect_needed {
                peer.connect();
            }
        });
    }

    /// Operator removal: close both sessions for good and drop the map
    /// entry.
    pub fn disconnect_permanently(&self) {
        self.closed_permanently.store(true, Ordering::Relaxed);
        self.disconnect_sessions();
        self.state
            .trusted_peers
            .lock()
            .unwrap()
            .remove(&self.address.ip());
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, TrustedSessions> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| panic!("Failed to lock trusted sessions: {}", e))
    }
}

/// Bounce every trusted connection; their reconnect logic then re-runs the
/// headers download from scratch.
pub fn force_disconnect_all_trusted(state: &NodeState) {
    let peers: Vec<Arc<TrustedPeer>> = state
        .trusted_peers
        .lock()
        .unwrap()
        .values()
        .cloned()
        .collect();
    for peer in peers {
        peer.on_disconnect();
    }
}

async fn run_inbound_session(peer: Arc<TrustedPeer>) {
    let result = std::panic::AssertUnwindSafe(inbound_session(&peer))
        .catch_unwind()
        .await;
    match result {
        Ok(Ok(())) => info!("Trusted inbound session to {} ended", peer.address),
        Ok(Err(e)) => debug!("Trusted inbound session to {} failed: {:#}", peer.address, e),
        Err(_) => peer.state.logger.log_line(format!(
            "Uncaught panic in trusted inbound session for {}",
            peer.address
        )),
    }
    peer.inbound_connected.store(false, Ordering::Relaxed);
    peer.on_disconnect();
}

async fn inbound_session(peer: &Arc<TrustedPeer>) -> Result<()> {
    let stream = tokio::net::TcpStream::connect(peer.address).await?;
    let mut framed = framed_peer_stream(stream);
    framed
        .send(PeerMessage::Version(Box::new(HandshakeData::new(
            own_subversion(),
        ))))
        .await?;
    let _their_handshake = expect_version(&mut framed, peer.address).await?;
    peer.inbound_connected.store(true, Ordering::Relaxed);
    info!("Trusted inbound session to {} is up", peer.address);

    let handler = TrustedInboundHandler::new(peer.state.clone(), peer.address);
    loop {
        match framed.try_next().await? {
            None => break,
            Some(message) => handler.handle_acceptance_message(message, &mut framed).await?,
        }
    }
    Ok(())
}

async fn run_outbound_session(peer: Arc<TrustedPeer>, outbound_rx: mpsc::Receiver<PeerMessage>) {
    let result = std::panic::AssertUnwindSafe(outbound_session(&peer, outbound_rx))
        .catch_unwind()
        .await;
    match result {
        Ok(Ok(())) => info!("Trusted outbound session to {} ended", peer.address),
        Ok(Err(e)) => debug!("Trusted outbound session to {} failed: {:#}", peer.address, e),
        Err(_) => peer.state.logger.log_line(format!(
            "Uncaught panic in trusted outbound session for {}",
            peer.address
        )),
    }
    peer.outbound_connected.store(false, Ordering::Relaxed);
    peer.on_disconnect();
}

async fn outbound_session(
    peer: &Arc<TrustedPeer>,
    mut outbound_rx: mpsc::Receiver<PeerMessage>,
) -> Result<()> {
    let stream = tokio::net::TcpStream::connect(peer.address).await?;
    let mut framed = framed_peer_stream(stream);
    framed
        .send(PeerMessage::Version(Box::new(HandshakeData::new(
            own_subversion(),
        ))))
        .await?;
    let _their_handshake = expect_version(&mut framed, peer.address).await?;
    peer.outbound_connected.store(true, Ordering::Relaxed);
    info!("Trusted outbound session to {} is up", peer.address);

    // Headers-only chain download with no upper bound, so the tip tracks the
    // validator's view.
    framed.send(headers_request(&peer.state)).await?;

    loop {
        select! {
            message = framed.try_next() => {
                match message? {
                    None => break,
                    Some(PeerMessage::Headers(headers)) => {
                        let added = peer
                            .state
                            .header_chain
                            .lock()
                            .unwrap()
                            .add_headers(&headers);
                        debug!("Connected {} of {} headers from {}", added, headers.len(), peer.address);
                        if !headers.is_empty() {
                            framed.send(headers_request(&peer.state)).await?;
                        }
                    }
                    Some(message) => {
                        trace!("Ignoring {} on trusted outbound session", message.get_type());
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

fn headers_request(state: &NodeState) -> PeerMessage {
    let locator_hashes = state.header_chain.lock().unwrap().locator();
    PeerMessage::GetHeaders(GetHeadersRequest {
        locator_hashes,
        stop_hash: Default::default(),
    })
}

/// Reacts to traffic on a trusted inbound session. Everything the validator
/// announces or sends here has been accepted by it and is safe to broadcast.
/// Distinct from the untrusted handler: known-good invs trigger fan-out
/// instead of a getdata.
pub struct TrustedInboundHandler {
    state: NodeState,
    peer_address: SocketAddr,
}

impl TrustedInboundHandler {
    pub fn new(state: NodeState, peer_address: SocketAddr) -> Self {
        Self {
            state,
            peer_address,
        }
    }

    pub async fn handle_acceptance_message<S>(&self, message: PeerMessage, peer: &mut S) -> Result<()>
    where
        S: Sink<PeerMessage> + Unpin,
        <S as Sink<PeerMessage>>::Error: std::error::Error + Send + Sync + 'static,
    {
        match message {
            PeerMessage::Inv(items) => {
                let mut getdata = vec![];
                let mut blocks_good = vec![];
                let mut tx_good = vec![];
                for item in items {
                    match item.kind {
                        InventoryKind::Block => {
                            if self.state.block_pool.should_request_inv(item.hash) {
                                getdata.push(item);
                            } else {
                                blocks_good.push(item.hash);
                            }
                        }
                        InventoryKind::Transaction => {
                            if self.state.tx_pool.should_request_inv(item.hash) {
                                getdata.push(item);
                            } else {
                                tx_good.push(item.hash);
                            }
                        }
                    }
                }

                // Unknown items come back in full over this session and
                // re-enter through the block/tx arms below.
                if !getdata.is_empty() {
                    peer.send(PeerMessage::GetData(getdata)).await?;
                }

                if !blocks_good.is_empty() {
                    let state = self.state.clone();
                    let remote = self.peer_address.ip();
                    tokio::spawn(async move {
                        for hash in blocks_good {
                            if let Some(block) = state.block_pool.get_object(hash) {
                                state.relay_clients.send_block(&block);
                            }
                            state.block_pool.inv_good(&state.blocks_clients, hash);
                            state
                                .relay_log
                                .log_block_relay(hash, "trusted inv", remote, None)
                                .await;
                        }
                    });
                }
                if !tx_good.is_empty() {
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        for hash in tx_good {
                            if let Some(transaction) = state.tx_pool.get_object(hash) {
                                state.relay_clients.send_transaction(&transaction);
                            }
                            state.tx_pool.inv_good(&state.txn_clients, hash);
                        }
                    });
                }
            }
            PeerMessage::Transaction(transaction) => {
                let state = self.state.clone();
                tokio::spawn(async move {
                    let hash = transaction.hash();
                    state.relay_clients.send_transaction(&transaction);
                    state.tx_pool.provide_object(*transaction);
                    state.tx_pool.inv_good(&state.txn_clients, hash);
                });
            }
            PeerMessage::Block(block) => {
                let state = self.state.clone();
                let peer_address = self.peer_address;
                tokio::spawn(async move {
                    let hash = block.hash();
                    state.relay_clients.send_block(&block);
                    state.block_pool.provide_object((*block).clone());
                    state.block_pool.inv_good(&state.blocks_clients, hash);
                    state
                        .relay_log
                        .log_block_relay(hash, "trusted block", peer_address.ip(), None)
                        .await;

                    let added = state.header_chain.lock().unwrap().add_header(&block.header);
                    if let Err(e) = added {
                        warn!("Failed to connect header from trusted peer {}: {}", peer_address, e);
                        state.logger.log_line(format!(
                            "WARNING: Exception adding block from trusted peer {peer_address}"
                        ));
                    }
                });
            }
            message => {
                trace!(
                    "Ignoring {} on trusted inbound session from {}",
                    message.get_type(),
                    self.peer_address
                );
            }
        }

        Ok(())
    }
}
