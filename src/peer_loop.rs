use std::net::IpAddr;
use std::net::SocketAddr;

use anyhow::bail;
use anyhow::Result;
use futures::sink::Sink;
use futures::sink::SinkExt;
use futures::stream::TryStream;
use futures::stream::TryStreamExt;
use tokio::select;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::trace;

use crate::models::blockchain::Block;
use crate::models::blockchain::Transaction;
use crate::models::blockchain::TransactionVerificationError;
use crate::models::peer::InventoryKind;
use crate::models::peer::PeerMessage;
use crate::models::peer::RELAY_PROTOCOL_MARKER;
use crate::models::state::NodeState;
use crate::peers::PeerAndInvs;

/// Ingress logic for one unvetted peer: an inbound client on either client
/// port, or an operator-added outbound Bitcoin P2P connection.
pub struct UntrustedPeerLoopHandler {
    state: NodeState,
    peer_address: SocketAddr,
    peer_subversion: String,
    member: PeerAndInvs,
}

impl UntrustedPeerLoopHandler {
    pub fn new(
        state: NodeState,
        peer_address: SocketAddr,
        peer_subversion: String,
        member: PeerAndInvs,
    ) -> Self {
        Self {
            state,
            peer_address,
            peer_subversion,
            member,
        }
    }

    fn source_tag(&self) -> &'static str {
        if self.peer_subversion.contains(RELAY_PROTOCOL_MARKER) {
            "relay SPV"
        } else {
            "p2p SPV"
        }
    }

    /// Drive the connection: inbound messages are dispatched, queued fan-out
    /// messages are written. Inventory bookkeeping runs synchronously before
    /// dispatch so the per-peer view is current by the time anything reacts.
    pub async fn run<S>(&self, mut peer: S, mut outbound_rx: mpsc::Receiver<PeerMessage>) -> Result<()>
    where
        S: Sink<PeerMessage> + TryStream<Ok = PeerMessage> + Unpin,
        <S as Sink<PeerMessage>>::Error: std::error::Error + Send + Sync + 'static,
        <S as TryStream>::Error: std::error::Error + Send + Sync + 'static,
    {
        loop {
            select! {
                peer_message = peer.try_next() => {
                    match peer_message {
                        Ok(None) => {
                            info!("Peer {} closed connection", self.peer_address);
                            break;
                        }
                        Ok(Some(message)) => {
                            self.member.record_inventory(&message);
                            self.handle_peer_message(message, &mut peer).await?;
                        }
                        Err(e) => {
                            bail!("Error receiving from {}: {}. Closing connection.", self.peer_address, e);
                        }
                    }
                }
                Some(outgoing) = outbound_rx.recv() => {
                    peer.send(outgoing).await?;
                }
            }
        }

        Ok(())
    }

    async fn handle_peer_message<S>(&self, message: PeerMessage, peer: &mut S) -> Result<()>
    where
        S: Sink<PeerMessage> + Unpin,
        <S as Sink<PeerMessage>>::Error: std::error::Error + Send + Sync + 'static,
    {
        match message {
            PeerMessage::Inv(items) => {
                let mut getdata = vec![];
                for item in items {
                    let wanted = match item.kind {
                        InventoryKind::Block => self.state.block_pool.should_request_inv(item.hash),
                        InventoryKind::Transaction => {
                            self.state.tx_pool.should_request_inv(item.hash)
                        }
                    };
                    if wanted {
                        getdata.push(item);
                    }
                }
                if !getdata.is_empty() {
                    peer.send(PeerMessage::GetData(getdata)).await?;
                }
            }
            PeerMessage::Block(block) => {
                // Off the receive path; header-chain work must not block the
                // socket.
                let state = self.state.clone();
                let source_tag = self.source_tag();
                let remote = self.peer_address.ip();
                tokio::spawn(async move {
                    handle_untrusted_block(state, *block, source_tag, remote).await;
                });
            }
            PeerMessage::Transaction(transaction) => {
                handle_untrusted_transaction(&self.state, *transaction);
            }
            PeerMessage::Ping(nonce) => {
                peer.send(PeerMessage::Pong(nonce)).await?;
            }
            message => {
                trace!(
                    "Ignoring {} message from {}",
                    message.get_type(),
                    self.peer_address
                );
            }
        }

        Ok(())
    }
}

/// Block received from an unvetted source. The block goes to the validators
/// unconditionally; clients only see it once the header store connects it.
pub(crate) async fn handle_untrusted_block(
    state: NodeState,
    block: Block,
    source_tag: &'static str,
    remote: IpAddr,
) {
    let hash = block.hash();

    // Relay to trusted peers before any local check, just in case we reject
    // something we shouldn't.
    state.block_pool.provide_object(block.clone());

    let header_accepted = {
        let mut chain = state.header_chain.lock().unwrap();
        !chain.contains(&hash) && matches!(chain.add_header(&block.header), Ok(true))
    };
    if !header_accepted {
        // Known or unconnectable: no fan-out, and the peer stays.
        return;
    }

    state.relay_clients.send_block(&block);
    state.block_pool.inv_good(&state.blocks_clients, hash);
    state
        .relay_log
        .log_block_relay(hash, source_tag, remote, None)
        .await;
}

/// Transaction received from an unvetted source. A structural "no inputs or
/// no outputs" failure swallows the message without disconnecting the peer;
/// every other verify failure is ignored at this call site.
pub(crate) fn handle_untrusted_transaction(state: &NodeState, transaction: Transaction) {
    state.tx_pool.provide_object(transaction.clone());

    if let Err(e) = transaction.verify() {
        match e {
            TransactionVerificationError::NoInputsOrOutputs => {
                debug!("Swallowing structurally empty transaction");
            }
            other => {
                trace!("Ignoring transaction verify failure: {}", other);
            }
        }
    }
}
