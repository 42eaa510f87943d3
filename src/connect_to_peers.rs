use std::fmt::Debug;
use std::net::SocketAddr;

use anyhow::bail;
use anyhow::Result;
use futures::sink::SinkExt;
use futures::stream::TryStream;
use futures::stream::TryStreamExt;
use futures::FutureExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio_serde::formats::Bincode;
use tokio_serde::formats::SymmetricalBincode;
use tokio_serde::SymmetricallyFramed;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::models::peer::outbound_p2p_subversion;
use crate::models::peer::HandshakeData;
use crate::models::peer::PeerMessage;
use crate::models::peer::MAINNET_MAGIC;
use crate::models::state::NodeState;
use crate::peer_loop::UntrustedPeerLoopHandler;
use crate::peers::PeerAndInvs;
use crate::peers::PeerHandle;

/// Ceiling on one framed message. Far above any block a validator would
/// accept; a peer shipping a larger frame loses the connection instead of
/// tying up the read buffer.
pub const MAX_PEER_FRAME_LENGTH_IN_BYTES: usize = 200 * 1024 * 1024;

/// Single codec configuration for every socket this node frames: dialed
/// peers, accepted clients, and the relay side channel all enforce the same
/// frame ceiling in both directions.
pub(crate) fn codec_rules() -> LengthDelimitedCodec {
    let mut codec_rules = LengthDelimitedCodec::new();
    codec_rules.set_max_frame_length(MAX_PEER_FRAME_LENGTH_IN_BYTES);
    codec_rules
}

pub(crate) type PeerStream<S> =
    SymmetricallyFramed<Framed<S, LengthDelimitedCodec>, PeerMessage, Bincode<PeerMessage, PeerMessage>>;

pub(crate) fn framed_peer_stream<S>(stream: S) -> PeerStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    SymmetricallyFramed::new(Framed::new(stream, codec_rules()), SymmetricalBincode::default())
}

/// Read the peer's version message off a fresh connection, enforcing the
/// network magic.
pub(crate) async fn expect_version<S>(peer: &mut S, peer_address: SocketAddr) -> Result<HandshakeData>
where
    S: TryStream<Ok = PeerMessage> + Unpin,
    <S as TryStream>::Error: std::error::Error + Send + Sync + 'static,
{
    match peer.try_next().await? {
        Some(PeerMessage::Version(handshake)) => {
            if handshake.network_magic != MAINNET_MAGIC {
                bail!(
                    "Cannot connect with {}: peer is on another network (magic {:#010x})",
                    peer_address,
                    handshake.network_magic
                );
            }
            Ok(*handshake)
        }
        other => {
            bail!("Expected version message from {}, got {:?}", peer_address, other);
        }
    }
}

/// Which client groups an inbound connection joins, decided by the port it
/// arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientMembership {
    BlocksOnly,
    BlocksAndTransactions,
}

/// Handle one inbound client connection while catching panics in the peer
/// task gracefully: the membership registered up front is dropped on every
/// exit path, and nothing propagates to the accept loop.
pub async fn answer_peer_wrapper<S>(
    stream: S,
    state: NodeState,
    peer_address: SocketAddr,
    membership: ClientMembership,
    own_handshake: HandshakeData,
) where
    S: AsyncRead + AsyncWrite + Debug + Unpin,
{
    let (handle, outbound_rx) = PeerHandle::channel(peer_address);
    let peer_id = handle.id();
    let member = PeerAndInvs::new(handle);

    // Join the block group before the transaction group so a block relayed
    // during registration cannot bounce back to its sender.
    state.blocks_clients.add_member(member.clone());
    if membership == ClientMembership::BlocksAndTransactions {
        state.txn_clients.add_member(member.clone());
    }

    let state_clone = state.clone();
    let mut inner_ret: Result<()> = Ok(());
    let panic_result = std::panic::AssertUnwindSafe(async {
        inner_ret = answer_peer(stream, state_clone, peer_address, member, outbound_rx, own_handshake).await;
    })
    .catch_unwind()
    .await;
    if panic_result.is_err() {
        state
            .logger
            .log_line(format!("Uncaught panic in client task for {peer_address}"));
    }

    state.blocks_clients.remove(peer_id);
    state.txn_clients.remove(peer_id);

    match inner_ret {
        Ok(()) => info!("Client {} disconnected", peer_address),
        Err(e) => debug!("Client connection {} closed: {:#}", peer_address, e),
    }
}

pub(crate) async fn answer_peer<S>(
    stream: S,
    state: NodeState,
    peer_address: SocketAddr,
    member: PeerAndInvs,
    outbound_rx: tokio::sync::mpsc::Receiver<PeerMessage>,
    own_handshake: HandshakeData,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Debug + Unpin,
{
    info!("Established incoming TCP connection with {peer_address}");
    let mut peer = framed_peer_stream(stream);

    // The connecting side speaks first.
    let peer_handshake = expect_version(&mut peer, peer_address).await?;
    peer.send(PeerMessage::Version(Box::new(own_handshake))).await?;
    debug!("Completed version exchange with {peer_address}");

    let handler =
        UntrustedPeerLoopHandler::new(state, peer_address, peer_handshake.subversion, member);
    handler.run(peer, outbound_rx).await
}

/// Operator-added outbound Bitcoin P2P peer: a block source we listen to,
/// not a client we serve. Keeps redialing with a one-second pause until the
/// operator marks it for removal.
pub fn spawn_outbound_p2p_connection(state: NodeState, address: SocketAddr) {
    state.outbound_p2p_registry.note_waiting(address);
    tokio::spawn(async move {
        loop {
            let state_clone = state.clone();
            let panic_result = std::panic::AssertUnwindSafe(async {
                debug!("Attempting to initiate connection to {}", address);
                match tokio::net::TcpStream::connect(address).await {
                    Err(e) => {
                        warn!("Failed to establish connection to {}: {}", address, e);
                    }
                    Ok(stream) => {
                        state_clone.outbound_p2p_registry.note_connected(address);
                        let own_handshake = HandshakeData::new(outbound_p2p_subversion());
                        match call_peer(stream, state_clone, address, own_handshake).await {
                            Ok(()) => info!("Connection to {} closed", address),
                            Err(e) => debug!("Connection to {} closed: {:#}", address, e),
                        }
                    }
                }
            })
            .catch_unwind()
            .await;
            if panic_result.is_err() {
                state
                    .logger
                    .log_line(format!("Uncaught panic in outbound peer task for {address}"));
            }

            if !state.outbound_p2p_registry.note_disconnected(address) {
                break;
            }
            tokio::time::sleep(crate::RECONNECT_DELAY).await;
        }
    });
}

pub(crate) async fn call_peer<S>(
    stream: S,
    state: NodeState,
    peer_address: SocketAddr,
    own_handshake: HandshakeData,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Debug + Unpin,
{
    info!("Established outgoing TCP connection with {peer_address}");
    let mut peer = framed_peer_stream(stream);

    peer.send(PeerMessage::Version(Box::new(own_handshake))).await?;
    let peer_handshake = expect_version(&mut peer, peer_address).await?;
    debug!("Completed version exchange with {peer_address}");

    let (handle, outbound_rx) = PeerHandle::channel(peer_address);
    let member = PeerAndInvs::new(handle);
    let handler =
        UntrustedPeerLoopHandler::new(state, peer_address, peer_handshake.subversion, member);
    handler.run(peer, outbound_rx).await
}

#[cfg(test)]
mod connect_tests {
    use super::*;

    use tokio_test::io::Builder;
    use tracing_test::traced_test;

    use crate::tests::shared::get_dummy_handshake_data;
    use crate::tests::shared::test_node_state;
    use crate::tests::shared::test_socket_address;
    use crate::tests::shared::to_bytes;

    #[traced_test]
    #[tokio::test]
    async fn incoming_connection_completes_version_exchange() {
        let own_handshake = get_dummy_handshake_data("/relay-wire:0.1.0:RelayNode:0.1.0/");
        let other_handshake = get_dummy_handshake_data("/Satoshi:0.8.1/");
        let mock = Builder::new()
            .read(&to_bytes(&PeerMessage::Version(Box::new(other_handshake))).unwrap())
            .write(&to_bytes(&PeerMessage::Version(Box::new(own_handshake.clone()))).unwrap())
            .build();

        let state = test_node_state().await;
        let peer_address = test_socket_address(6000);
        let (handle, outbound_rx) = PeerHandle::channel(peer_address);
        let member = PeerAndInvs::new(handle);

        answer_peer(mock, state, peer_address, member, outbound_rx, own_handshake)
            .await
            .unwrap();
    }

    #[traced_test]
    #[tokio::test]
    async fn incoming_connection_fails_without_version_message() {
        let own_handshake = get_dummy_handshake_data("/relay-wire:0.1.0:RelayNode:0.1.0/");
        let mock = Builder::new()
            .read(&to_bytes(&PeerMessage::Ping(1)).unwrap())
            .build();

        let state = test_node_state().await;
        let peer_address = test_socket_address(6001);
        let (handle, outbound_rx) = PeerHandle::channel(peer_address);
        let member = PeerAndInvs::new(handle);

        let answer = answer_peer(mock, state, peer_address, member, outbound_rx, own_handshake).await;
        assert!(answer.is_err(), "expected missing version message failure");
    }

    #[traced_test]
    #[tokio::test]
    async fn incoming_connection_fails_on_bad_magic() {
        let own_handshake = get_dummy_handshake_data("/relay-wire:0.1.0:RelayNode:0.1.0/");
        let mut other_handshake = get_dummy_handshake_data("/Satoshi:0.8.1/");
        other_handshake.network_magic = 0x0B11_0907; // testnet3

        let mock = Builder::new()
            .read(&to_bytes(&PeerMessage::Version(Box::new(other_handshake))).unwrap())
            .build();

        let state = test_node_state().await;
        let peer_address = test_socket_address(6002);
        let (handle, outbound_rx) = PeerHandle::channel(peer_address);
        let member = PeerAndInvs::new(handle);

        let answer = answer_peer(mock, state, peer_address, member, outbound_rx, own_handshake).await;
        assert!(answer.is_err(), "bad network magic must result in error");
    }

    #[traced_test]
    #[tokio::test]
    async fn outgoing_connection_completes_version_exchange() {
        let own_handshake = get_dummy_handshake_data("/relay-wire:0.1.0:RelayNode:0.1.0/");
        let other_handshake = get_dummy_handshake_data("/Satoshi:0.8.1/");
        let mock = Builder::new()
            .write(&to_bytes(&PeerMessage::Version(Box::new(own_handshake.clone()))).unwrap())
            .read(&to_bytes(&PeerMessage::Version(Box::new(other_handshake))).unwrap())
            .build();

        let state = test_node_state().await;
        call_peer(mock, state, test_socket_address(6003), own_handshake)
            .await
            .unwrap();
    }

    #[traced_test]
    #[tokio::test]
    async fn wrapper_clears_group_membership_on_exit() {
        let own_handshake = get_dummy_handshake_data("/relay-wire:0.1.0:RelayNode:0.1.0/");
        let other_handshake = get_dummy_handshake_data("/Satoshi:0.8.1/");
        let mock = Builder::new()
            .read(&to_bytes(&PeerMessage::Version(Box::new(other_handshake))).unwrap())
            .write(&to_bytes(&PeerMessage::Version(Box::new(own_handshake.clone()))).unwrap())
            .build();

        let state = test_node_state().await;
        answer_peer_wrapper(
            mock,
            state.clone(),
            test_socket_address(6004),
            ClientMembership::BlocksAndTransactions,
            own_handshake,
        )
        .await;

        assert_eq!(0, state.blocks_clients.size());
        assert_eq!(0, state.txn_clients.size());
    }
}
