pub(crate) mod shared {
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::time::Duration;

    use anyhow::Result;
    use bytes::Bytes;
    use bytes::BytesMut;
    use futures::sink;
    use futures::sink::SinkExt;
    use futures::stream;
    use futures::stream::TryStreamExt;
    use futures::task::Context;
    use futures::task::Poll;
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    use tokio_serde::formats::SymmetricalBincode;
    use tokio_serde::Serializer;
    use tokio_util::codec::Encoder;
    use tokio_util::codec::LengthDelimitedCodec;

    use crate::connect_to_peers::framed_peer_stream;
    use crate::connect_to_peers::PeerStream;
    use crate::models::blockchain::Block;
    use crate::models::blockchain::BlockHeader;
    use crate::models::blockchain::Sha256dHash;
    use crate::models::blockchain::Transaction;
    use crate::models::blockchain::TransactionInput;
    use crate::models::blockchain::TransactionOutput;
    use crate::models::peer::HandshakeData;
    use crate::models::peer::PeerMessage;
    use crate::models::peer::MAINNET_MAGIC;
    use crate::models::peer::NODE_NETWORK;
    use crate::models::relay::RelayMessage;
    use crate::models::state::NodeState;
    use crate::models::state::TuiLogger;
    use crate::relay_log::RelayLog;

    pub(crate) fn test_socket_address(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    pub(crate) fn get_dummy_handshake_data(subversion: &str) -> HandshakeData {
        HandshakeData {
            network_magic: MAINNET_MAGIC,
            services: NODE_NETWORK,
            subversion: subversion.to_string(),
            best_height: 1,
            timestamp: 1_700_000_000,
            nonce: 42,
        }
    }

    /// Fresh node state backed by a randomly named relay log in the temp
    /// directory, so tests can run in parallel.
    pub(crate) async fn test_node_state() -> NodeState {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(20)
            .map(char::from)
            .collect();
        let log_path = std::env::temp_dir().join(format!("blockrelay-test-{suffix}.log"));
        let logger = TuiLogger::default();
        let relay_log = RelayLog::open(&log_path, logger.clone()).unwrap();
        NodeState::new(relay_log, logger)
    }

    /// Block with a random nonce, so every call yields a distinct hash.
    /// Without an explicit parent it connects to genesis.
    pub(crate) fn mock_block(parent: Option<&BlockHeader>) -> Block {
        let prev_block_hash = parent
            .map(|header| header.hash())
            .unwrap_or_else(|| BlockHeader::genesis().hash());
        Block {
            header: BlockHeader {
                version: 2,
                prev_block_hash,
                merkle_root: Sha256dHash::of(&rand::random::<[u8; 32]>()),
                timestamp: 1_355_317_200,
                difficulty_target: 0x1d00_ffff,
                nonce: rand::random(),
            },
            transactions: vec![],
        }
    }

    pub(crate) fn mock_transaction(seed: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                previous_output: Sha256dHash::of(&seed.to_le_bytes()),
                previous_output_index: 0,
                script_sig: vec![0x00],
                sequence: u32::MAX,
            }],
            outputs: vec![TransactionOutput {
                value: 50_000,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    /// Structurally invalid: no inputs at all.
    pub(crate) fn mock_empty_transaction() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![TransactionOutput {
                value: 1,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    /// Poll a condition until it holds; panics after five seconds.
    pub(crate) async fn wait_until(mut predicate: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if predicate() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time")
    }

    /// Serialize a peer message the way the wire does: bincode body behind a
    /// length-delimited frame.
    pub(crate) fn to_bytes(message: &PeerMessage) -> Result<Bytes> {
        let mut transport = LengthDelimitedCodec::new();
        let mut formating = SymmetricalBincode::<PeerMessage>::default();
        let mut buf = BytesMut::new();
        transport.encode(Bytes::from(Pin::new(&mut formating).serialize(message)?), &mut buf)?;
        Ok(buf.freeze())
    }

    pub(crate) fn relay_messages_stream(
        messages: Vec<RelayMessage>,
    ) -> impl futures::stream::TryStream<Ok = RelayMessage, Error = std::io::Error> + Unpin {
        stream::iter(messages.into_iter().map(Ok))
    }

    /// Message-level mock of a peer connection: a scripted sequence of
    /// expected reads and writes. Reads yield in order; a write must match
    /// the next scripted action exactly. When the script is exhausted the
    /// stream reports end-of-connection, and dropping a mock with actions
    /// left over fails the test.
    #[derive(Debug)]
    pub(crate) struct Mock<Item> {
        actions: VecDeque<Action<Item>>,
    }

    #[derive(Debug, Clone)]
    pub(crate) enum Action<Item> {
        Read(Item),
        Write(Item),
    }

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum MockError {
        WrongSend,
        UnexpectedSend,
    }

    impl std::fmt::Display for MockError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                MockError::WrongSend => write!(f, "WrongSend"),
                MockError::UnexpectedSend => write!(f, "UnexpectedSend"),
            }
        }
    }

    impl std::error::Error for MockError {}

    impl<Item> Mock<Item> {
        pub(crate) fn new(actions: Vec<Action<Item>>) -> Mock<Item> {
            Mock {
                actions: actions.into(),
            }
        }
    }

    impl<Item> Drop for Mock<Item> {
        fn drop(&mut self) {
            if !self.actions.is_empty() && !std::thread::panicking() {
                panic!("mock dropped with {} unconsumed actions", self.actions.len());
            }
        }
    }

    impl<Item: PartialEq + Unpin> sink::Sink<Item> for Mock<Item> {
        type Error = MockError;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Item) -> Result<(), Self::Error> {
            match (self.get_mut().actions.pop_front(), item) {
                (Some(Action::Write(expected)), item) if item == expected => Ok(()),
                (Some(Action::Write(_)), _) => Err(MockError::WrongSend),
                _ => Err(MockError::UnexpectedSend),
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    impl<Item: Unpin> stream::Stream for Mock<Item> {
        type Item = Result<Item, MockError>;

        fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            let actions = &mut self.get_mut().actions;
            match actions.front() {
                None => Poll::Ready(None),
                Some(Action::Read(_)) => match actions.pop_front() {
                    Some(Action::Read(item)) => Poll::Ready(Some(Ok(item))),
                    _ => unreachable!(),
                },
                // A pending write is next; let the sink side catch up.
                Some(Action::Write(_)) => {
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
            }
        }
    }

    /// Server half of one trusted-validator session, used by reconnect
    /// tests: accepts the node's dial and completes the version exchange.
    pub(crate) struct TrustedSessionEndpoint {
        framed: PeerStream<tokio::net::TcpStream>,
    }

    impl TrustedSessionEndpoint {
        pub(crate) async fn accept_and_handshake(listener: &tokio::net::TcpListener) -> Self {
            let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
                .await
                .expect("timed out waiting for a trusted-session dial")
                .expect("accept failed");
            let mut framed = framed_peer_stream(stream);

            // The node speaks first on both trusted sessions.
            match tokio::time::timeout(Duration::from_secs(5), framed.try_next())
                .await
                .expect("timed out waiting for version message")
                .expect("stream error during handshake")
            {
                Some(PeerMessage::Version(_)) => (),
                other => panic!("expected version message, got {:?}", other),
            }
            framed
                .send(PeerMessage::Version(Box::new(get_dummy_handshake_data(
                    "/Satoshi:0.8.1/",
                ))))
                .await
                .expect("failed to answer handshake");

            Self { framed }
        }

        /// Consume traffic until the node closes this socket.
        pub(crate) async fn read_until_eof(mut self) {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    match self.framed.try_next().await {
                        Ok(None) | Err(_) => break,
                        Ok(Some(_)) => continue,
                    }
                }
            })
            .await
            .expect("expected the socket to be closed");
        }
    }
}

mod scenario_tests {
    use tokio_test::io::Builder;

    use super::shared::get_dummy_handshake_data;
    use super::shared::mock_block;
    use super::shared::test_node_state;
    use super::shared::test_socket_address;
    use super::shared::to_bytes;
    use super::shared::wait_until;
    use crate::connect_to_peers::answer_peer;
    use crate::models::peer::InventoryItem;
    use crate::models::peer::PeerMessage;
    use crate::models::peer::RelayObject;
    use crate::models::relay::RelayMessage;
    use crate::peers::PeerAndInvs;
    use crate::peers::PeerHandle;
    use crate::relay_peer::RelayClientHandle;

    /// The full untrusted-inv path: inv triggers a getdata, the served block
    /// goes to the validators, and once the header connects it fans out to
    /// relay clients and block clients and is logged, without echoing back
    /// to the peer that served it.
    #[tokio::test]
    async fn untrusted_inv_path_end_to_end() {
        let state = test_node_state().await;

        let (other_client, mut other_client_rx) = PeerHandle::channel(test_socket_address(8001));
        state.blocks_clients.add(other_client);
        let (trusted, mut trusted_rx) = PeerHandle::channel(test_socket_address(8002));
        state.trusted_outbound_peers.add(trusted);
        let (relay_client, mut relay_client_rx) = RelayClientHandle::channel(test_socket_address(8003));
        state.relay_clients.add(relay_client);

        let block = mock_block(None);
        let inv_item = InventoryItem::block(block.hash());

        let own_handshake = get_dummy_handshake_data("/relay-wire:0.1.0:RelayNode:0.1.0/");
        let peer_handshake = get_dummy_handshake_data("/Satoshi:0.8.1/");
        let mock = Builder::new()
            .read(&to_bytes(&PeerMessage::Version(Box::new(peer_handshake))).unwrap())
            .write(&to_bytes(&PeerMessage::Version(Box::new(own_handshake.clone()))).unwrap())
            .read(&to_bytes(&PeerMessage::Inv(vec![inv_item])).unwrap())
            .write(&to_bytes(&PeerMessage::GetData(vec![inv_item])).unwrap())
            .read(&to_bytes(&PeerMessage::Block(Box::new(block.clone()))).unwrap())
            .build();

        let peer_address = test_socket_address(8000);
        let (handle, outbound_rx) = PeerHandle::channel(peer_address);
        let sender_member = PeerAndInvs::new(handle);
        state.blocks_clients.add_member(sender_member.clone());

        answer_peer(
            mock,
            state.clone(),
            peer_address,
            sender_member.clone(),
            outbound_rx,
            own_handshake,
        )
        .await
        .unwrap();

        wait_until(|| state.relay_log.times_logged() == 1).await;

        assert_eq!(
            Some(block.to_peer_message()),
            trusted_rx.try_recv().ok(),
            "validators receive the unvetted block"
        );
        assert_eq!(
            Some(RelayMessage::Block(Box::new(block.clone()))),
            relay_client_rx.try_recv().ok(),
            "relay-protocol clients receive the accepted block"
        );
        assert_eq!(
            Some(block.to_peer_message()),
            other_client_rx.try_recv().ok(),
            "block clients receive the accepted block"
        );
        assert!(
            sender_member.knows(&inv_item),
            "the source peer's inventory blocks any echo"
        );

        let console = state.logger.drain();
        assert!(
            console
                .iter()
                .any(|line| line.contains("relayed (p2p SPV from 127.0.0.1/")),
            "first-seen line carries the p2p SPV tag"
        );
    }

    /// Scenario 4: an immediate repeat of the same block moves nothing.
    #[tokio::test]
    async fn duplicate_block_is_fully_suppressed() {
        let state = test_node_state().await;
        let (client, mut client_rx) = PeerHandle::channel(test_socket_address(8004));
        state.blocks_clients.add(client);

        let block = mock_block(None);
        crate::peer_loop::handle_untrusted_block(
            state.clone(),
            block.clone(),
            "p2p SPV",
            test_socket_address(8005).ip(),
        )
        .await;
        crate::relay_peer::handle_relay_peer_block(
            state.clone(),
            block.clone(),
            test_socket_address(8006),
            String::new(),
        )
        .await;

        assert!(client_rx.try_recv().is_ok());
        assert!(client_rx.try_recv().is_err(), "no second fan-out");
        assert_eq!(1, state.relay_log.times_logged(), "no second log entry");
    }
}
