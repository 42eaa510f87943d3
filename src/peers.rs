use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::trace;

use crate::models::peer::InventoryItem;
use crate::models::peer::PeerMessage;
use crate::models::peer::RelayObject;
use crate::util_types::limited_fifo_set::LimitedFifoSet;

/// How many inventory items we remember per peer.
pub const PEER_INV_CAPACITY: usize = 500;

/// Capacity of the queue feeding a peer task's write half.
pub const PEER_OUTBOUND_CHANNEL_CAPACITY: usize = 1000;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(0);

/// Cheap-clone handle onto a live peer connection's outbound queue. The
/// connection task drains the queue; everything else just enqueues.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    id: u64,
    address: SocketAddr,
    sender: mpsc::Sender<PeerMessage>,
}

impl PeerHandle {
    pub fn new(address: SocketAddr, sender: mpsc::Sender<PeerMessage>) -> Self {
        Self {
            id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
            address,
            sender,
        }
    }

    /// Convenience constructor returning the handle together with the
    /// receiving end its connection task will drain.
    pub fn channel(address: SocketAddr) -> (Self, mpsc::Receiver<PeerMessage>) {
        let (tx, rx) = mpsc::channel(PEER_OUTBOUND_CHANNEL_CAPACITY);
        (Self::new(address, tx), rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Best-effort enqueue. A peer that is not yet (or no longer) draining
    /// its queue simply misses the message; it will either catch up on its
    /// own next announcement or be forgotten.
    fn send_best_effort(&self, message: PeerMessage) {
        if let Err(e) = self.sender.try_send(message) {
            trace!("Dropping message to {}: {}", self.address, e);
        }
    }
}

/// A peer plus the bounded set of inventory items it is known to have.
#[derive(Clone, Debug)]
pub struct PeerAndInvs {
    peer: PeerHandle,
    invs: Arc<Mutex<LimitedFifoSet<InventoryItem>>>,
}

impl PeerAndInvs {
    pub fn new(peer: PeerHandle) -> Self {
        Self {
            peer,
            invs: Arc::new(Mutex::new(LimitedFifoSet::new(PEER_INV_CAPACITY))),
        }
    }

    pub fn peer(&self) -> &PeerHandle {
        &self.peer
    }

    /// Pre-dispatch hook run against every inbound message: whatever the
    /// peer announces or sends in full is something it evidently has, so we
    /// must never announce it back.
    pub fn record_inventory(&self, message: &PeerMessage) {
        let mut invs = self.invs.lock().unwrap();
        match message {
            PeerMessage::Inv(items) => {
                for item in items {
                    invs.insert(*item);
                }
            }
            PeerMessage::Block(block) => {
                invs.insert(InventoryItem::block(block.hash()));
            }
            PeerMessage::Transaction(tx) => {
                invs.insert(InventoryItem::transaction(tx.hash()));
            }
            _ => (),
        }
    }

    pub fn knows(&self, item: &InventoryItem) -> bool {
        self.invs.lock().unwrap().contains(item)
    }

    pub fn inv_count(&self) -> usize {
        self.invs.lock().unwrap().len()
    }

    /// Send the object unless this peer already has it. On return the
    /// object's inventory item is in `invs` either way.
    pub fn maybe_relay<T: RelayObject>(&self, object: &T) {
        let novel = self.invs.lock().unwrap().insert(object.inventory_item());
        if novel {
            self.peer.send_best_effort(object.to_peer_message());
        }
    }
}

/// A set of live peers that can be fanned out to as one.
#[derive(Clone, Debug, Default)]
pub struct PeerGroup {
    peers: Arc<Mutex<HashMap<u64, PeerAndInvs>>>,
}

impl PeerGroup {
    /// Wrap a peer and add it to the group. Returns the wrapper so the same
    /// membership (with the same inventory set) can be added to a second
    /// group.
    pub fn add(&self, peer: PeerHandle) -> PeerAndInvs {
        let member = PeerAndInvs::new(peer);
        self.add_member(member.clone());
        member
    }

    pub fn add_member(&self, member: PeerAndInvs) -> bool {
        self.peers
            .lock()
            .unwrap()
            .insert(member.peer.id(), member)
            .is_none()
    }

    /// Drop a member. Connection tasks call this on their way out.
    pub fn remove(&self, peer_id: u64) -> bool {
        self.peers.lock().unwrap().remove(&peer_id).is_some()
    }

    pub fn size(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Fan an object out to every member that does not already have it. The
    /// membership is snapshotted first so sends happen without the group
    /// lock and concurrent joins/leaves cannot invalidate the iteration.
    pub fn relay_object<T: RelayObject>(&self, object: &T) {
        let snapshot: Vec<PeerAndInvs> = self.peers.lock().unwrap().values().cloned().collect();
        for member in snapshot {
            member.maybe_relay(object);
        }
    }
}

#[cfg(test)]
mod peers_tests {
    use super::*;
    use crate::models::blockchain::Sha256dHash;
    use crate::tests::shared::mock_block;
    use crate::tests::shared::mock_transaction;

    fn test_address(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn maybe_relay_sends_novel_objects_once() {
        let (handle, mut rx) = PeerHandle::channel(test_address(1000));
        let member = PeerAndInvs::new(handle);
        let block = mock_block(None);

        member.maybe_relay(&block);
        member.maybe_relay(&block);

        assert_eq!(
            Some(block.to_peer_message()),
            rx.try_recv().ok(),
            "first relay must reach the peer"
        );
        assert!(rx.try_recv().is_err(), "second relay must be suppressed");
        assert!(member.knows(&block.inventory_item()));
    }

    #[test]
    fn recorded_inventory_suppresses_echo() {
        let (handle, mut rx) = PeerHandle::channel(test_address(1001));
        let member = PeerAndInvs::new(handle);
        let tx = mock_transaction(1);

        member.record_inventory(&tx.to_peer_message());
        member.maybe_relay(&tx);

        assert!(
            rx.try_recv().is_err(),
            "object the peer sent us must not be echoed back"
        );
    }

    #[test]
    fn inv_message_populates_tracker() {
        let (handle, _rx) = PeerHandle::channel(test_address(1002));
        let member = PeerAndInvs::new(handle);

        let items = vec![
            InventoryItem::block(Sha256dHash::of(b"a")),
            InventoryItem::transaction(Sha256dHash::of(b"b")),
        ];
        member.record_inventory(&PeerMessage::Inv(items.clone()));

        assert!(member.knows(&items[0]));
        assert!(member.knows(&items[1]));
    }

    #[test]
    fn inventory_tracker_is_bounded() {
        let (handle, _rx) = PeerHandle::channel(test_address(1003));
        let member = PeerAndInvs::new(handle);

        for i in 0..(PEER_INV_CAPACITY as u64 + 100) {
            let item = InventoryItem::block(Sha256dHash::of(&i.to_le_bytes()));
            member.record_inventory(&PeerMessage::Inv(vec![item]));
        }

        assert_eq!(PEER_INV_CAPACITY, member.inv_count());
    }

    #[test]
    fn group_relay_skips_peers_that_already_have_the_object() {
        let group = PeerGroup::default();
        let (handle_a, mut rx_a) = PeerHandle::channel(test_address(1004));
        let (handle_b, mut rx_b) = PeerHandle::channel(test_address(1005));
        let member_a = group.add(handle_a);
        let _member_b = group.add(handle_b);

        let block = mock_block(None);
        member_a.record_inventory(&block.to_peer_message());

        group.relay_object(&block);

        assert!(rx_a.try_recv().is_err(), "peer A already had the block");
        assert_eq!(Some(block.to_peer_message()), rx_b.try_recv().ok());
    }

    #[test]
    fn shared_membership_shares_the_inventory_set() {
        let blocks = PeerGroup::default();
        let txns = PeerGroup::default();
        let (handle, mut rx) = PeerHandle::channel(test_address(1006));
        let member = blocks.add(handle);
        txns.add_member(member.clone());

        let block = mock_block(None);
        blocks.relay_object(&block);
        txns.relay_object(&block);

        assert_eq!(Some(block.to_peer_message()), rx.try_recv().ok());
        assert!(
            rx.try_recv().is_err(),
            "the second group sees the inventory entry made by the first"
        );
    }

    #[test]
    fn removed_members_no_longer_receive() {
        let group = PeerGroup::default();
        let (handle, mut rx) = PeerHandle::channel(test_address(1007));
        let id = handle.id();
        group.add(handle);
        assert_eq!(1, group.size());

        assert!(group.remove(id));
        assert_eq!(0, group.size());

        group.relay_object(&mock_block(None));
        assert!(rx.try_recv().is_err());
    }
}
