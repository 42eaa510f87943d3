use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::trace;

use crate::models::blockchain::Sha256dHash;
use crate::models::peer::RelayObject;
use crate::peers::PeerGroup;
use crate::util_types::limited_fifo_set::LimitedFifoSet;

/// How long an unvetted object stays cached while we wait for a validator to
/// bless it.
pub const OBJECT_TTL: Duration = Duration::from_secs(60);

pub const EVICTION_INTERVAL: Duration = Duration::from_secs(1);

/// Relayed-hash cache sizes, tuned to the expected block and transaction
/// rates over roughly one hour.
pub const BLOCK_RELAYED_CACHE_SIZE: usize = 100;
pub const TX_RELAYED_CACHE_SIZE: usize = 10_000;

/// Short-lived cache of objects learned from untrusted peers, plus the set
/// of hashes that have already been fanned out to clients.
///
/// Objects are forwarded to the trusted validators immediately on ingest;
/// fan-out to clients waits until `inv_good` reports that a trusted path has
/// accepted the hash. The `relayed` set keeps a hash from being ingested or
/// broadcast twice after the object itself is gone.
pub struct ObjectPool<T> {
    inner: Mutex<PoolInner<T>>,
    trusted_outbound_peers: PeerGroup,
}

struct PoolInner<T> {
    objects: HashMap<Sha256dHash, T>,
    /// Expiry deadlines in insertion order.
    expirations: VecDeque<(Instant, Sha256dHash)>,
    relayed: LimitedFifoSet<Sha256dHash>,
}

impl<T: RelayObject> ObjectPool<T> {
    pub fn new(relayed_cache_size: usize, trusted_outbound_peers: PeerGroup) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                objects: HashMap::new(),
                expirations: VecDeque::new(),
                relayed: LimitedFifoSet::new(relayed_cache_size),
            }),
            trusted_outbound_peers,
        }
    }

    /// True iff the hash is worth a getdata: neither cached nor already
    /// relayed.
    pub fn should_request_inv(&self, hash: Sha256dHash) -> bool {
        let inner = self.lock();
        !inner.relayed.contains(&hash) && !inner.objects.contains_key(&hash)
    }

    pub fn get_object(&self, hash: Sha256dHash) -> Option<T> {
        self.lock().objects.get(&hash).cloned()
    }

    /// Ingest an object and push it to every trusted outbound session. The
    /// push happens even when the hash has already been relayed; only the
    /// cache insertion is skipped then.
    pub fn provide_object(&self, object: T) {
        let hash = object.hash();
        {
            let mut inner = self.lock();
            if !inner.relayed.contains(&hash) {
                inner.expirations.push_back((Instant::now() + OBJECT_TTL, hash));
                inner.objects.insert(hash, object.clone());
            }
        }
        self.trusted_outbound_peers.relay_object(&object);
    }

    /// A trusted path has accepted `hash`: drop it from the cache and mark it
    /// relayed. If the hash was newly marked and the object was still cached,
    /// broadcast it to `clients`, outside the critical section.
    pub fn inv_good(&self, clients: &PeerGroup, hash: Sha256dHash) {
        let to_relay = {
            let mut inner = self.lock();
            let object = inner.objects.remove(&hash);
            if inner.relayed.insert(hash) {
                object
            } else {
                None
            }
        };
        if let Some(object) = to_relay {
            clients.relay_object(&object);
        }
    }

    /// Drop every cached object whose deadline has passed, oldest first.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let mut inner = self.lock();
        let mut evicted = 0;
        while let Some((deadline, hash)) = inner.expirations.front().copied() {
            if deadline > now {
                break;
            }
            inner.expirations.pop_front();
            if inner.objects.remove(&hash).is_some() {
                evicted += 1;
            }
        }
        if evicted > 0 {
            trace!("Evicted {} expired pool objects", evicted);
        }
        evicted
    }

    /// Wake once a second and expire stale cache entries. The task holds a
    /// weak reference and dies with the pool.
    pub fn spawn_eviction_task(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EVICTION_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.evict_expired(Instant::now());
            }
        })
    }

    pub fn cached_object_count(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn relayed_count(&self) -> usize {
        self.lock().relayed.len()
    }

    pub fn is_relayed(&self, hash: Sha256dHash) -> bool {
        self.lock().relayed.contains(&hash)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner<T>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| panic!("Failed to lock object pool: {}", e))
    }
}

#[cfg(test)]
mod pool_tests {
    use super::*;
    use crate::models::blockchain::Block;
    use crate::peers::PeerHandle;
    use crate::tests::shared::mock_block;
    use crate::tests::shared::test_socket_address;

    fn pool_with_trusted_peer() -> (
        ObjectPool<Block>,
        tokio::sync::mpsc::Receiver<crate::models::peer::PeerMessage>,
    ) {
        let trusted = PeerGroup::default();
        let (handle, rx) = PeerHandle::channel(test_socket_address(2000));
        trusted.add(handle);
        (ObjectPool::new(BLOCK_RELAYED_CACHE_SIZE, trusted), rx)
    }

    #[test]
    fn should_request_inv_tracks_cache_and_relayed_state() {
        let (pool, _rx) = pool_with_trusted_peer();
        let block = mock_block(None);
        let hash = block.hash();

        assert!(pool.should_request_inv(hash));

        pool.provide_object(block);
        assert!(!pool.should_request_inv(hash), "cached object needs no getdata");

        pool.inv_good(&PeerGroup::default(), hash);
        assert!(!pool.should_request_inv(hash), "relayed hash needs no getdata");
    }

    #[test]
    fn provide_object_pushes_to_trusted_peers_even_when_already_relayed() {
        let (pool, mut rx) = pool_with_trusted_peer();
        let block = mock_block(None);
        let hash = block.hash();

        pool.provide_object(block.clone());
        pool.inv_good(&PeerGroup::default(), hash);
        assert!(pool.is_relayed(hash));

        pool.provide_object(block.clone());
        assert_eq!(
            0,
            pool.cached_object_count(),
            "relayed hash must not re-enter the cache"
        );

        // The trusted group saw exactly one send; its per-peer inventory
        // absorbed the second push.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn inv_good_moves_object_from_cache_to_relayed_and_broadcasts_once() {
        let (pool, _trusted_rx) = pool_with_trusted_peer();
        let clients = PeerGroup::default();
        let (client, mut client_rx) = PeerHandle::channel(test_socket_address(2001));
        clients.add(client);

        let block = mock_block(None);
        let hash = block.hash();
        pool.provide_object(block.clone());
        assert_eq!(1, pool.cached_object_count());

        pool.inv_good(&clients, hash);
        assert_eq!(0, pool.cached_object_count());
        assert!(pool.is_relayed(hash));
        assert_eq!(
            Some(block.hash()),
            match client_rx.try_recv().ok() {
                Some(crate::models::peer::PeerMessage::Block(b)) => Some(b.hash()),
                _ => None,
            }
        );

        pool.inv_good(&clients, hash);
        assert!(
            client_rx.try_recv().is_err(),
            "a hash is broadcast to clients at most once"
        );
    }

    #[test]
    fn inv_good_without_cached_object_still_marks_relayed() {
        let (pool, _rx) = pool_with_trusted_peer();
        let clients = PeerGroup::default();
        let hash = mock_block(None).hash();

        pool.inv_good(&clients, hash);
        assert!(pool.is_relayed(hash));
        assert!(!pool.should_request_inv(hash));
    }

    #[test]
    fn relayed_set_is_bounded_fifo() {
        let trusted = PeerGroup::default();
        let pool: ObjectPool<Block> = ObjectPool::new(3, trusted);
        let clients = PeerGroup::default();

        let mut hashes = vec![];
        for _ in 0..5 {
            let hash = mock_block(None).hash();
            hashes.push(hash);
            pool.inv_good(&clients, hash);
        }

        assert_eq!(3, pool.relayed_count());
        assert!(!pool.is_relayed(hashes[0]));
        assert!(!pool.is_relayed(hashes[1]));
        assert!(pool.is_relayed(hashes[4]));
    }

    #[test]
    fn expired_objects_are_evicted_in_insertion_order() {
        let (pool, _rx) = pool_with_trusted_peer();
        let first = mock_block(None);
        let second = mock_block(None);
        pool.provide_object(first.clone());
        pool.provide_object(second.clone());
        assert_eq!(2, pool.cached_object_count());

        assert_eq!(0, pool.evict_expired(Instant::now()));

        let evicted = pool.evict_expired(Instant::now() + OBJECT_TTL + Duration::from_secs(1));
        assert_eq!(2, evicted);
        assert_eq!(0, pool.cached_object_count());
        assert!(
            pool.should_request_inv(first.hash()),
            "an evicted, never-relayed hash is requestable again"
        );
    }

    #[test]
    fn eviction_skips_entries_already_consumed_by_inv_good() {
        let (pool, _rx) = pool_with_trusted_peer();
        let block = mock_block(None);
        let hash = block.hash();
        pool.provide_object(block);
        pool.inv_good(&PeerGroup::default(), hash);

        let evicted = pool.evict_expired(Instant::now() + OBJECT_TTL + Duration::from_secs(1));
        assert_eq!(0, evicted, "inv_good already removed the cache entry");
        assert!(pool.is_relayed(hash), "relayed state survives eviction");
    }
}
