//! Shared block cache with a per-block in-flight map.
//!
//! The cache stores fully verified, decompressed blocks keyed by
//! `(file_num, offset)`. It also coordinates loads: **at most one read is
//! in flight per key**. When several iterators miss on the same block
//! simultaneously, one becomes the leader and performs the read; the rest
//! wait on the in-flight entry and pick the block up from the cache when
//! the leader publishes it. If the leader fails, a waiter is promoted and
//! retries.
//!
//! Eviction is deliberately simple (drop an arbitrary resident block once
//! the capacity is reached): the reader treats the cache as an opaque
//! collaborator, and nothing in the crate depends on the eviction policy.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use super::LoadedBlock;

/// Cache key: owning file number and block offset.
pub type CacheKey = (u64, u64);

pub(crate) struct Inflight {
    state: Mutex<InflightState>,
    cv: Condvar,
}

#[derive(PartialEq, Eq, Copy, Clone)]
enum InflightState {
    Loading,
    Done,
}

/// Outcome of [`BlockCache::begin_load`].
pub(crate) enum LoadTicket {
    /// The caller is responsible for reading the block and must call
    /// [`BlockCache::finish_load`] afterwards, success or failure.
    Leader,

    /// Another thread is already loading this block; the caller should
    /// [`BlockCache::wait`] on the returned entry and re-check the cache.
    Follower(Arc<Inflight>),
}

/// Shared cache of loaded blocks.
pub struct BlockCache {
    capacity: usize,
    blocks: Mutex<HashMap<CacheKey, Arc<LoadedBlock>>>,
    inflight: Mutex<HashMap<CacheKey, Arc<Inflight>>>,
}

impl BlockCache {
    /// A cache retaining at most `capacity` blocks.
    pub fn new(capacity: usize) -> BlockCache {
        BlockCache {
            capacity: capacity.max(1),
            blocks: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Looks up a resident block.
    pub(crate) fn get(&self, key: CacheKey) -> Option<Arc<LoadedBlock>> {
        self.blocks.lock().expect("block cache poisoned").get(&key).cloned()
    }

    /// Publishes a loaded block.
    pub(crate) fn insert(&self, key: CacheKey, block: Arc<LoadedBlock>) {
        let mut blocks = self.blocks.lock().expect("block cache poisoned");
        if blocks.len() >= self.capacity && !blocks.contains_key(&key) {
            if let Some(&victim) = blocks.keys().next() {
                blocks.remove(&victim);
            }
        }
        blocks.insert(key, block);
    }

    /// Claims the right to load `key`, or returns the in-flight entry to
    /// wait on.
    pub(crate) fn begin_load(&self, key: CacheKey) -> LoadTicket {
        let mut inflight = self.inflight.lock().expect("block cache poisoned");
        if let Some(entry) = inflight.get(&key) {
            return LoadTicket::Follower(entry.clone());
        }
        inflight.insert(
            key,
            Arc::new(Inflight {
                state: Mutex::new(InflightState::Loading),
                cv: Condvar::new(),
            }),
        );
        LoadTicket::Leader
    }

    /// Releases the in-flight entry for `key` and wakes every waiter. The
    /// leader calls this whether the load succeeded or failed; waiters
    /// re-check the cache and retry on a miss.
    pub(crate) fn finish_load(&self, key: CacheKey) {
        let entry = {
            let mut inflight = self.inflight.lock().expect("block cache poisoned");
            inflight.remove(&key)
        };
        if let Some(entry) = entry {
            let mut state = entry.state.lock().expect("block cache poisoned");
            *state = InflightState::Done;
            entry.cv.notify_all();
        }
    }

    /// Blocks until the given in-flight load completes.
    pub(crate) fn wait(&self, entry: &Arc<Inflight>) {
        let mut state = entry.state.lock().expect("block cache poisoned");
        while *state == InflightState::Loading {
            state = entry.cv.wait(state).expect("block cache poisoned");
        }
    }

    /// Number of resident blocks.
    pub fn len(&self) -> usize {
        self.blocks.lock().expect("block cache poisoned").len()
    }

    /// Whether the cache holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockMetadata;

    fn block(bytes: &[u8]) -> Arc<LoadedBlock> {
        Arc::new(LoadedBlock::new(bytes.to_vec(), BlockMetadata::None, None))
    }

    #[test]
    fn insert_then_get() {
        let cache = BlockCache::new(4);
        cache.insert((1, 0), block(b"a"));
        assert!(cache.get((1, 0)).is_some());
        assert!(cache.get((1, 8)).is_none());
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = BlockCache::new(2);
        cache.insert((1, 0), block(b"a"));
        cache.insert((1, 8), block(b"b"));
        cache.insert((1, 16), block(b"c"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn single_leader_per_key() {
        let cache = BlockCache::new(4);
        assert!(matches!(cache.begin_load((1, 0)), LoadTicket::Leader));
        assert!(matches!(cache.begin_load((1, 0)), LoadTicket::Follower(_)));
        // A different key gets its own leader.
        assert!(matches!(cache.begin_load((1, 8)), LoadTicket::Leader));
        cache.finish_load((1, 0));
        assert!(matches!(cache.begin_load((1, 0)), LoadTicket::Leader));
    }

    #[test]
    fn followers_wake_on_finish() {
        use std::sync::mpsc;
        use std::thread;

        let cache = Arc::new(BlockCache::new(4));
        assert!(matches!(cache.begin_load((9, 0)), LoadTicket::Leader));

        let (tx, rx) = mpsc::channel();
        let c2 = cache.clone();
        let waiter = thread::spawn(move || {
            if let LoadTicket::Follower(entry) = c2.begin_load((9, 0)) {
                c2.wait(&entry);
            }
            tx.send(()).unwrap();
        });

        cache.insert((9, 0), block(b"x"));
        cache.finish_load((9, 0));
        rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
        assert!(cache.get((9, 0)).is_some());
    }
}
