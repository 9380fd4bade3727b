//! The client object cache: a byte-budgeted LRU over `OID → (TID, bytes)`.
//!
//! Entries reflect the latest known committed revision of an object. They
//! are installed on load and on commit, and dropped when the master
//! announces `InvalidateObjects`.

use bytes::Bytes;
use lru::LruCache;
use tracing::trace;

use neo_common::{Oid, Tid};

/// One cached revision.
#[derive(Clone, Debug)]
struct CacheEntry {
    tid: Tid,
    data: Bytes,
}

/// Fixed-budget LRU cache. Not internally synchronized; the client wraps it
/// in its cache lock.
#[derive(Debug)]
pub struct ClientCache {
    entries: LruCache<Oid, CacheEntry>,
    max_size: usize,
    size: usize,
}

impl ClientCache {
    /// A cache holding at most `max_size` payload bytes.
    pub fn new(max_size: usize) -> Self {
        ClientCache {
            entries: LruCache::unbounded(),
            max_size,
            size: 0,
        }
    }

    /// The cached revision of `oid`, touching its recency.
    pub fn get(&mut self, oid: Oid) -> Option<(Tid, Bytes)> {
        self.entries
            .get(&oid)
            .map(|e| (e.tid, e.data.clone()))
    }

    /// The cached serial of `oid` without the payload.
    pub fn serial(&mut self, oid: Oid) -> Option<Tid> {
        self.entries.get(&oid).map(|e| e.tid)
    }

    /// Install a revision loaded from a storage, evicting old entries to
    /// fit. Objects larger than the whole budget stay uncached.
    pub fn store(&mut self, oid: Oid, tid: Tid, data: Bytes) {
        self.remove(oid);
        if data.len() > self.max_size {
            trace!(%oid, len = data.len(), "object exceeds cache budget, not caching");
            return;
        }
        self.size += data.len();
        self.entries.put(oid, CacheEntry { tid, data });
        while self.size > self.max_size {
            match self.entries.pop_lru() {
                Some((_, evicted)) => self.size -= evicted.data.len(),
                None => break,
            }
        }
    }

    /// Install a just-committed revision. Unlike [`ClientCache::store`] this
    /// never evicts on behalf of the new entry: an object bigger than the
    /// remaining headroom would flush the whole cache on a large commit, so
    /// it is passed through uncached instead.
    pub fn store_committed(&mut self, oid: Oid, tid: Tid, data: Bytes) {
        self.remove(oid);
        if data.len() > self.max_size - self.size {
            trace!(%oid, len = data.len(), "commit exceeds cache headroom, not caching");
            return;
        }
        self.size += data.len();
        self.entries.put(oid, CacheEntry { tid, data });
    }

    /// Drop `oid` from the cache.
    pub fn remove(&mut self, oid: Oid) {
        if let Some(entry) = self.entries.pop(&oid) {
            self.size -= entry.data.len();
        }
    }

    /// Payload bytes currently held.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of cached objects.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: usize) -> Bytes {
        Bytes::from(vec![0u8; n])
    }

    #[test]
    fn stores_and_replaces_revisions() {
        let mut cache = ClientCache::new(100);
        cache.store(Oid::new(1), Tid::new(1), payload(10));
        cache.store(Oid::new(1), Tid::new(2), payload(20));
        let (tid, data) = cache.get(Oid::new(1)).unwrap();
        assert_eq!(tid, Tid::new(2));
        assert_eq!(data.len(), 20);
        assert_eq!(cache.size(), 20);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evicts_least_recently_used_over_budget() {
        let mut cache = ClientCache::new(100);
        cache.store(Oid::new(1), Tid::new(1), payload(40));
        cache.store(Oid::new(2), Tid::new(1), payload(40));
        // touch 1 so 2 is the eviction candidate
        cache.get(Oid::new(1));
        cache.store(Oid::new(3), Tid::new(1), payload(40));
        assert!(cache.get(Oid::new(2)).is_none());
        assert!(cache.get(Oid::new(1)).is_some());
        assert!(cache.get(Oid::new(3)).is_some());
        assert_eq!(cache.size(), 80);
    }

    #[test]
    fn oversized_objects_pass_through() {
        let mut cache = ClientCache::new(100);
        cache.store(Oid::new(1), Tid::new(1), payload(101));
        assert!(cache.is_empty());
    }

    #[test]
    fn commits_respect_headroom_instead_of_evicting() {
        let mut cache = ClientCache::new(100);
        cache.store(Oid::new(1), Tid::new(1), payload(80));
        cache.store_committed(Oid::new(2), Tid::new(2), payload(50));
        // 2 was bigger than the 20 bytes of headroom: not cached, 1 intact
        assert!(cache.get(Oid::new(2)).is_none());
        assert!(cache.get(Oid::new(1)).is_some());

        cache.store_committed(Oid::new(3), Tid::new(2), payload(10));
        assert!(cache.get(Oid::new(3)).is_some());
        assert_eq!(cache.size(), 90);
    }

    #[test]
    fn invalidation_removes_the_entry() {
        let mut cache = ClientCache::new(100);
        cache.store(Oid::new(1), Tid::new(1), payload(10));
        cache.remove(Oid::new(1));
        assert!(cache.get(Oid::new(1)).is_none());
        assert_eq!(cache.size(), 0);
    }
}
