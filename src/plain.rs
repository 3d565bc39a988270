use std::sync::Arc;

use crate::cache::{Cache, CacheInner, ManagedCache};
use crate::manager::Manager;
use crate::plain_bucket::PlainBucket;
use crate::value::{CachedValue, Finding};
use crate::Error;

/// The plain cache flavor: LRU-only buckets with five slots each.
pub struct PlainCache {
    inner: CacheInner<PlainBucket>,
}

impl PlainCache {
    /// Registers a new plain cache with the manager. Fails with
    /// [`Error::OutOfCapacity`] when not even a minimum-size grant fits the
    /// global budget.
    pub fn create(
        manager: &Arc<Manager>,
        requested: u64,
        allow_growth: bool,
    ) -> Result<Arc<PlainCache>, Error> {
        let metadata = manager.register_cache(requested)?;
        let cache = Arc::new(PlainCache {
            inner: CacheInner::new(Arc::clone(manager), Arc::clone(&metadata), allow_growth),
        });
        let dyn_cache: Arc<dyn ManagedCache> = cache.clone();
        let weak: std::sync::Weak<dyn ManagedCache> = Arc::downgrade(&dyn_cache);
        metadata.lock().set_cache(weak);
        Ok(cache)
    }
}

impl Cache for PlainCache {
    fn find(&self, key: &[u8]) -> Finding {
        self.inner.find(key)
    }

    fn insert(&self, value: Box<CachedValue>) -> bool {
        self.inner.insert(value)
    }

    fn remove(&self, key: &[u8]) -> bool {
        self.inner.remove(key)
    }

    fn usage(&self) -> u64 {
        self.inner.usage()
    }

    fn limit(&self) -> u64 {
        self.inner.limit()
    }

    fn destroy(&self) {
        self.inner.shutdown();
    }
}

impl ManagedCache for PlainCache {
    fn free_memory(&self) {
        self.inner.free_memory();
    }

    fn migrate(&self) {
        self.inner.migrate();
    }
}

impl Drop for PlainCache {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::manager::{CacheKind, MIN_CACHE_SIZE};
    use crate::state::Flag;

    fn entry(i: u64) -> Box<CachedValue> {
        CachedValue::new(&i.to_le_bytes(), &i.to_le_bytes())
    }

    fn key(i: u64) -> [u8; 8] {
        i.to_le_bytes()
    }

    #[test]
    fn construction() {
        let manager = Arc::new(Manager::new(1024 * 1024));
        let cache1 = manager
            .create_cache(CacheKind::Plain, 256 * 1024, false)
            .unwrap();
        let cache2 = manager
            .create_cache(CacheKind::Plain, 512 * 1024, false)
            .unwrap();

        assert_eq!(cache1.usage(), 0);
        assert_eq!(cache1.limit(), 256 * 1024);
        assert_eq!(cache2.usage(), 0);
        // not enough budget left, the second grant was halved
        assert!(cache2.limit() < 512 * 1024);

        cache1.destroy();
        cache2.destroy();
    }

    #[test]
    fn insertion() {
        let cache_limit = 256u64 * 1024;
        let manager = Arc::new(Manager::new(4 * cache_limit));
        let cache = PlainCache::create(&manager, cache_limit, false).unwrap();

        for i in 0u64..1024 {
            assert!(cache.insert(entry(i)));
            assert!(cache.find(&key(i)).found());
        }

        // re-inserting the same keys is refused
        for i in 0u64..1024 {
            assert!(!cache.insert(entry(i)));
            assert!(cache.find(&key(i)).found());
        }

        // saturating the cache fails some inserts but corrupts nothing
        let mut not_inserted = 0u64;
        for i in 1024u64..64 * 1024 {
            if cache.insert(entry(i)) {
                assert!(cache.find(&key(i)).found());
            } else {
                not_inserted += 1;
            }
        }
        assert!(not_inserted > 0);

        cache.destroy();
    }

    #[test]
    fn removal() {
        let cache_limit = 256u64 * 1024;
        let manager = Arc::new(Manager::new(4 * cache_limit));
        let cache = PlainCache::create(&manager, cache_limit, false).unwrap();

        for i in 0u64..1024 {
            assert!(cache.insert(entry(i)));
        }

        // removing bogus keys changes nothing
        for i in 1024u64..1100 {
            assert!(!cache.remove(&key(i)));
        }
        for i in 0u64..1024 {
            assert!(cache.find(&key(i)).found());
        }

        // removing all actual keys
        for i in 0u64..1024 {
            assert!(cache.remove(&key(i)));
            assert!(!cache.find(&key(i)).found());
        }
        assert_eq!(cache.usage(), 0);

        cache.destroy();
    }

    #[test]
    fn found_values_round_trip() {
        let manager = Arc::new(Manager::new(1024 * 1024));
        let cache = PlainCache::create(&manager, 64 * 1024, false).unwrap();

        assert!(cache.insert(CachedValue::new(b"question", b"answer")));

        let finding = cache.find(b"question");
        assert_eq!(finding.value().unwrap().value(), b"answer");

        let copy = finding.copy().unwrap();
        drop(finding);
        assert_eq!(copy.key(), b"question");
        assert_eq!(copy.value(), b"answer");

        cache.destroy();
    }

    #[test]
    fn usage_tracks_insertions() {
        let manager = Arc::new(Manager::new(1024 * 1024));
        let cache = PlainCache::create(&manager, 64 * 1024, false).unwrap();

        assert_eq!(cache.usage(), 0);
        let size = entry(1).size();
        for i in 0u64..10 {
            assert!(cache.insert(entry(i)));
        }
        assert_eq!(cache.usage(), 10 * size);
        assert!(cache.remove(&key(3)));
        assert_eq!(cache.usage(), 9 * size);

        cache.destroy();
    }

    #[test]
    fn growth_by_resize_request() {
        let manager = Arc::new(Manager::new(1 << 30));
        let cache = PlainCache::create(&manager, 16 * 1024, true).unwrap();
        let initial_limit = cache.limit();
        assert_eq!(initial_limit, 16 * 1024);

        // fill until the first denied insert asks the manager for room;
        // the first request is granted immediately
        let mut i = 0u64;
        while cache.limit() == initial_limit {
            cache.insert(entry(i));
            i += 1;
            assert!(i < 1_000_000, "limit never grew");
        }
        assert_eq!(cache.limit(), 2 * initial_limit);

        cache.destroy();
    }

    #[test]
    fn migration_preserves_entries() {
        let manager = Arc::new(Manager::new(4 << 20));
        let cache = PlainCache::create(&manager, 256 * 1024, false).unwrap();

        for i in 0u64..500 {
            assert!(cache.insert(entry(i)));
        }

        let metadata = cache.inner.metadata();
        let old_log_size = metadata.lock().log_size();

        // grow the table; the manager runs the migrate task synchronously
        let (accepted, _) = manager.request_migrate(metadata, old_log_size + 1);
        assert!(accepted);

        assert_eq!(metadata.lock().log_size(), old_log_size + 1);
        assert!(metadata.lock().auxiliary_table_ptr().is_none());
        for i in 0u64..500 {
            assert!(cache.find(&key(i)).found());
        }

        // and shrink it back down
        let (accepted, _) = manager.request_migrate(metadata, old_log_size);
        assert!(accepted);

        assert_eq!(metadata.lock().log_size(), old_log_size);
        let mut survivors = 0;
        for i in 0u64..500 {
            if cache.find(&key(i)).found() {
                survivors += 1;
            }
        }
        // shrinking halves the slot count, a few entries may get evicted
        assert!(survivors >= 490);

        cache.destroy();
    }

    #[test]
    fn free_memory_reclaims_below_soft_limit() {
        let manager = Arc::new(Manager::new(4 << 20));
        let cache = PlainCache::create(&manager, 256 * 1024, false).unwrap();

        for i in 0u64..1000 {
            assert!(cache.insert(entry(i)));
        }
        let used = cache.usage();
        assert!(used > 0);

        // pin the soft limit below the current usage and reclaim
        {
            let metadata = cache.inner.metadata();
            let mut meta = metadata.lock();
            let hard = meta.hard_limit();
            assert!(meta.adjust_limits(used / 2, hard));
        }
        cache.inner.free_memory();
        assert!(cache.usage() <= used / 2);

        cache.destroy();
    }

    #[test]
    fn destroy_is_idempotent_and_final() {
        let manager = Arc::new(Manager::new(1024 * 1024));
        let cache = PlainCache::create(&manager, 64 * 1024, false).unwrap();

        assert!(cache.insert(entry(1)));
        let copy = cache.find(&key(1)).copy().unwrap();

        let allocation_before = manager.global_allocation();
        cache.destroy();
        cache.destroy();
        assert!(manager.global_allocation() < allocation_before);

        assert!(!cache.insert(entry(2)));
        assert!(!cache.find(&key(1)).found());
        assert!(!cache.remove(&key(1)));
        assert_eq!(cache.usage(), 0);
        assert_eq!(cache.limit(), 0);

        // copies made before the shutdown stay valid
        assert_eq!(copy.value(), &key(1));
    }

    #[test]
    fn shrink_to_usage_is_immediate() {
        let manager = Arc::new(Manager::new(8 << 20));
        let cache = PlainCache::create(&manager, 1 << 20, false).unwrap();
        for i in 0u64..100 {
            assert!(cache.insert(entry(i)));
        }

        // make the cache's ranking entry exist, then shrink the world
        for i in 0u64..1000 {
            cache.find(&key(i % 100));
        }
        let allocation = manager.global_allocation();
        assert!(manager.resize(allocation - (1 << 19)));
        assert!(manager.global_limit() == allocation - (1 << 19));
        // the cache's hard limit was cut but stays above its usage
        assert!(cache.inner.metadata().lock().hard_limit() >= cache.usage());
        assert!(
            cache.usage().max(MIN_CACHE_SIZE) <= cache.inner.metadata().lock().hard_limit()
        );
        assert!(!cache.inner.metadata().lock().is_set(Flag::Resizing));

        cache.destroy();
    }
}
