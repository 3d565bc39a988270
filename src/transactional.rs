use std::sync::Arc;

use crate::cache::{hash_key, Cache, CacheInner, ManagedCache};
use crate::manager::Manager;
use crate::transactional_bucket::TransactionalBucket;
use crate::value::{CachedValue, Finding};
use crate::Error;

/// The transactional cache flavor: three-slot buckets that additionally
/// blacklist hashes for the duration of the surrounding transactions.
///
/// Every bucket acquisition carries the manager's current transaction term,
/// so blacklists are wiped lazily once all transactions that could have
/// observed stale data are closed.
pub struct TransactionalCache {
    inner: CacheInner<TransactionalBucket>,
}

impl TransactionalCache {
    /// Registers a new transactional cache with the manager.
    pub fn create(
        manager: &Arc<Manager>,
        requested: u64,
        allow_growth: bool,
    ) -> Result<Arc<TransactionalCache>, Error> {
        let metadata = manager.register_cache(requested)?;
        let cache = Arc::new(TransactionalCache {
            inner: CacheInner::new(Arc::clone(manager), Arc::clone(&metadata), allow_growth),
        });
        let dyn_cache: Arc<dyn ManagedCache> = cache.clone();
        let weak: std::sync::Weak<dyn ManagedCache> = Arc::downgrade(&dyn_cache);
        metadata.lock().set_cache(weak);
        Ok(cache)
    }

    /// Evicts any entry stored under `key` and bars its hash from re-entering
    /// the cache until the current transactions have closed.
    ///
    /// Unlike plain operations this retries on bucket contention: an
    /// invalidation must not be dropped.
    pub fn blacklist(&self, key: &[u8]) {
        let hash = hash_key(key);
        loop {
            match self.inner.get_bucket(hash, crate::cache::DEFAULT_TRIES, true) {
                Ok(bucket) => {
                    let evicted = bucket.blacklist(hash, key);
                    if !evicted.is_null() {
                        let size = unsafe { (*evicted).size() };
                        unsafe { CachedValue::free(evicted) };
                        self.inner.reclaim_memory(size);
                    }
                    return;
                }
                Err(Error::Busy) => continue,
                Err(_) => return,
            }
        }
    }
}

impl Cache for TransactionalCache {
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

impl ManagedCache for TransactionalCache {
    fn free_memory(&self) {
        self.inner.free_memory();
    }

    fn migrate(&self) {
        self.inner.migrate();
    }
}

impl Drop for TransactionalCache {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(i: u64) -> Box<CachedValue> {
        CachedValue::new(&i.to_le_bytes(), &(!i).to_le_bytes())
    }

    fn key(i: u64) -> [u8; 8] {
        i.to_le_bytes()
    }

    #[test]
    fn insert_find_remove() {
        let manager = Arc::new(Manager::new(1024 * 1024));
        let cache = TransactionalCache::create(&manager, 256 * 1024, false).unwrap();

        for i in 0u64..512 {
            assert!(cache.insert(entry(i)));
        }
        for i in 0u64..512 {
            let finding = cache.find(&key(i));
            assert_eq!(finding.value().unwrap().value(), &(!i).to_le_bytes());
        }
        for i in 0u64..512 {
            assert!(cache.remove(&key(i)));
            assert!(!cache.find(&key(i)).found());
        }
        assert_eq!(cache.usage(), 0);

        cache.destroy();
    }

    #[test]
    fn blacklist_scopes_to_the_transaction() {
        let manager = Arc::new(Manager::new(1024 * 1024));
        let cache = TransactionalCache::create(&manager, 256 * 1024, false).unwrap();

        assert!(cache.insert(entry(1)));
        assert!(cache.insert(entry(2)));
        let used = cache.usage();

        manager.start_transaction();

        cache.blacklist(&key(2));
        assert!(!cache.find(&key(2)).found());
        assert!(cache.usage() < used);

        // the barred hash cannot re-enter while the transaction is open
        assert!(!cache.insert(entry(2)));
        assert!(!cache.find(&key(2)).found());
        // other keys are unaffected
        assert!(cache.find(&key(1)).found());

        manager.end_transaction();

        // the term moved on, the hash is admitted again
        assert!(cache.insert(entry(2)));
        assert!(cache.find(&key(2)).found());

        cache.destroy();
    }

    #[test]
    fn blacklisting_a_missing_key_still_bars_it() {
        let manager = Arc::new(Manager::new(1024 * 1024));
        let cache = TransactionalCache::create(&manager, 256 * 1024, false).unwrap();

        manager.start_transaction();
        cache.blacklist(&key(7));
        assert!(!cache.insert(entry(7)));
        manager.end_transaction();

        assert!(cache.insert(entry(7)));

        cache.destroy();
    }

    #[test]
    fn migration_carries_entries_over() {
        let manager = Arc::new(Manager::new(4 << 20));
        let cache = TransactionalCache::create(&manager, 256 * 1024, false).unwrap();

        for i in 0u64..300 {
            assert!(cache.insert(entry(i)));
        }

        let metadata = cache.inner.metadata();
        let old_log_size = metadata.lock().log_size();
        let (accepted, _) = manager.request_migrate(metadata, old_log_size + 1);
        assert!(accepted);
        assert_eq!(metadata.lock().log_size(), old_log_size + 1);

        for i in 0u64..300 {
            assert!(cache.find(&key(i)).found());
        }

        cache.destroy();
    }
}
