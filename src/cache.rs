use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[allow(unused_imports)]
use log::{debug, trace};
use parking_lot::Mutex;
use rand::Rng;

use crate::bucket::Bucket;
use crate::frequency::FrequencyBuffer;
use crate::manager::Manager;
use crate::metadata::Metadata;
use crate::state::{Flag, State};
use crate::table::Table;
use crate::value::{CachedValue, Finding};
use crate::Error;

// every 128th single operation feeds the manager's frequency ranking
const ACCESS_REPORT_MASK: u64 = 0x7F;
// every 4096th insertion inspects the eviction statistics
const MIGRATE_CHECK_MASK: u64 = 0xFFF;
// lock attempts granted to foreground operations
pub(crate) const DEFAULT_TRIES: u64 = 10;

/// Sample tokens for the per-cache eviction statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Stat {
    Eviction   = 1,
    NoEviction = 2,
}

/// The public operations shared by all cache flavors.
pub trait Cache: Send + Sync {
    /// Looks the key up, returning a scoped lease on the stored value.
    fn find(&self, key: &[u8]) -> Finding;

    /// Stores the value under its own key. Returns false when the key is
    /// already present, when the cache is out of room, or when the cache is
    /// contended or shutting down.
    fn insert(&self, value: Box<CachedValue>) -> bool;

    /// Drops the entry for the key, returning whether one was found.
    fn remove(&self, key: &[u8]) -> bool;

    /// Bytes currently used by this cache's entries.
    fn usage(&self) -> u64;

    /// The cache's advisory byte limit.
    fn limit(&self) -> u64;

    /// Shuts the cache down and returns its budget to the manager.
    /// Idempotent; afterwards every operation fails.
    fn destroy(&self);
}

/// Management operations the manager and its tasks invoke through the
/// metadata back-reference.
pub(crate) trait ManagedCache: Send + Sync {
    /// Evicts from random buckets until usage fits the soft limit again.
    fn free_memory(&self);

    /// Rehashes into the granted auxiliary table while serving traffic.
    fn migrate(&self);
}

/// 32-bit non-cryptographic key hash, clamped to be non-zero since buckets
/// use a hash of 0 to mark empty slots.
pub(crate) fn hash_key(key: &[u8]) -> u32 {
    fxhash::hash32(key).max(1)
}

/// A locked bucket, unlocked on drop. For single operations the guard also
/// keeps the cache's open-operation count raised.
pub(crate) struct BucketGuard<'a, B: Bucket> {
    bucket:     &'a B,
    operations: Option<&'a AtomicU32>,
}

impl<B: Bucket> Deref for BucketGuard<'_, B> {
    type Target = B;

    fn deref(&self) -> &B {
        self.bucket
    }
}

impl<B: Bucket> Drop for BucketGuard<'_, B> {
    fn drop(&mut self) {
        self.bucket.unlock();
        if let Some(operations) = self.operations {
            operations.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// The machinery common to both cache flavors: table mirrors, bucket lookup
/// with the migration redirect, usage accounting, background reclamation and
/// the incremental migration itself.
pub(crate) struct CacheInner<B: Bucket> {
    state:             State,
    allow_growth:      bool,
    manager:           Arc<Manager>,
    metadata:          Arc<Metadata>,
    eviction_stats:    FrequencyBuffer<u8>,
    insertion_count:   AtomicU64,
    access_count:      AtomicU64,
    open_operations:   AtomicU32,
    next_request_time: Mutex<Instant>,
    main_table:        AtomicPtr<Table>,
    auxiliary_table:   AtomicPtr<Table>,
    _bucket:           PhantomData<fn() -> B>,
}

impl<B: Bucket> CacheInner<B> {
    pub(crate) fn new(
        manager: Arc<Manager>,
        metadata: Arc<Metadata>,
        allow_growth: bool,
    ) -> CacheInner<B> {
        let main = metadata
            .lock()
            .table_ptr()
            .expect("a freshly registered cache has a table") as *mut Table;

        CacheInner {
            state: State::new(),
            allow_growth,
            manager,
            metadata,
            eviction_stats: FrequencyBuffer::new(1024),
            insertion_count: AtomicU64::new(0),
            access_count: AtomicU64::new(0),
            open_operations: AtomicU32::new(0),
            next_request_time: Mutex::new(Instant::now()),
            main_table: AtomicPtr::new(main),
            auxiliary_table: AtomicPtr::new(std::ptr::null_mut()),
            _bucket: PhantomData,
        }
    }

    #[cfg(test)]
    pub(crate) fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    fn is_operational(&self) -> bool {
        debug_assert!(self.state.is_locked());
        !self.state.is_set(Flag::Shutdown)
    }

    fn start_operation(&self) {
        self.open_operations.fetch_add(1, Ordering::AcqRel);
    }

    fn end_operation(&self) {
        self.open_operations.fetch_sub(1, Ordering::AcqRel);
    }

    /// Locks and returns the bucket responsible for `hash`, transparently
    /// following a bucket that has already been migrated into the auxiliary
    /// table. Single operations are counted (the guard decrements again) and
    /// sampled into the manager's access ranking.
    pub(crate) fn get_bucket(
        &self,
        hash: u32,
        max_tries: u64,
        single_operation: bool,
    ) -> Result<BucketGuard<'_, B>, Error> {
        if !self.state.try_lock(max_tries) {
            return Err(Error::Busy);
        }
        if !self.is_operational() {
            self.state.unlock();
            return Err(Error::NotOperational);
        }

        let mut operations = None;
        if single_operation {
            self.start_operation();
            operations = Some(&self.open_operations);
            if self.access_count.fetch_add(1, Ordering::Relaxed) & ACCESS_REPORT_MASK == 0 {
                self.manager.report_access(self.metadata.id());
            }
        }

        let migrating = self.state.is_set(Flag::Migrating);
        let main = unsafe { &*self.main_table.load(Ordering::Relaxed) };

        let mut result = Err(Error::Busy);
        let bucket = &main.buckets::<B>()[main.index_of(hash)];
        if bucket.try_lock(B::context(&self.manager), max_tries) {
            if migrating && bucket.is_migrated() {
                // this bucket moved, follow it into the auxiliary table
                bucket.unlock();
                let auxiliary = unsafe { &*self.auxiliary_table.load(Ordering::Relaxed) };
                let bucket = &auxiliary.buckets::<B>()[auxiliary.index_of(hash)];
                if bucket.try_lock(B::context(&self.manager), max_tries) {
                    if bucket.is_migrated() {
                        // the table swap beat us, caller retries with the new mapping
                        bucket.unlock();
                    } else {
                        result = Ok(bucket);
                    }
                }
            } else {
                result = Ok(bucket);
            }
        }

        let result = result.map(|bucket| BucketGuard { bucket, operations });
        if result.is_err() && single_operation {
            self.end_operation();
        }
        self.state.unlock();
        result
    }

    pub(crate) fn find(&self, key: &[u8]) -> Finding {
        let hash = hash_key(key);
        match self.get_bucket(hash, DEFAULT_TRIES, true) {
            Ok(bucket) => Finding::from_ptr(bucket.find(hash, key, true)),
            Err(_) => Finding::none(),
        }
    }

    pub(crate) fn insert(&self, value: Box<CachedValue>) -> bool {
        let hash = hash_key(value.key());
        let mut inserted = false;
        let mut denied = false;

        if let Ok(bucket) = self.get_bucket(hash, DEFAULT_TRIES, true) {
            if bucket.find(hash, value.key(), true).is_null() {
                let mut change = value.size() as i64;
                let candidate = if bucket.is_full() {
                    bucket.eviction_candidate()
                } else {
                    std::ptr::null_mut()
                };
                if !candidate.is_null() {
                    change -= unsafe { (*candidate).size() } as i64;
                }

                let allowed = self.metadata.lock().adjust_usage_if_allowed(change);
                if allowed {
                    if !candidate.is_null() {
                        bucket.evict(candidate, true);
                        unsafe { CachedValue::free(candidate) };
                        self.record_stat(Stat::Eviction);
                    } else {
                        self.record_stat(Stat::NoEviction);
                    }

                    let size = value.size();
                    let raw = Box::into_raw(value);
                    if bucket.insert(hash, raw) {
                        inserted = true;
                    } else {
                        // full of hot entries, or the hash is barred
                        self.metadata.lock().adjust_usage_if_allowed(-(size as i64));
                        unsafe { CachedValue::free(raw) };
                    }
                } else {
                    denied = true;
                }
            }
            drop(bucket);

            if denied {
                self.request_resize();
            }
            self.maybe_request_migrate();
        }

        inserted
    }

    pub(crate) fn remove(&self, key: &[u8]) -> bool {
        let hash = hash_key(key);
        let mut removed = false;

        if let Ok(bucket) = self.get_bucket(hash, DEFAULT_TRIES, true) {
            let value = bucket.remove(hash, key);
            if !value.is_null() {
                let size = unsafe { (*value).size() };
                self.metadata.lock().adjust_usage_if_allowed(-(size as i64));
                unsafe { CachedValue::free(value) };
                removed = true;
            }
        }

        removed
    }

    pub(crate) fn usage(&self) -> u64 {
        self.state.lock();
        let usage = if self.is_operational() {
            self.metadata.lock().usage()
        } else {
            0
        };
        self.state.unlock();
        usage
    }

    pub(crate) fn limit(&self) -> u64 {
        self.state.lock();
        let limit = if self.is_operational() {
            self.metadata.lock().soft_limit()
        } else {
            0
        };
        self.state.unlock();
        limit
    }

    fn record_stat(&self, stat: Stat) {
        self.eviction_stats.insert_record(stat as u8);
    }

    /// Books `size` freed bytes and reports whether usage fits the soft
    /// limit again.
    pub(crate) fn reclaim_memory(&self, size: u64) -> bool {
        let mut meta = self.metadata.lock();
        meta.adjust_usage_if_allowed(-(size as i64));
        meta.soft_limit() >= meta.usage()
    }

    /// Asks the manager to double the limit. Rate limited and only for
    /// growth-enabled caches.
    fn request_resize(&self) {
        if !self.allow_growth {
            return;
        }
        if Instant::now() < *self.next_request_time.lock() {
            return;
        }
        if !self.state.try_lock(DEFAULT_TRIES) {
            return;
        }
        let operational = self.is_operational();
        self.state.unlock();
        if !operational {
            return;
        }

        let new_limit = self.metadata.lock().hard_limit() * 2;
        let (_, next_request) = self.manager.request_resize(&self.metadata, new_limit);
        *self.next_request_time.lock() = next_request;
    }

    /// Once per a few thousand insertions, checks whether insertions evict
    /// nearly every time; that means the table has too few buckets, so a
    /// migration to twice the bucket count is requested.
    fn maybe_request_migrate(&self) {
        if self.insertion_count.fetch_add(1, Ordering::Relaxed) & MIGRATE_CHECK_MASK != 0 {
            return;
        }

        let stats = self.eviction_stats.frequencies();
        let count = |token: Stat| {
            stats
                .iter()
                .find(|&&(s, _)| s == token as u8)
                .map_or(0, |&(_, n)| n)
        };
        let evictions = count(Stat::Eviction);
        let no_evictions = count(Stat::NoEviction);
        if evictions == 0 || (no_evictions != 0 && evictions < 16 * no_evictions) {
            return;
        }

        if Instant::now() < *self.next_request_time.lock() {
            return;
        }
        if !self.state.try_lock(DEFAULT_TRIES) {
            return;
        }
        let blocked = !self.is_operational() || self.state.is_set(Flag::Migrating);
        self.state.unlock();
        if blocked {
            return;
        }

        let new_log_size = self.metadata.lock().log_size() + 1;
        let (_, next_request) = self.manager.request_migrate(&self.metadata, new_log_size);
        *self.next_request_time.lock() = next_request;
    }

    /// Counts the task as an open operation unless the cache is shutting
    /// down. A successful begin must be paired with `end_operation`.
    fn begin_task(&self) -> bool {
        self.state.lock();
        let operational = self.is_operational();
        if operational {
            self.start_operation();
        }
        self.state.unlock();
        operational
    }

    /// Evicts entries from uniformly random buckets until the cache fits its
    /// soft limit again. Runs as a background task.
    pub(crate) fn free_memory(&self) {
        if !self.begin_task() {
            return;
        }

        let mut under_limit = self.reclaim_memory(0);
        while !under_limit {
            let hash: u32 = rand::thread_rng().gen();
            match self.get_bucket(hash, DEFAULT_TRIES, false) {
                Ok(bucket) => {
                    let candidate = bucket.eviction_candidate();
                    if !candidate.is_null() {
                        let size = unsafe { (*candidate).size() };
                        bucket.evict(candidate, false);
                        unsafe { CachedValue::free(candidate) };
                        under_limit = self.reclaim_memory(size);
                    }
                }
                Err(Error::NotOperational) => break,
                Err(_) => {}
            }
        }

        self.end_operation();
    }

    /// Rehashes every entry from the main table into the auxiliary table
    /// granted by the manager, then swaps the tables.
    ///
    /// Buckets are transferred one source bucket at a time under both the
    /// source and all covering target locks, and marked `Migrated` when
    /// done; concurrent operations follow that mark through `get_bucket`.
    /// Entries are moved back-to-front so the per-bucket LRU order survives.
    pub(crate) fn migrate(&self) {
        if !self.begin_task() {
            return;
        }

        let auxiliary_ptr = self.metadata.lock().auxiliary_table_ptr();
        let Some(auxiliary_ptr) = auxiliary_ptr else {
            // no table was granted, nothing to do
            self.end_operation();
            return;
        };
        let auxiliary_ptr = auxiliary_ptr as *mut Table;
        let main_ptr = self.main_table.load(Ordering::Relaxed);

        self.state.lock();
        self.auxiliary_table.store(auxiliary_ptr, Ordering::Relaxed);
        self.state.toggle(Flag::Migrating);
        self.state.unlock();

        let main = unsafe { &*main_ptr };
        let auxiliary = unsafe { &*auxiliary_ptr };

        #[cfg(feature = "logging")]
        debug!(
            "migrating cache {} from log size {} to {}",
            self.metadata.id(),
            main.log_size(),
            auxiliary.log_size()
        );

        for i in 0..main.len() {
            let bucket = &main.buckets::<B>()[i];
            bucket.lock(B::context(&self.manager));

            // lock the target bucket(s) covering this bucket's hash prefix
            let base = (((i as u32) << main.mask_shift()) >> auxiliary.mask_shift()) as usize;
            let fanout = if auxiliary.log_size() > main.log_size() {
                1usize << (auxiliary.log_size() - main.log_size())
            } else {
                1
            };
            let targets = &auxiliary.buckets::<B>()[base..base + fanout];
            for target in targets {
                target.lock(B::context(&self.manager));
                // blacklist state must survive the move
                target.inherit(bucket);
            }

            // back to front keeps the LRU order intact in the target
            for k in (0..B::SLOTS).rev() {
                let hash = bucket.hashes()[k].load(Ordering::Relaxed);
                if hash == 0 {
                    continue;
                }
                let value = bucket.slots()[k].load(Ordering::Relaxed);
                bucket.hashes()[k].store(0, Ordering::Relaxed);
                bucket.slots()[k].store(std::ptr::null_mut(), Ordering::Relaxed);

                let target = &auxiliary.buckets::<B>()[auxiliary.index_of(hash)];
                if target.is_full() {
                    let candidate = target.eviction_candidate();
                    if !candidate.is_null() {
                        target.evict(candidate, true);
                        let size = unsafe { (*candidate).size() };
                        unsafe { CachedValue::free(candidate) };
                        self.reclaim_memory(size);
                    }
                }
                if !target.insert(hash, value) {
                    // the target refuses the entry (still full of leased
                    // values, or the hash is barred there), give it up
                    let size = unsafe { (*value).size() };
                    unsafe { CachedValue::free(value) };
                    self.reclaim_memory(size);
                }
            }

            bucket.state().toggle(Flag::Migrated);
            for target in targets {
                target.unlock();
            }
            bucket.unlock();
        }

        // swap to the new table
        self.state.lock();
        self.main_table.store(auxiliary_ptr, Ordering::Relaxed);
        self.auxiliary_table.store(main_ptr, Ordering::Relaxed);
        self.state.toggle(Flag::Migrating);
        self.state.unlock();

        // drain whatever the redirect window still left in the old table
        self.clear_table(main);

        self.state.lock();
        self.auxiliary_table
            .store(std::ptr::null_mut(), Ordering::Relaxed);
        self.state.unlock();

        self.metadata.lock().swap_tables();
        self.end_operation();
    }

    /// Frees every entry (waiting out leases) and zeroes every bucket.
    fn clear_table(&self, table: &Table) {
        for bucket in table.buckets::<B>() {
            bucket.lock(B::context(&self.manager));
            for k in 0..B::SLOTS {
                let value = bucket.slots()[k].load(Ordering::Relaxed);
                if !value.is_null() {
                    let size = unsafe { (*value).size() };
                    self.metadata.lock().adjust_usage_if_allowed(-(size as i64));
                    unsafe { CachedValue::free(value) };
                }
            }
            bucket.clear();
            bucket.unlock();
        }
    }

    /// Marks the cache as shut down, waits for in-flight operations to
    /// drain, frees all entries and hands everything back to the manager.
    /// Idempotent.
    pub(crate) fn shutdown(&self) {
        self.state.lock();
        if self.state.is_set(Flag::Shutdown) {
            self.state.unlock();
            return;
        }
        self.state.toggle(Flag::Shutdown);
        self.state.unlock();

        while self.open_operations.load(Ordering::Acquire) > 0 {
            thread::sleep(Duration::from_micros(1));
        }

        let main = self.main_table.swap(std::ptr::null_mut(), Ordering::Relaxed);
        if !main.is_null() {
            self.clear_table(unsafe { &*main });
        }
        let auxiliary = self
            .auxiliary_table
            .swap(std::ptr::null_mut(), Ordering::Relaxed);
        if !auxiliary.is_null() {
            self.clear_table(unsafe { &*auxiliary });
        }

        self.manager.unregister_cache(&self.metadata);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hashes_are_never_zero() {
        for i in 0u64..10_000 {
            assert_ne!(hash_key(&i.to_le_bytes()), 0);
        }
    }

    #[test]
    fn hashes_spread_over_upper_bits() {
        // bucket indexes come from the upper hash bits, they must not all
        // collapse for sequential keys
        let mut seen = std::collections::HashSet::new();
        for i in 0u64..1024 {
            seen.insert(hash_key(&i.to_le_bytes()) >> 24);
        }
        assert!(seen.len() > 64);
    }
}
