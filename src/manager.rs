use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[allow(unused_imports)]
use log::{debug, info, trace};

use crate::cache::Cache;
use crate::frequency::FrequencyBuffer;
use crate::metadata::{Metadata, MetadataGuard};
use crate::plain::PlainCache;
use crate::state::{Flag, State};
use crate::table::{table_byte_size, Table};
use crate::tasks::{Executor, FreeMemoryTask, MigrateTask};
use crate::transactional::TransactionalCache;
use crate::Error;

/// Smallest table any cache is handed out (`2^3` buckets).
pub(crate) const MIN_TABLE_LOG_SIZE: u32 = 3;
/// Smallest limit grant a registration can be whittled down to (`2^10`).
pub(crate) const MIN_LOG_SIZE: u32 = 10;
/// Caches are never shrunk below this many bytes.
pub(crate) const MIN_CACHE_SIZE: u64 = 1024;
/// A cache with a `2^n` byte limit starts with a `2^(n-6)` bucket table.
pub(crate) const TABLE_LOG_SIZE_ADJUSTMENT: u32 = 6;
/// Cool-down between resize/migrate requests from the same cache.
pub(crate) const REQUEST_COOLDOWN: Duration = Duration::from_secs(30);

const TABLE_LISTS: usize = 32;
// registry record plus list node overhead
const CACHE_RECORD_OVERHEAD: u64 = (std::mem::size_of::<Metadata>() + 16) as u64;
// bookkeeping for the spare-table lists, assuming 16 entries per list
const TABLE_LISTS_OVERHEAD: u64 = (TABLE_LISTS * 16 * 8) as u64;

/// The cache flavors a manager can create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Plain,
    Transactional,
}

/// Coordinates a set of caches under one global memory budget.
///
/// The manager grants every cache a power-of-two slice of the budget, leases
/// hash tables out of a recycling pool, samples per-cache access frequency,
/// and arbitrates growth: a cache that runs hot may be granted a larger limit
/// or a bigger table (rehashed into by a background migrate task), and when
/// the global budget shrinks, the coldest caches are cut down first.
///
/// It also owns the transaction term used by transactional caches: the term
/// is bumped whenever the count of open transactions leaves or reaches zero,
/// so it is odd while transactions are open and even in quiescence.
pub struct Manager {
    state:             State,
    access_stats:      FrequencyBuffer<u64>,
    open_transactions: AtomicU64,
    transaction_term:  AtomicU64,
    next_cache_id:     AtomicU64,
    executor:          Option<Arc<dyn Executor>>,
    inner:             UnsafeCell<ManagerInner>,
}

struct ManagerInner {
    caches:            Vec<Arc<Metadata>>,
    tables:            [Vec<Box<Table>>; TABLE_LISTS],
    global_soft_limit: u64,
    global_hard_limit: u64,
    global_allocation: u64,
}

// Safety: `inner` is only touched through a ManagerGuard, which holds the
// state word's lock.
unsafe impl Send for Manager {}
unsafe impl Sync for Manager {}

impl Manager {
    /// Creates a manager without an executor: background work (reclamation,
    /// migration) runs synchronously on the thread that triggers it.
    pub fn new(global_limit: u64) -> Manager {
        Manager::build(None, global_limit)
    }

    /// Creates a manager that dispatches background work to `executor`.
    pub fn with_executor(executor: Arc<dyn Executor>, global_limit: u64) -> Manager {
        Manager::build(Some(executor), global_limit)
    }

    fn build(executor: Option<Arc<dyn Executor>>, global_limit: u64) -> Manager {
        let access_stats = FrequencyBuffer::new(if global_limit >= (1 << 30) {
            128 * 1024
        } else {
            global_limit / 8192
        });

        let global_allocation = std::mem::size_of::<Manager>() as u64
            + TABLE_LISTS_OVERHEAD
            + access_stats.memory_usage();
        assert!(
            global_allocation < global_limit,
            "global limit too small for the manager's own footprint"
        );

        Manager {
            state: State::new(),
            access_stats,
            open_transactions: AtomicU64::new(0),
            transaction_term: AtomicU64::new(0),
            next_cache_id: AtomicU64::new(0),
            executor,
            inner: UnsafeCell::new(ManagerInner {
                caches:            Vec::new(),
                tables:            std::array::from_fn(|_| Vec::new()),
                global_soft_limit: global_limit,
                global_hard_limit: global_limit,
                global_allocation,
            }),
        }
    }

    /// Creates a cache of the given flavor with a limit of at most
    /// `requested` bytes (the actual grant may be halved down to fit the
    /// global budget). With `allow_growth` the cache will ask for a larger
    /// limit when it fills up.
    pub fn create_cache(
        self: &Arc<Self>,
        kind: CacheKind,
        requested: u64,
        allow_growth: bool,
    ) -> Result<Arc<dyn Cache>, Error> {
        match kind {
            CacheKind::Plain => {
                let cache: Arc<dyn Cache> = PlainCache::create(self, requested, allow_growth)?;
                Ok(cache)
            }
            CacheKind::Transactional => {
                let cache: Arc<dyn Cache> =
                    TransactionalCache::create(self, requested, allow_growth)?;
                Ok(cache)
            }
        }
    }

    /// Changes the global limit. Returns whether the new limit is fully in
    /// effect; `false` means either that a previous shrink is still in
    /// progress, or that background reclamation has been scheduled and the
    /// hard limit will catch down to the requested soft limit later.
    pub fn resize(self: &Arc<Self>, new_global_limit: u64) -> bool {
        let mut tasks = Vec::new();
        let success;
        {
            let mut guard = self.lock();

            // if the limit is safe, just set it
            let mut done = guard.adjust_global_limits_if_allowed(new_global_limit);

            // otherwise see if freeing the unused tables gets us there
            if !done {
                guard.free_unused_tables();
                done = guard.adjust_global_limits_if_allowed(new_global_limit);
            }

            if done {
                // this also supersedes any still-pending shrink
                if guard.is_set(Flag::Resizing) {
                    guard.toggle(Flag::Resizing);
                }
            } else if guard.is_set(Flag::Resizing) {
                // a previous shrink still owns the resizing flag
                return false;
            }

            if !done {
                guard.toggle(Flag::Resizing);
                guard.inner_mut().global_soft_limit = new_global_limit;

                // shrink cold caches first so the hot ones stay large
                let stats = self.access_stats.frequencies();

                // gently: no tasks, cut limits straight down to current usage
                let goal = guard.inner().global_allocation - new_global_limit;
                let reclaimed =
                    guard.resize_all_caches(self, &stats, true, true, goal, &mut tasks);
                guard.inner_mut().global_allocation -= reclaimed;
                done = guard.adjust_global_limits_if_allowed(new_global_limit);
                if done {
                    guard.toggle(Flag::Resizing);
                } else {
                    // aggressively: schedule tasks that actually evict
                    let goal = guard
                        .inner()
                        .global_allocation
                        .saturating_sub(new_global_limit);
                    let reclaimed =
                        guard.resize_all_caches(self, &stats, false, true, goal, &mut tasks);
                    guard.inner_mut().global_allocation -= reclaimed;
                    done = guard.adjust_global_limits_if_allowed(new_global_limit);
                    if done {
                        guard.toggle(Flag::Resizing);
                    }
                }
            }
            success = done;
        }

        for task in tasks {
            self.dispatch(move || task.run());
        }
        success
    }

    /// Takes budget away from cold caches so that hot caches' future growth
    /// requests can be granted. Refused while a global resize is in progress.
    pub fn rebalance(self: &Arc<Self>) -> bool {
        let mut tasks = Vec::new();
        {
            let mut guard = self.lock();
            if guard.is_set(Flag::Resizing) || guard.is_set(Flag::Rebalancing) {
                return false;
            }
            guard.toggle(Flag::Rebalancing);

            let stats = self.access_stats.frequencies();
            let cold = &stats[..stats.len() / 2];
            let reclaimed = guard.resize_all_caches(self, cold, true, false, 0, &mut tasks);
            guard.inner_mut().global_allocation -= reclaimed;

            guard.toggle(Flag::Rebalancing);
        }
        debug_assert!(tasks.is_empty());
        true
    }

    /// The enforced global limit (the pending target while a shrink is in
    /// progress).
    pub fn global_limit(&self) -> u64 {
        let guard = self.lock();
        if guard.is_set(Flag::Resizing) {
            guard.inner().global_soft_limit
        } else {
            guard.inner().global_hard_limit
        }
    }

    /// Bytes currently charged against the global limit.
    pub fn global_allocation(&self) -> u64 {
        self.lock().inner().global_allocation
    }

    pub fn start_transaction(&self) {
        if self.open_transactions.fetch_add(1, Ordering::AcqRel) == 0 {
            self.transaction_term.fetch_add(1, Ordering::Release);
        }
    }

    pub fn end_transaction(&self) {
        if self.open_transactions.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.transaction_term.fetch_add(1, Ordering::Release);
        }
    }

    /// Monotone counter separating transactional epochs; odd while any
    /// transaction is open.
    pub fn transaction_term(&self) -> u64 {
        self.transaction_term.load(Ordering::Acquire)
    }

    fn lock(&self) -> ManagerGuard<'_> {
        self.state.lock();
        ManagerGuard { manager: self }
    }

    pub(crate) fn dispatch(&self, task: impl FnOnce() + Send + 'static) {
        match &self.executor {
            Some(executor) => executor.spawn(Box::new(task)),
            None => task(),
        }
    }

    /// Admits a new cache: picks the largest power-of-two grant that fits
    /// the global budget (halving the request as needed), charges it, and
    /// leases an initial table.
    pub(crate) fn register_cache(&self, requested: u64) -> Result<Arc<Metadata>, Error> {
        let mut log_size = 0u32;
        while (1u64 << log_size) < requested {
            log_size += 1;
        }
        let mut granted = 1u64 << log_size;
        let mut table_log_size = if log_size > TABLE_LOG_SIZE_ADJUSTMENT + MIN_TABLE_LOG_SIZE {
            log_size - TABLE_LOG_SIZE_ADJUSTMENT
        } else {
            MIN_TABLE_LOG_SIZE
        };

        let mut guard = self.lock();
        loop {
            if log_size < MIN_LOG_SIZE {
                return Err(Error::OutOfCapacity);
            }
            let table_allocation = if guard.inner().tables[table_log_size as usize].is_empty() {
                table_byte_size(table_log_size)
            } else {
                0
            };
            if guard.increase_allowed(granted + table_allocation + CACHE_RECORD_OVERHEAD) {
                break;
            }

            granted >>= 1;
            log_size -= 1;
            if table_log_size > MIN_TABLE_LOG_SIZE {
                table_log_size -= 1;
            }
        }

        guard.inner_mut().global_allocation += granted + CACHE_RECORD_OVERHEAD;
        let id = self.next_cache_id.fetch_add(1, Ordering::Relaxed) + 1;
        let metadata = Metadata::new(id, granted);
        guard.inner_mut().caches.push(Arc::clone(&metadata));

        let mut meta = metadata.lock();
        guard.lease_table(&mut meta, table_log_size);
        drop(meta);

        #[cfg(feature = "logging")]
        debug!(
            "registered cache {} with limit {} and table log size {}",
            id, granted, table_log_size
        );
        Ok(metadata)
    }

    /// Returns a cache's budget and tables; the metadata record is dropped
    /// from the registry.
    pub(crate) fn unregister_cache(&self, metadata: &Arc<Metadata>) {
        {
            let mut guard = self.lock();
            {
                let mut meta = metadata.lock();
                let returned = meta.hard_limit() + CACHE_RECORD_OVERHEAD;
                guard.inner_mut().global_allocation -= returned;
                guard.reclaim_tables(&mut meta, false);
            }
            guard
                .inner_mut()
                .caches
                .retain(|m| !Arc::ptr_eq(m, metadata));
        }
        self.access_stats.purge_record(metadata.id());
    }

    /// A cache asks for a new (usually doubled) limit. Grants it if the
    /// global budget allows. The returned instant is the earliest time the
    /// cache may ask again.
    pub(crate) fn request_resize(
        &self,
        metadata: &Arc<Metadata>,
        requested_limit: u64,
    ) -> (bool, Instant) {
        let next_request = Instant::now() + REQUEST_COOLDOWN;
        let mut allowed = false;

        let mut guard = self.lock();
        if !guard.is_registered(metadata) {
            return (false, next_request);
        }
        let mut meta = metadata.lock();
        if !meta.is_set(Flag::Resizing) {
            let old_hard = meta.hard_limit();
            let fits = requested_limit < old_hard
                || guard.increase_allowed(requested_limit - old_hard);
            if fits && meta.adjust_limits(requested_limit, requested_limit) {
                allowed = true;
                let inner = guard.inner_mut();
                if requested_limit >= old_hard {
                    inner.global_allocation += requested_limit - old_hard;
                } else {
                    inner.global_allocation -= old_hard - requested_limit;
                }
            }
        }

        (allowed, next_request)
    }

    /// A cache asks to be rehashed into a table of `2^requested_log_size`
    /// buckets. On success an auxiliary table is leased and a migrate task
    /// is dispatched.
    pub(crate) fn request_migrate(
        self: &Arc<Self>,
        metadata: &Arc<Metadata>,
        requested_log_size: u32,
    ) -> (bool, Instant) {
        let next_request = Instant::now() + REQUEST_COOLDOWN;
        if !(MIN_TABLE_LOG_SIZE..TABLE_LISTS as u32).contains(&requested_log_size) {
            return (false, next_request);
        }

        let mut task = None;
        {
            let mut guard = self.lock();
            if !guard.is_registered(metadata) {
                return (false, next_request);
            }
            let mut meta = metadata.lock();

            let busy = meta.is_set(Flag::Migrating)
                || meta.auxiliary_table_ptr().is_some()
                || meta.log_size() == requested_log_size;
            if !busy {
                let pooled = !guard.inner().tables[requested_log_size as usize].is_empty();
                if pooled || guard.increase_allowed(table_byte_size(requested_log_size)) {
                    if let Some(cache) = meta.cache() {
                        guard.lease_table(&mut meta, requested_log_size);
                        meta.toggle(Flag::Migrating);
                        task = Some(MigrateTask::new(
                            Arc::clone(self),
                            cache,
                            Arc::clone(metadata),
                        ));
                    }
                }
            }
        }

        match task {
            Some(task) => {
                self.dispatch(move || task.run());
                (true, next_request)
            }
            None => (false, next_request),
        }
    }

    /// Called by the migrate task once the cache runs on the new table:
    /// recycles the old one and lifts the migrating mark.
    pub(crate) fn reclaim_auxiliary(&self, metadata: &Arc<Metadata>) {
        let mut guard = self.lock();
        let mut meta = metadata.lock();
        guard.reclaim_tables(&mut meta, true);
        if meta.is_set(Flag::Migrating) {
            meta.toggle(Flag::Migrating);
        }
    }

    /// Called by a finishing free-memory task: pins the cache's hard limit
    /// down onto its soft limit, releases the freed budget globally, and
    /// completes a pending global shrink once the allocation fits.
    pub(crate) fn finish_shrink(&self, metadata: &Arc<Metadata>) {
        let mut guard = self.lock();
        if !guard.is_registered(metadata) {
            // the cache was destroyed while the task was in flight and its
            // budget has already been returned
            return;
        }
        {
            let mut meta = metadata.lock();
            let old_hard = meta.hard_limit();
            let soft = meta.soft_limit();
            let new_hard = soft.max(meta.usage());
            if new_hard < old_hard && meta.adjust_limits(soft, new_hard) {
                guard.inner_mut().global_allocation -= old_hard - new_hard;
            }
            if meta.is_set(Flag::Resizing) {
                meta.toggle(Flag::Resizing);
            }
        }

        let inner = guard.inner();
        if guard.is_set(Flag::Resizing) && inner.global_allocation <= inner.global_soft_limit {
            let soft = inner.global_soft_limit;
            guard.inner_mut().global_hard_limit = soft;
            guard.toggle(Flag::Resizing);
        }
    }

    /// Records a (sampled) access for the frequency ranking.
    pub(crate) fn report_access(&self, cache_id: u64) {
        self.access_stats.insert_record(cache_id);
    }
}

/// Exclusive view of the locked manager. Unlocks on drop.
struct ManagerGuard<'a> {
    manager: &'a Manager,
}

impl Drop for ManagerGuard<'_> {
    fn drop(&mut self) {
        self.manager.state.unlock();
    }
}

impl ManagerGuard<'_> {
    fn inner(&self) -> &ManagerInner {
        unsafe { &*self.manager.inner.get() }
    }

    fn inner_mut(&mut self) -> &mut ManagerInner {
        unsafe { &mut *self.manager.inner.get() }
    }

    fn is_set(&self, flag: Flag) -> bool {
        self.manager.state.is_set(flag)
    }

    fn is_registered(&self, metadata: &Arc<Metadata>) -> bool {
        self.inner().caches.iter().any(|m| Arc::ptr_eq(m, metadata))
    }

    fn toggle(&self, flag: Flag) {
        self.manager.state.toggle(flag);
    }

    /// Whether growing the allocation by `increase` stays under the limit
    /// (the soft limit while a shrink is pending).
    fn increase_allowed(&self, increase: u64) -> bool {
        let inner = self.inner();
        let limit = if self.is_set(Flag::Resizing) && inner.global_allocation < inner.global_soft_limit
        {
            inner.global_soft_limit
        } else {
            inner.global_hard_limit
        };
        inner.global_allocation + increase < limit
    }

    /// Hands `metadata` a table of the requested size, drawing from the pool
    /// or allocating (and charging) a fresh one. The table arrives as the
    /// auxiliary table, or as the main table if there is none yet.
    fn lease_table(&mut self, meta: &mut MetadataGuard<'_>, log_size: u32) {
        let pooled = self.inner_mut().tables[log_size as usize].pop();
        let table = match pooled {
            Some(table) => table,
            None => {
                self.inner_mut().global_allocation += table_byte_size(log_size);
                Table::new(log_size)
            }
        };
        meta.grant_auxiliary_table(table);
        if meta.table_ptr().is_none() {
            meta.swap_tables();
        }
    }

    /// Takes tables back into the pool. The memory stays charged against the
    /// global allocation until the pool is purged.
    fn reclaim_tables(&mut self, meta: &mut MetadataGuard<'_>, auxiliary_only: bool) {
        let log_size = meta.auxiliary_log_size() as usize;
        if let Some(table) = meta.release_auxiliary_table() {
            self.inner_mut().tables[log_size].push(table);
        }
        if auxiliary_only {
            return;
        }
        let log_size = meta.log_size() as usize;
        if let Some(table) = meta.release_table() {
            self.inner_mut().tables[log_size].push(table);
        }
    }

    fn free_unused_tables(&mut self) {
        let inner = self.inner_mut();
        for list in inner.tables.iter_mut() {
            while let Some(table) = list.pop() {
                inner.global_allocation -= table.byte_size();
            }
        }
    }

    /// Directly adopts the new limit if the current allocation already fits.
    fn adjust_global_limits_if_allowed(&mut self, new_global_limit: u64) -> bool {
        if new_global_limit < self.inner().global_allocation {
            return false;
        }
        let inner = self.inner_mut();
        inner.global_soft_limit = new_global_limit;
        inner.global_hard_limit = new_global_limit;
        true
    }

    /// Walks caches in the given (coldest-first) order and shrinks them.
    /// Limits cut below usage leave a pending shrink behind: the cache is
    /// marked resizing and a free-memory task is collected for dispatch
    /// after the manager unlocks. Returns the budget reclaimed immediately.
    fn resize_all_caches(
        &mut self,
        manager: &Arc<Manager>,
        stats: &[(u64, u64)],
        no_tasks: bool,
        aggressive: bool,
        goal: u64,
        tasks: &mut Vec<FreeMemoryTask>,
    ) -> u64 {
        let mut reclaimed = 0u64;
        for &(id, _) in stats {
            let Some(metadata) = self
                .inner()
                .caches
                .iter()
                .find(|m| m.id() == id)
                .map(Arc::clone)
            else {
                continue;
            };

            let mut meta = metadata.lock();
            if meta.is_set(Flag::Resizing) {
                // an earlier shrink is still pending
                continue;
            }

            let usage = meta.usage();
            let hard = meta.hard_limit();
            let new_limit = if aggressive {
                if no_tasks {
                    usage
                } else {
                    usage.min(hard / 4)
                }
            } else if no_tasks {
                usage.max(hard / 2)
            } else {
                usage.min(hard / 2)
            };
            let new_limit = new_limit.max(MIN_CACHE_SIZE);
            if new_limit >= hard {
                continue;
            }

            if usage <= new_limit {
                meta.adjust_limits(new_limit, new_limit);
                reclaimed += hard - new_limit;
            } else if !no_tasks {
                if let Some(cache) = meta.cache() {
                    meta.adjust_limits(new_limit, hard);
                    meta.toggle(Flag::Resizing);
                    tasks.push(FreeMemoryTask::new(
                        Arc::clone(manager),
                        cache,
                        Arc::clone(&metadata),
                    ));
                }
            }

            if goal > 0 && reclaimed >= goal {
                break;
            }
        }
        reclaimed
    }
}
