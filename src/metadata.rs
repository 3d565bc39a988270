use std::cell::UnsafeCell;
use std::sync::{Arc, Weak};

use crate::cache::ManagedCache;
use crate::state::{Flag, State};
use crate::table::Table;

/// Per-cache accounting record, shared between the cache and the manager.
///
/// The record carries the cache's memory usage and limits plus the tables
/// currently leased to it. Both sides funnel every access through
/// [`Metadata::lock`], a spin lock on the record's state word; the guard is
/// the only way to reach the mutable fields.
#[derive(Debug)]
pub(crate) struct Metadata {
    id:    u64,
    state: State,
    inner: UnsafeCell<MetadataInner>,
}

#[derive(Debug)]
struct MetadataInner {
    cache:           Weak<dyn ManagedCache>,
    usage:           u64,
    soft_limit:      u64,
    hard_limit:      u64,
    table:           Option<Box<Table>>,
    auxiliary_table: Option<Box<Table>>,
}

// Safety: `inner` is only touched through a MetadataGuard, which holds the
// state word's lock.
unsafe impl Send for Metadata {}
unsafe impl Sync for Metadata {}

impl Metadata {
    pub(crate) fn new(id: u64, limit: u64) -> Arc<Metadata> {
        Arc::new(Metadata {
            id,
            state: State::new(),
            inner: UnsafeCell::new(MetadataInner {
                cache:           Weak::<crate::plain::PlainCache>::new(),
                usage:           0,
                soft_limit:      limit,
                hard_limit:      limit,
                table:           None,
                auxiliary_table: None,
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn lock(&self) -> MetadataGuard<'_> {
        self.state.lock();
        MetadataGuard { meta: self }
    }
}

/// Exclusive view of a locked metadata record. Unlocks on drop.
pub(crate) struct MetadataGuard<'a> {
    meta: &'a Metadata,
}

impl Drop for MetadataGuard<'_> {
    fn drop(&mut self) {
        self.meta.state.unlock();
    }
}

impl MetadataGuard<'_> {
    fn inner(&self) -> &MetadataInner {
        unsafe { &*self.meta.inner.get() }
    }

    fn inner_mut(&mut self) -> &mut MetadataInner {
        unsafe { &mut *self.meta.inner.get() }
    }

    pub(crate) fn set_cache(&mut self, cache: Weak<dyn ManagedCache>) {
        self.inner_mut().cache = cache;
    }

    pub(crate) fn cache(&self) -> Option<Arc<dyn ManagedCache>> {
        self.inner().cache.upgrade()
    }

    pub(crate) fn usage(&self) -> u64 {
        self.inner().usage
    }

    pub(crate) fn soft_limit(&self) -> u64 {
        self.inner().soft_limit
    }

    pub(crate) fn hard_limit(&self) -> u64 {
        self.inner().hard_limit
    }

    pub(crate) fn is_set(&self, flag: Flag) -> bool {
        self.meta.state.is_set(flag)
    }

    pub(crate) fn toggle(&self, flag: Flag) {
        self.meta.state.toggle(flag);
    }

    /// Commits a usage change if it stays within the hard limit. Negative
    /// changes always succeed.
    pub(crate) fn adjust_usage_if_allowed(&mut self, change: i64) -> bool {
        let inner = self.inner_mut();
        if change < 0 {
            inner.usage = inner.usage.saturating_sub(change.unsigned_abs());
            return true;
        }
        if inner.usage + change as u64 <= inner.hard_limit {
            inner.usage += change as u64;
            return true;
        }
        false
    }

    /// Adopts new limits, requiring that current usage fits under the new
    /// hard limit.
    pub(crate) fn adjust_limits(&mut self, soft_limit: u64, hard_limit: u64) -> bool {
        let inner = self.inner_mut();
        if inner.usage > hard_limit {
            return false;
        }
        inner.soft_limit = soft_limit;
        inner.hard_limit = hard_limit;
        true
    }

    pub(crate) fn log_size(&self) -> u32 {
        self.inner().table.as_ref().map_or(0, |t| t.log_size())
    }

    pub(crate) fn auxiliary_log_size(&self) -> u32 {
        self.inner().auxiliary_table.as_ref().map_or(0, |t| t.log_size())
    }

    pub(crate) fn table_ptr(&self) -> Option<*const Table> {
        self.inner().table.as_deref().map(|t| t as *const Table)
    }

    pub(crate) fn auxiliary_table_ptr(&self) -> Option<*const Table> {
        self.inner()
            .auxiliary_table
            .as_deref()
            .map(|t| t as *const Table)
    }

    pub(crate) fn grant_auxiliary_table(&mut self, table: Box<Table>) {
        debug_assert!(self.inner().auxiliary_table.is_none());
        self.inner_mut().auxiliary_table = Some(table);
    }

    pub(crate) fn swap_tables(&mut self) {
        let inner = self.inner_mut();
        std::mem::swap(&mut inner.table, &mut inner.auxiliary_table);
    }

    pub(crate) fn release_table(&mut self) -> Option<Box<Table>> {
        self.inner_mut().table.take()
    }

    pub(crate) fn release_auxiliary_table(&mut self) -> Option<Box<Table>> {
        self.inner_mut().auxiliary_table.take()
    }
}
