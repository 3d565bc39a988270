use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

/// An immutable, reference counted key/value record.
///
/// Values are constructed by the caller and handed to a cache by
/// `insert`, which takes ownership. While stored, the owning bucket holds the
/// record behind a raw pointer; every [`Finding`] returned by `find` takes a
/// lease (reference count increment) for as long as it is alive. A record is
/// only freed once its reference count has drained to zero, the freeing side
/// spin-waits for that.
#[derive(Debug)]
pub struct CachedValue {
    ref_count: AtomicU32,
    key:       Box<[u8]>,
    value:     Box<[u8]>,
}

impl CachedValue {
    pub fn new(key: &[u8], value: &[u8]) -> Box<CachedValue> {
        Box::new(CachedValue {
            ref_count: AtomicU32::new(0),
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Bytes this record accounts for against its cache's usage.
    pub fn size(&self) -> u64 {
        (std::mem::size_of::<CachedValue>() + self.key.len() + self.value.len()) as u64
    }

    /// Deep copy with a fresh reference count.
    pub fn copy(&self) -> Box<CachedValue> {
        CachedValue::new(&self.key, &self.value)
    }

    pub(crate) fn same_key(&self, key: &[u8]) -> bool {
        *self.key == *key
    }

    pub(crate) fn lease(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn release(&self) {
        self.ref_count.fetch_sub(1, Ordering::Release);
    }

    pub(crate) fn is_freeable(&self) -> bool {
        self.ref_count.load(Ordering::Acquire) == 0
    }

    /// Frees an evicted record, spinning until all leases are released.
    ///
    /// # Safety
    ///
    /// `value` must have been created by [`CachedValue::new`] (via
    /// `Box::into_raw`), must have been removed from its bucket, and the
    /// caller must be its sole owner.
    pub(crate) unsafe fn free(value: *mut CachedValue) {
        while !(*value).is_freeable() {
            thread::sleep(Duration::from_micros(1));
        }
        drop(Box::from_raw(value));
    }
}

/// A scoped lease on a cached value, returned by `find`.
///
/// Dropping the finding releases the lease; that release is what eventually
/// allows the record to be evicted and freed. Callers that need the data
/// beyond the finding's scope must [`copy`](CachedValue::copy) it.
#[derive(Debug)]
pub struct Finding {
    value: *const CachedValue,
}

// A finding keeps its record alive through the lease; the record itself is
// immutable apart from the atomic reference count.
unsafe impl Send for Finding {}
unsafe impl Sync for Finding {}

impl Finding {
    pub(crate) fn none() -> Self {
        Finding {
            value: std::ptr::null(),
        }
    }

    pub(crate) fn from_ptr(value: *const CachedValue) -> Self {
        let mut finding = Finding::none();
        finding.reset(value);
        finding
    }

    /// Swaps the underlying record, releasing the old lease and taking a new
    /// one. Must be called while the bucket holding `value` is locked.
    pub(crate) fn reset(&mut self, value: *const CachedValue) {
        if !self.value.is_null() {
            unsafe { (*self.value).release() };
        }
        self.value = value;
        if !self.value.is_null() {
            unsafe { (*self.value).lease() };
        }
    }

    pub fn found(&self) -> bool {
        !self.value.is_null()
    }

    pub fn value(&self) -> Option<&CachedValue> {
        // Safety: the lease taken in reset() keeps the record alive until
        // this finding is dropped.
        unsafe { self.value.as_ref() }
    }

    pub fn copy(&self) -> Option<Box<CachedValue>> {
        self.value().map(CachedValue::copy)
    }
}

impl Drop for Finding {
    fn drop(&mut self) {
        if !self.value.is_null() {
            unsafe { (*self.value).release() };
        }
    }
}
