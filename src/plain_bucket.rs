use std::sync::atomic::{AtomicPtr, AtomicU32};

use crate::bucket::Bucket;
use crate::manager::Manager;
use crate::state::State;
use crate::table::{BucketFrame, BUCKET_SIZE};
use crate::value::CachedValue;

/// A plain LRU bucket: five `(hash, value)` slots and a state word, filling
/// one cache line exactly.
#[derive(Debug)]
#[repr(C, align(64))]
pub(crate) struct PlainBucket {
    state:  State,
    hashes: [AtomicU32; 5],
    slots:  [AtomicPtr<CachedValue>; 5],
}

const _: () = assert!(std::mem::size_of::<PlainBucket>() == BUCKET_SIZE);
const _: () = assert!(std::mem::align_of::<PlainBucket>() == BUCKET_SIZE);

// All-zero memory is an unlocked, empty bucket.
unsafe impl BucketFrame for PlainBucket {}

impl PlainBucket {
    #[cfg(test)]
    pub(crate) fn new() -> Self {
        PlainBucket {
            state:  State::new(),
            hashes: std::array::from_fn(|_| AtomicU32::new(0)),
            slots:  std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
        }
    }
}

impl Bucket for PlainBucket {
    type Context = ();

    const SLOTS: usize = 5;

    fn context(_manager: &Manager) -> Self::Context {}

    fn state(&self) -> &State {
        &self.state
    }

    fn hashes(&self) -> &[AtomicU32] {
        &self.hashes
    }

    fn slots(&self) -> &[AtomicPtr<CachedValue>] {
        &self.slots
    }

    fn on_lock(&self, _context: Self::Context) {}
}
