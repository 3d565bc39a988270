use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crate::bucket::Bucket;
use crate::manager::Manager;
use crate::state::{Flag, State};
use crate::table::{BucketFrame, BUCKET_SIZE};
use crate::value::CachedValue;

/// A bucket with transactional blacklisting: three data slots, four
/// blacklisted hashes and the term they belong to, in one cache line.
///
/// A blacklist entry bars a hash from being stored for as long as the
/// transaction that removed it may still be open. Rather than being cleaned
/// up eagerly, the whole set is stamped with the manager's transaction term:
/// the first lock acquisition carrying a newer term wipes it. When more than
/// four hashes get blacklisted in the same term, the bucket degrades to
/// refusing every hash until the term moves on.
#[derive(Debug)]
#[repr(C, align(64))]
pub(crate) struct TransactionalBucket {
    state:            State,
    hashes:           [AtomicU32; 3],
    blacklist_hashes: [AtomicU32; 4],
    blacklist_term:   AtomicU64,
    slots:            [AtomicPtr<CachedValue>; 3],
}

const _: () = assert!(std::mem::size_of::<TransactionalBucket>() == BUCKET_SIZE);
const _: () = assert!(std::mem::align_of::<TransactionalBucket>() == BUCKET_SIZE);

// All-zero memory is an unlocked, empty bucket at term 0.
unsafe impl BucketFrame for TransactionalBucket {}

impl TransactionalBucket {
    #[cfg(test)]
    pub(crate) fn new() -> Self {
        TransactionalBucket {
            state:            State::new(),
            hashes:           std::array::from_fn(|_| AtomicU32::new(0)),
            blacklist_hashes: std::array::from_fn(|_| AtomicU32::new(0)),
            blacklist_term:   AtomicU64::new(0),
            slots:            std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
        }
    }

    pub(crate) fn blacklist_term(&self) -> u64 {
        self.blacklist_term.load(Ordering::Relaxed)
    }

    pub(crate) fn is_fully_blacklisted(&self) -> bool {
        self.state.is_set(Flag::Blacklisted)
    }

    pub(crate) fn is_blacklisted(&self, hash: u32) -> bool {
        debug_assert!(self.state.is_locked());
        if self.is_fully_blacklisted() {
            return true;
        }
        self.blacklist_hashes
            .iter()
            .any(|slot| slot.load(Ordering::Relaxed) == hash)
    }

    /// Evicts any entry matching the key and bars the hash until the term
    /// moves on. Returns the evicted value (the caller owns it and must
    /// account for it), if there was one.
    pub(crate) fn blacklist(&self, hash: u32, key: &[u8]) -> *mut CachedValue {
        debug_assert!(self.state.is_locked());
        let evicted = self.remove(hash, key);
        self.bar_hash(hash);
        evicted
    }

    fn bar_hash(&self, hash: u32) {
        if self.is_fully_blacklisted() {
            return;
        }
        for slot in self.blacklist_hashes.iter() {
            if slot.load(Ordering::Relaxed) == 0 {
                slot.store(hash, Ordering::Relaxed);
                return;
            }
        }
        // no free blacklist slot, refuse everything for this term
        self.state.toggle(Flag::Blacklisted);
    }

    /// Rolls the blacklist over to a newer transaction term, dropping all
    /// blacklisted hashes.
    fn update_blacklist_term(&self, term: u64) {
        if term > self.blacklist_term.load(Ordering::Relaxed) {
            self.blacklist_term.store(term, Ordering::Relaxed);

            if self.is_fully_blacklisted() {
                self.state.toggle(Flag::Blacklisted);
            }
            for slot in self.blacklist_hashes.iter() {
                slot.store(0, Ordering::Relaxed);
            }
        }
    }
}

impl Bucket for TransactionalBucket {
    type Context = u64;

    const SLOTS: usize = 3;

    fn context(manager: &Manager) -> Self::Context {
        manager.transaction_term()
    }

    fn state(&self) -> &State {
        &self.state
    }

    fn hashes(&self) -> &[AtomicU32] {
        &self.hashes
    }

    fn slots(&self) -> &[AtomicPtr<CachedValue>] {
        &self.slots
    }

    fn on_lock(&self, term: Self::Context) {
        self.update_blacklist_term(term);
    }

    fn accepts(&self, hash: u32) -> bool {
        !self.is_blacklisted(hash)
    }

    fn inherit(&self, source: &Self) {
        if source.is_fully_blacklisted() {
            if !self.is_fully_blacklisted() {
                self.state.toggle(Flag::Blacklisted);
            }
            return;
        }
        for slot in source.blacklist_hashes.iter() {
            let hash = slot.load(Ordering::Relaxed);
            if hash != 0 && !self.is_blacklisted(hash) {
                self.bar_hash(hash);
            }
        }
    }

    fn clear_extra(&self) {
        for slot in self.blacklist_hashes.iter() {
            slot.store(0, Ordering::Relaxed);
        }
        self.blacklist_term.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn values(n: usize) -> Vec<*mut CachedValue> {
        (0..n as u64)
            .map(|i| Box::into_raw(CachedValue::new(&i.to_le_bytes(), &i.to_le_bytes())))
            .collect()
    }

    fn cleanup(ptrs: Vec<*mut CachedValue>) {
        for ptr in ptrs {
            unsafe { drop(Box::from_raw(ptr)) };
        }
    }

    fn key(i: u64) -> [u8; 8] {
        i.to_le_bytes()
    }

    #[test]
    fn locks_update_the_term() {
        let bucket = TransactionalBucket::new();

        assert!(bucket.try_lock(0, 10));
        assert!(bucket.state().is_locked());
        assert!(!bucket.try_lock(0, 10));
        bucket.unlock();

        assert_eq!(bucket.blacklist_term(), 0);
        bucket.lock(1);
        assert_eq!(bucket.blacklist_term(), 1);
        bucket.unlock();
        assert_eq!(bucket.blacklist_term(), 1);

        // older terms never roll the term back
        bucket.lock(0);
        assert_eq!(bucket.blacklist_term(), 1);
        bucket.unlock();
    }

    #[test]
    fn insert_to_full_then_drop() {
        let bucket = TransactionalBucket::new();
        let ptrs = values(4);
        let hashes: Vec<u32> = (1..=4).collect();

        bucket.lock(0);

        for i in 0..3 {
            assert!(!bucket.is_full());
            assert!(bucket.insert(hashes[i], ptrs[i]));
        }
        assert!(bucket.is_full());
        for i in 0..3 {
            assert_eq!(bucket.find(hashes[i], &key(i as u64), true), ptrs[i]);
        }

        // a fourth insert is refused
        assert!(!bucket.insert(hashes[3], ptrs[3]));
        assert!(bucket.find(hashes[3], &key(3), true).is_null());

        // evicting the candidate makes room for it
        let candidate = bucket.eviction_candidate();
        assert!(!candidate.is_null());
        bucket.evict(candidate, true);
        assert!(bucket.insert(hashes[3], ptrs[3]));
        assert_eq!(bucket.find(hashes[3], &key(3), false), ptrs[3]);

        bucket.unlock();
        cleanup(ptrs);
    }

    #[test]
    fn blacklist_lifecycle() {
        let bucket = TransactionalBucket::new();
        // some overlap: entry 1 shares its hash with entry 0 but has its own key
        let hashes: [u32; 7] = [1, 1, 2, 3, 4, 5, 6];
        let ptrs = values(6);

        bucket.lock(0);

        for i in 0..3 {
            bucket.insert(hashes[i], ptrs[i]);
        }

        // blacklist four hashes, one of them overlapping a stored entry
        for i in 1..5 {
            let evicted = bucket.blacklist(hashes[i], &key(i as u64));
            if i < 3 {
                assert_eq!(evicted, ptrs[i]);
                unsafe { drop(Box::from_raw(evicted)) };
            } else {
                assert!(evicted.is_null());
            }
        }
        for i in 1..5 {
            assert!(bucket.is_blacklisted(hashes[i]));
            assert!(bucket.find(hashes[i], &key(i as u64), true).is_null());
        }
        assert!(!bucket.is_fully_blacklisted());
        assert!(!bucket.is_blacklisted(hashes[6]));

        // the same hash with a different key was not removed
        assert_eq!(bucket.find(hashes[0], &key(0), true), ptrs[0]);

        // inserts with a blacklisted hash are refused
        assert!(!bucket.insert(hashes[3], ptrs[3]));
        assert!(bucket.find(hashes[3], &key(3), true).is_null());

        // a fifth distinct hash spills into full blacklisting
        assert!(bucket.blacklist(hashes[5], &key(5)).is_null());
        assert!(bucket.is_fully_blacklisted());
        assert!(bucket.is_blacklisted(hashes[6]));
        // but already stored entries stay readable
        assert_eq!(bucket.find(hashes[0], &key(0), true), ptrs[0]);

        bucket.unlock();

        // a newer term wipes the blacklist on the next lock
        bucket.lock(2);
        assert!(!bucket.is_fully_blacklisted());
        for hash in hashes {
            assert!(!bucket.is_blacklisted(hash));
        }
        bucket.unlock();

        cleanup(vec![ptrs[0], ptrs[3], ptrs[4], ptrs[5]]);
    }

    #[test]
    fn clear_resets_blacklist_state() {
        let bucket = TransactionalBucket::new();

        bucket.lock(3);
        for hash in [7u32, 8, 9, 10, 11] {
            bucket.blacklist(hash, b"unused");
        }
        assert!(bucket.is_fully_blacklisted());

        bucket.clear();
        assert!(bucket.state().is_locked());
        assert!(!bucket.is_fully_blacklisted());
        assert!(!bucket.is_blacklisted(7));
        assert_eq!(bucket.blacklist_term(), 0);
        bucket.unlock();
    }
}
