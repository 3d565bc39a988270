use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::manager::Manager;
use crate::state::{Flag, State};
use crate::table::BucketFrame;
use crate::value::CachedValue;

/// Common behavior of the cache-line-sized bucket flavors.
///
/// A bucket is a fixed array of `(hash, value)` slots plus a state word.
/// Entries are kept packed at the front of the array with slot 0 as the
/// most-recently-used; a stored hash of 0 marks an empty slot, which is why
/// the key hash is clamped to be non-zero. Slot contents are only read or
/// written while the bucket lock is held; the accesses themselves can then be
/// relaxed since the lock's acquire/release pair orders them.
pub(crate) trait Bucket: BucketFrame {
    /// Extra state threaded into every lock acquisition (the transactional
    /// flavor carries the manager's transaction term here).
    type Context: Copy;

    /// Number of data slots.
    const SLOTS: usize;

    fn context(manager: &Manager) -> Self::Context;

    fn state(&self) -> &State;
    fn hashes(&self) -> &[AtomicU32];
    fn slots(&self) -> &[AtomicPtr<CachedValue>];

    /// Runs right after the lock is acquired, before the caller sees it held.
    fn on_lock(&self, context: Self::Context);

    /// Whether an entry with this hash may currently be stored.
    fn accepts(&self, hash: u32) -> bool {
        let _ = hash;
        true
    }

    /// Carries flavor-specific state over from a bucket that is being
    /// migrated into this one. Both buckets must be locked.
    fn inherit(&self, source: &Self) {
        let _ = source;
    }

    /// Clears flavor-specific state beyond the data slots.
    fn clear_extra(&self) {}

    fn lock(&self, context: Self::Context) {
        self.state().lock();
        self.on_lock(context);
    }

    fn try_lock(&self, context: Self::Context, max_tries: u64) -> bool {
        if self.state().try_lock(max_tries) {
            self.on_lock(context);
            true
        } else {
            false
        }
    }

    fn unlock(&self) {
        self.state().unlock();
    }

    fn is_migrated(&self) -> bool {
        self.state().is_set(Flag::Migrated)
    }

    fn is_full(&self) -> bool {
        debug_assert!(self.state().is_locked());
        self.hashes()[Self::SLOTS - 1].load(Ordering::Relaxed) != 0
    }

    /// Linear scan over the packed prefix. On a hit the entry is promoted to
    /// slot 0 when `move_to_front` is set. Returns null on a miss.
    fn find(&self, hash: u32, key: &[u8], move_to_front: bool) -> *mut CachedValue {
        debug_assert!(self.state().is_locked());
        for i in 0..Self::SLOTS {
            if self.hashes()[i].load(Ordering::Relaxed) == 0 {
                break;
            }
            if self.hashes()[i].load(Ordering::Relaxed) == hash {
                let value = self.slots()[i].load(Ordering::Relaxed);
                if unsafe { (*value).same_key(key) } {
                    if move_to_front {
                        self.move_slot(i, true);
                    }
                    return value;
                }
            }
        }
        std::ptr::null_mut()
    }

    /// Writes the entry into the first empty slot and promotes it to the
    /// front. Returns false when the bucket is full or refuses the hash; the
    /// caller keeps ownership of the value in that case.
    fn insert(&self, hash: u32, value: *mut CachedValue) -> bool {
        debug_assert!(self.state().is_locked());
        if !self.accepts(hash) {
            return false;
        }
        for i in 0..Self::SLOTS {
            if self.hashes()[i].load(Ordering::Relaxed) == 0 {
                self.hashes()[i].store(hash, Ordering::Relaxed);
                self.slots()[i].store(value, Ordering::Relaxed);
                if i != 0 {
                    self.move_slot(i, true);
                }
                return true;
            }
        }
        false
    }

    /// Removes a matching entry and compacts the bucket. The caller takes
    /// ownership of the returned value.
    fn remove(&self, hash: u32, key: &[u8]) -> *mut CachedValue {
        let value = self.find(hash, key, false);
        if !value.is_null() {
            self.evict(value, false);
        }
        value
    }

    /// The least-recently-used entry whose value is currently not leased, or
    /// null if every entry is in use.
    fn eviction_candidate(&self) -> *mut CachedValue {
        debug_assert!(self.state().is_locked());
        for i in (0..Self::SLOTS).rev() {
            if self.hashes()[i].load(Ordering::Relaxed) == 0 {
                continue;
            }
            let value = self.slots()[i].load(Ordering::Relaxed);
            if unsafe { (*value).is_freeable() } {
                return value;
            }
        }
        std::ptr::null_mut()
    }

    /// Clears the slot holding `value`. With `optimize_for_insertion` the
    /// hole is moved to the front so that the insert which follows under the
    /// same lock lands in slot 0 without any shifting; otherwise the hole is
    /// compacted towards the back, keeping the occupied slots packed.
    fn evict(&self, value: *mut CachedValue, optimize_for_insertion: bool) {
        debug_assert!(self.state().is_locked());
        for i in (0..Self::SLOTS).rev() {
            if self.slots()[i].load(Ordering::Relaxed) == value {
                self.hashes()[i].store(0, Ordering::Relaxed);
                self.slots()[i].store(std::ptr::null_mut(), Ordering::Relaxed);
                self.move_slot(i, optimize_for_insertion);
                return;
            }
        }
    }

    /// Zeroes all slots and flags. The lock stays held.
    fn clear(&self) {
        debug_assert!(self.state().is_locked());
        for i in 0..Self::SLOTS {
            self.hashes()[i].store(0, Ordering::Relaxed);
            self.slots()[i].store(std::ptr::null_mut(), Ordering::Relaxed);
        }
        self.clear_extra();
        self.state().clear();
    }

    /// Shifts the entry (or hole) at `slot` to the front or back, moving the
    /// entries in between by one position.
    fn move_slot(&self, slot: usize, to_front: bool) {
        let hash = self.hashes()[slot].load(Ordering::Relaxed);
        let value = self.slots()[slot].load(Ordering::Relaxed);
        let mut i = slot;
        if to_front {
            while i >= 1 {
                let h = self.hashes()[i - 1].load(Ordering::Relaxed);
                let v = self.slots()[i - 1].load(Ordering::Relaxed);
                self.hashes()[i].store(h, Ordering::Relaxed);
                self.slots()[i].store(v, Ordering::Relaxed);
                i -= 1;
            }
        } else {
            while i + 1 < Self::SLOTS && self.hashes()[i + 1].load(Ordering::Relaxed) != 0 {
                let h = self.hashes()[i + 1].load(Ordering::Relaxed);
                let v = self.slots()[i + 1].load(Ordering::Relaxed);
                self.hashes()[i].store(h, Ordering::Relaxed);
                self.slots()[i].store(v, Ordering::Relaxed);
                i += 1;
            }
        }
        if i != slot {
            self.hashes()[i].store(hash, Ordering::Relaxed);
            self.slots()[i].store(value, Ordering::Relaxed);
        }
    }
}
