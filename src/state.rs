use std::sync::atomic::{AtomicU32, Ordering};

/// Lock bit, the lowest bit of every state word. Never exposed as a `Flag`.
const FLAG_LOCK: u32 = 0x0000_0001;

/// Public status flags. Each flag has exactly one bit set and none of them
/// overlaps the lock bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum Flag {
    Blacklisted = 0x0000_0002,
    Migrated    = 0x0000_0004,
    Migrating   = 0x0000_0008,
    Rebalancing = 0x0000_0010,
    Resizing    = 0x0000_0020,
    Shutdown    = 0x0000_0040,
}

/// A single 32-bit word carrying a spin lock in bit 0 and up to six status
/// flags above it.
///
/// Locking is a bounded-try compare-and-swap loop, there is no OS blocking
/// and no fairness. Flags may only be inspected or toggled while the word is
/// locked; this is asserted in debug builds.
#[derive(Debug)]
pub(crate) struct State {
    state: AtomicU32,
}

impl State {
    pub(crate) fn new() -> Self {
        State {
            state: AtomicU32::new(0),
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        (self.state.load(Ordering::Relaxed) & FLAG_LOCK) != 0
    }

    /// Spins until the lock is acquired.
    pub(crate) fn lock(&self) {
        loop {
            // expect unlocked, but preserve all flag bits
            let expected = self.state.load(Ordering::Relaxed) & !FLAG_LOCK;
            if self
                .state
                .compare_exchange_weak(
                    expected,
                    expected | FLAG_LOCK,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
            std::hint::spin_loop();
        }
    }

    /// Tries to acquire the lock with at most `max_tries` compare-and-swap
    /// attempts. Returns whether the lock was acquired.
    pub(crate) fn try_lock(&self, max_tries: u64) -> bool {
        for _ in 0..max_tries {
            let expected = self.state.load(Ordering::Relaxed) & !FLAG_LOCK;
            if self
                .state
                .compare_exchange_weak(
                    expected,
                    expected | FLAG_LOCK,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return true;
            }
            std::hint::spin_loop();
        }
        false
    }

    pub(crate) fn unlock(&self) {
        debug_assert!(self.is_locked());
        self.state.fetch_and(!FLAG_LOCK, Ordering::Release);
    }

    pub(crate) fn is_set(&self, flag: Flag) -> bool {
        debug_assert!(self.is_locked());
        (self.state.load(Ordering::Relaxed) & (flag as u32)) != 0
    }

    pub(crate) fn toggle(&self, flag: Flag) {
        debug_assert!(self.is_locked());
        self.state.fetch_xor(flag as u32, Ordering::Relaxed);
    }

    /// Clears every flag but leaves the lock bit untouched.
    pub(crate) fn clear(&self) {
        debug_assert!(self.is_locked());
        self.state.fetch_and(FLAG_LOCK, Ordering::Relaxed);
    }
}

// the word must stay exactly one cache-line-friendly u32
const _: () = assert!(std::mem::size_of::<State>() == 4);
