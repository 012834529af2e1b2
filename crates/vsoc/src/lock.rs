//! Spin lock over a 32-bit word in shared memory.
//!
//! The word holds 0 when free, otherwise the tag of the owning [`Side`]. A
//! process that crashes while holding the lock leaves its tag behind; the
//! next instance of that side releases it with [`SpinLock::recover`].

use std::sync::atomic::{AtomicU32, Ordering};

use crate::signal::Side;

const UNLOCKED: u32 = 0;
const SPINS_BEFORE_YIELD: u32 = 64;

pub struct SpinLock<'a> {
    word: &'a AtomicU32,
}

impl<'a> SpinLock<'a> {
    pub fn new(word: &'a AtomicU32) -> Self {
        Self { word }
    }

    pub fn try_lock(&self, side: Side) -> Option<SpinLockGuard<'a>> {
        self.word
            .compare_exchange(UNLOCKED, side.tag(), Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { word: self.word })
    }

    pub fn lock(&self, side: Side) -> SpinLockGuard<'a> {
        let mut spins = 0u32;
        loop {
            if let Some(guard) = self.try_lock(side) {
                return guard;
            }
            spins += 1;
            if spins < SPINS_BEFORE_YIELD {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Release the lock if it is held by `side`. Returns true if it was.
    pub fn recover(&self, side: Side) -> bool {
        let recovered = self
            .word
            .compare_exchange(side.tag(), UNLOCKED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();
        if recovered {
            tracing::warn!(%side, "Recovered lock left held by a previous instance");
        }
        recovered
    }

    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Acquire) != UNLOCKED
    }
}

pub struct SpinLockGuard<'a> {
    word: &'a AtomicU32,
}

impl Drop for SpinLockGuard<'_> {
    fn drop(&mut self) {
        self.word.store(UNLOCKED, Ordering::Release);
    }
}
