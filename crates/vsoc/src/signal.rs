//! Futex-style signalling between the two sides of a region.
//!
//! A side that changes a shared word calls `send_signal`, which wakes local
//! waiters on that word and posts the word's region offset into its outgoing
//! signal table. The peer's [`SignalWorker`] drains that table and wakes
//! waiters on each posted word from its own side of the mapping.
//!
//! Every wait is bounded by [`POLL_INTERVAL`]. A signal that is lost because
//! the table is full only costs latency.

use nix::errno::Errno;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::errors::VsocError;
use crate::segment::RegionView;

/// Marks an unused signal table slot.
pub const EMPTY_SLOT: u32 = u32::MAX;

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Host,
    Guest,
}

impl Side {
    pub fn peer(self) -> Self {
        match self {
            Side::Host => Side::Guest,
            Side::Guest => Side::Host,
        }
    }

    /// Non-zero tag identifying the side in shared lock words.
    pub(crate) fn tag(self) -> u32 {
        match self {
            Side::Host => 1,
            Side::Guest => 2,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Host => write!(f, "host"),
            Side::Guest => write!(f, "guest"),
        }
    }
}

/// Block while `word` holds `expected`, for at most `timeout`.
///
/// Spurious wakeups are possible; callers re-check their condition.
#[cfg(target_os = "linux")]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) {
    let timeout = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    // Not FUTEX_PRIVATE: the word lives in a mapping shared across processes.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            &timeout as *const libc::timespec,
            std::ptr::null::<u32>(),
            0u32,
        )
    };
    if ret != 0 {
        match Errno::last() {
            Errno::EAGAIN | Errno::EINTR | Errno::ETIMEDOUT => {}
            errno => tracing::warn!(%errno, "futex wait failed"),
        }
    }
}

/// Wake every waiter blocked on `word`. Returns the number woken.
#[cfg(target_os = "linux")]
pub fn futex_wake(word: &AtomicU32) -> usize {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        )
    };
    if ret < 0 {
        tracing::warn!(errno = %Errno::last(), "futex wake failed");
        return 0;
    }
    ret as usize
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) {
    if word.load(Ordering::Acquire) == expected {
        thread::sleep(timeout.min(Duration::from_millis(1)));
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_word: &AtomicU32) -> usize {
    0
}

/// One direction's signal table: an open-addressed set of pending word
/// offsets plus the interrupt word the draining side sleeps on.
pub(crate) struct SignalTable<'a> {
    slots: &'a [AtomicU32],
    interrupt: &'a AtomicU32,
}

impl<'a> SignalTable<'a> {
    pub(crate) fn new(slots: &'a [AtomicU32], interrupt: &'a AtomicU32) -> Self {
        debug_assert!(slots.len().is_power_of_two());
        Self { slots, interrupt }
    }

    pub(crate) fn interrupt(&self) -> &'a AtomicU32 {
        self.interrupt
    }

    pub(crate) fn reset(&self) {
        for slot in self.slots {
            slot.store(EMPTY_SLOT, Ordering::Relaxed);
        }
        self.interrupt.store(0, Ordering::Release);
    }

    /// Record `offset` as pending and raise the interrupt word.
    ///
    /// Returns false if the table was full; the interrupt is raised anyway so
    /// the peer wakes up and polls.
    pub(crate) fn post(&self, offset: u32) -> bool {
        let mask = self.slots.len() - 1;
        let mut index = (offset as usize >> 2) & mask;
        let mut posted = false;

        for _ in 0..self.slots.len() {
            match self.slots[index].compare_exchange(
                EMPTY_SLOT,
                offset,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    posted = true;
                    break;
                }
                Err(current) if current == offset => {
                    posted = true;
                    break;
                }
                Err(_) => index = (index + 1) & mask,
            }
        }

        if !posted {
            tracing::warn!(offset, "signal table full, dropping signal");
        }
        self.interrupt.store(1, Ordering::Release);
        futex_wake(self.interrupt);
        posted
    }

    /// Clear every pending slot, calling `on_signal` with each offset.
    pub(crate) fn drain(&self, mut on_signal: impl FnMut(u32)) -> usize {
        self.interrupt.store(0, Ordering::Release);
        let mut drained = 0;
        for slot in self.slots {
            if slot.load(Ordering::Acquire) == EMPTY_SLOT {
                continue;
            }
            let offset = slot.swap(EMPTY_SLOT, Ordering::AcqRel);
            if offset != EMPTY_SLOT {
                on_signal(offset);
                drained += 1;
            }
        }
        drained
    }
}

/// Background thread dispatching one region's incoming signals.
///
/// Stops and joins when dropped.
pub struct SignalWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SignalWorker {
    pub(crate) fn spawn(region: RegionView, side: Side) -> Result<Self, VsocError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let name = format!("vsoc-signal-{}", region.name());

        let handle = thread::Builder::new().name(name).spawn(move || {
            tracing::debug!(region = %region.name(), %side, "Signal worker started");
            let table = region.incoming_signal_table(side);
            while !stop_flag.load(Ordering::Acquire) {
                table.drain(|offset| match region.try_word(offset) {
                    Some(word) => {
                        futex_wake(word);
                    }
                    None => tracing::warn!(offset, "ignoring signal for invalid offset"),
                });
                futex_wait(table.interrupt(), 0, POLL_INTERVAL);
            }
            tracing::debug!(region = %region.name(), %side, "Signal worker stopped");
        })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("Signal worker panicked");
        }
    }
}

impl Drop for SignalWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
