//! Cross-process spin lock over a single shared-memory word.
//!
//! The word holds either [`NO_OWNER`] or a packed identity of the holder
//! (pid, tid and a hash of the acquiring call site), so a stuck lock can be
//! traced back to a process and a line of code from any mapping.

use crate::helpers::{is_valid_owner, pack_owner, site_hash, unpack_owner};
use crate::platform::unix::{current_pid, current_tid};
use log::{error, warn};
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};

pub const NO_OWNER: u64 = u64::MAX;

/// First congestion report after 2^20 spins, then at every doubling.
const CONGESTION_SHIFT_START: u32 = 20;
#[cfg(feature = "trace")]
const BACKTRACE_SHIFT: u32 = 28;

/// Mutual exclusion usable from several address spaces.
///
/// Implementors must be plain data living in shared memory; the guard
/// helpers release on drop.
pub trait ShmLock {
    /// Spin until held; returns the owner word written.
    #[track_caller]
    fn acquire(&self) -> u64;

    /// Single attempt.
    #[track_caller]
    fn try_acquire(&self) -> bool;

    fn release(&self);

    fn owner(&self) -> u64;

    #[track_caller]
    fn lock(&self) -> LockGuard<'_, Self> {
        self.acquire();
        LockGuard { lock: self }
    }

    #[track_caller]
    fn try_lock(&self) -> Option<LockGuard<'_, Self>> {
        if self.try_acquire() {
            Some(LockGuard { lock: self })
        } else {
            None
        }
    }
}

/// RAII guard; releases the lock on drop.
#[must_use = "if unused the lock is released immediately"]
pub struct LockGuard<'a, L: ShmLock + ?Sized> {
    lock: &'a L,
}

impl<L: ShmLock + ?Sized> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[repr(C)]
pub struct SpinLock {
    owner: AtomicU64,
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLock {
    pub const fn new() -> Self {
        Self { owner: AtomicU64::new(NO_OWNER) }
    }

    /// Reset to unlocked; used when carving the lock out of fresh memory.
    pub fn init(&self) {
        self.owner.store(NO_OWNER, Ordering::Release);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != NO_OWNER
    }

    #[inline]
    fn identity(loc: &Location<'_>) -> u64 {
        pack_owner(current_pid(), current_tid(), site_hash(loc))
    }

    #[cold]
    fn report_congestion(&self, times: u64, shift: u32) {
        let (pid, tid, site) = unpack_owner(self.owner.load(Ordering::Relaxed));
        warn!(
            "[LOCK] {:p} congested: {} spins, held by pid {} tid {} site {:#06x}",
            self as *const _, times, pid, tid, site
        );
        #[cfg(feature = "trace")]
        if shift >= BACKTRACE_SHIFT {
            warn!("[LOCK] waiter backtrace:\n{}", std::backtrace::Backtrace::force_capture());
        }
        #[cfg(not(feature = "trace"))]
        let _ = shift;
    }

    #[cold]
    fn on_corrupt_owner(&self, seen: u64, reported: &mut bool) {
        if !*reported {
            error!("[LOCK] {:p} holds invalid owner word {:#018x}", self as *const _, seen);
            *reported = true;
        }
        #[cfg(feature = "lock_recovery")]
        if self
            .owner
            .compare_exchange(seen, NO_OWNER, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            warn!("[LOCK] {:p} force-reset to unlocked", self as *const _);
        }
    }
}

impl ShmLock for SpinLock {
    #[track_caller]
    fn acquire(&self) -> u64 {
        let me = Self::identity(Location::caller());
        let mut times: u64 = 0;
        let mut shift = CONGESTION_SHIFT_START;
        let mut reported = false;
        loop {
            if self
                .owner
                .compare_exchange_weak(NO_OWNER, me, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return me;
            }
            loop {
                let cur = self.owner.load(Ordering::Relaxed);
                if cur == NO_OWNER {
                    break;
                }
                if !is_valid_owner(cur) {
                    self.on_corrupt_owner(cur, &mut reported);
                }
                times = times.wrapping_add(1);
                if times & ((1u64 << shift) - 1) == 0 {
                    self.report_congestion(times, shift);
                    if shift < 63 {
                        shift += 1;
                    }
                }
                std::hint::spin_loop();
            }
        }
    }

    #[track_caller]
    fn try_acquire(&self) -> bool {
        let me = Self::identity(Location::caller());
        self.owner
            .compare_exchange(NO_OWNER, me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn release(&self) {
        self.owner.store(NO_OWNER, Ordering::Release);
    }

    #[inline]
    fn owner(&self) -> u64 {
        self.owner.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_word_identifies_holder() {
        let l = SpinLock::new();
        assert!(!l.is_locked());
        let w = l.acquire();
        assert_eq!(l.owner(), w);
        let (pid, _, _) = unpack_owner(w);
        assert_eq!(pid, std::process::id() & ((1 << 22) - 1));
        assert!(!l.try_acquire());
        l.release();
        assert_eq!(l.owner(), NO_OWNER);
    }

    #[test]
    fn guard_releases_on_drop() {
        let l = SpinLock::new();
        {
            let _g = l.lock();
            assert!(l.try_lock().is_none());
        }
        assert!(l.try_lock().is_some());
        assert!(!l.is_locked());
    }

    #[cfg(feature = "lock_recovery")]
    #[test]
    fn corrupt_owner_is_reset() {
        let l = SpinLock::new();
        l.owner.store(0x1234, Ordering::Relaxed);
        let _g = l.lock();
        assert!(is_valid_owner(l.owner()));
    }
}
