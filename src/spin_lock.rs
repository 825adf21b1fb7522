use crate::util;
use std::sync::atomic::{AtomicBool, Ordering};

/// User mode SpinLock. Guards the one-time thread-slot registration in
/// `HazardEpoch`; container operations never take it.
pub struct SpinLock {
    atomic: AtomicBool,
}

impl Default for SpinLock {
    fn default() -> Self {
        SpinLock {
            atomic: AtomicBool::new(false),
        }
    }
}

impl SpinLock {
    /// Keep trying to lock until success.
    pub fn lock(&self) {
        while self.is_locked()
            || self
                .atomic
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
        {
            util::pause();
        }
    }

    /// Keep trying to lock until success, then return SpinLockGuard.
    #[inline]
    pub fn lock_guard(&self) -> SpinLockGuard {
        self.lock();
        SpinLockGuard::new(self)
    }

    /// Unlock if is locked, else panic.
    #[inline]
    pub fn unlock(&self) {
        assert!(
            self.atomic
                .compare_exchange(true, false, Ordering::Release, Ordering::Relaxed)
                .is_ok()
        );
    }

    /// Return true if locked.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.atomic.load(Ordering::Relaxed)
    }

    /// Return true if lock successfully.
    #[inline]
    pub fn try_lock(&self) -> bool {
        !self.is_locked()
            && self
                .atomic
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }
}

/// Guard of SpinLock, unlock it when dropped.
pub struct SpinLockGuard<'a> {
    spin_lock: &'a SpinLock,
}

impl<'a> SpinLockGuard<'a> {
    fn new(spin_lock: &'a SpinLock) -> Self {
        SpinLockGuard { spin_lock }
    }
}

impl<'a> Drop for SpinLockGuard<'a> {
    fn drop(&mut self) {
        self.spin_lock.unlock();
    }
}
