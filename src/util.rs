use std::cell::Cell;
use std::hint;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI64, Ordering};

static GLOBAL_THREAD_ID: AtomicI64 = AtomicI64::new(0);

/// Process-wide thread id, assigned on first call and stable for the thread's lifetime.
/// Ids are never recycled; a long-lived process that keeps spawning threads will
/// eventually exceed `MAX_THREAD_COUNT`.
pub fn get_thread_id() -> i64 {
    thread_local!(static THREAD_ID: Cell<i64> = Cell::new(-1));
    THREAD_ID.with(|tid| {
        if -1 == tid.get() {
            tid.set(GLOBAL_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        }
        tid.get()
    })
}

/// Pads its content to a cache line so neighboring fields written by different
/// threads do not false-share.
#[repr(align(64))]
pub struct WrappedAlign64Type<T>(pub T);

impl<T> Default for WrappedAlign64Type<T>
where
    T: Default,
{
    fn default() -> Self {
        WrappedAlign64Type(T::default())
    }
}

impl<T> Deref for WrappedAlign64Type<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for WrappedAlign64Type<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

pub fn get_cur_microseconds_time() -> i64 {
    let timespec = time::get_time();
    timespec.sec * 1_000_000 + timespec.nsec as i64 / 1_000
}

#[inline]
pub fn pause() {
    hint::spin_loop();
}

/// Read-only diagnostic snapshot exposed by every container. All counters are
/// maintained with relaxed atomics; values are approximate under concurrency.
#[derive(Copy, Clone, Debug, Default)]
pub struct Stats {
    /// Linked element count as tracked by the operations that completed so far.
    pub approx_len: i64,
    /// Number of failed CAS attempts that were retried.
    pub cas_retries: u64,
    /// Retired nodes not yet proven unreachable.
    pub pending_reclaim: i64,
}
