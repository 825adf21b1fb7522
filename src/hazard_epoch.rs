//! Definition and implementations of `HazardEpoch`, the crate's reclamation manager.

use crate::error::Status;
use crate::hazard_pointer::{ThreadStore, VersionHandle};
use crate::spin_lock::SpinLock;
use crate::util::{self, WrappedAlign64Type};
use cfg_if::cfg_if;
use log::warn;
use std::array;
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU64, Ordering};

pub use crate::hazard_pointer::{BaseHazardNode, HazardObject};

cfg_if! {
    if #[cfg(feature = "max_thread_count_4096")] {
        pub const MAX_THREAD_COUNT: usize = 4096;
    } else if #[cfg(feature = "max_thread_count_256")] {
        pub const MAX_THREAD_COUNT: usize = 256;
    } else {
        /// Maximum thread count
        pub const MAX_THREAD_COUNT: usize = 16;
    }
}

struct MinVersionCache {
    version: AtomicU64,
    timestamp_us: AtomicI64,
}

/// `HazardEpoch` makes "retire node, eventually free node" safe in the presence of
/// concurrent readers. It is a versioned rendition of hazard pointers: a global `u64`
/// version increases with every retirement; each thread publishes the version it
/// observed when entering a read-side section; a retired node, stamped with the version
/// at its retirement, is freed only once the minimum over all published versions has
/// passed its stamp. While a thread holds a handle, no node it could have reached is
/// freed or reused, which also rules out ABA on the containers' CAS loops.
///
/// Reclamation is advisory bookkeeping: it never blocks container operations. A thread
/// that dies without releasing its handle pins the minimum version forever — retired
/// nodes then leak, they are never corrupted.
///
/// Because of [`False sharing`](https://en.wikipedia.org/wiki/False_sharing), the member
/// variables frequently modified by different threads are aligned to 64 bytes.
pub struct HazardEpoch {
    reclaim_threshold: i64,
    min_version_cache_us: i64,
    version: WrappedAlign64Type<AtomicU64>,
    thread_lock: WrappedAlign64Type<SpinLock>,
    threads: [ThreadStore; MAX_THREAD_COUNT],
    thread_list: AtomicPtr<ThreadStore>,
    thread_count: AtomicI64,
    waiting_count: WrappedAlign64Type<AtomicI64>,
    min_version_cache: WrappedAlign64Type<MinVersionCache>,
}

impl HazardEpoch {
    /// To avoid one allocation, `HazardEpoch` can live on the stack directly, but then it
    /// must not be moved after any method has been called: threads link the address of
    /// their slot into an internal registry. `reclaim_threshold` is the number of retired
    /// nodes a single thread accumulates before reclamation is attempted;
    /// `min_version_cache_us` is how long (microseconds) a computed minimum version may
    /// be served from cache.
    ///
    /// # Examples
    ///
    /// ```
    /// use lockfree_containers::hazard_epoch::HazardEpoch;
    ///
    /// let h = unsafe { HazardEpoch::new_in_stack(64, 200_000) };
    /// let addr_h = &h as *const _ as usize;
    /// assert_eq!(addr_h % 64, 0);
    /// ```
    #[inline]
    pub unsafe fn new_in_stack(reclaim_threshold: i64, min_version_cache_us: i64) -> HazardEpoch {
        HazardEpoch {
            reclaim_threshold,
            min_version_cache_us,
            version: WrappedAlign64Type(AtomicU64::new(0)),
            thread_lock: WrappedAlign64Type(SpinLock::default()),
            threads: array::from_fn(|_| ThreadStore::new()),
            thread_list: AtomicPtr::new(ptr::null_mut()),
            thread_count: AtomicI64::new(0),
            waiting_count: WrappedAlign64Type(AtomicI64::new(0)),
            min_version_cache: WrappedAlign64Type(MinVersionCache {
                version: AtomicU64::new(0),
                timestamp_us: AtomicI64::new(0),
            }),
        }
    }

    /// Alloc `HazardEpoch` in heap, address-stable from the start.
    #[inline]
    pub fn new_in_heap(reclaim_threshold: i64, min_version_cache_us: i64) -> Box<Self> {
        unsafe {
            Box::new(Self::new_in_stack(
                reclaim_threshold,
                min_version_cache_us,
            ))
        }
    }

    /// Return `Self::new_in_stack(64, 200_000)`
    #[inline]
    pub unsafe fn default_new_in_stack() -> Self {
        Self::new_in_stack(64, 200_000)
    }

    /// Return `Self::new_in_heap(64, 200_000)`
    #[inline]
    pub fn default_new_in_heap() -> Box<Self> {
        Self::new_in_heap(64, 200_000)
    }

    /// Enter a read-side critical section: publish the current global version for the
    /// calling thread and return an opaque handle. Every node reachable from a live
    /// `AtomicRef` while the handle is held stays allocated until the matching
    /// [`release`](Self::release). Returns `Busy` if this thread already holds a handle,
    /// `ThreadNumOverflow` once more than `MAX_THREAD_COUNT` distinct threads have
    /// touched this instance.
    ///
    /// # Examples
    ///
    /// ```
    /// use lockfree_containers::hazard_epoch::HazardEpoch;
    /// use lockfree_containers::error::Status;
    ///
    /// let h = HazardEpoch::default_new_in_heap();
    /// let handle = h.acquire().unwrap();
    /// assert_eq!(h.acquire(), Err(Status::Busy));
    /// unsafe { h.release(handle) };
    /// ```
    pub fn acquire(&self) -> Result<u64, Status> {
        let ts = self.thread_store()?;
        loop {
            let version = self.atomic_load_version();
            let handle = ts.acquire(version)?;
            // The published version must be current once globally visible, or the
            // min-version scan could race past it. Re-validate and retry if the
            // global version moved in between.
            if version != self.atomic_load_version() {
                ts.release(&handle);
            } else {
                return Ok(handle.as_u64());
            }
        }
    }

    /// Leave the read-side critical section entered by [`acquire`](Self::acquire), then
    /// opportunistically reclaim if enough retirements have piled up.
    ///
    /// # Safety
    ///
    /// `handle` must be the value returned by this thread's outstanding `acquire`.
    /// Releasing a guard another operation still relies on re-enables reclamation of
    /// nodes that operation may yet dereference.
    pub unsafe fn release(&self, handle: u64) {
        let version_handle = VersionHandle::from_u64(handle);
        if MAX_THREAD_COUNT > version_handle.tid() as usize {
            let ts = &self.threads[version_handle.tid() as usize];
            ts.release(&version_handle);
            if self.reclaim_threshold < ts.waiting_count() {
                let min_version = self.min_version(false);
                let freed = ts.reclaim(min_version, ts);
                self.waiting_count.fetch_add(-freed, Ordering::Relaxed);
            } else if self.thread_count.load(Ordering::Relaxed) * self.reclaim_threshold
                < self.waiting_count.load(Ordering::Relaxed)
            {
                self.reclaim();
            }
        }
    }

    /// Hand an unlinked node over for deferred destruction. The node is stamped with the
    /// next global version and parked on the calling thread's retired list until
    /// reclamation proves no reader can still hold it. The inner `Option` of a container
    /// value is untouched: destruction runs `T`'s `Drop` via `Box::from_raw`.
    ///
    /// # Safety
    ///
    /// `node` must come from `Box::into_raw`, must already be unreachable from every
    /// live `AtomicRef`, and must be retired at most once.
    pub unsafe fn retire<T>(&self, node: *mut T) -> Status
    where
        T: HazardObject,
    {
        if node.is_null() {
            warn!("node is null");
            return Status::InvalidParam;
        }
        let ts = match self.thread_store() {
            Ok(ts) => ts,
            Err(ret) => {
                warn!("get_thread_store fail, ret={}", ret);
                return ret;
            }
        };
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let base = (*node).base_node();
        (*base).set_version(version);
        (*base).set_reclaim(node as *mut (), drop_boxed::<T>);
        ts.push_retired(base);
        self.waiting_count.fetch_add(1, Ordering::Relaxed);
        Status::Success
    }

    /// Free every retired node not protected by any thread's published version. Called
    /// internally from [`release`](Self::release) past the thresholds and on drop; safe
    /// to call at any time, never blocks other operations.
    pub fn reclaim(&self) {
        let ts = match self.thread_store() {
            Ok(ts) => ts,
            Err(ret) => {
                warn!("get_thread_store fail, ret={}", ret);
                return;
            }
        };
        let min_version = self.min_version(true);
        unsafe {
            let freed = ts.reclaim(min_version, ts);
            self.waiting_count.fetch_add(-freed, Ordering::Relaxed);

            let mut iter = self.atomic_load_thread_list();
            while !iter.is_null() {
                if iter != ts as *const _ as *mut ThreadStore {
                    let freed = (*iter).reclaim(min_version, ts);
                    self.waiting_count.fetch_add(-freed, Ordering::Relaxed);
                }
                iter = (*iter).next();
            }
        }
    }

    /// Retired nodes not yet freed. Diagnostic snapshot, relaxed and approximate.
    #[inline]
    pub fn retired_count(&self) -> i64 {
        self.waiting_count.load(Ordering::Relaxed)
    }

    #[inline]
    fn atomic_load_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    #[inline]
    fn atomic_load_thread_list(&self) -> *mut ThreadStore {
        self.thread_list.load(Ordering::Acquire)
    }

    #[inline]
    fn thread_store(&self) -> Result<&ThreadStore, Status> {
        let tid = util::get_thread_id();
        if MAX_THREAD_COUNT <= tid as usize {
            warn!("thread number overflow, tid={}", tid);
            return Err(Status::ThreadNumOverflow);
        }
        let ts = &self.threads[tid as usize];
        // Different threads use different thread stores; the lock only serializes
        // linking the slot into the registry list.
        if !ts.is_enabled() {
            let _guard = self.thread_lock.lock_guard();
            ts.set_enabled(tid as u16);
            ts.set_next(self.atomic_load_thread_list());
            self.thread_list
                .store(ts as *const _ as *mut ThreadStore, Ordering::Release);
            self.thread_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(ts)
    }

    fn min_version(&self, force_flush: bool) -> u64 {
        let cached = self.min_version_cache.version.load(Ordering::Relaxed);
        if !force_flush
            && 0 != cached
            && self.min_version_cache.timestamp_us.load(Ordering::Relaxed)
                + self.min_version_cache_us
                > util::get_cur_microseconds_time()
        {
            return cached;
        }
        let mut ret = self.atomic_load_version();
        let mut iter = self.atomic_load_thread_list();
        while !iter.is_null() {
            unsafe {
                let ts_version = (*iter).version();
                if ret > ts_version {
                    ret = ts_version;
                }
                iter = (*iter).next();
            }
        }
        self.min_version_cache.version.store(ret, Ordering::Relaxed);
        self.min_version_cache
            .timestamp_us
            .store(util::get_cur_microseconds_time(), Ordering::Relaxed);
        ret
    }
}

unsafe fn drop_boxed<T>(obj: *mut ()) {
    drop(Box::from_raw(obj as *mut T));
}

impl Drop for HazardEpoch {
    fn drop(&mut self) {
        self.reclaim();
    }
}

unsafe impl Send for HazardEpoch {}
unsafe impl Sync for HazardEpoch {}
