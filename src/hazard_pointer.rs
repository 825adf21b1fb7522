use crate::error::Status;
use crate::util::{self, WrappedAlign64Type};
use log::{error, warn};
use std::ptr;
use std::sync::atomic::{
    AtomicBool, AtomicI64, AtomicPtr, AtomicU16, AtomicU32, AtomicU64, Ordering,
};

/// Published version of a thread that is not inside a read-side section.
pub(crate) const IDLE_VERSION: u64 = u64::MAX;

/// Opaque handle returned by `HazardEpoch::acquire`: the owning thread's id in the
/// low 16 bits, a per-thread sequence number above it. The sequence number lets
/// `release` reject a handle from an earlier acquire/release cycle.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct VersionHandle(u64);

impl VersionHandle {
    pub(crate) fn new(tid: u16, seq: u32) -> VersionHandle {
        VersionHandle((seq as u64) << 16 | tid as u64)
    }

    pub(crate) fn from_u64(v: u64) -> VersionHandle {
        VersionHandle(v)
    }

    pub(crate) fn as_u64(&self) -> u64 {
        self.0
    }

    #[inline]
    pub(crate) fn tid(&self) -> u16 {
        self.0 as u16
    }

    #[inline]
    pub(crate) fn seq(&self) -> u32 {
        (self.0 >> 16) as u32
    }
}

/// Intrusive link every reclaimable node embeds: the retired-list chain, the global
/// version at retirement, and type-erased drop glue installed when the node is retired.
pub struct BaseHazardNode {
    next: *mut BaseHazardNode,
    version: u64,
    obj: *mut (),
    drop_obj: Option<unsafe fn(*mut ())>,
}

impl Default for BaseHazardNode {
    fn default() -> Self {
        BaseHazardNode {
            next: ptr::null_mut(),
            version: IDLE_VERSION,
            obj: ptr::null_mut(),
            drop_obj: None,
        }
    }
}

impl BaseHazardNode {
    #[inline]
    fn next(&self) -> *mut BaseHazardNode {
        self.next
    }

    #[inline]
    fn set_next(&mut self, next: *mut BaseHazardNode) {
        debug_assert_ne!(next, self as *mut _);
        self.next = next;
    }

    #[inline]
    fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    #[inline]
    pub(crate) fn set_reclaim(&mut self, obj: *mut (), drop_obj: unsafe fn(*mut ())) {
        self.obj = obj;
        self.drop_obj = Some(drop_obj);
    }
}

/// Implemented by every node type managed by `HazardEpoch`. The returned pointer must
/// address a `BaseHazardNode` embedded in `self` and stay valid for the node's lifetime.
pub trait HazardObject {
    fn base_node(&self) -> *mut BaseHazardNode;
}

impl HazardObject for BaseHazardNode {
    fn base_node(&self) -> *mut BaseHazardNode {
        self as *const _ as *mut BaseHazardNode
    }
}

/// Runs the drop glue installed at retirement, deallocating the owning node.
pub(crate) unsafe fn reclaim_node(node: *mut BaseHazardNode) {
    if let Some(drop_obj) = (*node).drop_obj {
        drop_obj((*node).obj);
    }
}

struct SeqVersion {
    seq: AtomicU32,
    version: AtomicU64,
}

impl Default for SeqVersion {
    fn default() -> Self {
        SeqVersion {
            seq: AtomicU32::new(0),
            version: AtomicU64::new(IDLE_VERSION),
        }
    }
}

/// Per-thread slot of a `HazardEpoch`: the thread's published version, its retired
/// list, and its link in the registration list walked by the min-version scan.
/// Fields written on every operation are cache-line padded against false sharing.
pub(crate) struct ThreadStore {
    enabled: AtomicBool,
    tid: AtomicU16,
    last_reclaim_version: AtomicU64,
    curr_seq_version: WrappedAlign64Type<SeqVersion>,
    retired_list: WrappedAlign64Type<AtomicPtr<BaseHazardNode>>,
    retired_count: WrappedAlign64Type<AtomicI64>,
    next: WrappedAlign64Type<AtomicPtr<ThreadStore>>,
}

impl Default for ThreadStore {
    fn default() -> Self {
        ThreadStore::new()
    }
}

impl ThreadStore {
    pub(crate) fn new() -> ThreadStore {
        ThreadStore {
            enabled: AtomicBool::new(false),
            tid: AtomicU16::new(0),
            last_reclaim_version: AtomicU64::new(0),
            curr_seq_version: Default::default(),
            retired_list: WrappedAlign64Type(AtomicPtr::new(ptr::null_mut())),
            retired_count: Default::default(),
            next: WrappedAlign64Type(AtomicPtr::new(ptr::null_mut())),
        }
    }

    pub(crate) fn set_enabled(&self, tid: u16) {
        self.tid.store(tid, Ordering::Relaxed);
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn tid(&self) -> u16 {
        self.tid.load(Ordering::Relaxed)
    }

    pub(crate) fn set_next(&self, next: *mut ThreadStore) {
        self.next.store(next, Ordering::Relaxed);
    }

    pub(crate) fn next(&self) -> *mut ThreadStore {
        self.next.load(Ordering::Acquire)
    }

    #[inline]
    fn curr_seq(&self) -> u32 {
        self.curr_seq_version.seq.load(Ordering::Relaxed)
    }

    #[inline]
    fn inc_curr_seq(&self) {
        self.curr_seq_version
            .seq
            .store(self.curr_seq().wrapping_add(1), Ordering::Relaxed);
    }

    /// The thread's published version; `IDLE_VERSION` outside read-side sections.
    /// SeqCst pairs with the SeqCst bump in `HazardEpoch::retire` so the min-version
    /// scan and the publication cannot pass each other.
    #[inline]
    pub(crate) fn version(&self) -> u64 {
        self.curr_seq_version.version.load(Ordering::SeqCst)
    }

    #[inline]
    fn set_curr_version(&self, version: u64) {
        self.curr_seq_version.version.store(version, Ordering::SeqCst);
    }

    pub(crate) fn acquire(&self, version: u64) -> Result<VersionHandle, Status> {
        debug_assert_eq!(self.tid() as i64, util::get_thread_id());
        if IDLE_VERSION != self.version() {
            warn!(
                "current thread has already acquired a version handle, seq={}",
                self.curr_seq()
            );
            Err(Status::Busy)
        } else {
            self.set_curr_version(version);
            Ok(VersionHandle::new(self.tid(), self.curr_seq()))
        }
    }

    pub(crate) fn release(&self, handle: &VersionHandle) {
        debug_assert_eq!(self.tid() as i64, util::get_thread_id());
        if self.tid() == handle.tid() && self.curr_seq() != handle.seq() {
            error!("invalid handle seq={}, tid={}", handle.seq(), handle.tid());
        } else {
            self.set_curr_version(IDLE_VERSION);
            self.inc_curr_seq();
        }
    }

    /// Prepend one retired node. The version stamp and drop glue must already be set.
    pub(crate) unsafe fn push_retired(&self, node: *mut BaseHazardNode) {
        self.add_nodes(node, node, 1);
    }

    pub(crate) fn waiting_count(&self) -> i64 {
        self.retired_count.load(Ordering::Relaxed)
    }

    /// Drain this store's retired list, free every node stamped at or below
    /// `min_version`, and hand the survivors to `receiver` (the calling thread's
    /// store). Returns the number of nodes freed.
    pub(crate) unsafe fn reclaim(&self, min_version: u64, receiver: &ThreadStore) -> i64 {
        if self.last_reclaim_version.load(Ordering::Relaxed) == min_version {
            return 0;
        }
        self.last_reclaim_version.store(min_version, Ordering::Relaxed);

        let mut curr = self.retired_list.swap(ptr::null_mut(), Ordering::AcqRel);
        let mut list_retire: *mut BaseHazardNode = ptr::null_mut();
        let mut keep_head: *mut BaseHazardNode = ptr::null_mut();
        let mut keep_tail: *mut BaseHazardNode = ptr::null_mut();
        let mut retire_count = 0i64;
        let mut keep_count = 0i64;
        while !curr.is_null() {
            let next = (*curr).next();
            if (*curr).version() <= min_version {
                (*curr).set_next(list_retire);
                list_retire = curr;
                retire_count += 1;
            } else {
                (*curr).set_next(keep_head);
                if keep_head.is_null() {
                    keep_tail = curr;
                }
                keep_head = curr;
                keep_count += 1;
            }
            curr = next;
        }
        receiver.add_nodes(keep_head, keep_tail, keep_count);
        self.retired_count
            .fetch_add(-(keep_count + retire_count), Ordering::Relaxed);
        while !list_retire.is_null() {
            let node_retire = list_retire;
            list_retire = (*node_retire).next();
            reclaim_node(node_retire);
        }
        retire_count
    }

    unsafe fn add_nodes(&self, head: *mut BaseHazardNode, tail: *mut BaseHazardNode, count: i64) {
        if 0 < count {
            let mut old = self.retired_list.load(Ordering::Relaxed);
            loop {
                (*tail).set_next(old);
                match self
                    .retired_list
                    .compare_exchange(old, head, Ordering::Release, Ordering::Relaxed)
                {
                    Ok(_) => break,
                    Err(curr) => old = curr,
                }
            }
            self.retired_count.fetch_add(count, Ordering::Relaxed);
        }
    }
}

impl Drop for ThreadStore {
    fn drop(&mut self) {
        // Exclusive access: free whatever is still pending, stamps notwithstanding.
        let mut curr = self.retired_list.load(Ordering::Relaxed);
        while !curr.is_null() {
            unsafe {
                let next = (*curr).next();
                reclaim_node(curr);
                curr = next;
            }
        }
    }
}
