//! Michael–Scott queue: a FIFO container with a permanent dummy node, so `head` and
//! `tail` are never null. An enqueuer links the new node first and swings `tail`
//! second; any thread finding `tail` lagging helps it forward, which is what makes a
//! stalled enqueuer unable to block dequeuers.

use crate::atomic_ref::AtomicRef;
use crate::error::Status;
use crate::hazard_epoch::HazardEpoch;
use crate::hazard_pointer::{BaseHazardNode, HazardObject};
use crate::util::{Stats, WrappedAlign64Type};
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

struct FifoNode<T> {
    value: Option<T>,
    base: BaseHazardNode,
    next: AtomicRef<FifoNode<T>>,
}

impl<T> HazardObject for FifoNode<T> {
    fn base_node(&self) -> *mut BaseHazardNode {
        &self.base as *const _ as *mut BaseHazardNode
    }
}

impl<T> Default for FifoNode<T> {
    fn default() -> Self {
        FifoNode {
            value: None,
            base: BaseHazardNode::default(),
            next: AtomicRef::null(),
        }
    }
}

impl<T> FifoNode<T> {
    fn new(value: T) -> Self {
        FifoNode {
            value: Some(value),
            base: BaseHazardNode::default(),
            next: AtomicRef::null(),
        }
    }
}

/// Lock-free FIFO queue. Values enqueued by one producer are dequeued in that
/// producer's order even with many concurrent consumers; no ordering is promised
/// between different producers beyond the queue's own linearization.
pub struct LockFreeQueue<T> {
    reclaimer: Box<HazardEpoch>,
    head: WrappedAlign64Type<AtomicRef<FifoNode<T>>>,
    tail: WrappedAlign64Type<AtomicRef<FifoNode<T>>>,
    len: AtomicI64,
    cas_retries: AtomicU64,
}

unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T> Default for LockFreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LockFreeQueue<T> {
    pub fn new() -> Self {
        let dummy = Box::into_raw(Box::new(FifoNode::<T>::default()));
        LockFreeQueue {
            reclaimer: HazardEpoch::default_new_in_heap(),
            head: WrappedAlign64Type(AtomicRef::new(dummy)),
            tail: WrappedAlign64Type(AtomicRef::new(dummy)),
            len: AtomicI64::new(0),
            cas_retries: AtomicU64::new(0),
        }
    }

    /// Append a value at the tail. Errs only on `ThreadNumOverflow`, leaving the
    /// queue unchanged.
    pub fn enqueue(&self, value: T) -> Result<(), Status> {
        let handle = self.reclaimer.acquire()?;
        let node = Box::into_raw(Box::new(FifoNode::new(value)));
        loop {
            let last = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*last).next.load(Ordering::Acquire) };
            if last != self.tail.load(Ordering::Acquire) {
                self.cas_retries.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if next.is_null() {
                // Linking into `last.next` is the linearization point; swinging
                // `tail` afterwards is best effort, any thread may finish it.
                if unsafe {
                    (*last)
                        .next
                        .compare_exchange(ptr::null_mut(), node, Ordering::Release, Ordering::Relaxed)
                        .is_ok()
                } {
                    let _ = self
                        .tail
                        .compare_exchange(last, node, Ordering::Release, Ordering::Relaxed);
                    break;
                }
                self.cas_retries.fetch_add(1, Ordering::Relaxed);
            } else {
                // Tail lags behind a finished link; help it forward and retry.
                let _ = self
                    .tail
                    .compare_exchange(last, next, Ordering::Release, Ordering::Relaxed);
            }
        }
        self.len.fetch_add(1, Ordering::Relaxed);
        unsafe { self.reclaimer.release(handle) };
        Ok(())
    }

    /// Remove the oldest value, `Ok(None)` on an empty queue. The dequeued node's
    /// successor becomes the new dummy; the old dummy is retired, never freed inline.
    pub fn dequeue(&self) -> Result<Option<T>, Status> {
        let handle = self.reclaimer.acquire()?;
        let mut ret = None;
        loop {
            let first = self.head.load(Ordering::Acquire);
            let last = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*first).next.load(Ordering::Acquire) };
            if first != self.head.load(Ordering::Acquire) {
                self.cas_retries.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if first == last {
                if next.is_null() {
                    break;
                }
                // An enqueuer linked a node but has not swung the tail yet.
                let _ = self
                    .tail
                    .compare_exchange(last, next, Ordering::Release, Ordering::Relaxed);
                continue;
            }
            match self
                .head
                .compare_exchange(first, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    // Only the winner of the head CAS touches `next.value`.
                    ret = unsafe { (*next).value.take() };
                    debug_assert!(ret.is_some());
                    self.len.fetch_add(-1, Ordering::Relaxed);
                    unsafe { self.reclaimer.retire(first) };
                    break;
                }
                Err(_) => {
                    self.cas_retries.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        unsafe { self.reclaimer.release(handle) };
        Ok(ret)
    }

    // dereferencing the dummy here would need a guard, so go by the counter
    pub fn is_empty(&self) -> bool {
        self.len() <= 0
    }

    /// Element count as seen by completed operations; approximate under concurrency.
    pub fn len(&self) -> i64 {
        self.len.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Stats {
        Stats {
            approx_len: self.len.load(Ordering::Relaxed),
            cas_retries: self.cas_retries.load(Ordering::Relaxed),
            pending_reclaim: self.reclaimer.retired_count(),
        }
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        let mut head = self.head.load(Ordering::Relaxed);
        while !head.is_null() {
            let node = unsafe { Box::from_raw(head) };
            head = node.next.load(Ordering::Relaxed);
        }
    }
}
