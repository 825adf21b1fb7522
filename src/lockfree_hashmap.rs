//! Chained hash table over a fixed bucket array. Each bucket heads a lock-free
//! singly-linked chain; deletion marks bit 0 of a node's `next` pointer before the
//! node is unlinked, so a concurrent traversal can always tell a live node from a
//! logically removed one. The bucket count is fixed at construction; growing the
//! table would need a rehashing protocol this design deliberately leaves out.

use crate::atomic_ref::{is_marked, marked, unmarked, AtomicRef};
use crate::error::Status;
use crate::hazard_epoch::HazardEpoch;
use crate::hazard_pointer::{BaseHazardNode, HazardObject};
use crate::util::{Stats, WrappedAlign64Type};
use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

const DEFAULT_BUCKET_COUNT: usize = 512;

/// Values live behind their own pointer so an overwrite is a single swap and the
/// displaced value can be retired independently of its node.
struct ValueBox<V> {
    base: BaseHazardNode,
    value: V,
}

impl<V> HazardObject for ValueBox<V> {
    fn base_node(&self) -> *mut BaseHazardNode {
        &self.base as *const _ as *mut BaseHazardNode
    }
}

impl<V> ValueBox<V> {
    fn boxed(value: V) -> *mut ValueBox<V> {
        Box::into_raw(Box::new(ValueBox {
            base: BaseHazardNode::default(),
            value,
        }))
    }
}

struct ChainNode<K, V> {
    key: K,
    hash: u64,
    base: BaseHazardNode,
    value: AtomicRef<ValueBox<V>>,
    next: AtomicRef<ChainNode<K, V>>,
}

impl<K, V> HazardObject for ChainNode<K, V> {
    fn base_node(&self) -> *mut BaseHazardNode {
        &self.base as *const _ as *mut BaseHazardNode
    }
}

impl<K, V> ChainNode<K, V> {
    fn new(hash: u64, key: K, value: V) -> Self {
        ChainNode {
            key,
            hash,
            base: BaseHazardNode::default(),
            value: AtomicRef::new(ValueBox::boxed(value)),
            next: AtomicRef::null(),
        }
    }
}

impl<K, V> Drop for ChainNode<K, V> {
    fn drop(&mut self) {
        let vb = self.value.load(Ordering::Relaxed);
        if !vb.is_null() {
            unsafe { drop(Box::from_raw(vb)) };
        }
    }
}

enum Search<K, V> {
    Found {
        prev: *const AtomicRef<ChainNode<K, V>>,
        node: *mut ChainNode<K, V>,
    },
    Absent {
        head: *mut ChainNode<K, V>,
    },
}

/// Lock-free hash table with overwrite-on-duplicate inserts. New nodes are only ever
/// linked at a bucket's head, so two racing inserts of one key serialize through the
/// head CAS: the loser re-searches, finds the winner's node and overwrites its value.
/// A key therefore never has two live nodes.
pub struct LockFreeHashMap<K, V, S = RandomState> {
    reclaimer: Box<HazardEpoch>,
    buckets: Box<[AtomicRef<ChainNode<K, V>>]>,
    mask: usize,
    hasher: S,
    len: WrappedAlign64Type<AtomicI64>,
    cas_retries: AtomicU64,
}

unsafe impl<K: Send + Sync, V: Send + Sync, S: Send> Send for LockFreeHashMap<K, V, S> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync> Sync for LockFreeHashMap<K, V, S> {}

impl<K, V> LockFreeHashMap<K, V, RandomState>
where
    K: Hash + Eq,
{
    pub fn new() -> Self {
        Self::with_capacity_and_hasher(DEFAULT_BUCKET_COUNT, RandomState::new())
    }

    /// `capacity` is the bucket count, not an element limit; chains grow unbounded.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K, V> Default for LockFreeHashMap<K, V, RandomState>
where
    K: Hash + Eq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> LockFreeHashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Bucket count is rounded up to a power of two and fixed for the map's lifetime.
    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        let capacity = capacity.next_power_of_two().max(16);
        let buckets = (0..capacity)
            .map(|_| AtomicRef::null())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        LockFreeHashMap {
            reclaimer: HazardEpoch::default_new_in_heap(),
            buckets,
            mask: capacity - 1,
            hasher,
            len: WrappedAlign64Type(AtomicI64::new(0)),
            cas_retries: AtomicU64::new(0),
        }
    }

    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(DEFAULT_BUCKET_COUNT, hasher)
    }

    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Live entry count as seen by completed operations; approximate under concurrency.
    pub fn len(&self) -> i64 {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 0
    }

    pub fn stats(&self) -> Stats {
        Stats {
            approx_len: self.len.load(Ordering::Relaxed),
            cas_retries: self.cas_retries.load(Ordering::Relaxed),
            pending_reclaim: self.reclaimer.retired_count(),
        }
    }

    #[inline]
    fn hash_key<Q>(&self, key: &Q) -> u64
    where
        K: Borrow<Q>,
        Q: Hash + ?Sized,
    {
        self.hasher.hash_one(key)
    }

    /// Insert with overwrite semantics: an existing live node with an equal key gets
    /// its value swapped (the old value is retired), otherwise a new node is CAS-linked
    /// at the bucket head. Errs only on `ThreadNumOverflow`, leaving the map unchanged.
    pub fn insert(&self, key: K, value: V) -> Result<(), Status> {
        let hash = self.hash_key(&key);
        let bucket = &self.buckets[hash as usize & self.mask];
        let handle = self.reclaimer.acquire()?;
        let node = Box::into_raw(Box::new(ChainNode::new(hash, key, value)));
        unsafe {
            loop {
                match self.search(bucket, hash, &(*node).key) {
                    Search::Found { node: existing, .. } => {
                        let fresh = (*node).value.swap(ptr::null_mut(), Ordering::Relaxed);
                        let old = (*existing).value.swap(fresh, Ordering::AcqRel);
                        self.reclaimer.retire(old);
                        // staging node carries no value anymore, drop it directly
                        drop(Box::from_raw(node));
                        break;
                    }
                    Search::Absent { head } => {
                        (*node).next.store(head, Ordering::Relaxed);
                        if bucket
                            .compare_exchange(head, node, Ordering::Release, Ordering::Relaxed)
                            .is_ok()
                        {
                            self.len.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                        self.cas_retries.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            self.reclaimer.release(handle);
        }
        Ok(())
    }

    /// Clone out the value stored under `key`, `Ok(None)` on a miss. Pure read path:
    /// acquire loads only, skips logically deleted nodes, no CAS.
    pub fn lookup<Q>(&self, key: &Q) -> Result<Option<V>, Status>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let hash = self.hash_key(key);
        let handle = self.reclaimer.acquire()?;
        let ret = unsafe {
            let node = self.find_live(hash, key);
            if node.is_null() {
                None
            } else {
                let vb = (*node).value.load(Ordering::Acquire);
                Some((*vb).value.clone())
            }
        };
        unsafe { self.reclaimer.release(handle) };
        Ok(ret)
    }

    pub fn contains<Q>(&self, key: &Q) -> Result<bool, Status>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_key(key);
        let handle = self.reclaimer.acquire()?;
        let found = unsafe { !self.find_live(hash, key).is_null() };
        unsafe { self.reclaimer.release(handle) };
        Ok(found)
    }

    /// Remove the entry under `key`; `Ok(true)` if a live entry was found. The node is
    /// first marked (logical delete), then unlinked; whichever thread wins the unlink
    /// CAS retires it, and traversals finish unlinks a slow remover left behind.
    pub fn remove<Q>(&self, key: &Q) -> Result<bool, Status>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_key(key);
        let bucket = &self.buckets[hash as usize & self.mask];
        let handle = self.reclaimer.acquire()?;
        let removed;
        unsafe {
            loop {
                match self.search(bucket, hash, key) {
                    Search::Absent { .. } => {
                        removed = false;
                        break;
                    }
                    Search::Found { prev, node } => {
                        let next = (*node).next.load(Ordering::Acquire);
                        if is_marked(next) {
                            // a concurrent remove got here first
                            continue;
                        }
                        if (*node)
                            .next
                            .compare_exchange(next, marked(next), Ordering::AcqRel, Ordering::Relaxed)
                            .is_err()
                        {
                            self.cas_retries.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        self.len.fetch_add(-1, Ordering::Relaxed);
                        if (*prev)
                            .compare_exchange(node, next, Ordering::AcqRel, Ordering::Relaxed)
                            .is_ok()
                        {
                            self.reclaimer.retire(node);
                        }
                        removed = true;
                        break;
                    }
                }
            }
            self.reclaimer.release(handle);
        }
        Ok(removed)
    }

    /// Locate a live node with `key`, tracking the link that points at it. Marked
    /// nodes encountered on the way are unlinked (the winner of that CAS retires
    /// them); any interference restarts the traversal from the bucket head.
    unsafe fn search<Q>(
        &self,
        bucket: &AtomicRef<ChainNode<K, V>>,
        hash: u64,
        key: &Q,
    ) -> Search<K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        'retry: loop {
            let head = bucket.load(Ordering::Acquire);
            let mut prev: *const AtomicRef<ChainNode<K, V>> = bucket;
            let mut curr = head;
            while !curr.is_null() {
                let next = (*curr).next.load(Ordering::Acquire);
                if is_marked(next) {
                    match (*prev).compare_exchange(
                        curr,
                        unmarked(next),
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            self.reclaimer.retire(curr);
                            curr = unmarked(next);
                            continue;
                        }
                        Err(_) => {
                            self.cas_retries.fetch_add(1, Ordering::Relaxed);
                            continue 'retry;
                        }
                    }
                }
                if (*curr).hash == hash && (*curr).key.borrow() == key {
                    return Search::Found { prev, node: curr };
                }
                prev = &(*curr).next;
                curr = next;
            }
            return Search::Absent { head };
        }
    }

    /// Read-only bucket scan used by the lookup paths; steps over marked nodes
    /// without helping, so it stays CAS-free.
    unsafe fn find_live<Q>(&self, hash: u64, key: &Q) -> *mut ChainNode<K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let bucket = &self.buckets[hash as usize & self.mask];
        let mut curr = bucket.load(Ordering::Acquire);
        while !curr.is_null() {
            let next = (*curr).next.load(Ordering::Acquire);
            if !is_marked(next) && (*curr).hash == hash && (*curr).key.borrow() == key {
                return curr;
            }
            curr = unmarked(next);
        }
        ptr::null_mut()
    }
}

impl<K, V, S> Drop for LockFreeHashMap<K, V, S> {
    fn drop(&mut self) {
        for bucket in self.buckets.iter() {
            let mut curr = bucket.load(Ordering::Relaxed);
            while !curr.is_null() {
                unsafe {
                    let next = (*curr).next.load(Ordering::Relaxed);
                    drop(Box::from_raw(curr));
                    curr = unmarked(next);
                }
            }
        }
    }
}
