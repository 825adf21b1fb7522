//! Lock-free containers built on CAS, with epoch-versioned hazard reclamation
//!
//! The core of the crate is [`hazard_epoch::HazardEpoch`], a practical variant of the
//! [`Hazard Pointers`](http://www.cs.otago.ac.nz/cosc440/readings/hazard-pointers.pdf)
//! algorithm: instead of publishing individual addresses, each thread publishes the global
//! version it observed when entering a read-side section, and a retired node is freed only
//! once every published version has passed the node's retirement stamp. An address is never
//! reused while any thread may still dereference it, which closes the
//! [`ABA problem`](https://en.wikipedia.org/wiki/ABA_problem) by construction.
//!
//! On top of the reclamation manager sit three containers, each driven purely by
//! compare-and-swap loops with no mutex on any operation path:
//!
//! - [`lockfree_stack::LockFreeStack`] — Treiber stack (`push`/`pop`).
//! - [`lockfree_queue::LockFreeQueue`] — Michael–Scott queue (`enqueue`/`dequeue`).
//! - [`lockfree_hashmap::LockFreeHashMap`] — fixed-bucket chained table with
//!   marked-pointer deletion (`insert`/`lookup`/`remove`).
//!
//! Progress is lock-free, not wait-free: some thread always completes, but an individual
//! thread can be starved by an adversarial scheduler. Repeated CAS failure under contention
//! is expected and handled by retrying with refreshed state, never surfaced as an error.

pub mod atomic_ref;
pub mod error;
pub mod hazard_epoch;
mod hazard_pointer;
pub mod lockfree_hashmap;
pub mod lockfree_queue;
pub mod lockfree_stack;
pub mod spin_lock;
pub mod task_queue;
pub mod util;
