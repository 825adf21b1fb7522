use lockfree_containers::lockfree_stack::LockFreeStack;
use lockfree_containers::util;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;

fn set_cpu_affinity() {
    let cpus = core_affinity::get_core_ids().unwrap();
    let tid = util::get_thread_id() as usize;
    core_affinity::set_for_current(cpus[tid % cpus.len()]);
}

// 4 threads push disjoint ranges; a single-threaded drain must yield every pushed
// value exactly once.
#[test]
fn test_disjoint_ranges_drain() {
    let push_threads = 4i64;
    let per_thread = 1000i64;
    let stack = Arc::new(LockFreeStack::new());

    let mut pushers = vec![];
    for t in 0..push_threads {
        let stack = stack.clone();
        pushers.push(thread::spawn(move || {
            set_cpu_affinity();
            for i in 0..per_thread {
                stack.push(t * per_thread + i).unwrap();
            }
        }));
    }
    for t in pushers {
        t.join().unwrap();
    }

    assert_eq!(stack.len(), push_threads * per_thread);
    let mut seen = HashSet::new();
    while let Some(v) = stack.pop().unwrap() {
        assert!(seen.insert(v), "value {} popped twice", v);
    }
    assert_eq!(seen.len() as i64, push_threads * per_thread);
    for v in 0..push_threads * per_thread {
        assert!(seen.contains(&v), "value {} lost", v);
    }
    assert!(stack.pop().unwrap().is_none());
}

// concurrent pushers and poppers; the union of popped values equals the union of
// pushed values, nothing lost, nothing duplicated
#[test]
fn test_concurrent_push_pop() {
    let producer_count = 2i64;
    let per_producer = 20_000i64;
    let stack = Arc::new(LockFreeStack::new());
    let producers_left = Arc::new(AtomicI64::new(producer_count));

    let mut producers = vec![];
    for t in 0..producer_count {
        let stack = stack.clone();
        let producers_left = producers_left.clone();
        producers.push(thread::spawn(move || {
            set_cpu_affinity();
            for i in 0..per_producer {
                stack.push(t * per_producer + i).unwrap();
            }
            producers_left.fetch_add(-1, Ordering::Relaxed);
        }));
    }

    let mut poppers = vec![];
    for _ in 0..2 {
        let stack = stack.clone();
        let producers_left = producers_left.clone();
        poppers.push(thread::spawn(move || {
            set_cpu_affinity();
            let mut popped = Vec::new();
            loop {
                if let Some(v) = stack.pop().unwrap() {
                    popped.push(v);
                } else if producers_left.load(Ordering::Relaxed) == 0 {
                    break;
                }
            }
            popped
        }));
    }

    for t in producers {
        t.join().unwrap();
    }
    let mut seen = HashSet::new();
    for t in poppers {
        for v in t.join().unwrap() {
            assert!(seen.insert(v), "value {} popped twice", v);
        }
    }
    while let Some(v) = stack.pop().unwrap() {
        assert!(seen.insert(v), "value {} popped twice", v);
    }
    assert_eq!(seen.len() as i64, producer_count * per_producer);
}
