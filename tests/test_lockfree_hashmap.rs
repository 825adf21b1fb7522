use lockfree_containers::lockfree_hashmap::LockFreeHashMap;
use lockfree_containers::util;
use std::sync::Arc;
use std::thread;

fn set_cpu_affinity() {
    let cpus = core_affinity::get_core_ids().unwrap();
    let tid = util::get_thread_id() as usize;
    core_affinity::set_for_current(cpus[tid % cpus.len()]);
}

// each thread owns a disjoint key range: insert, verify, overwrite, remove half;
// after the join the survivors must be exactly the odd keys with overwritten values
#[test]
fn test_disjoint_key_ranges() {
    let thread_count = 4i64;
    let per_thread = 1000i64;
    let map: Arc<LockFreeHashMap<i64, i64>> = Arc::new(LockFreeHashMap::new());

    let mut workers = vec![];
    for t in 0..thread_count {
        let map = map.clone();
        workers.push(thread::spawn(move || {
            set_cpu_affinity();
            let base = t * per_thread;
            for k in base..base + per_thread {
                map.insert(k, k).unwrap();
            }
            for k in base..base + per_thread {
                assert_eq!(map.lookup(&k).unwrap(), Some(k));
            }
            for k in base..base + per_thread {
                map.insert(k, k * 2).unwrap();
            }
            for k in (base..base + per_thread).step_by(2) {
                assert!(map.remove(&k).unwrap());
            }
        }));
    }
    for t in workers {
        t.join().unwrap();
    }

    // point lookups after the synchronization point of the joins
    for t in 0..thread_count {
        let base = t * per_thread;
        for k in base..base + per_thread {
            let expect = if k % 2 == 0 { None } else { Some(k * 2) };
            assert_eq!(map.lookup(&k).unwrap(), expect);
            assert_eq!(map.contains(&k).unwrap(), expect.is_some());
        }
    }
    assert_eq!(map.len(), thread_count * per_thread / 2);
}

// the smallest table maximizes chain contention: inserts, removes and lookups of
// colliding keys keep hitting the same bucket heads
#[test]
fn test_single_bucket_contention() {
    let thread_count = 4i64;
    let per_thread = 500i64;
    let map: Arc<LockFreeHashMap<i64, i64>> = Arc::new(LockFreeHashMap::with_capacity(1));

    let mut workers = vec![];
    for t in 0..thread_count {
        let map = map.clone();
        workers.push(thread::spawn(move || {
            set_cpu_affinity();
            let base = t * per_thread;
            for k in base..base + per_thread {
                map.insert(k, -k).unwrap();
                // reads of other threads' keys must see either nothing or a
                // fully linked node, never garbage
                let probe = (k + per_thread) % (thread_count * per_thread);
                if let Some(v) = map.lookup(&probe).unwrap() {
                    assert_eq!(v, -probe);
                }
            }
            for k in (base..base + per_thread).skip(1).step_by(2) {
                assert!(map.remove(&k).unwrap());
            }
        }));
    }
    for t in workers {
        t.join().unwrap();
    }

    for k in 0..thread_count * per_thread {
        let expect = if k % per_thread % 2 == 1 { None } else { Some(-k) };
        assert_eq!(map.lookup(&k).unwrap(), expect);
    }
}
