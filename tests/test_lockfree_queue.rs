use lockfree_containers::lockfree_queue::LockFreeQueue;
use lockfree_containers::util;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;

fn set_cpu_affinity() {
    let cpus = core_affinity::get_core_ids().unwrap();
    let tid = util::get_thread_id() as usize;
    core_affinity::set_for_current(cpus[tid % cpus.len()]);
}

#[derive(Default)]
struct QueueValue {
    a: i64,
    b: i64,
    sum: i64,
}

struct Conf {
    queue: LockFreeQueue<QueueValue>,
    loop_cnt: i64,
    producer_cnt: AtomicI64,
    produced: AtomicI64,
    consumed: AtomicI64,
}

fn producer_thread(conf: Arc<Conf>) {
    set_cpu_affinity();
    let sum_base = util::get_thread_id() * conf.loop_cnt;
    for i in 0..conf.loop_cnt {
        conf.queue
            .enqueue(QueueValue {
                a: i,
                b: 2 * i + sum_base,
                sum: sum_base + i * 3,
            })
            .unwrap();
        conf.produced.fetch_add(1, Ordering::Relaxed);
    }
    conf.producer_cnt.fetch_add(-1, Ordering::Relaxed);
}

fn consumer_thread(conf: Arc<Conf>) {
    set_cpu_affinity();
    loop {
        if let Some(v) = conf.queue.dequeue().unwrap() {
            assert_eq!(v.a + v.b, v.sum);
            conf.consumed.fetch_add(1, Ordering::Relaxed);
        } else if conf.producer_cnt.load(Ordering::Relaxed) == 0 {
            break;
        }
    }
}

#[test]
fn test_multi_threads() {
    env_logger::init();

    let producer_count = 2;
    let consumer_count = 2;
    let conf = Arc::new(Conf {
        queue: LockFreeQueue::new(),
        loop_cnt: 50_000,
        producer_cnt: AtomicI64::new(producer_count),
        produced: AtomicI64::new(0),
        consumed: AtomicI64::new(0),
    });

    let mut producer_threads = vec![];
    let mut consumer_threads = vec![];
    for _ in 0..producer_count {
        let conf = conf.clone();
        producer_threads.push(thread::spawn(move || producer_thread(conf)));
    }
    for _ in 0..consumer_count {
        let conf = conf.clone();
        consumer_threads.push(thread::spawn(move || consumer_thread(conf)));
    }

    for t in producer_threads {
        t.join().unwrap();
    }
    for t in consumer_threads {
        t.join().unwrap();
    }

    let produced = conf.produced.load(Ordering::Relaxed);
    let consumed = conf.consumed.load(Ordering::Relaxed);
    assert_eq!(produced, conf.loop_cnt * producer_count);
    assert_eq!(produced, consumed);
    assert!(conf.queue.dequeue().unwrap().is_none());
}

// values enqueued by one producer come out in that producer's order, no matter how
// many consumers compete; every consumer's view of a producer is an increasing
// subsequence of it
#[test]
fn test_fifo_per_producer() {
    let producer_count = 2i64;
    let per_producer = 30_000i64;
    let queue: Arc<LockFreeQueue<(i64, i64)>> = Arc::new(LockFreeQueue::new());
    let producers_left = Arc::new(AtomicI64::new(producer_count));

    let mut producers = vec![];
    for p in 0..producer_count {
        let queue = queue.clone();
        let producers_left = producers_left.clone();
        producers.push(thread::spawn(move || {
            set_cpu_affinity();
            for seq in 0..per_producer {
                queue.enqueue((p, seq)).unwrap();
            }
            producers_left.fetch_add(-1, Ordering::Relaxed);
        }));
    }

    let mut consumers = vec![];
    for _ in 0..2 {
        let queue = queue.clone();
        let producers_left = producers_left.clone();
        consumers.push(thread::spawn(move || {
            set_cpu_affinity();
            let mut last_seen: HashMap<i64, i64> = HashMap::new();
            let mut taken = 0i64;
            loop {
                if let Some((p, seq)) = queue.dequeue().unwrap() {
                    let last = last_seen.insert(p, seq);
                    assert!(
                        last.map_or(true, |l| l < seq),
                        "producer {} reordered: {:?} before {}",
                        p,
                        last,
                        seq
                    );
                    taken += 1;
                } else if producers_left.load(Ordering::Relaxed) == 0 {
                    break;
                }
            }
            taken
        }));
    }

    for t in producers {
        t.join().unwrap();
    }
    let mut total = 0;
    for t in consumers {
        total += t.join().unwrap();
    }
    assert_eq!(total, producer_count * per_producer);
}
