//! Boundary between the queue and a worker pool. The pool sees the queue purely as a
//! task buffer: `submit` on the producer side, `take` on the worker side. How idle
//! workers are woken (typically a counting semaphore posted once per successful
//! `submit`) is the pool's decision and lives outside this crate; nothing here blocks,
//! so a worker that gets `Ok(None)` simply polls again or parks itself.

use crate::error::Status;
use crate::lockfree_queue::LockFreeQueue;

/// Task-buffer contract consumed by thread pools.
pub trait TaskBuffer<T: Send>: Send + Sync {
    /// Hand a task to the buffer.
    fn submit(&self, task: T) -> Result<(), Status>;

    /// Take the oldest buffered task, `Ok(None)` once drained.
    fn take(&self) -> Result<Option<T>, Status>;
}

impl<T: Send> TaskBuffer<T> for LockFreeQueue<T> {
    fn submit(&self, task: T) -> Result<(), Status> {
        self.enqueue(task)
    }

    fn take(&self) -> Result<Option<T>, Status> {
        self.dequeue()
    }
}

#[cfg(test)]
mod test {
    use super::TaskBuffer;
    use crate::lockfree_queue::LockFreeQueue;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_pool_style_consumption() {
        let buffer: Arc<LockFreeQueue<i64>> = Arc::new(LockFreeQueue::new());
        let executed = Arc::new(AtomicI64::new(0));
        let task_num = 1000;

        for i in 0..task_num {
            buffer.submit(i).unwrap();
        }

        let mut workers = vec![];
        for _ in 0..2 {
            let buffer = buffer.clone();
            let executed = executed.clone();
            workers.push(thread::spawn(move || {
                while let Some(task) = buffer.take().unwrap() {
                    executed.fetch_add(task, Ordering::Relaxed);
                }
            }));
        }
        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(executed.load(Ordering::Relaxed), task_num * (task_num - 1) / 2);
        assert!(buffer.take().unwrap().is_none());
    }
}
