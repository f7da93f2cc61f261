//! Bounded pool of OS threads executing HTTP-request tasks.
//!
//! The pool is a fixed number of worker threads pulling from a rendezvous
//! channel: because the channel capacity is zero and there are exactly `W`
//! consumers, `submit` naturally blocks once `W` tasks are already in
//! flight — the backpressure the spec asks for falls out of the channel
//! shape rather than a separate counter.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Receiver, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A counting semaphore callers `wait` on to join a group of submitted
/// tasks. Mirrors the "independent counting semaphore per call-site group"
/// locking-discipline note above.
#[derive(Clone)]
pub struct TaskGroup {
    state: Arc<(Mutex<usize>, Condvar)>,
}

impl TaskGroup {
    pub fn new() -> Self {
        TaskGroup {
            state: Arc::new((Mutex::new(0), Condvar::new())),
        }
    }

    fn add(&self, n: usize) {
        let mut count = self.state.0.lock().unwrap();
        *count += n;
    }

    fn mark_done(&self) {
        let (lock, cvar) = &*self.state;
        let mut count = lock.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            cvar.notify_all();
        }
    }

    /// Blocks until every task added to this group has completed.
    pub fn wait(&self) {
        let (lock, cvar) = &*self.state;
        let mut count = lock.lock().unwrap();
        while *count > 0 {
            count = cvar.wait(count).unwrap();
        }
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` worker threads, each running a FIFO pop-and-execute
    /// loop until the pool is dropped.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "worker pool size must be > 0");
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = bounded(0);
        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let receiver = receiver.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("objectfs-worker-{id}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn worker thread"),
            );
        }
        WorkerPool {
            sender: Some(sender),
            workers,
        }
    }

    /// Enqueues `job` as a member of `group`. Blocks if all `W` workers are
    /// currently busy (rendezvous backpressure).
    pub fn submit(&self, group: &TaskGroup, job: impl FnOnce() + Send + 'static) {
        group.add(1);
        let group = group.clone();
        let wrapped: Job = Box::new(move || {
            job();
            group.mark_done();
        });
        self.sender
            .as_ref()
            .expect("pool not shut down")
            .send(wrapped)
            .expect("worker pool channel closed unexpectedly");
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Dropping the sender closes the channel; each worker's `recv`
        // loop then returns `Err` and exits.
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn submitted_tasks_all_run() {
        let pool = WorkerPool::new(4);
        let group = TaskGroup::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let counter = counter.clone();
            pool.submit(&group, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        group.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn independent_groups_do_not_interfere() {
        let pool = WorkerPool::new(2);
        let group_a = TaskGroup::new();
        let group_b = TaskGroup::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        pool.submit(&group_a, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        group_a.wait();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let h = hits.clone();
        pool.submit(&group_b, move || {
            h.fetch_add(10, Ordering::SeqCst);
        });
        group_b.wait();
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn pool_drains_pending_work_on_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new(3);
            let group = TaskGroup::new();
            for _ in 0..10 {
                let counter = counter.clone();
                pool.submit(&group, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
            group.wait();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
