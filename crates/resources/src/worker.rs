//! Fixed-size worker pool for loader and upload jobs.
//!
//! Jobs are boxed closures sent over one multi-consumer channel; each worker
//! holds its own receiver clone. A job that panics is logged and the worker
//! keeps running.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, error};

use crate::error::ResourceResult;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed number of named threads draining one job queue.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `threads` workers (at least one).
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to spawn a thread.
    pub fn new(threads: usize) -> ResourceResult<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = unbounded::<Job>();

        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("ember-worker-{id}"))
                .spawn(move || worker_loop(id, receiver))?;
            workers.push(handle);
        }

        debug!("Worker pool started with {} thread(s)", threads);
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Queues `job` on the next free worker.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        let Some(sender) = &self.sender else {
            return;
        };
        if sender.send(Box::new(job)).is_err() {
            error!("Worker pool queue closed; job dropped");
        }
    }

    /// Jobs waiting for a free worker.
    #[inline]
    pub fn queued(&self) -> usize {
        self.sender.as_ref().map_or(0, Sender::len)
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }
}

fn worker_loop(id: usize, receiver: Receiver<Job>) {
    for job in receiver.iter() {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("Job panicked on worker {}", id);
        }
    }
    debug!("Worker {} exiting", id);
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel ends every worker loop once the queue drains.
        drop(self.sender.take());

        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // The last owner of the pool can be a job running on a worker;
            // that thread exits on its own after the job returns.
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("Worker thread panicked during shutdown");
            }
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.workers.len())
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crossbeam_channel::bounded;
    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn test_execute_runs_job() {
        let pool = WorkerPool::new(2).unwrap();
        let (tx, rx) = bounded(1);
        pool.execute(move || tx.send(21 * 2).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_zero_threads_still_runs_jobs() {
        let pool = WorkerPool::new(0).unwrap();
        assert_eq!(pool.thread_count(), 1);
        let (tx, rx) = bounded(1);
        pool.execute(move || tx.send("ok").unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "ok");
    }

    #[test]
    fn test_panicking_job_is_contained() {
        let pool = WorkerPool::new(1).unwrap();
        pool.execute(|| panic!("boom"));
        let (tx, rx) = bounded(1);
        pool.execute(move || tx.send(7).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn test_jobs_spread_across_workers() {
        let pool = WorkerPool::new(3).unwrap();
        let names = Arc::new(Mutex::new(HashSet::new()));
        let (tx, rx) = bounded(3);
        let gate = Arc::new(std::sync::Barrier::new(3));
        for _ in 0..3 {
            let names = names.clone();
            let gate = gate.clone();
            let tx = tx.clone();
            pool.execute(move || {
                // Every job waits for the others, so each needs its own worker.
                gate.wait();
                let name = thread::current().name().map(str::to_string);
                names.lock().insert(name);
                tx.send(()).unwrap();
            });
        }
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(names.lock().len(), 3);
    }

    #[test]
    fn test_drop_drains_queued_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new(3).unwrap();
            for _ in 0..50 {
                let counter = counter.clone();
                pool.execute(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }
}
