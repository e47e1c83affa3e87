//! Bounded pool of worker threads for blocking backend I/O.
//!
//! Tasks are drained in submission order from a shared FIFO queue. In synchronous
//! mode no threads are started and every task runs inline, inside `submit`.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::atomic::{AtomicBool, Ordering},
    thread::{self, JoinHandle},
};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

use crate::error::PvError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to the result of a submitted task
#[derive(Debug)]
pub struct TaskHandle<T> {
    receiver: oneshot::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Block the calling thread until the task has run.
    ///
    /// Must not be called from within an async runtime; use [`TaskHandle::join`].
    pub fn wait(self) -> Result<T, PvError> {
        self.receiver
            .blocking_recv()
            .map_err(|_| PvError::Unavailable("task was dropped before completing"))
    }

    pub async fn join(self) -> Result<T, PvError> {
        self.receiver
            .await
            .map_err(|_| PvError::Unavailable("task was dropped before completing"))
    }
}

/// Run a job, logging instead of unwinding if it panics
fn run_job(job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("Worker task panicked; continuing with the next task");
    }
}

#[derive(Debug)]
pub struct WorkerPool {
    /// Queue feeding the workers, `None` once shut down
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    thread_count: usize,
    synchronous: bool,
    shut_down: AtomicBool,
}

impl WorkerPool {
    /// Start a pool with a fixed number of worker threads.
    ///
    /// A pool with zero threads rejects every submission with
    /// [`PvError::Unavailable`]; use [`WorkerPool::synchronous`] to run inline.
    pub fn new(name: &str, threads: usize) -> Result<WorkerPool, PvError> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("pv-worker-{name}-{i}"))
                .spawn(move || {
                    // Ends once the queue is both disconnected and empty
                    for job in receiver.iter() {
                        trace!("Worker picked up task");
                        run_job(job);
                    }
                    trace!("Worker exiting");
                })?;
            workers.push(handle);
        }
        debug!("Started worker pool '{name}' with {threads} threads");
        Ok(WorkerPool {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            thread_count: threads,
            synchronous: false,
            shut_down: AtomicBool::new(false),
        })
    }

    /// A pool that runs every task inline, in the submitting thread
    pub fn synchronous() -> WorkerPool {
        WorkerPool {
            sender: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            thread_count: 0,
            synchronous: true,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Whether tasks can currently be handed to a worker thread
    pub fn has_workers(&self) -> bool {
        !self.synchronous && self.thread_count > 0 && !self.shut_down.load(Ordering::Acquire)
    }

    pub fn submit<F, T>(&self, task: F) -> Result<TaskHandle<T>, PvError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(PvError::Unavailable("worker pool has been shut down"));
        }
        let (tx, receiver) = oneshot::channel();
        let job: Job = Box::new(move || {
            let _ = tx.send(task());
        });
        if self.synchronous {
            run_job(job);
            return Ok(TaskHandle { receiver });
        }
        if self.thread_count == 0 {
            return Err(PvError::Unavailable("worker pool has no threads"));
        }
        match self.sender.lock().as_ref() {
            Some(sender) => sender
                .send(job)
                .map_err(|_| PvError::Unavailable("worker pool has been shut down"))?,
            None => return Err(PvError::Unavailable("worker pool has been shut down")),
        }
        Ok(TaskHandle { receiver })
    }

    /// Stop accepting tasks, wait for every queued task to finish and join the workers.
    ///
    /// Safe to call more than once, and from a worker thread (which is then left to
    /// exit on its own).
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        // Disconnecting the queue lets the workers drain it and then exit
        drop(self.sender.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("Worker thread panicked during shutdown");
            }
        }
        debug!("Worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
        time::Duration,
    };

    use super::*;

    #[test]
    fn shutdown_drains_queued_tasks() {
        let pool = WorkerPool::new("test", 2).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let done = done.clone();
            pool.submit(move || {
                thread::sleep(Duration::from_millis(2));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 20);
        assert!(matches!(
            pool.submit(|| ()),
            Err(PvError::Unavailable(_))
        ));
        // Shutting down twice is harmless
        pool.shutdown();
    }

    #[test]
    fn tasks_return_results() {
        let pool = WorkerPool::new("test", 1).unwrap();
        let handle = pool.submit(|| 6 * 7).unwrap();
        assert_eq!(handle.wait().unwrap(), 42);
        let caller = thread::current().id();
        let ran_on = pool.submit(move || thread::current().id()).unwrap();
        assert_ne!(ran_on.wait().unwrap(), caller);
    }

    #[test]
    fn synchronous_mode_runs_inline() {
        let pool = WorkerPool::synchronous();
        let caller = thread::current().id();
        let ran = Arc::new(AtomicUsize::new(0));
        let inner = ran.clone();
        let handle = pool
            .submit(move || {
                inner.fetch_add(1, Ordering::SeqCst);
                thread::current().id()
            })
            .unwrap();
        // Already executed before submit returned
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(handle.wait().unwrap(), caller);
        assert!(!pool.has_workers());
    }

    #[test]
    fn zero_threads_is_unavailable() {
        let pool = WorkerPool::new("empty", 0).unwrap();
        assert!(matches!(
            pool.submit(|| ()),
            Err(PvError::Unavailable(_))
        ));
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let pool = WorkerPool::new("test", 1).unwrap();
        let failed = pool.submit(|| -> i32 { panic!("task failure") }).unwrap();
        assert!(failed.wait().is_err());
        assert_eq!(pool.submit(|| 1).unwrap().wait().unwrap(), 1);
    }

    #[tokio::test]
    async fn join_from_async_context() {
        let pool = WorkerPool::new("test", 1).unwrap();
        let handle = pool.submit(|| "done").unwrap();
        assert_eq!(handle.join().await.unwrap(), "done");
    }
}
