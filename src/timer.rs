//! Deferred execution of retries.
//!
//! A single worker thread drains a deadline-ordered queue. The thread is only
//! started when something is queued, and exits again once the queue is empty.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{error, trace, warn};

use crate::error::PvError;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    deadline: Instant,
    /// Submission order, so equal deadlines run first-in first-out
    sequence: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    /// Reversed, so that the max-heap pops the earliest deadline first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct TimerState {
    queue: BinaryHeap<Entry>,
    next_sequence: u64,
    worker: Option<JoinHandle<()>>,
    worker_running: bool,
    shut_down: bool,
}

#[derive(Default)]
struct TimerInner {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

#[derive(Clone, Default)]
pub struct TimerQueue {
    inner: Arc<TimerInner>,
}

impl TimerQueue {
    pub fn new() -> Self {
        TimerQueue::default()
    }

    /// Run `task` once `delay` has elapsed
    pub fn submit_after<F>(&self, delay: Duration, task: F) -> Result<(), PvError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_at(Instant::now() + delay, task)
    }

    pub fn submit_at<F>(&self, deadline: Instant, task: F) -> Result<(), PvError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.shut_down {
            return Err(PvError::Unavailable("timer queue has been shut down"));
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.queue.push(Entry {
            deadline,
            sequence,
            task: Box::new(task),
        });
        if state.worker_running {
            self.inner.wakeup.notify_one();
        } else {
            // The previous worker, if any, has already left its loop
            state.worker.take();
            let inner = self.inner.clone();
            let handle = thread::Builder::new()
                .name("pv-retry-timer".to_string())
                .spawn(move || run_timer(inner))?;
            state.worker = Some(handle);
            state.worker_running = true;
            trace!("Started timer worker");
        }
        Ok(())
    }

    /// Number of tasks waiting for their deadline
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard every pending task and wait for the worker to stop
    pub fn shutdown(&self) {
        let worker = {
            let mut state = self.inner.state.lock();
            state.shut_down = true;
            if !state.queue.is_empty() {
                warn!("Discarding {} pending timer tasks", state.queue.len());
            }
            state.queue.clear();
            self.inner.wakeup.notify_all();
            state.worker.take()
        };
        if let Some(worker) = worker
            && worker.thread().id() != thread::current().id()
            && worker.join().is_err()
        {
            error!("Timer worker panicked");
        }
    }
}

fn run_timer(inner: Arc<TimerInner>) {
    let mut state = inner.state.lock();
    loop {
        if state.shut_down {
            break;
        }
        let Some(next) = state.queue.peek() else {
            break;
        };
        let deadline = next.deadline;
        if deadline > Instant::now() {
            inner.wakeup.wait_until(&mut state, deadline);
            continue;
        }
        let Some(entry) = state.queue.pop() else {
            break;
        };
        drop(state);
        if panic::catch_unwind(AssertUnwindSafe(entry.task)).is_err() {
            error!("Timer task panicked");
        }
        state = inner.state.lock();
    }
    state.worker_running = false;
    trace!("Timer worker idle, exiting");
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::unbounded;

    use super::*;

    #[test]
    fn runs_tasks_in_deadline_order() {
        let timer = TimerQueue::new();
        let (tx, rx) = unbounded();
        for (delay, label) in [(30, "c"), (10, "a"), (20, "b"), (20, "b2")] {
            let tx = tx.clone();
            timer
                .submit_after(Duration::from_millis(delay), move || {
                    tx.send(label).unwrap();
                })
                .unwrap();
        }
        let order: Vec<_> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(order, vec!["a", "b", "b2", "c"]);
    }

    #[test]
    fn worker_restarts_after_going_idle() {
        let timer = TimerQueue::new();
        let (tx, rx) = unbounded();
        let first = tx.clone();
        timer
            .submit_after(Duration::ZERO, move || first.send(1).unwrap())
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        // Give the worker time to notice the empty queue and exit
        thread::sleep(Duration::from_millis(50));
        assert!(!timer.inner.state.lock().worker_running);

        timer
            .submit_after(Duration::from_millis(5), move || tx.send(2).unwrap())
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
    }

    #[test]
    fn shutdown_discards_pending() {
        let timer = TimerQueue::new();
        timer
            .submit_after(Duration::from_secs(60), || panic!("should never run"))
            .unwrap();
        assert_eq!(timer.len(), 1);
        timer.shutdown();
        assert!(timer.is_empty());
        assert!(timer.submit_after(Duration::ZERO, || ()).is_err());
    }
}
