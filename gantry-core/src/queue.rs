//! Serial execution queues
//!
//! A [`SerialQueue`] runs its tasks one at a time, in submission order. Each
//! queue is a task on the shared runtime draining a `flume` channel, so two
//! different queues run in parallel and one queue never runs two tasks at
//! once.
//!
//! Every socket owns one queue (its internal context), and every delegate is
//! called on another. All socket state is mutated from inside the socket's
//! queue, which is what makes the engine lock-free across sockets.
//!
//! # Interface
//!
//! - `schedule`: run a task later
//! - `schedule_after`: run a task after a delay, cancellable
//! - `run_exclusive`: run a task and wait for its result. If the caller is
//!   already inside the queue the task runs inline.

use flume::{Receiver, Sender};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, trace};

use crate::error::{GantryError, Result};
use crate::runtime;
use crate::timer::{self, TimerHandle};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Tasks run per turn before a queue yields its worker.
const DRAIN_BATCH: usize = 64;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT_QUEUE: u64;
}

struct QueueInner {
    id: u64,
    label: String,
    tasks: Sender<Task>,
}

/// A serialized execution context.
///
/// Cloning is cheap and yields a handle to the same queue. The queue's
/// runtime task ends once every handle is dropped and the backlog is run.
#[derive(Clone)]
pub struct SerialQueue {
    inner: Arc<QueueInner>,
}

impl SerialQueue {
    /// Create a new queue. The label only shows up in logs.
    pub fn new(label: impl Into<String>) -> Self {
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let label = label.into();
        let (tx, rx) = flume::unbounded();
        runtime::spawn(drain(id, label.clone(), rx));
        Self {
            inner: Arc::new(QueueInner { id, label, tasks: tx }),
        }
    }

    #[inline]
    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// True when called from a task running on this queue.
    #[must_use]
    pub fn is_current(&self) -> bool {
        CURRENT_QUEUE
            .try_with(|id| *id == self.inner.id)
            .unwrap_or(false)
    }

    /// Append a task. Returns immediately.
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.tasks.send(Box::new(task)).is_err() {
            error!("[QUEUE] '{}' is not running; task dropped", self.inner.label);
        }
    }

    /// Append a task once `delay` has elapsed.
    ///
    /// Cancelling the returned handle from inside this queue guarantees the
    /// task will not run, even if the deadline already passed and the task
    /// is sitting in the queue.
    pub fn schedule_after<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let queue = self.clone();
        timer::after(delay, move |cancelled| {
            queue.schedule(move || {
                if !cancelled.is_cancelled() {
                    task();
                }
            });
        })
    }

    /// Run `task` on this queue and wait for its result.
    ///
    /// Runs inline when already on this queue. Otherwise the calling thread
    /// blocks until the queue gets to the task; a caller on a runtime worker
    /// first hands that worker's other tasks off. Never call this while
    /// holding something the queue's tasks may wait on.
    pub fn run_exclusive<R, F>(&self, task: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_current() {
            return Ok(task());
        }
        let (tx, rx) = flume::bounded(1);
        self.schedule(move || {
            let _ = tx.send(task());
        });
        runtime::block(|| rx.recv())
            .map_err(|_| GantryError::other(format!("queue '{}' dropped the task", self.label())))
    }
}

async fn drain(id: u64, label: String, rx: Receiver<Task>) {
    let mut budget = DRAIN_BATCH;
    while let Ok(task) = rx.recv_async().await {
        let outcome = CURRENT_QUEUE.sync_scope(id, || panic::catch_unwind(AssertUnwindSafe(task)));
        if outcome.is_err() {
            error!("[QUEUE] Task on '{}' panicked", label);
        }
        budget -= 1;
        if budget == 0 {
            budget = DRAIN_BATCH;
            tokio::task::yield_now().await;
        }
    }
    trace!("[QUEUE] '{}' finished", label);
}

impl fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialQueue")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_tasks_run_in_order() {
        let queue = SerialQueue::new("order");
        let (tx, rx) = flume::unbounded();
        for i in 0..200 {
            let tx = tx.clone();
            queue.schedule(move || {
                let _ = tx.send(i);
            });
        }
        let seen: Vec<i32> = (0..200)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(seen, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_tasks_never_overlap() {
        let queue = SerialQueue::new("exclusive");
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            queue.schedule(move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::yield_now();
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }
        queue.run_exclusive(|| ()).unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_exclusive_reentrant() {
        let queue = SerialQueue::new("reentrant");
        let inner = queue.clone();
        let value = queue
            .run_exclusive(move || {
                assert!(inner.is_current());
                // Would deadlock if not run inline.
                inner.run_exclusive(|| 41).unwrap() + 1
            })
            .unwrap();
        assert_eq!(value, 42);
        assert!(!queue.is_current());
    }

    #[test]
    fn test_schedule_after_cancelled_inside_queue() {
        let queue = SerialQueue::new("timer");
        let (tx, rx) = flume::unbounded::<&str>();
        let handle = queue.schedule_after(Duration::from_millis(5), move || {
            let _ = tx.send("fired");
        });
        // Block the queue past the deadline, then cancel from inside it.
        let cancel = handle.clone();
        queue
            .run_exclusive(move || {
                thread::sleep(Duration::from_millis(40));
                cancel.cancel();
            })
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_waiting_queues_do_not_starve_the_runtime() {
        // Every waiter blocks in run_exclusive at the same moment, each on
        // a queue of its own.
        let waiters = 4;
        let barrier = Arc::new(Barrier::new(waiters));
        let (tx, rx) = flume::unbounded();
        let mut keep = Vec::new();
        for i in 0..waiters {
            let waiter = SerialQueue::new(format!("waiter-{i}"));
            let target = SerialQueue::new(format!("target-{i}"));
            let barrier = Arc::clone(&barrier);
            let tx = tx.clone();
            let t = target.clone();
            waiter.schedule(move || {
                barrier.wait();
                let answer = t.run_exclusive(move || i).unwrap();
                let _ = tx.send(answer);
            });
            keep.push((waiter, target));
        }
        let mut answered: Vec<usize> = (0..waiters)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        answered.sort_unstable();
        assert_eq!(answered, (0..waiters).collect::<Vec<_>>());
    }
}
