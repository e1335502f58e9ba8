//! Shared task runtime.
//!
//! Serial queues, deadline timers and hostname lookups all run on one
//! process-wide `tokio` multi-thread runtime. Queue tasks run on its
//! workers, timers are `tokio::time::sleep` tasks, and blocking lookups go
//! to its bounded blocking pool.
//!
//! The runtime is built on first use. Sockets do their own I/O through the
//! `mio` reactor, so only the time driver is enabled.

use once_cell::sync::Lazy;
use std::future::Future;
use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};
use tokio::task::AbortHandle;
use tracing::{debug, error};

/// Lower bound on worker threads.
const MIN_WORKERS: usize = 4;

/// Upper bound on threads parked in blocking calls (lookups, and callers
/// waiting in `run_exclusive` from inside the runtime).
const MAX_BLOCKING_THREADS: usize = 256;

static RUNTIME: Lazy<Option<Runtime>> = Lazy::new(|| {
    let workers = num_cpus::get().max(MIN_WORKERS);
    match Builder::new_multi_thread()
        .worker_threads(workers)
        .max_blocking_threads(MAX_BLOCKING_THREADS)
        .thread_name("gantry-worker")
        .enable_time()
        .build()
    {
        Ok(rt) => {
            debug!("[RUNTIME] Started with {} workers", workers);
            Some(rt)
        }
        Err(e) => {
            error!("[RUNTIME] Failed to start: {}", e);
            None
        }
    }
});

/// Handle to the shared runtime, if it could be started.
#[must_use]
pub fn handle() -> Option<&'static Handle> {
    RUNTIME.as_ref().map(Runtime::handle)
}

/// Spawn a future on the shared runtime.
pub fn spawn<F>(future: F) -> Option<AbortHandle>
where
    F: Future<Output = ()> + Send + 'static,
{
    match handle() {
        Some(h) => Some(h.spawn(future).abort_handle()),
        None => {
            error!("[RUNTIME] Unavailable; task dropped");
            None
        }
    }
}

/// Run `f`, which blocks, without taking a worker away from other tasks.
///
/// On one of the shared runtime's threads the worker hands its other tasks
/// off before blocking. Elsewhere `f` just runs.
pub fn block<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(h) if h.runtime_flavor() == RuntimeFlavor::MultiThread => tokio::task::block_in_place(f),
        _ => f(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_spawn_runs() {
        let (tx, rx) = flume::bounded(1);
        spawn(async move {
            let _ = tx.send(7);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
    }

    #[test]
    fn test_block_outside_runtime() {
        assert_eq!(block(|| 3), 3);
    }
}
