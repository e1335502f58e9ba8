//! Deadline timers.
//!
//! A timer is a `tokio::time::sleep` task on the shared runtime. A fired
//! timer only runs a short hand-off closure (normally "schedule this onto a
//! serial queue"), so it never executes engine work itself.
//!
//! Cancellation aborts the sleep and sets a shared flag. The flag is checked
//! when the deadline passes and, for timers created through
//! [`SerialQueue::schedule_after`], once more when the hand-off task runs
//! inside the queue. An operation that completes on its queue and cancels
//! its timer therefore never sees that timer fire.
//!
//! [`SerialQueue::schedule_after`]: crate::queue::SerialQueue::schedule_after

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::trace;

use crate::runtime;

/// Convert a timeout expressed in seconds into an optional duration.
///
/// Negative (and NaN) values mean "no timeout".
///
/// ```
/// use gantry_core::timer::timeout_secs;
/// use std::time::Duration;
///
/// assert_eq!(timeout_secs(-1.0), None);
/// assert_eq!(timeout_secs(1.5), Some(Duration::from_millis(1500)));
/// ```
#[must_use]
pub fn timeout_secs(secs: f64) -> Option<Duration> {
    if secs.is_nan() || secs < 0.0 || !secs.is_finite() {
        None
    } else {
        Some(Duration::from_secs_f64(secs))
    }
}

/// Handle to an armed timer.
///
/// Dropping the handle does not cancel the timer.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    sleeper: Option<Arc<AbortHandle>>,
}

impl TimerHandle {
    /// Disarm the timer. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(sleeper) = &self.sleeper {
            sleeper.abort();
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Run `fire` on the runtime once `delay` has elapsed.
///
/// `fire` gets a copy of the handle so a hand-off can check for a late
/// cancel. It must be short; hand real work to a queue.
pub fn after<F>(delay: Duration, fire: F) -> TimerHandle
where
    F: FnOnce(TimerHandle) + Send + 'static,
{
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = TimerHandle {
        cancelled: Arc::clone(&cancelled),
        sleeper: None,
    };
    let sleeper = runtime::spawn(async move {
        tokio::time::sleep(delay).await;
        if flag.is_cancelled() {
            return;
        }
        trace!("[TIMER] Deadline reached after {:?}", delay);
        fire(flag);
    });
    TimerHandle {
        cancelled,
        sleeper: sleeper.map(Arc::new),
    }
}
