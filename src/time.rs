// time.rs - Clock and Delayed-Call Scheduler
//
//! Monotonic time and cancelable delayed calls.
//!
//! All agent and protocol code is driven through this scheduler.
//! `call_next` guarantees the chain of invocations is broken: the caller
//! returns before the scheduled work runs, because the work is always
//! re-entered through the executor queue. Delays are not drift-compensated.
//!
//! Under `#[tokio::test(start_paused = true)]` the timer wheel auto-advances,
//! so timer-driven tests are deterministic and instant.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Handle to one scheduled call.
///
/// Cancellation is idempotent. `active` is true until the call either fires
/// or is cancelled.
#[derive(Clone)]
pub struct CallHandle {
    id: Uuid,
    state: Arc<CallState>,
}

struct CallState {
    deadline: Instant,
    fired: AtomicBool,
    cancelled: AtomicBool,
    abort: Mutex<Option<AbortHandle>>,
}

impl CallHandle {
    /// Identifier of this call.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Absolute time the call is scheduled to fire at.
    pub fn scheduled_at(&self) -> Instant {
        self.state.deadline
    }

    /// True while the call has neither fired nor been cancelled.
    pub fn active(&self) -> bool {
        !self.state.fired.load(Ordering::SeqCst) && !self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Cancel the call. A call that already fired is left alone.
    pub fn cancel(&self) {
        if self.state.fired.load(Ordering::SeqCst) {
            return;
        }
        if self.state.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(abort) = self.state.abort.lock().take() {
            abort.abort();
        }
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("id", &self.id)
            .field("active", &self.active())
            .finish()
    }
}

/// Cooperative scheduler over the tokio timer wheel.
#[derive(Clone, Copy, Debug, Default)]
pub struct Scheduler;

impl Scheduler {
    pub fn new() -> Self {
        Self
    }

    /// Current monotonic time.
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Run `work` after `delay`.
    pub fn call_later<F>(&self, delay: Duration, work: F) -> CallHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let state = Arc::new(CallState {
            deadline,
            fired: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            abort: Mutex::new(None),
        });

        let task_state = state.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if task_state.cancelled.load(Ordering::SeqCst) {
                return;
            }
            task_state.fired.store(true, Ordering::SeqCst);
            work.await;
        });
        *state.abort.lock() = Some(task.abort_handle());

        CallHandle {
            id: Uuid::new_v4(),
            state,
        }
    }

    /// Run `work` from the executor queue, after the caller returns.
    pub fn call_next<F>(&self, work: F) -> CallHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.call_later(Duration::ZERO, work)
    }

    /// Box a future for storage in call books.
    pub fn boxed<F>(work: F) -> BoxFuture<'static, ()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        work.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    #[tokio::test(start_paused = true)]
    async fn call_later_fires_after_delay() {
        let (tx, rx) = oneshot::channel();
        let scheduler = Scheduler::new();
        let start = scheduler.now();

        let handle = scheduler.call_later(Duration::from_secs(5), async move {
            let _ = tx.send(());
        });
        assert!(handle.active());
        assert!(handle.scheduled_at() >= start + Duration::from_secs(5));

        rx.await.unwrap();
        assert!(!handle.active());
        assert!(scheduler.now() - start >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn call_next_breaks_the_chain() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new();

        let inner = counter.clone();
        scheduler.call_next(async move {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        // The caller observes the old value before yielding.
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new();

        let inner = counter.clone();
        let handle = scheduler.call_later(Duration::from_secs(10), async move {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();
        handle.cancel();
        assert!(!handle.active());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
