// protocol/periodic.rs - Periodic Protocol Wrapper
//
//! Runs a task factory repeatedly with a fixed period and single-flight
//! semantics: at most one inner task is live, and the next tick is
//! scheduled at `now + period` measured from the previous completion, not
//! from its start.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::messaging::Message;
use crate::time::CallHandle;
use super::{
    FinishNotifier, FinishWaiter, InitiatorFactory, ProtocolDealer, ProtocolError,
    ProtocolInstance, ProtocolKind,
};

/// Long-running wrapper repeating an inner task.
pub struct PeriodicProtocol {
    guid: Uuid,
    dealer: Arc<dyn ProtocolDealer>,
    factory: Arc<dyn InitiatorFactory>,
    period: Duration,
    run_count: AtomicU64,
    current: Mutex<Option<Arc<dyn ProtocolInstance>>>,
    timer: Mutex<Option<CallHandle>>,
    cancelled: AtomicBool,
    notifier: FinishNotifier,
}

impl PeriodicProtocol {
    pub fn new(
        dealer: Arc<dyn ProtocolDealer>,
        factory: Arc<dyn InitiatorFactory>,
        period: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            guid: Uuid::new_v4(),
            dealer,
            factory,
            period,
            run_count: AtomicU64::new(0),
            current: Mutex::new(None),
            timer: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            notifier: FinishNotifier::new(),
        })
    }

    /// Start the first tick off the caller's stack.
    pub fn initiate(self: Arc<Self>) -> Arc<Self> {
        let me = self.clone();
        self.dealer.scheduler().call_next(async move {
            me.tick().await;
        });
        self
    }

    /// Completed tick count.
    pub fn run_count(&self) -> u64 {
        self.run_count.load(Ordering::SeqCst)
    }

    /// True while an inner task is live.
    pub fn has_running_task(&self) -> bool {
        self.current.lock().is_some()
    }

    /// True while the next tick is scheduled.
    pub fn has_pending_timer(&self) -> bool {
        self.timer
            .lock()
            .as_ref()
            .map(CallHandle::active)
            .unwrap_or(false)
    }

    fn tick(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if self.cancelled.load(Ordering::SeqCst) {
                return;
            }
            debug_assert!(
                self.current.lock().is_none(),
                "periodic tick overlapped a live task"
            );

            self.run_count.fetch_add(1, Ordering::SeqCst);
            match self.dealer.initiate_protocol(self.factory.clone()).await {
                Ok(instance) => {
                    *self.current.lock() = Some(instance.clone());
                    if let Err(err) = instance.notify_finish().wait().await {
                        debug!(guid = %self.guid, %err, "periodic task failed");
                    }
                    self.current.lock().take();
                }
                Err(err) => {
                    warn!(guid = %self.guid, %err, "periodic task could not be initiated");
                }
            }

            if self.cancelled.load(Ordering::SeqCst) {
                return;
            }
            let me = self.clone();
            let handle = self.dealer.scheduler().call_later(self.period, async move {
                me.tick().await;
            });
            *self.timer.lock() = Some(handle);
        })
    }
}

#[async_trait]
impl ProtocolInstance for PeriodicProtocol {
    fn guid(&self) -> Uuid {
        self.guid
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Periodic
    }

    fn protocol_type(&self) -> String {
        self.factory.protocol_type().to_string()
    }

    fn protocol_id(&self) -> String {
        self.factory.protocol_id().to_string()
    }

    fn is_idle(&self) -> bool {
        self.current.lock().is_none()
    }

    fn is_long_running(&self) -> bool {
        true
    }

    fn notify_finish(&self) -> FinishWaiter {
        self.notifier.waiter()
    }

    fn deliver(&self, message: Message) {
        warn!(guid = %self.guid, message_id = %message.message_id,
              "periodic wrapper is not a message target");
    }

    async fn cleanup(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
        let current = self.current.lock().take();
        if let Some(task) = current {
            task.cleanup().await;
        }
        self.notifier.fail(ProtocolError::Cancelled);
    }

    fn agent_snapshot(&self) -> Value {
        Value::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Completion, Protocol};
    use crate::time::Scheduler;
    use std::sync::atomic::AtomicUsize;

    /// Instance resolving after a fixed simulated duration (zero = sync).
    struct TimedInstance {
        guid: Uuid,
        notifier: FinishNotifier,
    }

    impl TimedInstance {
        fn new(duration: Duration) -> Arc<Self> {
            let notifier = FinishNotifier::new();
            if duration.is_zero() {
                notifier.resolve(Completion::default());
            } else {
                let settle = notifier.clone();
                Scheduler::new().call_later(duration, async move {
                    settle.resolve(Completion::default());
                });
            }
            Arc::new(Self {
                guid: Uuid::new_v4(),
                notifier,
            })
        }
    }

    #[async_trait]
    impl ProtocolInstance for TimedInstance {
        fn guid(&self) -> Uuid {
            self.guid
        }

        fn kind(&self) -> ProtocolKind {
            ProtocolKind::Task
        }

        fn protocol_type(&self) -> String {
            "Task".into()
        }

        fn protocol_id(&self) -> String {
            "dummy-task".into()
        }

        fn is_idle(&self) -> bool {
            self.notifier.is_settled()
        }

        fn notify_finish(&self) -> FinishWaiter {
            self.notifier.waiter()
        }

        fn deliver(&self, _message: Message) {}

        async fn cleanup(&self) {
            self.notifier.fail(ProtocolError::Cancelled);
        }

        fn agent_snapshot(&self) -> Value {
            Value::Null
        }
    }

    /// Counts every task instantiation, like the agent-side counter a real
    /// task would bump.
    struct TaskDealer {
        external_counter: AtomicUsize,
        task_duration: Duration,
        live: Arc<AtomicUsize>,
        overlap_seen: AtomicBool,
    }

    impl TaskDealer {
        fn new(task_duration: Duration) -> Arc<Self> {
            Arc::new(Self {
                external_counter: AtomicUsize::new(0),
                task_duration,
                live: Arc::new(AtomicUsize::new(0)),
                overlap_seen: AtomicBool::new(false),
            })
        }

        fn external(&self) -> usize {
            self.external_counter.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProtocolDealer for TaskDealer {
        fn scheduler(&self) -> Scheduler {
            Scheduler::new()
        }

        async fn initiate_protocol(
            &self,
            _factory: Arc<dyn InitiatorFactory>,
        ) -> Result<Arc<dyn ProtocolInstance>, ProtocolError> {
            if self.live.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlap_seen.store(true, Ordering::SeqCst);
            }
            self.external_counter.fetch_add(1, Ordering::SeqCst);

            let instance = TimedInstance::new(self.task_duration);
            let live = self.live.clone();
            let waiter = instance.notify_finish();
            tokio::spawn(async move {
                let _ = waiter.wait().await;
                live.fetch_sub(1, Ordering::SeqCst);
            });
            Ok(instance)
        }
    }

    struct DummyTaskFactory;

    impl InitiatorFactory for DummyTaskFactory {
        fn protocol_type(&self) -> &str {
            "Task"
        }

        fn protocol_id(&self) -> &str {
            "dummy-task"
        }

        fn build(&self) -> Box<dyn Protocol> {
            unreachable!("the dealer double never builds agent-side logic")
        }
    }

    async fn wait_for_runs(protocol: &Arc<PeriodicProtocol>, runs: u64) {
        while protocol.run_count() < runs || protocol.has_running_task() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sync_task_repeats_with_the_period() {
        let dealer = TaskDealer::new(Duration::ZERO);
        let protocol = PeriodicProtocol::new(
            dealer.clone(),
            Arc::new(DummyTaskFactory),
            Duration::from_secs(10),
        );
        let protocol = protocol.initiate();

        wait_for_runs(&protocol, 3).await;
        assert_eq!(protocol.run_count(), 3);
        assert_eq!(dealer.external(), 3);
        assert!(!protocol.has_running_task());
        assert!(protocol.has_pending_timer());
        protocol.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn async_task_never_overlaps() {
        let dealer = TaskDealer::new(Duration::from_secs(2));
        let protocol = PeriodicProtocol::new(
            dealer.clone(),
            Arc::new(DummyTaskFactory),
            Duration::from_secs(10),
        );
        let protocol = protocol.initiate();

        wait_for_runs(&protocol, 3).await;
        assert_eq!(protocol.run_count(), 3);
        assert_eq!(dealer.external(), 3);
        assert!(!dealer.overlap_seen.load(Ordering::SeqCst));
        protocol.cleanup().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_future_ticks() {
        let dealer = TaskDealer::new(Duration::ZERO);
        let protocol = PeriodicProtocol::new(
            dealer.clone(),
            Arc::new(DummyTaskFactory),
            Duration::from_secs(10),
        );
        let protocol = protocol.initiate();

        wait_for_runs(&protocol, 1).await;
        protocol.cleanup().await;
        let runs = protocol.run_count();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(protocol.run_count(), runs);
        assert!(!protocol.has_pending_timer());
    }
}
