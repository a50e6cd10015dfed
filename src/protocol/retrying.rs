// protocol/retrying.rs - Retrying Protocol Wrapper
//
//! Wraps an initiator factory with exponential-backoff re-initiation.
//!
//! Each attempt instantiates the inner initiator and awaits its finish.
//! On failure with retries remaining the next attempt is scheduled at
//! `now + delay` through a cancelable handle. The current delay is memoized
//! and capped before use; after the wait is taken the memoized value
//! becomes `min(delay * 2, max_delay)`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use async_trait::async_trait;
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

/// Backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// `None` retries forever.
    pub max_retries: Option<u32>,

    pub initial_delay: Duration,

    /// Cap applied to every wait.
    pub max_delay: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_secs(1),
            max_delay: None,
        }
    }
}

/// Long-running wrapper re-initiating an inner protocol until it succeeds.
pub struct RetryingProtocol {
    guid: Uuid,
    dealer: Arc<dyn ProtocolDealer>,
    factory: Arc<dyn InitiatorFactory>,
    config: RetryConfig,
    delay: Mutex<Duration>,
    attempts: AtomicU32,
    inner: Mutex<Option<Arc<dyn ProtocolInstance>>>,
    timer: Mutex<Option<CallHandle>>,
    cancelled: AtomicBool,
    notifier: FinishNotifier,
}

impl RetryingProtocol {
    pub fn new(
        dealer: Arc<dyn ProtocolDealer>,
        factory: Arc<dyn InitiatorFactory>,
        config: RetryConfig,
    ) -> Arc<Self> {
        let delay = config.initial_delay;
        Arc::new(Self {
            guid: Uuid::new_v4(),
            dealer,
            factory,
            config,
            delay: Mutex::new(delay),
            attempts: AtomicU32::new(0),
            inner: Mutex::new(None),
            timer: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            notifier: FinishNotifier::new(),
        })
    }

    /// Start the first attempt off the caller's stack.
    pub fn initiate(self: Arc<Self>) -> Arc<Self> {
        let me = self.clone();
        self.dealer.scheduler().call_next(async move {
            me.attempt().await;
        });
        self
    }

    /// Attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The memoized delay; observable by tests.
    pub fn current_delay(&self) -> Duration {
        *self.delay.lock()
    }

    /// True while a retry timer is scheduled.
    pub fn has_pending_timer(&self) -> bool {
        self.timer
            .lock()
            .as_ref()
            .map(CallHandle::active)
            .unwrap_or(false)
    }

    async fn attempt(self: Arc<Self>) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(guid = %self.guid, attempt, "initiating inner protocol");

        let outcome = match self.dealer.initiate_protocol(self.factory.clone()).await {
            Ok(instance) => {
                *self.inner.lock() = Some(instance.clone());
                let result = instance.notify_finish().wait().await;
                self.inner.lock().take();
                result
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(completion) => self.notifier.resolve(completion),
            Err(err) => self.handle_failure(err),
        }
    }

    fn handle_failure(self: Arc<Self>, err: ProtocolError) {
        if self.cancelled.load(Ordering::SeqCst) {
            self.notifier.fail(ProtocolError::Cancelled);
            return;
        }
        if let Some(max_retries) = self.config.max_retries {
            if self.attempts() > max_retries {
                debug!(guid = %self.guid, %err, "retries exhausted");
                self.notifier.fail(err);
                return;
            }
        }

        let wait = {
            let mut delay = self.delay.lock();
            let (wait, next) = backoff_step(*delay, self.config.max_delay);
            *delay = next;
            wait
        };

        debug!(guid = %self.guid, ?wait, "scheduling retry");
        let me = self.clone();
        let handle = self.dealer.scheduler().call_later(wait, async move {
            me.attempt().await;
        });
        *self.timer.lock() = Some(handle);
    }
}

/// One backoff step: the wait to use now and the memoized successor, both
/// capped before use.
fn backoff_step(current: Duration, max_delay: Option<Duration>) -> (Duration, Duration) {
    let wait = match max_delay {
        Some(cap) => current.min(cap),
        None => current,
    };
    let next = match max_delay {
        Some(cap) => (wait * 2).min(cap),
        None => wait * 2,
    };
    (wait, next)
}

#[async_trait]
impl ProtocolInstance for RetryingProtocol {
    fn guid(&self) -> Uuid {
        self.guid
    }

    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Retrying
    }

    fn protocol_type(&self) -> String {
        self.factory.protocol_type().to_string()
    }

    fn protocol_id(&self) -> String {
        self.factory.protocol_id().to_string()
    }

    fn is_idle(&self) -> bool {
        self.inner.lock().is_none()
    }

    fn is_long_running(&self) -> bool {
        true
    }

    fn notify_finish(&self) -> FinishWaiter {
        self.notifier.waiter()
    }

    fn deliver(&self, message: Message) {
        warn!(guid = %self.guid, message_id = %message.message_id,
              "retrying wrapper is not a message target");
    }

    async fn cleanup(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
        let inner = self.inner.lock().take();
        if let Some(inner) = inner {
            inner.cleanup().await;
        }
        self.notifier.fail(ProtocolError::Cancelled);
    }

    fn agent_snapshot(&self) -> Value {
        Value::Null
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    //! Dealer double counting inner initiations, in the shape the wrapper
    //! tests need.

    use super::*;
    use crate::time::Scheduler;
    use std::sync::atomic::AtomicUsize;

    /// Inner instance that settles immediately.
    pub struct SettledInstance {
        guid: Uuid,
        notifier: FinishNotifier,
    }

    impl SettledInstance {
        pub fn new(should_work: bool) -> Arc<Self> {
            let notifier = FinishNotifier::new();
            if should_work {
                notifier.resolve(super::super::Completion::default());
            } else {
                notifier.fail(ProtocolError::Failed("inner failed".into()));
            }
            Arc::new(Self {
                guid: Uuid::new_v4(),
                notifier,
            })
        }
    }

    #[async_trait]
    impl ProtocolInstance for SettledInstance {
        fn guid(&self) -> Uuid {
            self.guid
        }

        fn kind(&self) -> ProtocolKind {
            ProtocolKind::Initiator
        }

        fn protocol_type(&self) -> String {
            "Dummy".into()
        }

        fn protocol_id(&self) -> String {
            "dummy".into()
        }

        fn is_idle(&self) -> bool {
            true
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

    /// Counts initiations; succeeds once the configured attempt is reached.
    pub struct RepeatDealer {
        pub number_called: AtomicUsize,
        pub success_at_try: Option<usize>,
    }

    impl RepeatDealer {
        pub fn new(success_at_try: Option<usize>) -> Arc<Self> {
            Arc::new(Self {
                number_called: AtomicUsize::new(0),
                success_at_try,
            })
        }

        pub fn calls(&self) -> usize {
            self.number_called.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProtocolDealer for RepeatDealer {
        fn scheduler(&self) -> Scheduler {
            Scheduler::new()
        }

        async fn initiate_protocol(
            &self,
            _factory: Arc<dyn InitiatorFactory>,
        ) -> Result<Arc<dyn ProtocolInstance>, ProtocolError> {
            let called = self.number_called.fetch_add(1, Ordering::SeqCst) + 1;
            let should_work = self
                .success_at_try
                .map(|at| called >= at)
                .unwrap_or(false);
            Ok(SettledInstance::new(should_work))
        }
    }

    pub struct DummyFactory;

    impl InitiatorFactory for DummyFactory {
        fn protocol_type(&self) -> &str {
            "Dummy"
        }

        fn protocol_id(&self) -> &str {
            "dummy"
        }

        fn build(&self) -> Box<dyn super::super::Protocol> {
            unreachable!("the dealer double never builds agent-side logic")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testkit::{DummyFactory, RepeatDealer};
    use super::*;

    fn config(
        max_retries: Option<u32>,
        initial_delay: u64,
        max_delay: Option<u64>,
    ) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_secs(initial_delay),
            max_delay: max_delay.map(Duration::from_secs),
        }
    }

    async fn settle() {
        // Let scheduled attempts and timers run under the paused clock.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_the_fourth_attempt() {
        let dealer = RepeatDealer::new(Some(4));
        let protocol = RetryingProtocol::new(dealer.clone(), Arc::new(DummyFactory), config(None, 1, None))
            .initiate();
        let waiter = protocol.notify_finish();

        waiter.wait().await.unwrap();
        assert_eq!(dealer.calls(), 4);
        assert!(!protocol.has_pending_timer());
        assert!(protocol.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_the_maximum_number_of_retries() {
        let dealer = RepeatDealer::new(None);
        let protocol = RetryingProtocol::new(dealer.clone(), Arc::new(DummyFactory), config(Some(3), 1, None))
            .initiate();
        let waiter = protocol.notify_finish();

        let err = waiter.wait().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Failed(_)));
        assert_eq!(dealer.calls(), 4);
        assert_eq!(protocol.current_delay(), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn caps_the_delay() {
        let dealer = RepeatDealer::new(None);
        let protocol = RetryingProtocol::new(
            dealer.clone(),
            Arc::new(DummyFactory),
            config(Some(3), 1, Some(2)),
        )
        .initiate();
        let waiter = protocol.notify_finish();

        waiter.wait().await.unwrap_err();
        assert_eq!(dealer.calls(), 4);
        assert_eq!(protocol.current_delay(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_forever_until_cancelled() {
        let dealer = RepeatDealer::new(None);
        let protocol = RetryingProtocol::new(dealer.clone(), Arc::new(DummyFactory), config(None, 1, None))
            .initiate();

        // First attempt plus four timed retries: waits of 1, 2, 4 and 8s.
        tokio::time::sleep(Duration::from_secs(16)).await;
        settle().await;
        assert_eq!(dealer.calls(), 5);

        protocol.cleanup().await;
        let calls = dealer.calls();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(dealer.calls(), calls);
    }

    mod backoff_laws {
        use super::super::backoff_step;
        use proptest::prelude::*;
        use std::time::Duration;

        proptest! {
            /// The wait sequence is min(d * 2^i, cap) for every step.
            #[test]
            fn waits_double_up_to_the_cap(
                initial in 1u64..64,
                cap in proptest::option::of(1u64..128),
                steps in 1usize..10,
            ) {
                let cap_duration = cap.map(Duration::from_secs);
                let mut delay = Duration::from_secs(initial);
                for step in 0..steps {
                    let (wait, next) = backoff_step(delay, cap_duration);

                    let uncapped = initial.saturating_mul(1u64 << step);
                    let expected = cap.map(|c| c.min(uncapped)).unwrap_or(uncapped);
                    prop_assert_eq!(wait, Duration::from_secs(expected));
                    if let Some(cap) = cap_duration {
                        prop_assert!(next <= cap);
                    }
                    delay = next;
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delays_follow_the_backoff_sequence() {
        let dealer = RepeatDealer::new(None);
        let protocol = RetryingProtocol::new(dealer.clone(), Arc::new(DummyFactory), config(Some(2), 3, None))
            .initiate();
        settle().await;

        // After the first failure the wait is the initial delay.
        assert_eq!(dealer.calls(), 1);
        assert_eq!(protocol.current_delay(), Duration::from_secs(6));
        assert!(protocol.has_pending_timer());

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(dealer.calls(), 2);

        tokio::time::sleep(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(dealer.calls(), 3);
        protocol.notify_finish().wait().await.unwrap_err();
    }
}
