// protocol/mod.rs - Protocol Framework
//
//! The protocol multiplexer's building blocks.
//!
//! A protocol has two halves: the agent-side logic (`Protocol`, built by a
//! factory) and the medium-side instance (`ProtocolInstance`) registered in
//! the owning agent's protocol table under a guid unique within that table.
//! Passive endpoints are `Interest`s which materialize an instance on the
//! first matching inbound message; active endpoints are initiators. Two
//! reliability wrappers are built over the initiator seam:
//!
//! - `RetryingProtocol` - exponential backoff re-initiation
//! - `PeriodicProtocol` - single-flight repetition with a fixed period
//!
//! Protocol instances report completion through `notify_finish`, are
//! cancelable through `cleanup`, and expose an idle flag consumed by the
//! owning agent's idleness predicate.

pub mod contract_net;
pub mod interest;
pub mod periodic;
pub mod poster;
pub mod request;
pub mod retrying;

pub use contract_net::{
    Bidder, ContractNetBidder, ContractNetBidderFactory, ContractNetManager,
    ContractNetManagerFactory,
};
pub use interest::Interest;
pub use periodic::PeriodicProtocol;
pub use poster::Poster;
pub use request::{
    RequestFactory, RequestHandler, RequestInitiator, RequestResponder,
    RequestResponderFactory,
};
pub use retrying::{RetryConfig, RetryingProtocol};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::messaging::{Message, Recipient};
use crate::time::Scheduler;

/// Protocol error types
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Message validation failed: {0}")]
    ValidationFailed(String),

    #[error("Protocol failed: {0}")]
    Failed(String),

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Protocol cancelled")]
    Cancelled,

    #[error("Already interested in {protocol_type}.{protocol_id}")]
    DuplicateInterest {
        protocol_type: String,
        protocol_id: String,
    },

    #[error("Interest {protocol_type}.{protocol_id} does not accept a first message")]
    NotFirstMessage {
        protocol_type: String,
        protocol_id: String,
    },

    #[error("Messaging error: {0}")]
    Messaging(String),
}

/// Data returned when a protocol completes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    /// Final result/outcome
    pub result: Option<Bytes>,

    /// Metadata about completion
    pub metadata: HashMap<String, String>,
}

impl Completion {
    pub fn with_result(bytes: impl Into<Bytes>) -> Self {
        Self {
            result: Some(bytes.into()),
            metadata: HashMap::new(),
        }
    }
}

/// Result of one protocol step.
#[derive(Debug)]
pub enum ProcessResult {
    /// Continue waiting for more messages
    Continue,

    /// Send a response message and keep going
    Respond(Message),

    /// Protocol completed successfully
    Complete(Completion),

    /// Protocol failed
    Failed(String),
}

/// What a running protocol needs from its medium.
#[async_trait]
pub trait ProtocolMedium: Send + Sync {
    /// Messaging address of the owning agent.
    fn agent_address(&self) -> Recipient;

    fn scheduler(&self) -> Scheduler;

    async fn post(
        &self,
        recipients: &[Recipient],
        message: Message,
    ) -> Result<(), ProtocolError>;
}

/// Execution context handed to agent-side protocol logic.
#[derive(Clone)]
pub struct ProtocolContext {
    pub guid: Uuid,
    pub medium: Arc<dyn ProtocolMedium>,
}

impl ProtocolContext {
    /// Stamp and post an outbound message of this conversation.
    pub async fn send(&self, mut message: Message) -> Result<(), ProtocolError> {
        message.conversation_id = Some(self.guid);
        message.sender = Some(self.medium.agent_address());
        let receivers = message.receivers.clone();
        self.medium.post(&receivers, message).await
    }
}

/// Agent-side protocol logic.
#[async_trait]
pub trait Protocol: Send + 'static {
    /// First step of the conversation.
    async fn initiate(&mut self, ctx: &ProtocolContext) -> Result<ProcessResult, ProtocolError>;

    /// Process one inbound message.
    async fn on_message(
        &mut self,
        ctx: &ProtocolContext,
        message: Message,
    ) -> Result<ProcessResult, ProtocolError>;

    /// Agent-side view captured into snapshots.
    fn snapshot(&self) -> Value {
        Value::Null
    }
}

/// Builds agent-side logic for active initiation.
pub trait InitiatorFactory: Send + Sync + 'static {
    fn protocol_type(&self) -> &str;

    fn protocol_id(&self) -> &str;

    fn build(&self) -> Box<dyn Protocol>;
}

/// Builds agent-side logic for passive acceptance.
pub trait InterestFactory: Send + Sync + 'static {
    fn protocol_type(&self) -> &str;

    fn protocol_id(&self) -> &str;

    /// Whether the produced logic can be constructed from the first inbound
    /// message of a conversation. Registration requires this.
    fn accepts_first_message(&self) -> bool {
        true
    }

    /// Broadcast key to bind in every joined shard, for public interests.
    fn public_binding_key(&self) -> Option<String> {
        None
    }

    fn build(&self, first_message: &Message) -> Box<dyn Protocol>;
}

/// Payload envelope used by the dialog protocols: a performative tag plus
/// free-form content.
pub fn envelope(performative: &str, content: Value) -> Value {
    serde_json::json!({
        "performative": performative,
        "content": content,
    })
}

/// The performative of a dialog message, if any.
pub fn performative(message: &Message) -> Option<&str> {
    message.payload.get("performative").and_then(Value::as_str)
}

/// The content of a dialog message.
pub fn content(message: &Message) -> Value {
    message
        .payload
        .get("content")
        .cloned()
        .unwrap_or(Value::Null)
}

/// Kind of a protocol instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Initiator,
    InterestSpawned,
    Task,
    Retrying,
    Periodic,
}

// ---------------------------------------------------------------------------
// Finish notification
// ---------------------------------------------------------------------------

type FinishValue = Option<Result<Completion, ProtocolError>>;

/// Write side of a protocol's completion; the first outcome wins.
#[derive(Clone)]
pub struct FinishNotifier {
    tx: Arc<watch::Sender<FinishValue>>,
}

impl FinishNotifier {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn resolve(&self, completion: Completion) {
        self.settle(Ok(completion));
    }

    pub fn fail(&self, error: ProtocolError) {
        self.settle(Err(error));
    }

    pub fn is_settled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn waiter(&self) -> FinishWaiter {
        FinishWaiter {
            rx: self.tx.subscribe(),
        }
    }

    fn settle(&self, outcome: Result<Completion, ProtocolError>) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        });
    }
}

impl Default for FinishNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Awaitable completion of one protocol instance.
pub struct FinishWaiter {
    rx: watch::Receiver<FinishValue>,
}

impl FinishWaiter {
    pub async fn wait(mut self) -> Result<Completion, ProtocolError> {
        match self.rx.wait_for(|value| value.is_some()).await {
            Ok(value) => match value.clone() {
                Some(outcome) => outcome,
                None => Err(ProtocolError::Cancelled),
            },
            Err(_) => Err(ProtocolError::Cancelled),
        }
    }
}

// ---------------------------------------------------------------------------
// Medium-side instance
// ---------------------------------------------------------------------------

/// Medium-side handle to one live protocol.
#[async_trait]
pub trait ProtocolInstance: Send + Sync {
    fn guid(&self) -> Uuid;

    fn kind(&self) -> ProtocolKind;

    fn protocol_type(&self) -> String;

    fn protocol_id(&self) -> String;

    /// True when the instance is not actively doing work.
    fn is_idle(&self) -> bool;

    /// Long-running instances are tracked separately by the owning agent
    /// and cancelled explicitly during termination.
    fn is_long_running(&self) -> bool {
        false
    }

    fn notify_finish(&self) -> FinishWaiter;

    /// Dispatch one inbound message of this conversation.
    fn deliver(&self, message: Message);

    /// Abort the instance and wait briefly for it to wind down.
    async fn cleanup(&self);

    /// Agent-side view captured into snapshots.
    fn agent_snapshot(&self) -> Value;
}

/// Seam between the reliability wrappers and whatever can run initiators;
/// implemented by the agent medium and by test doubles.
#[async_trait]
pub trait ProtocolDealer: Send + Sync {
    fn scheduler(&self) -> Scheduler;

    async fn initiate_protocol(
        &self,
        factory: Arc<dyn InitiatorFactory>,
    ) -> Result<Arc<dyn ProtocolInstance>, ProtocolError>;
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

enum RunnerOp {
    Deliver(Message),
    Abort,
}

/// Drives one agent-side `Protocol` over a private mailbox.
pub struct ProtocolRunner {
    guid: Uuid,
    kind: ProtocolKind,
    protocol_type: String,
    protocol_id: String,
    tx: mpsc::UnboundedSender<RunnerOp>,
    notifier: FinishNotifier,
    finished: Arc<AtomicBool>,
    snapshot: Arc<Mutex<Value>>,
}

impl ProtocolRunner {
    /// Spawn the runner task. When `first_message` is given the logic is fed
    /// that message right after initiation (interest-spawned instances).
    pub fn spawn(
        guid: Uuid,
        kind: ProtocolKind,
        protocol_type: impl Into<String>,
        protocol_id: impl Into<String>,
        logic: Box<dyn Protocol>,
        medium: Arc<dyn ProtocolMedium>,
        first_message: Option<Message>,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = FinishNotifier::new();
        let finished = Arc::new(AtomicBool::new(false));
        let snapshot = Arc::new(Mutex::new(Value::Null));

        let runner = Arc::new(Self {
            guid,
            kind,
            protocol_type: protocol_type.into(),
            protocol_id: protocol_id.into(),
            tx,
            notifier: notifier.clone(),
            finished: finished.clone(),
            snapshot: snapshot.clone(),
        });

        let ctx = ProtocolContext { guid, medium };
        let mut logic = logic;
        tokio::spawn(async move {
            let mut done = match logic.initiate(&ctx).await {
                Ok(result) => apply_result(&ctx, &notifier, result).await,
                Err(err) => {
                    notifier.fail(err);
                    true
                }
            };
            *snapshot.lock() = logic.snapshot();

            if !done {
                if let Some(message) = first_message {
                    done = step(&mut logic, &ctx, &notifier, message).await;
                    *snapshot.lock() = logic.snapshot();
                }
            }

            while !done {
                match rx.recv().await {
                    Some(RunnerOp::Deliver(message)) => {
                        done = step(&mut logic, &ctx, &notifier, message).await;
                        *snapshot.lock() = logic.snapshot();
                    }
                    Some(RunnerOp::Abort) | None => {
                        notifier.fail(ProtocolError::Cancelled);
                        done = true;
                    }
                }
            }

            finished.store(true, Ordering::SeqCst);
        });

        runner
    }
}

async fn step(
    logic: &mut Box<dyn Protocol>,
    ctx: &ProtocolContext,
    notifier: &FinishNotifier,
    message: Message,
) -> bool {
    match logic.on_message(ctx, message).await {
        Ok(result) => apply_result(ctx, notifier, result).await,
        Err(err) => {
            notifier.fail(err);
            true
        }
    }
}

async fn apply_result(
    ctx: &ProtocolContext,
    notifier: &FinishNotifier,
    result: ProcessResult,
) -> bool {
    match result {
        ProcessResult::Continue => false,
        ProcessResult::Respond(message) => match ctx.send(message).await {
            Ok(()) => false,
            Err(err) => {
                notifier.fail(err);
                true
            }
        },
        ProcessResult::Complete(completion) => {
            notifier.resolve(completion);
            true
        }
        ProcessResult::Failed(reason) => {
            notifier.fail(ProtocolError::Failed(reason));
            true
        }
    }
}

#[async_trait]
impl ProtocolInstance for ProtocolRunner {
    fn guid(&self) -> Uuid {
        self.guid
    }

    fn kind(&self) -> ProtocolKind {
        self.kind
    }

    fn protocol_type(&self) -> String {
        self.protocol_type.clone()
    }

    fn protocol_id(&self) -> String {
        self.protocol_id.clone()
    }

    fn is_idle(&self) -> bool {
        self.finished.load(Ordering::SeqCst) || self.notifier.is_settled()
    }

    fn notify_finish(&self) -> FinishWaiter {
        self.notifier.waiter()
    }

    fn deliver(&self, message: Message) {
        if self.tx.send(RunnerOp::Deliver(message)).is_err() {
            debug!(guid = %self.guid, "message for finished protocol dropped");
        }
    }

    async fn cleanup(&self) {
        let _ = self.tx.send(RunnerOp::Abort);
        let waiter = self.notifier.waiter();
        if tokio::time::timeout(Duration::from_secs(5), waiter.wait())
            .await
            .is_err()
        {
            warn!(guid = %self.guid, "protocol refused to terminate, abandoning");
        }
    }

    fn agent_snapshot(&self) -> Value {
        self.snapshot.lock().clone()
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    //! Dummy medium shared by the protocol module tests.

    use super::*;

    pub struct DummyMedium {
        pub sent: Mutex<Vec<Message>>,
    }

    impl DummyMedium {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ProtocolMedium for DummyMedium {
        fn agent_address(&self) -> Recipient {
            Recipient::agent("dummy-medium", "lobby")
        }

        fn scheduler(&self) -> Scheduler {
            Scheduler::new()
        }

        async fn post(
            &self,
            _recipients: &[Recipient],
            message: Message,
        ) -> Result<(), ProtocolError> {
            self.sent.lock().push(message);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testkit::DummyMedium;
    use super::*;
    use serde_json::json;

    /// Echoes one inbound message back, then completes on the second.
    struct Echo {
        seen: usize,
    }

    #[async_trait]
    impl Protocol for Echo {
        async fn initiate(
            &mut self,
            _ctx: &ProtocolContext,
        ) -> Result<ProcessResult, ProtocolError> {
            Ok(ProcessResult::Continue)
        }

        async fn on_message(
            &mut self,
            _ctx: &ProtocolContext,
            message: Message,
        ) -> Result<ProcessResult, ProtocolError> {
            self.seen += 1;
            if self.seen == 1 {
                Ok(ProcessResult::Respond(Message::reply(
                    &message,
                    json!({"echo": message.payload}),
                )))
            } else {
                Ok(ProcessResult::Complete(Completion::default()))
            }
        }

        fn snapshot(&self) -> Value {
            json!({"seen": self.seen})
        }
    }

    fn inbound(payload: Value) -> Message {
        Message::new("Request", "echo", payload)
            .with_sender(Recipient::agent("caller", "lobby"))
            .expiring_in(60)
    }

    #[tokio::test]
    async fn runner_drives_protocol_to_completion() {
        let medium = DummyMedium::new();
        let runner = ProtocolRunner::spawn(
            Uuid::new_v4(),
            ProtocolKind::InterestSpawned,
            "Request",
            "echo",
            Box::new(Echo { seen: 0 }),
            medium.clone(),
            None,
        );

        let waiter = runner.notify_finish();
        runner.deliver(inbound(json!({"n": 1})));
        runner.deliver(inbound(json!({"n": 2})));

        waiter.wait().await.unwrap();
        assert!(runner.is_idle());
        assert_eq!(medium.sent.lock().len(), 1);
        assert_eq!(runner.agent_snapshot(), json!({"seen": 2}));
    }

    #[tokio::test]
    async fn cleanup_cancels_a_pending_protocol() {
        let medium = DummyMedium::new();
        let runner = ProtocolRunner::spawn(
            Uuid::new_v4(),
            ProtocolKind::Initiator,
            "Request",
            "echo",
            Box::new(Echo { seen: 0 }),
            medium,
            None,
        );

        let waiter = runner.notify_finish();
        runner.cleanup().await;
        let err = waiter.wait().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Cancelled));
    }

    #[tokio::test]
    async fn first_message_is_processed_before_the_mailbox() {
        let medium = DummyMedium::new();
        let runner = ProtocolRunner::spawn(
            Uuid::new_v4(),
            ProtocolKind::InterestSpawned,
            "Request",
            "echo",
            Box::new(Echo { seen: 0 }),
            medium.clone(),
            Some(inbound(json!({"first": true}))),
        );

        runner.deliver(inbound(json!({"second": true})));
        runner.notify_finish().wait().await.unwrap();

        let sent = medium.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, json!({"echo": {"first": true}}));
    }

    #[tokio::test]
    async fn finish_notifier_first_outcome_wins() {
        let notifier = FinishNotifier::new();
        let waiter = notifier.waiter();
        notifier.resolve(Completion::with_result("done"));
        notifier.fail(ProtocolError::Timeout);

        let completion = waiter.wait().await.unwrap();
        assert_eq!(completion.result, Some(Bytes::from("done")));
    }
}
