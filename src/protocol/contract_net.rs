// protocol/contract_net.rs - Contract-Net Dialog
//
//! Task allocation through bidding. The manager announces a task to a set
//! of participants, collects proposals and refusals, awards the best bid
//! and waits for the winner's completion report. Bidders answer the
//! announcement through an interest.

use std::sync::Arc;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::messaging::{Message, Recipient};
use super::{
    content, envelope, performative, Completion, InterestFactory, InitiatorFactory,
    ProcessResult, Protocol, ProtocolContext, ProtocolError,
};

/// Protocol family of the contract-net dialog.
pub const CONTRACT_NET_TYPE: &str = "ContractNet";

const DEFAULT_EXPIRATION_SECS: i64 = 30;

/// Manager-side states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerState {
    NotStarted,
    Announced,
    Awarded,
    Completed,
    Failed,
}

impl ManagerState {
    fn as_str(self) -> &'static str {
        match self {
            ManagerState::NotStarted => "not_started",
            ManagerState::Announced => "announced",
            ManagerState::Awarded => "awarded",
            ManagerState::Completed => "completed",
            ManagerState::Failed => "failed",
        }
    }
}

/// One received proposal.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub bidder: Recipient,
    pub bid: f64,
}

/// Active half: announces the task and awards the best proposal.
pub struct ContractNetManager {
    protocol_id: String,
    participants: Vec<Recipient>,
    task: Value,
    expiration_secs: i64,
    state: ManagerState,
    proposals: Vec<Proposal>,
    refusals: usize,
    winner: Option<Recipient>,
}

impl ContractNetManager {
    pub fn new(
        protocol_id: impl Into<String>,
        participants: Vec<Recipient>,
        task: Value,
    ) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            participants,
            task,
            expiration_secs: DEFAULT_EXPIRATION_SECS,
            state: ManagerState::NotStarted,
            proposals: Vec::new(),
            refusals: 0,
            winner: None,
        }
    }

    fn answers(&self) -> usize {
        self.proposals.len() + self.refusals
    }

    /// Award once every participant has answered: accept the highest bid,
    /// reject the rest.
    async fn award(&mut self, ctx: &ProtocolContext) -> Result<ProcessResult, ProtocolError> {
        let Some(best) = self
            .proposals
            .iter()
            .max_by(|a, b| a.bid.total_cmp(&b.bid))
            .cloned()
        else {
            self.state = ManagerState::Failed;
            return Ok(ProcessResult::Failed("every participant refused".into()));
        };

        for proposal in &self.proposals {
            let verdict = if proposal.bidder == best.bidder {
                "accept-proposal"
            } else {
                "reject-proposal"
            };
            let message = Message::new(
                CONTRACT_NET_TYPE,
                self.protocol_id.clone(),
                envelope(verdict, self.task.clone()),
            )
            .with_receivers(vec![proposal.bidder.clone()])
            .expiring_in(self.expiration_secs);
            ctx.send(message).await?;
        }

        debug!(winner = %best.bidder.key, bid = best.bid, "contract awarded");
        self.winner = Some(best.bidder);
        self.state = ManagerState::Awarded;
        Ok(ProcessResult::Continue)
    }
}

#[async_trait]
impl Protocol for ContractNetManager {
    async fn initiate(&mut self, ctx: &ProtocolContext) -> Result<ProcessResult, ProtocolError> {
        let message = Message::new(
            CONTRACT_NET_TYPE,
            self.protocol_id.clone(),
            envelope("cfp", self.task.clone()),
        )
        .with_receivers(self.participants.clone())
        .expiring_in(self.expiration_secs);
        ctx.send(message).await?;
        self.state = ManagerState::Announced;
        Ok(ProcessResult::Continue)
    }

    async fn on_message(
        &mut self,
        ctx: &ProtocolContext,
        message: Message,
    ) -> Result<ProcessResult, ProtocolError> {
        let performative = performative(&message)
            .ok_or_else(|| ProtocolError::ValidationFailed("missing performative".into()))?;
        let sender = message
            .sender
            .clone()
            .ok_or_else(|| ProtocolError::ValidationFailed("missing sender".into()))?;

        match (self.state, performative) {
            (ManagerState::Announced, "propose") => {
                let bid = content(&message)
                    .get("bid")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| {
                        ProtocolError::ValidationFailed("proposal carries no bid".into())
                    })?;
                self.proposals.push(Proposal {
                    bidder: sender,
                    bid,
                });
                if self.answers() == self.participants.len() {
                    self.award(ctx).await
                } else {
                    Ok(ProcessResult::Continue)
                }
            }
            (ManagerState::Announced, "refuse") => {
                self.refusals += 1;
                if self.answers() == self.participants.len() {
                    self.award(ctx).await
                } else {
                    Ok(ProcessResult::Continue)
                }
            }
            (ManagerState::Awarded, "inform-done") => {
                if self.winner.as_ref() != Some(&sender) {
                    return Err(ProtocolError::ValidationFailed(
                        "completion report from a non-winner".into(),
                    ));
                }
                self.state = ManagerState::Completed;
                let result = content(&message);
                let bytes = serde_json::to_vec(&result)
                    .map_err(|e| ProtocolError::ValidationFailed(e.to_string()))?;
                Ok(ProcessResult::Complete(Completion::with_result(bytes)))
            }
            (ManagerState::Awarded, "failure") => {
                self.state = ManagerState::Failed;
                Ok(ProcessResult::Failed(format!(
                    "contractor failed: {}",
                    content(&message)
                )))
            }
            (state, other) => Err(ProtocolError::InvalidTransition {
                from: state.as_str().to_string(),
                to: other.to_string(),
            }),
        }
    }

    fn snapshot(&self) -> Value {
        json!({
            "protocol_id": self.protocol_id,
            "state": self.state.as_str(),
            "proposals": self.proposals.len(),
            "refusals": self.refusals,
        })
    }
}

/// Factory for contract-net managers.
pub struct ContractNetManagerFactory {
    pub protocol_id: String,
    pub participants: Vec<Recipient>,
    pub task: Value,
}

impl InitiatorFactory for ContractNetManagerFactory {
    fn protocol_type(&self) -> &str {
        CONTRACT_NET_TYPE
    }

    fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    fn build(&self) -> Box<dyn Protocol> {
        Box::new(ContractNetManager::new(
            self.protocol_id.clone(),
            self.participants.clone(),
            self.task.clone(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Bidder side
// ---------------------------------------------------------------------------

/// Bidder-side states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BidderState {
    NotStarted,
    Proposed,
    Completed,
    Failed,
}

impl BidderState {
    fn as_str(self) -> &'static str {
        match self {
            BidderState::NotStarted => "not_started",
            BidderState::Proposed => "proposed",
            BidderState::Completed => "completed",
            BidderState::Failed => "failed",
        }
    }
}

/// Agent-side bidding behavior.
pub trait Bidder: Send + 'static {
    /// Price the announced task; `None` refuses it.
    fn bid(&mut self, task: &Value) -> Option<f64>;

    /// Perform an awarded task.
    fn perform(&mut self, task: &Value) -> Result<Value, String>;
}

/// Passive half, materialized by an interest on the first `cfp`.
pub struct ContractNetBidder {
    bidder: Box<dyn Bidder>,
    state: BidderState,
}

impl ContractNetBidder {
    pub fn new(bidder: Box<dyn Bidder>) -> Self {
        Self {
            bidder,
            state: BidderState::NotStarted,
        }
    }
}

#[async_trait]
impl Protocol for ContractNetBidder {
    async fn initiate(&mut self, _ctx: &ProtocolContext) -> Result<ProcessResult, ProtocolError> {
        Ok(ProcessResult::Continue)
    }

    async fn on_message(
        &mut self,
        ctx: &ProtocolContext,
        message: Message,
    ) -> Result<ProcessResult, ProtocolError> {
        let performative = performative(&message)
            .ok_or_else(|| ProtocolError::ValidationFailed("missing performative".into()))?;

        match (self.state, performative) {
            (BidderState::NotStarted, "cfp") => {
                let task = content(&message);
                match self.bidder.bid(&task) {
                    Some(bid) => {
                        ctx.send(Message::reply(&message, envelope("propose", json!({"bid": bid}))))
                            .await?;
                        self.state = BidderState::Proposed;
                        Ok(ProcessResult::Continue)
                    }
                    None => {
                        ctx.send(Message::reply(&message, envelope("refuse", Value::Null)))
                            .await?;
                        self.state = BidderState::Completed;
                        Ok(ProcessResult::Complete(Completion::default()))
                    }
                }
            }
            (BidderState::Proposed, "accept-proposal") => {
                let task = content(&message);
                match self.bidder.perform(&task) {
                    Ok(result) => {
                        ctx.send(Message::reply(&message, envelope("inform-done", result)))
                            .await?;
                        self.state = BidderState::Completed;
                        Ok(ProcessResult::Complete(Completion::default()))
                    }
                    Err(reason) => {
                        ctx.send(Message::reply(
                            &message,
                            envelope("failure", Value::String(reason.clone())),
                        ))
                        .await?;
                        self.state = BidderState::Failed;
                        Ok(ProcessResult::Failed(reason))
                    }
                }
            }
            (BidderState::Proposed, "reject-proposal") => {
                debug!("proposal rejected");
                self.state = BidderState::Completed;
                Ok(ProcessResult::Complete(Completion::default()))
            }
            (state, other) => Err(ProtocolError::InvalidTransition {
                from: state.as_str().to_string(),
                to: other.to_string(),
            }),
        }
    }

    fn snapshot(&self) -> Value {
        json!({"state": self.state.as_str()})
    }
}

/// Builds contract-net bidders for one protocol id.
pub struct ContractNetBidderFactory {
    protocol_id: String,
    make_bidder: Arc<dyn Fn() -> Box<dyn Bidder> + Send + Sync>,
}

impl ContractNetBidderFactory {
    pub fn new(
        protocol_id: impl Into<String>,
        make_bidder: Arc<dyn Fn() -> Box<dyn Bidder> + Send + Sync>,
    ) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            make_bidder,
        }
    }
}

impl InterestFactory for ContractNetBidderFactory {
    fn protocol_type(&self) -> &str {
        CONTRACT_NET_TYPE
    }

    fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    fn build(&self, _first_message: &Message) -> Box<dyn Protocol> {
        Box::new(ContractNetBidder::new((self.make_bidder)()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testkit::DummyMedium;
    use uuid::Uuid;

    fn ctx(medium: Arc<DummyMedium>) -> ProtocolContext {
        ProtocolContext {
            guid: Uuid::new_v4(),
            medium,
        }
    }

    fn answer(from: &str, performative_tag: &str, payload: Value) -> Message {
        Message::new(CONTRACT_NET_TYPE, "haul", envelope(performative_tag, payload))
            .with_sender(Recipient::agent(from, "lobby"))
            .expiring_in(30)
    }

    #[tokio::test]
    async fn manager_awards_the_best_bid() {
        let medium = DummyMedium::new();
        let ctx = ctx(medium.clone());
        let participants = vec![
            Recipient::agent("truck-1", "lobby"),
            Recipient::agent("truck-2", "lobby"),
            Recipient::agent("truck-3", "lobby"),
        ];
        let mut manager =
            ContractNetManager::new("haul", participants, json!({"tons": 12}));

        manager.initiate(&ctx).await.unwrap();
        assert_eq!(performative(&medium.sent.lock()[0]), Some("cfp"));

        manager
            .on_message(&ctx, answer("truck-1", "propose", json!({"bid": 3.0})))
            .await
            .unwrap();
        manager
            .on_message(&ctx, answer("truck-2", "refuse", Value::Null))
            .await
            .unwrap();
        let result = manager
            .on_message(&ctx, answer("truck-3", "propose", json!({"bid": 7.5})))
            .await
            .unwrap();
        assert!(matches!(result, ProcessResult::Continue));

        // cfp + one accept + one reject went out.
        {
            let sent = medium.sent.lock();
            assert_eq!(sent.len(), 3);
            let accept = sent
                .iter()
                .find(|m| performative(m) == Some("accept-proposal"))
                .unwrap();
            assert_eq!(accept.receivers[0].key, "truck-3");
            let reject = sent
                .iter()
                .find(|m| performative(m) == Some("reject-proposal"))
                .unwrap();
            assert_eq!(reject.receivers[0].key, "truck-1");
        }

        let result = manager
            .on_message(&ctx, answer("truck-3", "inform-done", json!({"hauled": 12})))
            .await
            .unwrap();
        assert!(matches!(result, ProcessResult::Complete(_)));
    }

    #[tokio::test]
    async fn manager_fails_when_everyone_refuses() {
        let medium = DummyMedium::new();
        let ctx = ctx(medium);
        let participants = vec![Recipient::agent("truck-1", "lobby")];
        let mut manager = ContractNetManager::new("haul", participants, json!({}));

        manager.initiate(&ctx).await.unwrap();
        let result = manager
            .on_message(&ctx, answer("truck-1", "refuse", Value::Null))
            .await
            .unwrap();
        assert!(matches!(result, ProcessResult::Failed(_)));
    }

    #[tokio::test]
    async fn manager_ignores_reports_from_non_winners() {
        let medium = DummyMedium::new();
        let ctx = ctx(medium);
        let participants = vec![
            Recipient::agent("truck-1", "lobby"),
            Recipient::agent("truck-2", "lobby"),
        ];
        let mut manager = ContractNetManager::new("haul", participants, json!({}));
        manager.initiate(&ctx).await.unwrap();

        manager
            .on_message(&ctx, answer("truck-1", "propose", json!({"bid": 1.0})))
            .await
            .unwrap();
        manager
            .on_message(&ctx, answer("truck-2", "propose", json!({"bid": 2.0})))
            .await
            .unwrap();

        let err = manager
            .on_message(&ctx, answer("truck-1", "inform-done", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ValidationFailed(_)));
    }

    struct EagerBidder;

    impl Bidder for EagerBidder {
        fn bid(&mut self, task: &Value) -> Option<f64> {
            task.get("tons").and_then(Value::as_f64)
        }

        fn perform(&mut self, _task: &Value) -> Result<Value, String> {
            Ok(json!({"done": true}))
        }
    }

    #[tokio::test]
    async fn bidder_proposes_and_performs() {
        let medium = DummyMedium::new();
        let ctx = ctx(medium.clone());
        let mut bidder = ContractNetBidder::new(Box::new(EagerBidder));

        bidder.initiate(&ctx).await.unwrap();
        let result = bidder
            .on_message(&ctx, answer("manager", "cfp", json!({"tons": 12})))
            .await
            .unwrap();
        assert!(matches!(result, ProcessResult::Continue));

        let result = bidder
            .on_message(&ctx, answer("manager", "accept-proposal", json!({"tons": 12})))
            .await
            .unwrap();
        assert!(matches!(result, ProcessResult::Complete(_)));

        let sent = medium.sent.lock();
        assert_eq!(performative(&sent[0]), Some("propose"));
        assert_eq!(content(&sent[0]), json!({"bid": 12.0}));
        assert_eq!(performative(&sent[1]), Some("inform-done"));
    }

    #[tokio::test]
    async fn bidder_refusal_ends_the_conversation() {
        struct Refuser;
        impl Bidder for Refuser {
            fn bid(&mut self, _task: &Value) -> Option<f64> {
                None
            }
            fn perform(&mut self, _task: &Value) -> Result<Value, String> {
                Err("never awarded".into())
            }
        }

        let medium = DummyMedium::new();
        let ctx = ctx(medium.clone());
        let mut bidder = ContractNetBidder::new(Box::new(Refuser));

        bidder.initiate(&ctx).await.unwrap();
        let result = bidder
            .on_message(&ctx, answer("manager", "cfp", json!({})))
            .await
            .unwrap();
        assert!(matches!(result, ProcessResult::Complete(_)));
        assert_eq!(performative(&medium.sent.lock()[0]), Some("refuse"));
    }
}
