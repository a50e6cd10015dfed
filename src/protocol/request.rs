// protocol/request.rs - Request/Response Dialog
//
//! The request dialog: an initiator asks one or more peers to perform an
//! action; a responder agrees, performs it and reports the result. Both
//! halves are state machines validating every transition.

use std::sync::Arc;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::messaging::{Message, Recipient};
use super::{
    content, envelope, performative, Completion, InterestFactory, InitiatorFactory,
    ProcessResult, Protocol, ProtocolContext, ProtocolError,
};

/// Protocol family of the request dialog.
pub const REQUEST_TYPE: &str = "Request";

const DEFAULT_EXPIRATION_SECS: i64 = 30;

/// Request dialog states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    NotStarted,
    Requested,
    Agreed,
    Completed,
    Refused,
    Failed,
    Cancelled,
}

impl RequestState {
    fn as_str(self) -> &'static str {
        match self {
            RequestState::NotStarted => "not_started",
            RequestState::Requested => "requested",
            RequestState::Agreed => "agreed",
            RequestState::Completed => "completed",
            RequestState::Refused => "refused",
            RequestState::Failed => "failed",
            RequestState::Cancelled => "cancelled",
        }
    }
}

fn invalid(state: RequestState, performative: &str) -> ProtocolError {
    ProtocolError::InvalidTransition {
        from: state.as_str().to_string(),
        to: performative.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Initiator side
// ---------------------------------------------------------------------------

/// Active half: sends the request and tracks the dialog to completion.
pub struct RequestInitiator {
    protocol_id: String,
    recipients: Vec<Recipient>,
    request: Value,
    expiration_secs: i64,
    state: RequestState,
}

impl RequestInitiator {
    pub fn new(protocol_id: impl Into<String>, recipients: Vec<Recipient>, request: Value) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            recipients,
            request,
            expiration_secs: DEFAULT_EXPIRATION_SECS,
            state: RequestState::NotStarted,
        }
    }
}

#[async_trait]
impl Protocol for RequestInitiator {
    async fn initiate(&mut self, ctx: &ProtocolContext) -> Result<ProcessResult, ProtocolError> {
        let message = Message::new(
            REQUEST_TYPE,
            self.protocol_id.clone(),
            envelope("request", self.request.clone()),
        )
        .with_receivers(self.recipients.clone())
        .expiring_in(self.expiration_secs);
        ctx.send(message).await?;
        self.state = RequestState::Requested;
        Ok(ProcessResult::Continue)
    }

    async fn on_message(
        &mut self,
        _ctx: &ProtocolContext,
        message: Message,
    ) -> Result<ProcessResult, ProtocolError> {
        let performative = performative(&message)
            .ok_or_else(|| ProtocolError::ValidationFailed("missing performative".into()))?;

        match (self.state, performative) {
            (RequestState::Requested, "agree") => {
                self.state = RequestState::Agreed;
                Ok(ProcessResult::Continue)
            }
            (RequestState::Requested, "refuse") => {
                self.state = RequestState::Refused;
                Ok(ProcessResult::Failed("request refused".into()))
            }
            (RequestState::Requested | RequestState::Agreed, "inform-result") => {
                self.state = RequestState::Completed;
                let result = content(&message);
                let bytes = serde_json::to_vec(&result)
                    .map_err(|e| ProtocolError::ValidationFailed(e.to_string()))?;
                Ok(ProcessResult::Complete(Completion::with_result(bytes)))
            }
            (RequestState::Requested | RequestState::Agreed, "failure") => {
                self.state = RequestState::Failed;
                Ok(ProcessResult::Failed(format!(
                    "peer reported failure: {}",
                    content(&message)
                )))
            }
            (state, "cancel") => {
                debug!(from = state.as_str(), "request cancelled by peer");
                self.state = RequestState::Cancelled;
                Ok(ProcessResult::Failed("request cancelled".into()))
            }
            (state, other) => Err(invalid(state, other)),
        }
    }

    fn snapshot(&self) -> Value {
        serde_json::json!({
            "protocol_id": self.protocol_id,
            "state": self.state.as_str(),
        })
    }
}

/// Factory for request initiators.
pub struct RequestFactory {
    pub protocol_id: String,
    pub recipients: Vec<Recipient>,
    pub request: Value,
}

impl InitiatorFactory for RequestFactory {
    fn protocol_type(&self) -> &str {
        REQUEST_TYPE
    }

    fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    fn build(&self) -> Box<dyn Protocol> {
        Box::new(RequestInitiator::new(
            self.protocol_id.clone(),
            self.recipients.clone(),
            self.request.clone(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Responder side
// ---------------------------------------------------------------------------

/// What a responder does with an accepted request.
pub trait RequestHandler: Send + 'static {
    /// Perform the requested action; the result travels back as
    /// `inform-result`, an error as `failure`.
    fn handle(&mut self, request: &Value) -> Result<Value, String>;
}

impl<F> RequestHandler for F
where
    F: FnMut(&Value) -> Result<Value, String> + Send + 'static,
{
    fn handle(&mut self, request: &Value) -> Result<Value, String> {
        self(request)
    }
}

/// Passive half, materialized by an interest on the first `request`.
pub struct RequestResponder {
    handler: Box<dyn RequestHandler>,
    state: RequestState,
}

impl RequestResponder {
    pub fn new(handler: Box<dyn RequestHandler>) -> Self {
        Self {
            handler,
            state: RequestState::NotStarted,
        }
    }
}

#[async_trait]
impl Protocol for RequestResponder {
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
            (RequestState::NotStarted, "request") => {
                self.state = RequestState::Requested;
                ctx.send(Message::reply(&message, envelope("agree", Value::Null)))
                    .await?;
                self.state = RequestState::Agreed;

                let request = content(&message);
                match self.handler.handle(&request) {
                    Ok(result) => {
                        ctx.send(Message::reply(&message, envelope("inform-result", result)))
                            .await?;
                        self.state = RequestState::Completed;
                        Ok(ProcessResult::Complete(Completion::default()))
                    }
                    Err(reason) => {
                        ctx.send(Message::reply(
                            &message,
                            envelope("failure", Value::String(reason.clone())),
                        ))
                        .await?;
                        self.state = RequestState::Failed;
                        Ok(ProcessResult::Failed(reason))
                    }
                }
            }
            (state, "cancel") => {
                debug!(from = state.as_str(), "request cancelled by initiator");
                self.state = RequestState::Cancelled;
                Ok(ProcessResult::Failed("request cancelled".into()))
            }
            (state, other) => Err(invalid(state, other)),
        }
    }

    fn snapshot(&self) -> Value {
        serde_json::json!({"state": self.state.as_str()})
    }
}

/// Builds request responders for one protocol id.
pub struct RequestResponderFactory {
    protocol_id: String,
    make_handler: Arc<dyn Fn() -> Box<dyn RequestHandler> + Send + Sync>,
}

impl RequestResponderFactory {
    pub fn new(
        protocol_id: impl Into<String>,
        make_handler: Arc<dyn Fn() -> Box<dyn RequestHandler> + Send + Sync>,
    ) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            make_handler,
        }
    }
}

impl InterestFactory for RequestResponderFactory {
    fn protocol_type(&self) -> &str {
        REQUEST_TYPE
    }

    fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    fn build(&self, _first_message: &Message) -> Box<dyn Protocol> {
        Box::new(RequestResponder::new((self.make_handler)()))
    }
}
