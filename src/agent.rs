// agent.rs - Agent-Side Behavior Traits
//
//! The contract between user agent code and its medium.
//!
//! Agents are replayable: every state change goes through `apply_mutation`
//! so the journal can record the mutation sequence, and `snapshot` captures
//! the full state when the journal is compacted. External effects (network,
//! database, clock) happen on the medium, never inside a mutation.

use async_trait::async_trait;
use serde_json::Value;

use crate::agency::{AgencyAgent, AgencyError};
use crate::database::Document;

/// User-defined agent behavior, driven by its `AgencyAgent` medium.
///
/// All hooks default to no-ops so simple agents only implement what they
/// need. Hook failures before `ready` terminate the agent.
#[async_trait]
pub trait Agent: Send + 'static {
    /// Document id of the optional configuration document. A missing
    /// document is logged and ignored.
    fn configuration_doc_id(&self) -> Option<String> {
        None
    }

    /// First agent-side code to run; the medium is fully wired but the
    /// agent is not yet ready.
    async fn initiate_agent(
        &mut self,
        _medium: &AgencyAgent,
        _payload: &Value,
    ) -> Result<(), AgencyError> {
        Ok(())
    }

    /// Runs after initiation, off the caller's stack; completion makes the
    /// agent ready.
    async fn startup_agent(&mut self, _medium: &AgencyAgent) -> Result<(), AgencyError> {
        Ok(())
    }

    /// Gentle shutdown hook; the descriptor is deleted afterwards.
    async fn shutdown_agent(&mut self, _medium: &AgencyAgent) -> Result<(), AgencyError> {
        Ok(())
    }

    /// Hard termination hook; the descriptor survives.
    async fn on_agent_killed(&mut self, _medium: &AgencyAgent) -> Result<(), AgencyError> {
        Ok(())
    }

    async fn on_agent_disconnect(&mut self, _medium: &AgencyAgent) {}

    async fn on_agent_reconnect(&mut self, _medium: &AgencyAgent) {}

    /// The configuration document changed and has been reloaded.
    async fn on_agent_configuration_change(&mut self, _medium: &AgencyAgent, _doc: &Document) {}

    /// Apply one recorded mutation. Must be deterministic: replaying the
    /// journal feeds the same sequence and expects the same results.
    fn apply_mutation(&mut self, function_id: &str, payload: &Value) -> Result<Value, AgencyError>;

    /// Capture the full agent state for snapshotting.
    fn snapshot(&self) -> Value;
}

/// Builds agents of one `document_type`.
pub trait AgentFactory: Send + Sync + 'static {
    fn document_type(&self) -> &str;

    /// Build a fresh agent.
    fn build(&self) -> Box<dyn Agent>;

    /// Rebuild an agent from a snapshot taken by `Agent::snapshot`.
    fn restore(&self, snapshot: &Value) -> Result<Box<dyn Agent>, AgencyError>;
}
