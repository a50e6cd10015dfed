// journal/replay.rs - Deterministic Replay Driver
//
//! Rebuilds an agent's in-memory state from a snapshot plus the ordered
//! entry suffix of its journal stream.
//!
//! Replay never re-executes external effects: an entry's side effects carry
//! their recorded results and are only available for inspection. What is
//! re-executed is the mutation itself, through `Agent::apply_mutation`; a
//! result differing from the recorded one means the agent code is not
//! deterministic and fails the replay.

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::entry::{JournalEntry, SnapshotRecord};
use crate::agent::{Agent, AgentFactory};

/// Recorder id used for agency bookkeeping entries; these carry no agent
/// mutation and are skipped by replay.
pub const AGENCY_RECORDER: &str = "agency";

/// Recorder id used for agent-side mutations.
pub const AGENT_RECORDER: &str = "agent";

/// Replay errors
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Snapshot stream mismatch: expected {expected}, got {actual}")]
    StreamMismatch { expected: String, actual: String },

    #[error("Agent could not be restored: {0}")]
    Restore(String),

    #[error("Mutation {function_id} failed during replay: {reason}")]
    MutationFailed { function_id: String, reason: String },

    #[error(
        "Replay diverged at seq {seq} ({function_id}): expected {expected}, got {actual}"
    )]
    Divergence {
        seq: u64,
        function_id: String,
        expected: Value,
        actual: Value,
    },
}

/// Outcome of a replay run.
pub struct ReplayedAgent {
    pub agent: Box<dyn Agent>,
    /// Entries that carried a mutation and were applied
    pub applied: usize,
    /// Agency bookkeeping entries that were skipped
    pub skipped: usize,
}

impl std::fmt::Debug for ReplayedAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayedAgent")
            .field("applied", &self.applied)
            .field("skipped", &self.skipped)
            .finish_non_exhaustive()
    }
}

/// Replay one stream from its snapshot.
///
/// `entries` must belong to the snapshot's `(agent_id, instance_id)` stream;
/// entries at or below the snapshot's position are expected to have been
/// pruned by the caller.
pub fn replay(
    factory: &dyn AgentFactory,
    snapshot: &SnapshotRecord,
    entries: &[JournalEntry],
) -> Result<ReplayedAgent, ReplayError> {
    let mut agent = factory
        .restore(&snapshot.agent_state)
        .map_err(|e| ReplayError::Restore(e.to_string()))?;

    let mut applied = 0;
    let mut skipped = 0;

    for entry in entries {
        if entry.agent_id != snapshot.agent_id || entry.instance_id != snapshot.instance_id {
            return Err(ReplayError::StreamMismatch {
                expected: format!("{}/{}", snapshot.agent_id, snapshot.instance_id),
                actual: format!("{}/{}", entry.agent_id, entry.instance_id),
            });
        }

        if entry.recorder_id == AGENCY_RECORDER {
            skipped += 1;
            continue;
        }

        let actual = agent
            .apply_mutation(&entry.function_id, &entry.args)
            .map_err(|e| ReplayError::MutationFailed {
                function_id: entry.function_id.clone(),
                reason: e.to_string(),
            })?;

        if actual != entry.result {
            return Err(ReplayError::Divergence {
                seq: entry.seq,
                function_id: entry.function_id.clone(),
                expected: entry.result.clone(),
                actual,
            });
        }
        applied += 1;
    }

    debug!(
        agent_id = %snapshot.agent_id,
        instance_id = snapshot.instance_id,
        applied,
        skipped,
        "replay complete"
    );

    Ok(ReplayedAgent {
        agent,
        applied,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agency::AgencyError;
    use serde_json::json;

    /// Minimal deterministic counter agent.
    struct Counter {
        count: i64,
    }

    #[async_trait::async_trait]
    impl Agent for Counter {
        fn apply_mutation(
            &mut self,
            function_id: &str,
            payload: &Value,
        ) -> Result<Value, AgencyError> {
            match function_id {
                "add" => {
                    let by = payload.get("by").and_then(Value::as_i64).unwrap_or(0);
                    self.count += by;
                    Ok(json!(self.count))
                }
                other => Err(AgencyError::UnknownMutation(other.to_string())),
            }
        }

        fn snapshot(&self) -> Value {
            json!({"count": self.count})
        }
    }

    struct CounterFactory;

    impl AgentFactory for CounterFactory {
        fn document_type(&self) -> &str {
            "counter"
        }

        fn build(&self) -> Box<dyn Agent> {
            Box::new(Counter { count: 0 })
        }

        fn restore(&self, snapshot: &Value) -> Result<Box<dyn Agent>, AgencyError> {
            let count = snapshot.get("count").and_then(Value::as_i64).unwrap_or(0);
            Ok(Box::new(Counter { count }))
        }
    }

    fn entry(seq: u64, by: i64, result: i64) -> JournalEntry {
        JournalEntry {
            agent_id: "counter-1".into(),
            instance_id: 1,
            recorder_id: "agent".into(),
            function_id: "add".into(),
            args: json!({"by": by}),
            kwargs: Value::Null,
            seq,
            fiber_id: None,
            fiber_depth: 0,
            side_effects: vec![],
            result: json!(result),
            timestamp: 0,
        }
    }

    fn snapshot(count: i64) -> SnapshotRecord {
        SnapshotRecord {
            agent_id: "counter-1".into(),
            instance_id: 1,
            agent_state: json!({"count": count}),
            protocols: vec![],
            timestamp: 0,
        }
    }

    #[test]
    fn replay_reconstructs_state() {
        let replayed = replay(
            &CounterFactory,
            &snapshot(10),
            &[entry(1, 5, 15), entry(2, -3, 12)],
        )
        .unwrap();
        assert_eq!(replayed.applied, 2);
        assert_eq!(replayed.agent.snapshot(), json!({"count": 12}));
    }

    #[test]
    fn replay_skips_agency_entries() {
        let mut bookkeeping = entry(1, 0, 0);
        bookkeeping.recorder_id = AGENCY_RECORDER.into();
        bookkeeping.function_id = "agent_created".into();
        bookkeeping.result = Value::Null;

        let replayed = replay(
            &CounterFactory,
            &snapshot(0),
            &[bookkeeping, entry(2, 1, 1)],
        )
        .unwrap();
        assert_eq!(replayed.applied, 1);
        assert_eq!(replayed.skipped, 1);
    }

    #[test]
    fn divergence_is_detected() {
        let err = replay(&CounterFactory, &snapshot(0), &[entry(1, 1, 99)]).unwrap_err();
        assert!(matches!(err, ReplayError::Divergence { seq: 1, .. }));
    }

    #[test]
    fn foreign_stream_is_rejected() {
        let mut foreign = entry(1, 1, 1);
        foreign.instance_id = 9;
        let err = replay(&CounterFactory, &snapshot(0), &[foreign]).unwrap_err();
        assert!(matches!(err, ReplayError::StreamMismatch { .. }));
    }
}
