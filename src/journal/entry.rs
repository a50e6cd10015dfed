// journal/entry.rs - Journal Record Types
//
//! Records written by the journal keeper.
//!
//! An entry captures one replayable agent-side call together with the side
//! effects it performed and the result it produced. Entries of one
//! `(agent_id, instance_id)` stream carry a monotonic sequence number
//! assigned when the entry is opened.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One recorded external effect with its recorded outcome. Replay feeds the
/// recorded result back instead of re-executing the effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideEffect {
    pub function_id: String,
    pub args: Value,
    pub kwargs: Value,
    #[serde(default)]
    pub effects: Vec<SideEffect>,
    pub result: Value,
}

impl SideEffect {
    pub fn new(function_id: impl Into<String>, args: Value, kwargs: Value, result: Value) -> Self {
        Self {
            function_id: function_id.into(),
            args,
            kwargs,
            effects: Vec::new(),
            result,
        }
    }
}

/// One recorded agent-side call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub agent_id: String,
    pub instance_id: u64,

    /// Which recorder produced the entry ("agent", "agency", protocol guid…)
    pub recorder_id: String,

    pub function_id: String,
    pub args: Value,
    pub kwargs: Value,

    /// Per-stream order witness, assigned at `new_entry`
    pub seq: u64,

    pub fiber_id: Option<Uuid>,
    pub fiber_depth: u32,

    #[serde(default)]
    pub side_effects: Vec<SideEffect>,

    pub result: Value,

    /// Wall-clock commit hint, millis since epoch
    pub timestamp: i64,
}

/// A consistent capture of an agent plus its live protocols' agent-side
/// views, bounding replay cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub agent_id: String,
    pub instance_id: u64,
    pub agent_state: Value,
    #[serde(default)]
    pub protocols: Vec<Value>,
    pub timestamp: i64,
}

/// A log line redirected into the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub category: String,
    pub level: String,
    pub message: String,
    pub timestamp: i64,
}

/// Everything the journal writer appends, in one tagged stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalRecord {
    Entry(JournalEntry),
    Snapshot(SnapshotRecord),
    Log(LogRecord),
}
