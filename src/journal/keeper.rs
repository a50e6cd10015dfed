// journal/keeper.rs - Journal Keeper and Write Targets
//
//! The keeper is the single writer of an agency's journal. Entries flow
//! through one FIFO channel into a writer task, so records of one
//! `(agent_id, instance_id)` stream are appended in the order their entries
//! were opened. `EntryBuilder::commit` resolves only after the record is
//! durable on the target.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};
use uuid::Uuid;

use super::entry::{JournalEntry, JournalRecord, LogRecord, SideEffect, SnapshotRecord};

/// Journal errors
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Journal writer stopped")]
    WriterStopped,
}

/// Append-only write target behind the keeper.
#[async_trait]
pub trait JournalTarget: Send + Sync {
    async fn append(&self, record: &JournalRecord) -> Result<(), JournalError>;

    async fn flush(&self) -> Result<(), JournalError>;
}

enum WriterOp {
    Record(
        JournalRecord,
        Option<oneshot::Sender<Result<(), JournalError>>>,
    ),
    Flush(oneshot::Sender<()>),
}

/// The agency's journal connection. Cheap to clone; all clones feed the same
/// writer task.
#[derive(Clone)]
pub struct Journaler {
    tx: mpsc::UnboundedSender<WriterOp>,
    sequences: Arc<Mutex<HashMap<(String, u64), u64>>>,
}

impl Journaler {
    pub fn new(target: Arc<dyn JournalTarget>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    WriterOp::Record(record, ack) => {
                        let result = target.append(&record).await;
                        if let Err(err) = &result {
                            error!(%err, "journal append failed");
                        }
                        if let Some(ack) = ack {
                            let _ = ack.send(result);
                        }
                    }
                    WriterOp::Flush(ack) => {
                        if let Err(err) = target.flush().await {
                            error!(%err, "journal flush failed");
                        }
                        let _ = ack.send(());
                    }
                }
            }
        });
        Self {
            tx,
            sequences: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open a new entry; the per-stream sequence number is assigned here.
    pub fn new_entry(
        &self,
        agent_id: impl Into<String>,
        instance_id: u64,
        recorder_id: impl Into<String>,
        function_id: impl Into<String>,
        args: Value,
        kwargs: Value,
    ) -> EntryBuilder {
        let agent_id = agent_id.into();
        let seq = {
            let mut sequences = self.sequences.lock();
            let counter = sequences.entry((agent_id.clone(), instance_id)).or_insert(0);
            *counter += 1;
            *counter
        };

        EntryBuilder {
            entry: JournalEntry {
                agent_id,
                instance_id,
                recorder_id: recorder_id.into(),
                function_id: function_id.into(),
                args,
                kwargs,
                seq,
                fiber_id: None,
                fiber_depth: 0,
                side_effects: Vec::new(),
                result: Value::Null,
                timestamp: 0,
            },
            tx: self.tx.clone(),
        }
    }

    /// Append a snapshot record and wait for durability.
    pub async fn snapshot(&self, record: SnapshotRecord) -> Result<(), JournalError> {
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(WriterOp::Record(JournalRecord::Snapshot(record), Some(ack)))
            .map_err(|_| JournalError::WriterStopped)?;
        ack_rx.await.map_err(|_| JournalError::WriterStopped)?
    }

    /// Append a log record, fire and forget.
    pub fn log(&self, category: &str, level: &str, message: &str) {
        let record = LogRecord {
            category: category.to_string(),
            level: level.to_string(),
            message: message.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        };
        let _ = self
            .tx
            .send(WriterOp::Record(JournalRecord::Log(record), None));
    }

    /// Wait for everything queued so far to reach the target.
    pub async fn flush(&self) {
        let (ack, ack_rx) = oneshot::channel();
        if self.tx.send(WriterOp::Flush(ack)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Builder for one journal entry.
pub struct EntryBuilder {
    entry: JournalEntry,
    tx: mpsc::UnboundedSender<WriterOp>,
}

impl EntryBuilder {
    pub fn set_fiber_context(&mut self, fiber_id: Uuid, depth: u32) -> &mut Self {
        self.entry.fiber_id = Some(fiber_id);
        self.entry.fiber_depth = depth;
        self
    }

    pub fn add_side_effect(&mut self, effect: SideEffect) -> &mut Self {
        self.entry.side_effects.push(effect);
        self
    }

    pub fn set_result(&mut self, result: Value) -> &mut Self {
        self.entry.result = result;
        self
    }

    pub fn seq(&self) -> u64 {
        self.entry.seq
    }

    /// Commit and wait until the record is durable.
    pub async fn commit(mut self) -> Result<(), JournalError> {
        self.entry.timestamp = Utc::now().timestamp_millis();
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(WriterOp::Record(JournalRecord::Entry(self.entry), Some(ack)))
            .map_err(|_| JournalError::WriterStopped)?;
        ack_rx.await.map_err(|_| JournalError::WriterStopped)?
    }

    /// Commit without waiting; ordering is still fixed at send time.
    pub fn commit_detached(mut self) {
        self.entry.timestamp = Utc::now().timestamp_millis();
        debug!(
            agent_id = %self.entry.agent_id,
            function_id = %self.entry.function_id,
            seq = self.entry.seq,
            "journal entry committed"
        );
        let _ = self
            .tx
            .send(WriterOp::Record(JournalRecord::Entry(self.entry), None));
    }
}

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// In-memory target with read-back, used by tests and replay checks.
#[derive(Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<JournalRecord>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<JournalRecord> {
        self.records.lock().clone()
    }

    /// Entries of one stream, in append order.
    pub fn entries_for(&self, agent_id: &str, instance_id: u64) -> Vec<JournalEntry> {
        self.records
            .lock()
            .iter()
            .filter_map(|record| match record {
                JournalRecord::Entry(entry)
                    if entry.agent_id == agent_id && entry.instance_id == instance_id =>
                {
                    Some(entry.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Latest snapshot of one stream.
    pub fn latest_snapshot(&self, agent_id: &str, instance_id: u64) -> Option<SnapshotRecord> {
        self.records
            .lock()
            .iter()
            .rev()
            .find_map(|record| match record {
                JournalRecord::Snapshot(snap)
                    if snap.agent_id == agent_id && snap.instance_id == instance_id =>
                {
                    Some(snap.clone())
                }
                _ => None,
            })
    }
}

#[async_trait]
impl JournalTarget for MemoryJournal {
    async fn append(&self, record: &JournalRecord) -> Result<(), JournalError> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<(), JournalError> {
        Ok(())
    }
}

/// JSON-lines file target.
pub struct FileJournal {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl FileJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Read every record back from a journal file.
    pub async fn read_all(path: &PathBuf) -> Result<Vec<JournalRecord>, JournalError> {
        let content = tokio::fs::read_to_string(path).await?;
        let mut records = Vec::new();
        for line in content.lines().filter(|line| !line.trim().is_empty()) {
            let record: JournalRecord = serde_json::from_str(line)
                .map_err(|e| JournalError::Serialization(e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }
}

#[async_trait]
impl JournalTarget for FileJournal {
    async fn append(&self, record: &JournalRecord) -> Result<(), JournalError> {
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }

        let mut line = serde_json::to_vec(record)
            .map_err(|e| JournalError::Serialization(e.to_string()))?;
        line.push(b'\n');

        let file = guard.as_mut().ok_or(JournalError::WriterStopped)?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), JournalError> {
        if let Some(file) = self.file.lock().await.as_mut() {
            file.sync_data().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn entries_keep_stream_order() {
        let target = Arc::new(MemoryJournal::new());
        let journaler = Journaler::new(target.clone());

        for n in 0..5 {
            let mut builder = journaler.new_entry(
                "agent-1",
                1,
                "agent",
                format!("step_{n}"),
                json!({"n": n}),
                Value::Null,
            );
            builder.set_result(json!(n));
            builder.commit().await.unwrap();
        }

        let entries = target.entries_for("agent-1", 1);
        assert_eq!(entries.len(), 5);
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn streams_are_independent() {
        let target = Arc::new(MemoryJournal::new());
        let journaler = Journaler::new(target.clone());

        journaler
            .new_entry("agent-1", 1, "agent", "a", Value::Null, Value::Null)
            .commit()
            .await
            .unwrap();
        journaler
            .new_entry("agent-1", 2, "agent", "b", Value::Null, Value::Null)
            .commit()
            .await
            .unwrap();

        assert_eq!(target.entries_for("agent-1", 1)[0].seq, 1);
        assert_eq!(target.entries_for("agent-1", 2)[0].seq, 1);
    }

    #[tokio::test]
    async fn snapshot_is_durable_on_return() {
        let target = Arc::new(MemoryJournal::new());
        let journaler = Journaler::new(target.clone());

        journaler
            .snapshot(SnapshotRecord {
                agent_id: "agent-1".into(),
                instance_id: 1,
                agent_state: json!({"count": 9}),
                protocols: vec![],
                timestamp: 0,
            })
            .await
            .unwrap();

        let snapshot = target.latest_snapshot("agent-1", 1).unwrap();
        assert_eq!(snapshot.agent_state, json!({"count": 9}));
    }

    #[tokio::test]
    async fn file_target_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let target = Arc::new(FileJournal::new(path.clone()));
        let journaler = Journaler::new(target);

        let mut builder =
            journaler.new_entry("agent-1", 1, "agent", "bump", json!({"by": 2}), Value::Null);
        builder.set_result(json!(2));
        builder.commit().await.unwrap();
        journaler.log("agency", "info", "started");
        journaler.flush().await;

        let records = FileJournal::read_all(&path).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0], JournalRecord::Entry(_)));
        assert!(matches!(records[1], JournalRecord::Log(_)));
    }
}
