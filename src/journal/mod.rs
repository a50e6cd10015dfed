// journal/mod.rs - Journal and Snapshot Engine
//
//! Append-only record of agent-side effects with snapshot points and a
//! deterministic replay driver.
//!
//! # Architecture
//!
//! ```text
//! +--------------+     +------------------+     +------------------+
//! |  Journaler   |---->|  writer task     |---->|  JournalTarget   |
//! |  (keeper)    |     |  (single writer) |     |  (file/memory)   |
//! +--------------+     +------------------+     +------------------+
//!        |
//!        v
//! +--------------+     +------------------+
//! | EntryBuilder |     |  replay driver   |
//! +--------------+     +------------------+
//! ```
//!
//! Committed entries are durable before their results are observed by other
//! agents; snapshots bound the entry suffix a replay has to walk.

pub mod entry;
pub mod keeper;
pub mod replay;

pub use entry::{JournalEntry, JournalRecord, LogRecord, SideEffect, SnapshotRecord};
pub use keeper::{EntryBuilder, FileJournal, JournalError, JournalTarget, Journaler, MemoryJournal};
pub use replay::{replay, ReplayError, ReplayedAgent, AGENCY_RECORDER, AGENT_RECORDER};
