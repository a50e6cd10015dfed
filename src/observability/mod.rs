// observability/mod.rs - Tracing and Metrics
//
//! Structured logging and runtime metrics.
//!
//! Tracing is initialized once by the embedding process; the runtime itself
//! only emits through module-level targets. Metrics go through the
//! `metrics` facade, so with no recorder installed every record call is a
//! no-op.

mod metrics;
mod tracing_setup;

pub use metrics::{
    describe_metrics, record_agent_started, record_agent_terminated, record_descriptor_update,
    record_journal_entry, record_journal_snapshot, record_message_expired, record_message_posted,
    record_protocol_finished, record_protocol_initiated, AgentMetrics, JournalMetrics,
    MessageMetrics, ProtocolMetrics,
};

pub use tracing_setup::{init_tracing, TracingConfig};
