// observability/metrics.rs - Runtime Metrics

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Agent lifecycle metrics
pub struct AgentMetrics;

impl AgentMetrics {
    pub const STARTED_TOTAL: &'static str = "apiary_agents_started_total";
    pub const TERMINATED_TOTAL: &'static str = "apiary_agents_terminated_total";
    pub const ACTIVE: &'static str = "apiary_agents_active";
}

/// Protocol engine metrics
pub struct ProtocolMetrics;

impl ProtocolMetrics {
    pub const INITIATED_TOTAL: &'static str = "apiary_protocols_initiated_total";
    pub const FINISHED_TOTAL: &'static str = "apiary_protocols_finished_total";
    pub const DURATION_SECONDS: &'static str = "apiary_protocol_duration_seconds";
}

/// Messaging metrics
pub struct MessageMetrics;

impl MessageMetrics {
    pub const POSTED_TOTAL: &'static str = "apiary_messages_posted_total";
    pub const EXPIRED_TOTAL: &'static str = "apiary_messages_expired_total";
}

/// Journal and descriptor metrics
pub struct JournalMetrics;

impl JournalMetrics {
    pub const ENTRIES_TOTAL: &'static str = "apiary_journal_entries_total";
    pub const SNAPSHOTS_TOTAL: &'static str = "apiary_journal_snapshots_total";
    pub const DESCRIPTOR_UPDATES_TOTAL: &'static str = "apiary_descriptor_updates_total";
}

/// Register metric descriptions with the installed recorder.
///
/// The crate only speaks the `metrics` facade; installing a recorder and
/// exposing it is left to the embedding process.
pub fn describe_metrics() {
    describe_counter!(AgentMetrics::STARTED_TOTAL, "Total number of agents started");
    describe_counter!(
        AgentMetrics::TERMINATED_TOTAL,
        "Total number of agents terminated"
    );
    describe_gauge!(AgentMetrics::ACTIVE, "Current number of live agents");

    describe_counter!(
        ProtocolMetrics::INITIATED_TOTAL,
        "Total number of protocol instances initiated"
    );
    describe_counter!(
        ProtocolMetrics::FINISHED_TOTAL,
        "Total number of protocol instances finished"
    );
    describe_histogram!(
        ProtocolMetrics::DURATION_SECONDS,
        "Protocol lifetime in seconds"
    );

    describe_counter!(MessageMetrics::POSTED_TOTAL, "Total number of messages posted");
    describe_counter!(
        MessageMetrics::EXPIRED_TOTAL,
        "Total number of messages dropped as expired"
    );

    describe_counter!(
        JournalMetrics::ENTRIES_TOTAL,
        "Total number of journal entries committed"
    );
    describe_counter!(
        JournalMetrics::SNAPSHOTS_TOTAL,
        "Total number of journal snapshots emitted"
    );
    describe_counter!(
        JournalMetrics::DESCRIPTOR_UPDATES_TOTAL,
        "Total number of descriptor updates applied"
    );
}

// Recording functions

pub fn record_agent_started(agent_type: &str) {
    counter!(AgentMetrics::STARTED_TOTAL, "agent_type" => agent_type.to_string()).increment(1);
    gauge!(AgentMetrics::ACTIVE, "agent_type" => agent_type.to_string()).increment(1.0);
}

pub fn record_agent_terminated(agent_type: &str, mode: &str) {
    counter!(
        AgentMetrics::TERMINATED_TOTAL,
        "agent_type" => agent_type.to_string(),
        "mode" => mode.to_string()
    )
    .increment(1);
    gauge!(AgentMetrics::ACTIVE, "agent_type" => agent_type.to_string()).decrement(1.0);
}

pub fn record_protocol_initiated(protocol_type: &str, kind: &str) {
    counter!(
        ProtocolMetrics::INITIATED_TOTAL,
        "protocol_type" => protocol_type.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn record_protocol_finished(protocol_type: &str, duration: Duration, failed: bool) {
    counter!(
        ProtocolMetrics::FINISHED_TOTAL,
        "protocol_type" => protocol_type.to_string(),
        "failed" => failed.to_string()
    )
    .increment(1);
    histogram!(
        ProtocolMetrics::DURATION_SECONDS,
        "protocol_type" => protocol_type.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_message_posted(protocol_type: &str) {
    counter!(
        MessageMetrics::POSTED_TOTAL,
        "protocol_type" => protocol_type.to_string()
    )
    .increment(1);
}

pub fn record_message_expired(protocol_type: &str) {
    counter!(
        MessageMetrics::EXPIRED_TOTAL,
        "protocol_type" => protocol_type.to_string()
    )
    .increment(1);
}

pub fn record_journal_entry(recorder: &str) {
    counter!(JournalMetrics::ENTRIES_TOTAL, "recorder" => recorder.to_string()).increment(1);
}

pub fn record_journal_snapshot(agent_type: &str) {
    counter!(
        JournalMetrics::SNAPSHOTS_TOTAL,
        "agent_type" => agent_type.to_string()
    )
    .increment(1);
}

pub fn record_descriptor_update(agent_type: &str, outcome: &str) {
    counter!(
        JournalMetrics::DESCRIPTOR_UPDATES_TOTAL,
        "agent_type" => agent_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        assert!(AgentMetrics::STARTED_TOTAL.starts_with("apiary_"));
        assert!(ProtocolMetrics::INITIATED_TOTAL.starts_with("apiary_"));
        assert!(JournalMetrics::ENTRIES_TOTAL.starts_with("apiary_"));
    }

    #[test]
    fn test_recording_without_a_recorder_is_a_noop() {
        record_agent_started("worker");
        record_agent_terminated("worker", "gentle");
        record_protocol_finished("Request", Duration::from_millis(5), false);
    }
}
