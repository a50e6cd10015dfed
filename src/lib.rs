// lib.rs - Distributed Autonomous-Agent Runtime
//
// Agencies host long-lived replayable agents that communicate by messaging,
// persist their descriptors to a document database and participate in
// protocols with retrying and periodic reliability wrappers.

#![doc = include_str!("../README.md")]

pub mod agency;
pub mod agent;
pub mod common;
pub mod config;
pub mod database;
pub mod descriptor;
pub mod journal;
pub mod messaging;
pub mod observability;
pub mod protocol;
pub mod serialization;
pub mod time;

// Re-export commonly used types
pub use agency::{
    Agency, AgencyAgent, AgencyAgentState, AgencyError, ShutdownOptions, ShutdownOutcome,
    ShutdownStage, SpawnTarget, StartupConfig, StartupStage, TerminationMode,
    HOST_AGENT_SHARD, HOST_AGENT_TYPE, MIN_ENTRIES_PER_SNAPSHOT,
};

pub use agent::{Agent, AgentFactory};

pub use protocol::{
    Completion, FinishNotifier, FinishWaiter, Interest, InterestFactory, InitiatorFactory,
    PeriodicProtocol, Poster, ProcessResult, Protocol, ProtocolContext, ProtocolDealer,
    ProtocolError, ProtocolInstance, ProtocolKind, ProtocolMedium, ProtocolRunner,
    RetryConfig, RetryingProtocol,
};

pub use database::{
    ChangeCallback, Database, DatabaseError, DatabaseFactory, Document, DocumentChange,
    MemoryDatabase, QueryOptions,
};

pub use messaging::{
    BindingHandle, MemoryMessaging, Message, MessageConsumer, Messaging, MessagingError,
    MessagingFactory, Recipient, RecipientKind, RouteOptions,
};

pub use descriptor::{Allocation, AllocationState, Descriptor, DescriptorError, Partner};

pub use journal::{
    replay, EntryBuilder, FileJournal, JournalEntry, JournalError, JournalRecord,
    JournalTarget, Journaler, MemoryJournal, ReplayError, SideEffect, SnapshotRecord,
};

pub use serialization::{
    AgentRegistry, DescriptorRegistry, SerializationError, Transportable, TypeRegistry,
};

pub use config::{ConfigError, EnvConfig};

pub use observability::{init_tracing, TracingConfig};

pub use time::{CallHandle, Scheduler};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::agency::{
        Agency, AgencyAgent, AgencyAgentState, AgencyError, SpawnTarget, StartupConfig,
    };
    pub use crate::agent::{Agent, AgentFactory};
    pub use crate::database::{Database, DatabaseFactory, Document, MemoryDatabase};
    pub use crate::descriptor::Descriptor;
    pub use crate::messaging::{MemoryMessaging, Message, Messaging, Recipient};
    pub use crate::protocol::{
        Completion, InterestFactory, InitiatorFactory, ProcessResult, Protocol,
        ProtocolContext, ProtocolError, RetryConfig,
    };
    pub use crate::time::Scheduler;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
