// observability/tracing_setup.rs - Log Output of the Agency Runtime
//
//! Events in this runtime follow fixed field conventions: agent-scoped
//! events carry `agent_id` (plus `instance_id` where the stream identity
//! matters), protocol events the conversation `guid` and
//! `protocol_type`/`protocol_id`, journal events the `seq` of their stream,
//! descriptor saves the `rev`. The subscriber filter is assembled from
//! per-subsystem levels so an operator can raise protocol chatter without
//! drowning in journal traffic, or the other way around.

use tracing_subscriber::EnvFilter;

/// Per-subsystem log levels, assembled into one `EnvFilter`.
///
/// An explicit `RUST_LOG` in the environment wins over all of this.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Everything outside the runtime
    pub base: String,

    /// Agency container and agent lifecycle (`agency::*`)
    pub agency: String,

    /// Protocol engine: interests, dialogs, reliability wrappers
    pub protocols: String,

    /// Journal keeper and replay
    pub journal: String,

    /// Messaging and database glue
    pub glue: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,

    /// ANSI colors for terminal output
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            base: "info".into(),
            agency: "debug".into(),
            protocols: "info".into(),
            journal: "info".into(),
            glue: "info".into(),
            json: false,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Production: JSON lines, nothing below info, no colors.
    pub fn production() -> Self {
        Self {
            base: "info".into(),
            agency: "info".into(),
            protocols: "info".into(),
            journal: "info".into(),
            glue: "info".into(),
            json: true,
            with_ansi: false,
        }
    }

    /// Everything a conversation touches at trace level; for chasing a
    /// misbehaving dialog across the protocol engine and the glue.
    pub fn tracing_conversations() -> Self {
        Self {
            protocols: "trace".into(),
            glue: "trace".into(),
            ..Self::default()
        }
    }

    /// The filter directive string this configuration denotes.
    pub fn directives(&self) -> String {
        format!(
            "{base},apiary::agency={agency},apiary::protocol={protocols},\
             apiary::journal={journal},apiary::messaging={glue},\
             apiary::database={glue}",
            base = self.base,
            agency = self.agency,
            protocols = self.protocols,
            journal = self.journal,
            glue = self.glue,
        )
    }
}

/// Initialize the tracing subscriber. Call once at process startup.
pub fn init_tracing(config: TracingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.directives()));

    if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_ansi(config.with_ansi)
            .init();
    }

    tracing::info!(
        directives = %config.directives(),
        json = config.json,
        "tracing initialized"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_cover_every_subsystem() {
        let directives = TracingConfig::default().directives();
        assert!(directives.starts_with("info,"));
        assert!(directives.contains("apiary::agency=debug"));
        assert!(directives.contains("apiary::protocol=info"));
        assert!(directives.contains("apiary::journal=info"));
        assert!(directives.contains("apiary::messaging=info"));
        assert!(directives.contains("apiary::database=info"));
    }

    #[test]
    fn production_is_json_without_colors() {
        let config = TracingConfig::production();
        assert!(config.json);
        assert!(!config.with_ansi);
        assert!(!config.directives().contains("debug"));
    }

    #[test]
    fn conversation_preset_raises_protocol_and_glue() {
        let config = TracingConfig::tracing_conversations();
        assert_eq!(config.protocols, "trace");
        assert_eq!(config.glue, "trace");
        assert_eq!(config.agency, "debug");
        assert!(!config.json);
    }
}
