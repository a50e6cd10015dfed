// config.rs - Environment Configuration
//
//! Configuration handed to standalone agencies as environment variables of
//! shape `FEAT_<GROUP>_<KEY>`, where the group is the first `_`-separated
//! token and the rest of the name is the key (so
//! `FEAT_AGENCY_FORCE_HOST_RESTART` is `agency.force_host_restart`). The
//! literal value `"None"` denotes an absent setting.

use serde::Deserialize;
use thiserror::Error;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "FEAT";

const GROUPS: [&str; 6] = ["MSG", "DB", "MANHOLE", "AGENCY", "GATEWAY", "TUNNEL"];

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment parse error: {0}")]
    Parse(#[from] config::ConfigError),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MsgSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DbSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ManholeSection {
    pub public_key: Option<String>,
    pub private_key: Option<String>,
    pub authorized_keys: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgencySection {
    pub journal: Option<String>,
    pub socket_path: Option<String>,
    pub rundir: Option<String>,
    pub logdir: Option<String>,
    pub daemonize: Option<bool>,
    pub force_host_restart: Option<bool>,
    pub enable_spawning_slave: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub port: Option<u16>,
    pub p12: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TunnelSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub p12: Option<String>,
    pub allow_tcp: Option<bool>,
}

/// Everything a standalone agency is configured with.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub msg: MsgSection,
    pub db: DbSection,
    pub manhole: ManholeSection,
    pub agency: AgencySection,
    pub gateway: GatewaySection,
    pub tunnel: TunnelSection,
}

impl EnvConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Read the configuration from an explicit variable list.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut builder = config::Config::builder();
        for (name, value) in vars {
            let Some((group, key)) = split_var(&name) else {
                continue;
            };
            if value == "None" {
                continue;
            }
            builder = builder.set_override(
                format!("{}.{}", group.to_lowercase(), key.to_lowercase()),
                normalize(value),
            )?;
        }
        Ok(builder.build()?.try_deserialize()?)
    }
}

/// `FEAT_MSG_HOST` → `("MSG", "HOST")`; anything outside the known groups
/// is ignored.
fn split_var(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix(ENV_PREFIX)?.strip_prefix('_')?;
    let (group, key) = rest.split_once('_')?;
    if !GROUPS.contains(&group) || key.is_empty() {
        return None;
    }
    Some((group, key))
}

/// Python-style booleans show up capitalized.
fn normalize(value: String) -> String {
    match value.as_str() {
        "True" => "true".to_string(),
        "False" => "false".to_string(),
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_grouped_variables() {
        let config = EnvConfig::from_vars(vars(&[
            ("FEAT_MSG_HOST", "broker.example.org"),
            ("FEAT_MSG_PORT", "5672"),
            ("FEAT_DB_NAME", "agents"),
            ("FEAT_AGENCY_FORCE_HOST_RESTART", "True"),
            ("FEAT_AGENCY_JOURNAL", "/var/log/agency.journal"),
            ("FEAT_TUNNEL_ALLOW_TCP", "False"),
        ]))
        .unwrap();

        assert_eq!(config.msg.host.as_deref(), Some("broker.example.org"));
        assert_eq!(config.msg.port, Some(5672));
        assert_eq!(config.db.name.as_deref(), Some("agents"));
        assert_eq!(config.agency.force_host_restart, Some(true));
        assert_eq!(
            config.agency.journal.as_deref(),
            Some("/var/log/agency.journal")
        );
        assert_eq!(config.tunnel.allow_tcp, Some(false));
    }

    #[test]
    fn none_marks_an_absent_value() {
        let config = EnvConfig::from_vars(vars(&[
            ("FEAT_MSG_HOST", "None"),
            ("FEAT_MSG_USER", "guest"),
        ]))
        .unwrap();

        assert_eq!(config.msg.host, None);
        assert_eq!(config.msg.user.as_deref(), Some("guest"));
    }

    #[test]
    fn foreign_variables_are_ignored() {
        let config = EnvConfig::from_vars(vars(&[
            ("PATH", "/usr/bin"),
            ("FEAT_UNKNOWN_KEY", "x"),
            ("FEATURE_MSG_HOST", "x"),
            ("FEAT_GATEWAY_P12", "/etc/agency/gateway.p12"),
        ]))
        .unwrap();

        assert_eq!(config.msg.host, None);
        assert_eq!(config.gateway.p12.as_deref(), Some("/etc/agency/gateway.p12"));
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = EnvConfig::from_vars(Vec::new()).unwrap();
        assert_eq!(config, EnvConfig::default());
    }
}
