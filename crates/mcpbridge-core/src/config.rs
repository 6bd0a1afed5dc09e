//! Configuration loading.
//!
//! Turns a TOML file plus environment overrides into a [`BridgeConfig`].
//! `serde`'s `deny_unknown_fields` does the work of rejecting unknown
//! configuration keys.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// One configured MCP server: a command line and environment, with
/// optional `{SESSION_ID}`/`{SERVER_NAME}` placeholders expanded per
/// session when `session_scoped` is set.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub session_scoped: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RawBridgeConfig {
    domain: String,
    subdomain_prefix: String,
    port: u16,
    max_connections: usize,
    health_check_interval_secs: u64,
    operation_timeout_secs: u64,
    session_root: Option<String>,
    bearer_token: Option<String>,
    servers: HashMap<String, ServerConfig>,
}

impl Default for RawBridgeConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            subdomain_prefix: "mcp".to_string(),
            port: 8080,
            max_connections: 100,
            health_check_interval_secs: 30,
            operation_timeout_secs: 300,
            session_root: None,
            bearer_token: None,
            servers: HashMap::new(),
        }
    }
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub domain: String,
    pub subdomain_prefix: String,
    pub port: u16,
    pub max_connections: usize,
    pub health_check_interval: Duration,
    pub operation_timeout: Duration,
    pub session_root: String,
    /// When set, every request to the HTTP surface must carry this exact
    /// bearer token. `None` leaves the bridge unauthenticated,
    /// which is only appropriate behind another access-controlled layer.
    pub bearer_token: Option<String>,
    pub servers: HashMap<String, ServerConfig>,
}

/// Environment variable names recognized by the core.
pub mod env_keys {
    pub const DOMAIN: &str = "MCP_BRIDGE_DOMAIN";
    pub const SUBDOMAIN_PREFIX: &str = "MCP_BRIDGE_SUBDOMAIN_PREFIX";
    pub const PORT: &str = "MCP_BRIDGE_PORT";
    pub const MAX_CONNECTIONS: &str = "MCP_BRIDGE_MAX_CONNECTIONS";
    pub const HEALTH_CHECK_INTERVAL_SECS: &str = "MCP_BRIDGE_HEALTH_CHECK_INTERVAL_SECS";
    pub const OPERATION_TIMEOUT_SECS: &str = "MCP_BRIDGE_OPERATION_TIMEOUT_SECS";
    pub const BEARER_TOKEN: &str = "MCP_BRIDGE_TOKEN";
}

/// Load configuration from a TOML file at `path`, applying environment
/// overrides from `env_lookup` (injected so this stays unit-testable
/// without touching the real process environment).
pub fn load(
    path: &std::path::Path,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<BridgeConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    load_from_str(&text, env_lookup)
}

/// Parse configuration text directly (used by `load` and by tests).
pub fn load_from_str(
    text: &str,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<BridgeConfig, ConfigError> {
    let mut raw: RawBridgeConfig = toml::from_str(text)?;

    if let Some(v) = env_lookup(env_keys::DOMAIN) {
        raw.domain = v;
    }
    if let Some(v) = env_lookup(env_keys::SUBDOMAIN_PREFIX) {
        raw.subdomain_prefix = v;
    }
    if let Some(v) = env_lookup(env_keys::PORT) {
        raw.port = v
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid port override: {v}")))?;
    }
    if let Some(v) = env_lookup(env_keys::MAX_CONNECTIONS) {
        raw.max_connections = v
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid max_connections override: {v}")))?;
    }
    if let Some(v) = env_lookup(env_keys::HEALTH_CHECK_INTERVAL_SECS) {
        raw.health_check_interval_secs = v.parse().map_err(|_| {
            ConfigError::Invalid(format!("invalid health_check_interval override: {v}"))
        })?;
    }
    if let Some(v) = env_lookup(env_keys::OPERATION_TIMEOUT_SECS) {
        raw.operation_timeout_secs = v
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid operation_timeout override: {v}")))?;
    }
    if let Some(v) = env_lookup(env_keys::BEARER_TOKEN) {
        raw.bearer_token = Some(v);
    }

    if raw.domain.is_empty() {
        return Err(ConfigError::Invalid(
            "domain must be set (config file or MCP_BRIDGE_DOMAIN)".into(),
        ));
    }
    if raw.servers.is_empty() {
        return Err(ConfigError::Invalid(
            "at least one [servers.<name>] entry is required".into(),
        ));
    }
    for name in raw.servers.keys() {
        if name.contains('.') || name.contains(':') || name.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "server name '{name}' must be a valid DNS label"
            )));
        }
    }

    Ok(BridgeConfig {
        domain: raw.domain,
        subdomain_prefix: raw.subdomain_prefix,
        port: raw.port,
        max_connections: raw.max_connections,
        health_check_interval: Duration::from_secs(raw.health_check_interval_secs),
        operation_timeout: Duration::from_secs(raw.operation_timeout_secs),
        session_root: raw.session_root.unwrap_or_else(|| "/tmp/mcpbridge-sessions".into()),
        bearer_token: raw.bearer_token,
        servers: raw.servers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn parses_minimal_config() {
        let toml = r#"
            domain = "example.test"

            [servers.echo]
            command = "cat"
        "#;
        let cfg = load_from_str(toml, no_env).unwrap();
        assert_eq!(cfg.domain, "example.test");
        assert_eq!(cfg.subdomain_prefix, "mcp");
        assert!(cfg.servers.contains_key("echo"));
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let toml = r#"
            domain = "example.test"
            bogus_key = true

            [servers.echo]
            command = "cat"
        "#;
        assert!(load_from_str(toml, no_env).is_err());
    }

    #[test]
    fn unknown_server_key_is_rejected() {
        let toml = r#"
            domain = "example.test"

            [servers.echo]
            command = "cat"
            bogus = 1
        "#;
        assert!(load_from_str(toml, no_env).is_err());
    }

    #[test]
    fn missing_domain_is_an_error() {
        let toml = r#"
            [servers.echo]
            command = "cat"
        "#;
        assert!(load_from_str(toml, no_env).is_err());
    }

    #[test]
    fn env_override_wins_over_file_value() {
        let toml = r#"
            domain = "example.test"
            port = 1

            [servers.echo]
            command = "cat"
        "#;
        let cfg = load_from_str(toml, |k| {
            if k == env_keys::PORT {
                Some("9999".into())
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(cfg.port, 9999);
    }

    #[test]
    fn bearer_token_env_override_is_picked_up() {
        let toml = r#"
            domain = "example.test"

            [servers.echo]
            command = "cat"
        "#;
        let cfg = load_from_str(toml, |k| {
            if k == env_keys::BEARER_TOKEN {
                Some("s3cret".into())
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(cfg.bearer_token.as_deref(), Some("s3cret"));
    }
}
