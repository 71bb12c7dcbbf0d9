//! Plugin server definitions
//!
//! A [`PluginServerDefinition`] identifies one external plugin-runtime
//! endpoint: where its socket lives, which wire protocol it speaks, how to
//! start it and how to ask it what it contains. Definitions are loaded once
//! and never mutated by this crate.
//!
//! ```toml
//! [[plugin_server]]
//! name = "go-plugins"
//! socket = "/usr/local/kong/go-plugins.sock"
//! protocol = "CborRpc:1"
//! start_command = ["/usr/local/bin/go-pluginserver", "-kong-prefix", "/usr/local/kong"]
//! query_command = ["/usr/local/bin/go-pluginserver", "-dump"]
//!
//! [plugin_server.restart]
//! max_restarts = 5
//! initial_backoff_ms = 500
//! ```

use crate::phase::Phase;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Errors found while loading or validating definitions
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Plugin server '{server}': {reason}")]
    Invalid { server: String, reason: String },

    #[error("Duplicate plugin server name: {0}")]
    DuplicateName(String),
}

/// Start/restart behaviour of a supervised plugin server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Crashes tolerated before the server is marked failed
    pub max_restarts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Uptime after which the restart counter is forgiven
    pub stable_after_ms: u64,
    /// How long the socket may take to start accepting
    pub startup_timeout_ms: u64,
    pub query_timeout_ms: u64,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_grace_ms: u64,
    /// Socket health probe period (0 disables probing)
    pub health_interval_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            stable_after_ms: 60_000,
            startup_timeout_ms: 10_000,
            query_timeout_ms: 10_000,
            stop_grace_ms: 5_000,
            health_interval_ms: 10_000,
        }
    }
}

impl RestartPolicy {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.stable_after_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn health_interval(&self) -> Option<Duration> {
        (self.health_interval_ms > 0).then(|| Duration::from_millis(self.health_interval_ms))
    }

    /// Delay before restart attempt `attempt` (1-based), capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_backoff_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::from_millis(millis.min(self.max_backoff_ms as f64) as u64)
    }
}

/// One external plugin-runtime endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginServerDefinition {
    /// Logical name, used in logs and as the registration key
    pub name: String,
    /// Unix socket the server listens on
    pub socket: PathBuf,
    /// Wire protocol identifier; when absent the one reported by the
    /// introspection query is used
    #[serde(default)]
    pub protocol: Option<String>,
    /// Program and arguments; the socket path is appended as last argument
    pub start_command: Vec<String>,
    /// Program and arguments of the one-shot introspection query
    pub query_command: Vec<String>,
    #[serde(default)]
    pub restart: RestartPolicy,
    /// Per-dispatch deadline
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
    /// Phases sent fire-and-forget where the protocol allows it
    #[serde(default)]
    pub notification_phases: Vec<Phase>,
}

fn default_dispatch_timeout_ms() -> u64 {
    60_000
}

impl PluginServerDefinition {
    pub fn new(name: &str, socket: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            socket: socket.into(),
            protocol: None,
            start_command: Vec::new(),
            query_command: Vec::new(),
            restart: RestartPolicy::default(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            notification_phases: Vec::new(),
        }
    }

    pub fn with_protocol(mut self, protocol: &str) -> Self {
        self.protocol = Some(protocol.to_string());
        self
    }

    pub fn with_start_command<S: AsRef<str>>(mut self, command: &[S]) -> Self {
        self.start_command = command.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn with_query_command<S: AsRef<str>>(mut self, command: &[S]) -> Self {
        self.query_command = command.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            server: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.socket.as_os_str().is_empty() {
            return Err(invalid("socket path must not be empty"));
        }
        if self.start_command.is_empty() {
            return Err(invalid("start_command must not be empty"));
        }
        if self.query_command.is_empty() {
            return Err(invalid("query_command must not be empty"));
        }
        if self.dispatch_timeout_ms == 0 {
            return Err(invalid("dispatch_timeout_ms must be positive"));
        }
        if self.restart.backoff_multiplier < 1.0 {
            return Err(invalid("restart.backoff_multiplier must be >= 1.0"));
        }
        Ok(())
    }
}

/// The set of plugin servers configured for a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginServersConfig {
    #[serde(default, rename = "plugin_server")]
    pub servers: Vec<PluginServerDefinition>,
}

impl PluginServersConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_slice(bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !seen.insert(server.name.as_str()) {
                return Err(ConfigError::DuplicateName(server.name.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[plugin_server]]
name = "go-plugins"
socket = "/tmp/go-plugins.sock"
protocol = "CborRpc:1"
start_command = ["/usr/bin/go-pluginserver", "-kong-prefix", "/tmp"]
query_command = ["/usr/bin/go-pluginserver", "-dump"]
notification_phases = ["log"]

[plugin_server.restart]
max_restarts = 3
initial_backoff_ms = 100

[[plugin_server]]
name = "py-plugins"
socket = "/tmp/py-plugins.sock"
start_command = ["/usr/bin/py-pluginserver"]
query_command = ["/usr/bin/py-pluginserver", "--dump-all-plugins"]
"#;

    #[test]
    fn test_parse_toml_definitions() {
        let config = PluginServersConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.servers.len(), 2);

        let go = &config.servers[0];
        assert_eq!(go.protocol.as_deref(), Some("CborRpc:1"));
        assert_eq!(go.restart.max_restarts, 3);
        assert_eq!(go.restart.initial_backoff_ms, 100);
        // Unspecified policy fields keep their defaults
        assert_eq!(go.restart.max_backoff_ms, RestartPolicy::default().max_backoff_ms);
        assert_eq!(go.notification_phases, vec![Phase::Log]);

        let py = &config.servers[1];
        assert_eq!(py.protocol, None);
        assert_eq!(py.dispatch_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let doubled = format!("{}\n{}", SAMPLE, SAMPLE.replace("py-plugins\"", "other\""));
        let err = PluginServersConfig::from_toml_str(&doubled).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName(name) if name == "go-plugins"));
    }

    #[test]
    fn test_empty_start_command_rejected() {
        let def = PluginServerDefinition::new("x", "/tmp/x.sock").with_query_command(&["q"]);
        assert!(matches!(def.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_json_definitions() {
        let json = br#"{"plugin_server":[{"name":"a","socket":"/tmp/a.sock","start_command":["a"],"query_command":["a","--dump"]}]}"#;
        let config = PluginServersConfig::from_json_slice(json).unwrap();
        assert_eq!(config.servers[0].name, "a");
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RestartPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            ..Default::default()
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(800));
        assert_eq!(policy.backoff_for(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_for(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_health_interval_zero_disables() {
        let policy = RestartPolicy {
            health_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(policy.health_interval(), None);
    }
}
