use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::agent::{StartupOptions, StartupPolicy};
use crate::agents::DEFAULT_REFUND_THRESHOLD;
use crate::gateway::DEFAULT_RESPONSE_TTL;
use crate::channel::{BrokerConnector, InMemoryConnector, SqliteBrokerOptions, SqliteConnector};
use crate::retry::RetryPolicy;
use crate::session::{
    DEFAULT_SESSION_TTL, InMemorySessionStore, SessionStore, SessionStoreError, SqliteSessionStore,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("switchboard")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Sqlite,
    /// Process-local; only useful when everything runs in one process.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub kind: BackendKind,
    pub path: PathBuf,
    pub poll_interval_ms: u64,
    pub visibility_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Sqlite,
            path: data_dir().join("broker.db"),
            poll_interval_ms: 250,
            visibility_timeout_secs: 300,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub kind: BackendKind,
    pub path: PathBuf,
    pub ttl_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Sqlite,
            path: data_dir().join("sessions.db"),
            ttl_secs: DEFAULT_SESSION_TTL.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub startup: StartupPolicy,
    pub heartbeat_secs: u64,
    pub refund_threshold: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            startup: StartupPolicy::FailFast,
            heartbeat_secs: 60,
            refund_threshold: DEFAULT_REFUND_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: String,
    pub collect_responses: bool,
    /// How long a request stays answerable by `lookup`.
    pub response_ttl_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            collect_responses: true,
            response_ttl_secs: DEFAULT_RESPONSE_TTL.as_secs(),
        }
    }
}

/// Everything a switchboard process needs, loaded from TOML. Every field has
/// a default, so an empty file is a valid config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    pub broker: BrokerConfig,
    pub sessions: SessionsConfig,
    pub agent: AgentConfig,
    pub gateway: GatewayConfig,
}

impl SwitchboardConfig {
    /// Location of the config file used when none is given explicitly.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("switchboard").join("config.toml"))
    }

    /// Reads `path`, or the default location when `path` is `None`. An
    /// explicit path must exist; a missing default file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => {
                    debug!("No config file found, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_toml(&contents).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.clone(),
                source,
            },
            other => other,
        })?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("broker.retry.max_attempts must be at least 1"));
        }
        if self.broker.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("broker.poll_interval_ms must be positive"));
        }
        if self.sessions.ttl_secs == 0 {
            return Err(ConfigError::invalid("sessions.ttl_secs must be positive"));
        }
        if self.gateway.response_ttl_secs == 0 {
            return Err(ConfigError::invalid("gateway.response_ttl_secs must be positive"));
        }
        if !self.agent.refund_threshold.is_finite() || self.agent.refund_threshold < 0.0 {
            return Err(ConfigError::invalid(
                "agent.refund_threshold must be a non-negative number",
            ));
        }
        Ok(())
    }

    pub fn broker_options(&self) -> SqliteBrokerOptions {
        SqliteBrokerOptions {
            path: self.broker.path.clone(),
            poll_interval: Duration::from_millis(self.broker.poll_interval_ms),
            visibility_timeout: Duration::from_secs(self.broker.visibility_timeout_secs),
        }
    }

    /// A connector for the configured broker. Each memory connector owns a
    /// fresh broker, so build it once per process.
    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        match self.broker.kind {
            BackendKind::Sqlite => Arc::new(SqliteConnector::new(self.broker_options())),
            BackendKind::Memory => Arc::new(InMemoryConnector::default()),
        }
    }

    pub fn startup_options(&self) -> StartupOptions {
        StartupOptions {
            retry: self.broker.retry,
            policy: self.agent.startup,
            heartbeat: Duration::from_secs(self.agent.heartbeat_secs),
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.sessions.ttl_secs)
    }

    pub fn response_ttl(&self) -> Duration {
        Duration::from_secs(self.gateway.response_ttl_secs)
    }

    pub async fn open_session_store(&self) -> Result<Arc<dyn SessionStore>, SessionStoreError> {
        Ok(match self.sessions.kind {
            BackendKind::Sqlite => {
                Arc::new(SqliteSessionStore::new(&self.sessions.path, self.session_ttl()).await?)
            }
            BackendKind::Memory => Arc::new(InMemorySessionStore::new(self.session_ttl())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use std::io::Write;

    #[test]
    fn empty_file_yields_defaults() {
        let config = SwitchboardConfig::from_toml("").unwrap();
        assert_eq!(config, SwitchboardConfig::default());
        assert_eq!(config.broker.retry.max_attempts, 5);
        assert_eq!(config.agent.refund_threshold, 100.0);
        assert_eq!(config.gateway.bind, "0.0.0.0:8000");
        assert_eq!(config.session_ttl(), Duration::from_secs(3600));
    }

    #[test]
    fn sections_override_defaults() {
        let config = SwitchboardConfig::from_toml(
            r#"
            [broker]
            kind = "memory"
            poll_interval_ms = 50

            [broker.retry]
            max_attempts = 3

            [broker.retry.backoff]
            kind = "exponential"
            initial = 1.0
            max = 8.0

            [agent]
            startup = "passive"
            refund_threshold = 250.0

            [gateway]
            collect_responses = false
            response_ttl_secs = 600
            "#,
        )
        .unwrap();

        assert_eq!(config.broker.kind, BackendKind::Memory);
        assert_eq!(config.broker_options().poll_interval, Duration::from_millis(50));
        assert_eq!(
            config.broker.retry.backoff,
            Backoff::Exponential {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(8),
            }
        );
        let startup = config.startup_options();
        assert_eq!(startup.policy, StartupPolicy::Passive);
        assert_eq!(startup.retry.max_attempts, 3);
        assert_eq!(config.agent.refund_threshold, 250.0);
        assert!(!config.gateway.collect_responses);
        assert_eq!(config.response_ttl(), Duration::from_secs(600));
        assert_eq!(config.sessions.kind, BackendKind::Sqlite);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = SwitchboardConfig::from_toml("[agent]\nrefund_threshold = -1.0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = SwitchboardConfig::from_toml("[broker.retry]\nmax_attempts = 0").unwrap_err();
        assert!(err.to_string().contains("max_attempts"));

        let err = SwitchboardConfig::from_toml("[broker]\nkind = \"rabbit\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn load_reads_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sessions]\nttl_secs = 120").unwrap();

        let config = SwitchboardConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.session_ttl(), Duration::from_secs(120));

        let missing = SwitchboardConfig::load(Some(Path::new("/definitely/not/here.toml")));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }

    #[tokio::test]
    async fn memory_backends_open_without_files() {
        let config = SwitchboardConfig::from_toml(
            "[broker]\nkind = \"memory\"\n[sessions]\nkind = \"memory\"",
        )
        .unwrap();
        let store = config.open_session_store().await.unwrap();
        assert_eq!(store.ttl(), Duration::from_secs(3600));
        assert!(config.connector().connect().await.is_ok());
    }
}
