//! # Configuration
//!
//! Runtime configuration loaded from TOML. Every section and field has a
//! default, so an empty document is a valid configuration.
//!
//! ```toml
//! node_id = "node-a"
//!
//! [actor_peer]
//! lease_duration_ms = 3000
//! renew_lease_grace_ms = 1500
//!
//! [actor]
//! action_timeout_ms = 60000
//!
//! [logging]
//! level = "debug"
//! output = "stdout"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Identity of this process in the coordinate topology. Generated when absent.
    pub node_id: Option<String>,
    pub actor_peer: ActorPeerConfig,
    pub relay: RelayRetryConfig,
    pub actor: ActorOptions,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
}

impl RuntimeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.actor_peer.validate()?;
        self.relay.validate()?;
        Ok(())
    }
}

/// Lease timing for the coordinate topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorPeerConfig {
    /// How long a lease is valid after it is written
    pub lease_duration_ms: u64,
    /// The leader renews this long before the lease expires
    pub renew_lease_grace_ms: u64,
    /// Base interval between follower lease checks
    pub check_lease_interval_ms: u64,
    /// Upper bound of the random delay added to each follower check
    pub check_lease_jitter_ms: u64,
    /// How long to wait for the leader to ack a relayed message
    pub message_ack_timeout_ms: u64,
}

impl Default for ActorPeerConfig {
    fn default() -> Self {
        Self {
            lease_duration_ms: 3000,
            renew_lease_grace_ms: 1500,
            check_lease_interval_ms: 1000,
            check_lease_jitter_ms: 500,
            message_ack_timeout_ms: 1000,
        }
    }
}

impl ActorPeerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.renew_lease_grace_ms >= self.lease_duration_ms {
            return Err(ConfigError::Invalid(format!(
                "renew_lease_grace_ms ({}) must be smaller than lease_duration_ms ({})",
                self.renew_lease_grace_ms, self.lease_duration_ms
            )));
        }
        if self.message_ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "message_ack_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    /// Interval between lease renewals while leader.
    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms.saturating_sub(self.renew_lease_grace_ms))
    }

    pub fn check_lease_interval(&self) -> Duration {
        Duration::from_millis(self.check_lease_interval_ms)
    }

    pub fn message_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.message_ack_timeout_ms)
    }
}

/// Retry tuning for messages published to an actor leader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayRetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub min_backoff_ms: u64,
    /// Cap on the delay between retries
    pub max_backoff_ms: u64,
    /// Multiplier applied per retry; 1.0 keeps the backoff fixed
    pub backoff_factor: f64,
    /// Relayed action responses wait `message_ack_timeout * factor`
    pub action_response_timeout_factor: u32,
}

impl Default for RelayRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_backoff_ms: 1000,
            max_backoff_ms: 1000,
            backoff_factor: 1.0,
            action_response_timeout_factor: 10,
        }
    }
}

impl RelayRetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "relay.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid(
                "relay.backoff_factor must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay to wait after the given failed attempt (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = (self.min_backoff_ms as f64) * self.backoff_factor.powi(attempt as i32);
        let delay = delay.min(self.max_backoff_ms.max(self.min_backoff_ms) as f64) as u64;
        Duration::from_millis(delay)
    }
}

/// Per actor execution limits. Actor definitions may override any of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorOptions {
    pub action_timeout_ms: u64,
    pub on_connect_timeout_ms: u64,
    pub create_conn_state_timeout_ms: u64,
    pub max_conn_params_size: usize,
    pub max_incoming_message_size: usize,
}

impl Default for ActorOptions {
    fn default() -> Self {
        Self {
            action_timeout_ms: 60_000,
            on_connect_timeout_ms: 5_000,
            create_conn_state_timeout_ms: 5_000,
            max_conn_params_size: 4_096,
            max_incoming_message_size: 65_536,
        }
    }
}

impl ActorOptions {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn on_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.on_connect_timeout_ms)
    }

    pub fn create_conn_state_timeout(&self) -> Duration {
        Duration::from_millis(self.create_conn_state_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub output: LogOutput,
    pub file_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    File,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Stdout,
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6420,
        }
    }
}
