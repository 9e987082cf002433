//! Client configuration.
//!
//! Configuration is loaded in layers with the following precedence (lowest to highest):
//! 1. Built-in defaults
//! 2. Environment variables (FJORD_*)
//! 3. TOML configuration file
//! 4. Programmatic overrides
//!
//! Use [`ClientConfig::merge`] to lay a higher layer over a lower one.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use snafu::Snafu;

use crate::constants::DEFAULT_BOOTSTRAP_BROKER;
use crate::constants::DEFAULT_PARTITION_DISCOVERY_INTERVAL_MS;
use crate::constants::DEFAULT_REFRESH_RETRY_DELAY_MS;
use crate::constants::DEFAULT_REQUEST_TIMEOUT_MS;
use crate::constants::DEFAULT_SUBSCRIPTION_BUFFER_SIZE;
use crate::constants::DEFAULT_SUBSCRIPTION_REOPEN_ATTEMPTS;
use crate::constants::DEFAULT_TIMEOUT_SWEEP_INTERVAL_MS;
use crate::constants::DEFAULT_TOPIC;
use crate::constants::DEFAULT_TOPOLOGY_MAX_AGE_MS;
use crate::constants::DEFAULT_TOPOLOGY_REFRESH_TIMEOUT_MS;
use crate::constants::MAX_BOOTSTRAP_BROKERS;
use crate::constants::MAX_SUBSCRIPTION_BUFFER_SIZE;
use crate::types::BrokerAddress;
use crate::types::StartPosition;
use crate::types::TopicName;

/// Configuration of a [`FjordClient`](crate::FjordClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Contact points for topology queries, as `host:port`.
    #[serde(default = "default_bootstrap_brokers")]
    pub bootstrap_brokers: Vec<String>,

    /// Timeout of one topology query, and the budget for resolving a leader.
    #[serde(default = "default_topology_refresh_timeout_ms")]
    pub topology_refresh_timeout_ms: u64,

    /// Timeout of one dispatched command once its leader is known.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Age after which a topology snapshot answers lookups as a miss.
    /// 0 disables expiry.
    #[serde(default = "default_topology_max_age_ms")]
    pub topology_max_age_ms: u64,

    /// Pause between leader-resolution attempts.
    #[serde(default = "default_refresh_retry_delay_ms")]
    pub refresh_retry_delay_ms: u64,

    /// Period of the timeout-detection sweep.
    #[serde(default = "default_timeout_sweep_interval_ms")]
    pub timeout_sweep_interval_ms: u64,

    /// Where new subscriptions start unless they say otherwise.
    #[serde(default)]
    pub subscription_start_position: StartPosition,

    /// Consecutive failed re-opens a partition subscription tolerates.
    #[serde(default = "default_subscription_reopen_attempts")]
    pub subscription_reopen_attempts: u32,

    /// How often an open subscription looks for new partitions.
    #[serde(default = "default_partition_discovery_interval_ms")]
    pub partition_discovery_interval_ms: u64,

    /// Capacity of a subscription's merge channel.
    #[serde(default = "default_subscription_buffer_size")]
    pub subscription_buffer_size: usize,

    /// Topic used by commands built with [`FjordClient::command`](crate::FjordClient::command).
    #[serde(default = "default_topic")]
    pub default_topic: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bootstrap_brokers: default_bootstrap_brokers(),
            topology_refresh_timeout_ms: default_topology_refresh_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            topology_max_age_ms: default_topology_max_age_ms(),
            refresh_retry_delay_ms: default_refresh_retry_delay_ms(),
            timeout_sweep_interval_ms: default_timeout_sweep_interval_ms(),
            subscription_start_position: StartPosition::default(),
            subscription_reopen_attempts: default_subscription_reopen_attempts(),
            partition_discovery_interval_ms: default_partition_discovery_interval_ms(),
            subscription_buffer_size: default_subscription_buffer_size(),
            default_topic: default_topic(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        Self::from_toml_str(&content).map_err(|source| ConfigError::ParseToml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse configuration from TOML text. Missing fields take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load configuration from environment variables.
    ///
    /// Variables follow the pattern FJORD_<FIELD_NAME> (uppercase); lists are
    /// comma-separated. Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let bootstrap_brokers = parse_env_vec("FJORD_BOOTSTRAP_BROKERS");
        Self {
            bootstrap_brokers: if bootstrap_brokers.is_empty() {
                default_bootstrap_brokers()
            } else {
                bootstrap_brokers
            },
            topology_refresh_timeout_ms: parse_env("FJORD_TOPOLOGY_REFRESH_TIMEOUT_MS")
                .unwrap_or_else(default_topology_refresh_timeout_ms),
            request_timeout_ms: parse_env("FJORD_REQUEST_TIMEOUT_MS").unwrap_or_else(default_request_timeout_ms),
            topology_max_age_ms: parse_env("FJORD_TOPOLOGY_MAX_AGE_MS").unwrap_or_else(default_topology_max_age_ms),
            refresh_retry_delay_ms: parse_env("FJORD_REFRESH_RETRY_DELAY_MS")
                .unwrap_or_else(default_refresh_retry_delay_ms),
            timeout_sweep_interval_ms: parse_env("FJORD_TIMEOUT_SWEEP_INTERVAL_MS")
                .unwrap_or_else(default_timeout_sweep_interval_ms),
            subscription_start_position: parse_env("FJORD_SUBSCRIPTION_START_POSITION").unwrap_or_default(),
            subscription_reopen_attempts: parse_env("FJORD_SUBSCRIPTION_REOPEN_ATTEMPTS")
                .unwrap_or_else(default_subscription_reopen_attempts),
            partition_discovery_interval_ms: parse_env("FJORD_PARTITION_DISCOVERY_INTERVAL_MS")
                .unwrap_or_else(default_partition_discovery_interval_ms),
            subscription_buffer_size: parse_env("FJORD_SUBSCRIPTION_BUFFER_SIZE")
                .unwrap_or_else(default_subscription_buffer_size),
            default_topic: parse_env("FJORD_DEFAULT_TOPIC").unwrap_or_else(default_topic),
        }
    }

    /// Merge configuration from a higher-precedence source.
    ///
    /// Fields in `other` that differ from their defaults override fields in `self`.
    pub fn merge(&mut self, other: Self) {
        if other.bootstrap_brokers != default_bootstrap_brokers() {
            self.bootstrap_brokers = other.bootstrap_brokers;
        }
        if other.topology_refresh_timeout_ms != default_topology_refresh_timeout_ms() {
            self.topology_refresh_timeout_ms = other.topology_refresh_timeout_ms;
        }
        if other.request_timeout_ms != default_request_timeout_ms() {
            self.request_timeout_ms = other.request_timeout_ms;
        }
        if other.topology_max_age_ms != default_topology_max_age_ms() {
            self.topology_max_age_ms = other.topology_max_age_ms;
        }
        if other.refresh_retry_delay_ms != default_refresh_retry_delay_ms() {
            self.refresh_retry_delay_ms = other.refresh_retry_delay_ms;
        }
        if other.timeout_sweep_interval_ms != default_timeout_sweep_interval_ms() {
            self.timeout_sweep_interval_ms = other.timeout_sweep_interval_ms;
        }
        if other.subscription_start_position != StartPosition::default() {
            self.subscription_start_position = other.subscription_start_position;
        }
        if other.subscription_reopen_attempts != default_subscription_reopen_attempts() {
            self.subscription_reopen_attempts = other.subscription_reopen_attempts;
        }
        if other.partition_discovery_interval_ms != default_partition_discovery_interval_ms() {
            self.partition_discovery_interval_ms = other.partition_discovery_interval_ms;
        }
        if other.subscription_buffer_size != default_subscription_buffer_size() {
            self.subscription_buffer_size = other.subscription_buffer_size;
        }
        if other.default_topic != default_topic() {
            self.default_topic = other.default_topic;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_brokers.is_empty() {
            return Err(ConfigError::Validation {
                message: "at least one bootstrap broker is required".into(),
            });
        }

        if self.bootstrap_brokers.len() > MAX_BOOTSTRAP_BROKERS {
            return Err(ConfigError::Validation {
                message: format!(
                    "{} bootstrap brokers configured, maximum is {}",
                    self.bootstrap_brokers.len(),
                    MAX_BOOTSTRAP_BROKERS
                ),
            });
        }

        for broker in &self.bootstrap_brokers {
            broker.parse::<BrokerAddress>().map_err(|message| ConfigError::Validation { message })?;
        }

        let non_zero = [
            ("topology_refresh_timeout_ms", self.topology_refresh_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("refresh_retry_delay_ms", self.refresh_retry_delay_ms),
            ("timeout_sweep_interval_ms", self.timeout_sweep_interval_ms),
            ("partition_discovery_interval_ms", self.partition_discovery_interval_ms),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Validation {
                    message: format!("{} must be non-zero", name),
                });
            }
        }

        if self.subscription_reopen_attempts == 0 {
            return Err(ConfigError::Validation {
                message: "subscription_reopen_attempts must be non-zero".into(),
            });
        }

        if self.subscription_buffer_size == 0 || self.subscription_buffer_size > MAX_SUBSCRIPTION_BUFFER_SIZE {
            return Err(ConfigError::Validation {
                message: format!("subscription_buffer_size must be between 1 and {}", MAX_SUBSCRIPTION_BUFFER_SIZE),
            });
        }

        if self.default_topic.is_empty() {
            return Err(ConfigError::Validation {
                message: "default_topic must not be empty".into(),
            });
        }

        Ok(())
    }

    /// Parsed bootstrap brokers. Entries that do not parse are skipped;
    /// [`validate`](Self::validate) reports them.
    pub fn bootstrap_addresses(&self) -> Vec<BrokerAddress> {
        self.bootstrap_brokers.iter().filter_map(|b| b.parse().ok()).collect()
    }

    pub fn topology_refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.topology_refresh_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// `None` when snapshots never expire.
    pub fn topology_max_age(&self) -> Option<Duration> {
        (self.topology_max_age_ms > 0).then(|| Duration::from_millis(self.topology_max_age_ms))
    }

    pub fn refresh_retry_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_retry_delay_ms)
    }

    pub fn timeout_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_sweep_interval_ms)
    }

    pub fn partition_discovery_interval(&self) -> Duration {
        Duration::from_millis(self.partition_discovery_interval_ms)
    }

    pub fn default_topic(&self) -> TopicName {
        TopicName::new(self.default_topic.clone())
    }
}

fn default_bootstrap_brokers() -> Vec<String> {
    vec![DEFAULT_BOOTSTRAP_BROKER.to_string()]
}

fn default_topology_refresh_timeout_ms() -> u64 {
    DEFAULT_TOPOLOGY_REFRESH_TIMEOUT_MS
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_topology_max_age_ms() -> u64 {
    DEFAULT_TOPOLOGY_MAX_AGE_MS
}

fn default_refresh_retry_delay_ms() -> u64 {
    DEFAULT_REFRESH_RETRY_DELAY_MS
}

fn default_timeout_sweep_interval_ms() -> u64 {
    DEFAULT_TIMEOUT_SWEEP_INTERVAL_MS
}

fn default_subscription_reopen_attempts() -> u32 {
    DEFAULT_SUBSCRIPTION_REOPEN_ATTEMPTS
}

fn default_partition_discovery_interval_ms() -> u64 {
    DEFAULT_PARTITION_DISCOVERY_INTERVAL_MS
}

fn default_subscription_buffer_size() -> usize {
    DEFAULT_SUBSCRIPTION_BUFFER_SIZE
}

fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}

// Helper functions for parsing environment variables
fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

fn parse_env_vec(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

/// Configuration loading and validation errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    ReadFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to parse TOML config file {}: {source}", path.display()))]
    ParseToml { path: PathBuf, source: toml::de::Error },

    #[snafu(display("configuration validation failed: {message}"))]
    Validation { message: String },
}
