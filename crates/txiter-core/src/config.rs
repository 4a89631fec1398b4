//! Configuration parsing.
//!
//! One TOML file drives both entry points; the `[iterator]` table configures
//! an iterator process and the `[supervisor]` table the supervisor. Either
//! may be absent when only the other is run.
//!
//! ```toml
//! [iterator]
//! id = "it-eu-1"
//! region = "eu-west"
//! entity = "0xsender"
//! failover_timeout = "2s"
//! http_addr = "0.0.0.0:8080"
//! checkpoint_db = "/var/lib/txiter/checkpoints.db"
//!
//! [iterator.upstream]
//! url = "http://node-eu:9000"
//! method = "getDigests"
//!
//! [iterator.store]
//! writer = "/var/lib/txiter/digests.db"
//!
//! [supervisor]
//! interval = "5s"
//! checkpoint_db = "/var/lib/txiter/checkpoints.db"
//!
//! [[supervisor.iterators]]
//! id = "it-eu-1"
//! url = "http://it-eu-1:8080"
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::BackoffConfig;
use crate::failover::DEFAULT_FAILOVER_TIMEOUT;
use crate::resolution::DEFAULT_MAX_TRACKED;
use crate::role::Role;
use crate::source::PollerConfig;
use crate::supervisor::{CheckpointFloor, SupervisorSettings, TieBreak};
use crate::types::{IteratorId, SeqNum};

/// Configuration errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TxiterConfig {
    /// Iterator process settings.
    #[serde(default)]
    pub iterator: Option<IteratorConfig>,

    /// Supervisor settings.
    #[serde(default)]
    pub supervisor: Option<SupervisorConfig>,
}

impl TxiterConfig {
    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks invariants serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(iterator) = &self.iterator {
            iterator.validate()?;
        }
        if let Some(supervisor) = &self.supervisor {
            supervisor.validate()?;
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation(message.into())
}

fn non_zero(name: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(invalid(format!("{name} must be greater than zero")));
    }
    Ok(())
}

/// Iterator process configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IteratorConfig {
    /// Stable iterator id, shared across restarts.
    pub id: IteratorId,

    /// Deployment region, informational.
    #[serde(default)]
    pub region: String,

    /// Tracked entity (for example a sender address).
    pub entity: String,

    /// Role at startup.
    #[serde(default)]
    pub initial_role: Role,

    /// Failover timeout `X`, tuned per process.
    #[serde(default = "default_failover_timeout", with = "crate::humantime_serde")]
    pub failover_timeout: Duration,

    /// Time between sweeps.
    #[serde(default = "default_sweep_interval", with = "crate::humantime_serde")]
    pub sweep_interval: Duration,

    /// First seq# when no checkpoint exists.
    #[serde(default)]
    pub start_seq: SeqNum,

    /// Address of the status and control HTTP server.
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Checkpoint database read at startup.
    #[serde(default)]
    pub checkpoint_db: Option<PathBuf>,

    /// Buffer between the poller task and the resolver.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Seq#s tracked above the frontier before observations pause.
    #[serde(default = "default_max_tracked")]
    pub max_tracked: usize,

    /// Upstream node.
    pub upstream: UpstreamConfig,

    /// Digest store.
    pub store: StoreConfig,
}

const fn default_failover_timeout() -> Duration {
    DEFAULT_FAILOVER_TIMEOUT
}

const fn default_sweep_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

const fn default_channel_capacity() -> usize {
    1024
}

const fn default_max_tracked() -> usize {
    DEFAULT_MAX_TRACKED
}

impl IteratorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.id.as_str().is_empty() {
            return Err(invalid("iterator.id must not be empty"));
        }
        if self.entity.is_empty() {
            return Err(invalid("iterator.entity must not be empty"));
        }
        if self.initial_role.is_terminating() {
            return Err(invalid("iterator.initial_role cannot be terminating"));
        }
        non_zero("iterator.failover_timeout", self.failover_timeout)?;
        non_zero("iterator.sweep_interval", self.sweep_interval)?;
        if self.channel_capacity == 0 {
            return Err(invalid("iterator.channel_capacity must be greater than zero"));
        }
        if self.max_tracked == 0 {
            return Err(invalid("iterator.max_tracked must be greater than zero"));
        }
        self.upstream.validate()
    }
}

/// How the upstream encodes digests in its answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestEncoding {
    /// Hex string, optional `0x` prefix.
    #[default]
    Hex,
    /// Standard base64.
    Base64,
    /// The string's UTF-8 bytes are the digest.
    Utf8,
}

/// Upstream node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// JSON-RPC endpoint.
    pub url: String,

    /// RPC method returning `[[seq, digest], ...]` for `(entity, start, limit)`.
    #[serde(default = "default_method")]
    pub method: String,

    /// Digests per request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Sleep when nothing new is available.
    #[serde(default = "default_idle_interval", with = "crate::humantime_serde")]
    pub idle_interval: Duration,

    /// Per-request timeout.
    #[serde(default = "default_request_timeout", with = "crate::humantime_serde")]
    pub request_timeout: Duration,

    /// Digest encoding in responses.
    #[serde(default)]
    pub digest_encoding: DigestEncoding,

    /// Retry policy for failed requests.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_method() -> String {
    "getDigests".to_string()
}

const fn default_batch_size() -> usize {
    crate::source::DEFAULT_BATCH_SIZE
}

const fn default_idle_interval() -> Duration {
    crate::source::DEFAULT_IDLE_INTERVAL
}

const fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

impl UpstreamConfig {
    /// Poller settings derived from this upstream.
    #[must_use]
    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            batch_size: self.batch_size,
            idle_interval: self.idle_interval,
            backoff: self.backoff.clone(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(invalid("iterator.upstream.url must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(invalid("iterator.upstream.batch_size must be greater than zero"));
        }
        non_zero("iterator.upstream.request_timeout", self.request_timeout)
    }
}

/// Digest store locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Database every write goes to.
    pub writer: PathBuf,

    /// Optional replica used for support reads. Defaults to `writer`.
    #[serde(default)]
    pub reader: Option<PathBuf>,
}

/// Supervisor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Time between cycles.
    #[serde(default = "default_supervisor_interval", with = "crate::humantime_serde")]
    pub interval: Duration,

    /// Per-iterator status timeout.
    #[serde(default = "default_status_timeout", with = "crate::humantime_serde")]
    pub status_timeout: Duration,

    /// Which concurrent leader survives.
    #[serde(default)]
    pub tie_break: TieBreak,

    /// How checkpoints are derived.
    #[serde(default)]
    pub checkpoint_floor: CheckpointFloor,

    /// Checkpoint database.
    pub checkpoint_db: PathBuf,

    /// Optional Prometheus listener.
    #[serde(default)]
    pub metrics_addr: Option<SocketAddr>,

    /// Supervised iterators.
    #[serde(default)]
    pub iterators: Vec<IteratorEndpoint>,
}

const fn default_supervisor_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_status_timeout() -> Duration {
    Duration::from_secs(1)
}

impl SupervisorConfig {
    /// Loop settings derived from this configuration.
    #[must_use]
    pub const fn settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            interval: self.interval,
            status_timeout: self.status_timeout,
            tie_break: self.tie_break,
            checkpoint_floor: self.checkpoint_floor,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        non_zero("supervisor.interval", self.interval)?;
        non_zero("supervisor.status_timeout", self.status_timeout)?;
        let mut seen = HashSet::new();
        for endpoint in &self.iterators {
            if !seen.insert(&endpoint.id) {
                return Err(invalid(format!(
                    "supervisor.iterators: duplicate id '{}'",
                    endpoint.id
                )));
            }
            if endpoint.url.is_empty() {
                return Err(invalid(format!(
                    "supervisor.iterators: '{}' has no url",
                    endpoint.id
                )));
            }
        }
        Ok(())
    }
}

/// Where the supervisor reaches one iterator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IteratorEndpoint {
    /// Iterator id.
    pub id: IteratorId,
    /// Base URL of the iterator's HTTP server.
    pub url: String,
}
