//! Configuration system for pingwatch.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PINGWATCH_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/pingwatch/config.toml
//!   3. ~/.config/pingwatch/config.toml

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::peer::PeerId;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PingwatchConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub probe: ProbeSettings,
    /// Bootstrap peers, probed from the first round on.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<BootstrapPeer>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// This node's id (hex). Empty = derived from host label and listen address.
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP address the ping responder and prober share.
    pub listen_addr: String,
    /// HTTP address serving /metrics and /peers.
    pub metrics_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Peers not successfully probed within this window are expired.
    pub ttl_secs: u64,
    /// How often the expiry sweep runs.
    pub sweep_interval_secs: u64,
    /// Length of one probe round.
    pub round_deadline_ms: u64,
    /// Value of the `host` metric label. Empty = system hostname.
    pub host_label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapPeer {
    pub node_id: String,
    pub addr: String,
}

/// Timing parameters shared by the last-seen registry and the probe scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    pub ttl: Duration,
    pub sweep_interval: Duration,
    pub round_deadline: Duration,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:4001".to_string(),
            metrics_addr: "0.0.0.0:9100".to_string(),
        }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            sweep_interval_secs: 1,
            round_deadline_ms: 1000,
            host_label: String::new(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(1),
            round_deadline: Duration::from_secs(1),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("pingwatch")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("{0} must be greater than zero")]
    InvalidProbeSetting(&'static str),
    #[error("invalid socket address '{0}'")]
    InvalidAddress(String),
    #[error("invalid node id '{0}': {1}")]
    InvalidNodeId(String, crate::peer::PeerIdError),
}

// ── Probe timing ──────────────────────────────────────────────────────────────

impl ProbeConfig {
    /// All three durations must be non-zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl.is_zero() {
            return Err(ConfigError::InvalidProbeSetting("ttl"));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidProbeSetting("sweep_interval"));
        }
        if self.round_deadline.is_zero() {
            return Err(ConfigError::InvalidProbeSetting("round_deadline"));
        }
        Ok(())
    }
}

impl ProbeSettings {
    pub fn probe_config(&self) -> Result<ProbeConfig, ConfigError> {
        let config = ProbeConfig {
            ttl: Duration::from_secs(self.ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            round_deadline: Duration::from_millis(self.round_deadline_ms),
        };
        config.validate()?;
        Ok(config)
    }
}

impl NetworkConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr(&self.listen_addr)
    }

    pub fn metrics_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr(&self.metrics_addr)
    }
}

impl BootstrapPeer {
    pub fn resolve(&self) -> Result<(PeerId, SocketAddr), ConfigError> {
        let id = self
            .node_id
            .parse()
            .map_err(|e| ConfigError::InvalidNodeId(self.node_id.clone(), e))?;
        Ok((id, parse_addr(&self.addr)?))
    }
}

fn parse_addr(s: &str) -> Result<SocketAddr, ConfigError> {
    s.parse()
        .map_err(|_| ConfigError::InvalidAddress(s.to_string()))
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PingwatchConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            PingwatchConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PINGWATCH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&PingwatchConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// This node's identity: the configured id, or one derived from
    /// `host_label` and the listen address.
    pub fn node_id(&self, host_label: &str) -> Result<PeerId, ConfigError> {
        if !self.identity.node_id.is_empty() {
            return self
                .identity
                .node_id
                .parse()
                .map_err(|e| ConfigError::InvalidNodeId(self.identity.node_id.clone(), e));
        }
        let seed = format!("{host_label}/{}", self.network.listen_addr);
        Ok(PeerId::derive(seed.as_bytes()))
    }

    /// Apply PINGWATCH_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PINGWATCH_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Ok(v) = std::env::var("PINGWATCH_NETWORK__METRICS_ADDR") {
            self.network.metrics_addr = v;
        }
        if let Ok(v) = std::env::var("PINGWATCH_PROBE__TTL_SECS") {
            if let Ok(n) = v.parse() {
                self.probe.ttl_secs = n;
            }
        }
        if let Ok(v) = std::env::var("PINGWATCH_PROBE__SWEEP_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.probe.sweep_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("PINGWATCH_PROBE__ROUND_DEADLINE_MS") {
            if let Ok(n) = v.parse() {
                self.probe.round_deadline_ms = n;
            }
        }
        if let Ok(v) = std::env::var("PINGWATCH_PROBE__HOST_LABEL") {
            self.probe.host_label = v;
        }
    }
}
