//! Link configuration.
//!
//! Layering, lowest precedence first: built-in defaults, TOML file,
//! environment (`GPSLINK_CHANNEL`, `GPSLINK_TRANSPORT`), CLI flags (applied
//! by the binary).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use gpslink_bluez::BinderConfig;
use gpslink_core::Channel;
use gpslink_protocol::DEFAULT_CLIENT_NAME;

use crate::retry::RetryPolicy;

/// Environment variable overriding the starting channel.
pub const ENV_CHANNEL: &str = "GPSLINK_CHANNEL";

/// Environment variable selecting the transport (`socket` or `device`).
pub const ENV_TRANSPORT: &str = "GPSLINK_TRANSPORT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {var}: '{value}' ({reason})")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Transport Kind
// ============================================================================

/// How the link reaches the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// RFCOMM stream socket.
    #[default]
    Socket,
    /// `/dev/rfcommN` bound through the binding facility.
    Device,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Socket => f.write_str("socket"),
            TransportKind::Device => f.write_str("device"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "socket" => Ok(TransportKind::Socket),
            "device" => Ok(TransportKind::Device),
            other => Err(format!("unknown transport '{other}' (expected socket or device)")),
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

fn channel_range(numbers: impl IntoIterator<Item = u16>) -> Vec<Channel> {
    numbers
        .into_iter()
        .filter_map(|n| Channel::new(n).ok())
        .collect()
}

/// Optional greeting sent after each connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    pub enabled: bool,
    pub name: String,
    pub timeout_secs: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: DEFAULT_CLIENT_NAME.to_string(),
            timeout_secs: 5,
        }
    }
}

impl HandshakeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Channel discovery and fallback lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Case-insensitive substrings that mark a service as ours.
    pub keywords: Vec<String>,
    /// Low-numbered channels tried when nothing matches.
    pub default_channels: Vec<Channel>,
    /// Last-resort channels used by some GPS relays.
    pub extended_channels: Vec<Channel>,
    pub timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            keywords: ["spp", "serial", "gps", "location", "nodenav"]
                .iter()
                .map(|k| k.to_string())
                .collect(),
            default_channels: channel_range(1..=5),
            extended_channels: channel_range([17]),
            timeout_secs: 15,
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Bound-device transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinderSettings {
    pub device_dir: PathBuf,
    pub first_slot: u8,
    pub last_slot: u8,
    pub bind_timeout_secs: u64,
    pub release_timeout_secs: u64,
    pub grace_period_ms: u64,
    pub poll_interval_ms: u64,
    pub channel_guesses: Vec<Channel>,
}

impl Default for BinderSettings {
    fn default() -> Self {
        Self {
            device_dir: PathBuf::from("/dev"),
            first_slot: 0,
            last_slot: 9,
            bind_timeout_secs: 5,
            release_timeout_secs: 2,
            grace_period_ms: 1000,
            poll_interval_ms: 100,
            channel_guesses: channel_range(1..=5),
        }
    }
}

impl BinderSettings {
    pub fn bind_timeout(&self) -> Duration {
        Duration::from_secs(self.bind_timeout_secs)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_secs(self.release_timeout_secs)
    }

    pub fn to_binder_config(&self) -> BinderConfig {
        BinderConfig {
            device_dir: self.device_dir.clone(),
            first_slot: self.first_slot,
            last_slot: self.last_slot,
            bind_timeout: self.bind_timeout(),
            grace_period: Duration::from_millis(self.grace_period_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            channel_guesses: self.channel_guesses.clone(),
        }
    }
}

// ============================================================================
// Link Configuration
// ============================================================================

/// Every tunable of the link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Forces the starting channel and skips service discovery.
    pub channel: Option<Channel>,
    pub transport: TransportKind,
    /// Run privileged `rfcomm` commands through `sudo -n`.
    pub use_sudo: bool,
    pub connect_timeout_secs: u64,
    pub read_timeout_ms: u64,
    pub stale_after_secs: u64,
    /// Connect attempts on the primary channel.
    pub max_attempts: u32,
    /// Supervisor reconnect cycles after a stall or lost connection.
    pub max_reconnects: u32,
    pub port_sweep_pause_ms: u64,
    pub read_chunk_bytes: usize,
    /// Longest unterminated line kept before it is dropped.
    pub max_line_bytes: usize,
    /// Records buffered between the supervisor and its consumer.
    pub record_buffer: usize,
    pub handshake: HandshakeConfig,
    pub discovery: DiscoveryConfig,
    pub retry: RetryPolicy,
    pub binder: BinderSettings,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            channel: None,
            transport: TransportKind::Socket,
            use_sudo: true,
            connect_timeout_secs: 10,
            read_timeout_ms: 1000,
            stale_after_secs: 30,
            max_attempts: 3,
            max_reconnects: 3,
            port_sweep_pause_ms: 1000,
            read_chunk_bytes: 1024,
            max_line_bytes: 64 * 1024,
            record_buffer: 64,
            handshake: HandshakeConfig::default(),
            discovery: DiscoveryConfig::default(),
            retry: RetryPolicy::default(),
            binder: BinderSettings::default(),
        }
    }
}

impl LinkConfig {
    /// `$XDG_CONFIG_HOME/gpslink/config.toml` (platform equivalent elsewhere).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("gpslink").join("config.toml"))
    }

    /// Loads `path`, or the default path if it exists, or the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: LinkConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Applies `GPSLINK_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|var| std::env::var(var).ok())
    }

    /// Applies `GPSLINK_*` variables from `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_CHANNEL).filter(|v| !v.trim().is_empty()) {
            let channel = value.parse::<Channel>().map_err(|e| ConfigError::InvalidEnv {
                var: ENV_CHANNEL,
                value: value.clone(),
                reason: e.to_string(),
            })?;
            self.channel = Some(channel);
        }
        if let Some(value) = lookup(ENV_TRANSPORT).filter(|v| !v.trim().is_empty()) {
            self.transport = value
                .parse::<TransportKind>()
                .map_err(|reason| ConfigError::InvalidEnv {
                    var: ENV_TRANSPORT,
                    value: value.clone(),
                    reason,
                })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".to_string()));
        }
        if self.read_chunk_bytes == 0 {
            return Err(ConfigError::Invalid("read_chunk_bytes must be at least 1".to_string()));
        }
        if self.record_buffer == 0 {
            return Err(ConfigError::Invalid("record_buffer must be at least 1".to_string()));
        }
        if self.stale_after_secs == 0 {
            return Err(ConfigError::Invalid("stale_after_secs must be at least 1".to_string()));
        }
        if self.binder.first_slot > self.binder.last_slot {
            return Err(ConfigError::Invalid(format!(
                "binder slot range {}..={} is empty",
                self.binder.first_slot, self.binder.last_slot
            )));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn port_sweep_pause(&self) -> Duration {
        Duration::from_millis(self.port_sweep_pause_ms)
    }
}
