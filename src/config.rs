//! Service configuration parsing and validation.

use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::launch::args::ClassLoadingPolicy;
use crate::{AppError, Result};

/// Timeout values (milliseconds) for the bounded network operations.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Time a freshly accepted worker socket has to deliver its handshake.
    #[serde(default = "default_handshake_millis")]
    pub handshake_millis: u64,
    /// Upper bound for dialing a worker's callback address.
    #[serde(default = "default_connect_millis")]
    pub connect_millis: u64,
    /// Upper bound for one blocked write attempt on a connection stream.
    #[serde(default = "default_write_millis")]
    pub write_millis: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_millis: default_handshake_millis(),
            connect_millis: default_connect_millis(),
            write_millis: default_write_millis(),
        }
    }
}

impl TimeoutConfig {
    /// Handshake read deadline.
    #[must_use]
    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_millis)
    }

    /// Connect deadline for outbound control connections.
    #[must_use]
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_millis)
    }

    /// Per-attempt write deadline.
    #[must_use]
    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_millis)
    }
}

fn default_handshake_millis() -> u64 {
    1000
}

fn default_connect_millis() -> u64 {
    5000
}

fn default_write_millis() -> u64 {
    10_000
}

/// Blocking-stream adapter tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StreamConfig {
    /// Initial capacity of each read-ahead buffer; it grows on demand.
    #[serde(default = "default_read_ahead_bytes")]
    pub read_ahead_initial_bytes: usize,
    /// Buffered bytes at which the close watcher stops reading ahead of an
    /// idle consumer.
    #[serde(default = "default_read_ahead_limit")]
    pub read_ahead_limit_bytes: usize,
    /// Register every connection with the shared close watcher.
    #[serde(default = "default_true")]
    pub watch_idle: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            read_ahead_initial_bytes: default_read_ahead_bytes(),
            read_ahead_limit_bytes: default_read_ahead_limit(),
            watch_idle: true,
        }
    }
}

fn default_read_ahead_bytes() -> usize {
    256
}

fn default_read_ahead_limit() -> usize {
    1024 * 1024
}

fn default_true() -> bool {
    true
}

/// Defaults used when rendering worker launch arguments.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LaunchConfig {
    /// Class-loading policy passed to every worker.
    #[serde(default)]
    pub class_loading: ClassLoadingPolicy,
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}

/// Top-level configuration parsed from `tether.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TetherConfig {
    /// Local address handshake listeners bind to (ephemeral port).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Keep the worker's handshake socket as its first control connection
    /// instead of dialing the advertised port.
    #[serde(default)]
    pub reuse_handshake_socket: bool,
    /// Network timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Stream adapter tuning.
    #[serde(default)]
    pub streams: StreamConfig,
    /// Worker launch defaults.
    #[serde(default)]
    pub launch: LaunchConfig,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            reuse_handshake_socket: false,
            timeouts: TimeoutConfig::default(),
            streams: StreamConfig::default(),
            launch: LaunchConfig::default(),
        }
    }
}

impl TetherConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Parsed form of [`bind_address`](Self::bind_address).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the address is not an IP literal.
    pub fn bind_ip(&self) -> Result<IpAddr> {
        self.bind_address
            .parse()
            .map_err(|err| AppError::Config(format!("bind_address invalid: {err}")))
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        self.bind_ip()?;

        if self.timeouts.handshake_millis == 0 {
            return Err(AppError::Config(
                "timeouts.handshake_millis must be greater than zero".into(),
            ));
        }
        if self.timeouts.connect_millis == 0 {
            return Err(AppError::Config(
                "timeouts.connect_millis must be greater than zero".into(),
            ));
        }
        if self.timeouts.write_millis == 0 {
            return Err(AppError::Config(
                "timeouts.write_millis must be greater than zero".into(),
            ));
        }
        if self.streams.read_ahead_initial_bytes == 0 {
            return Err(AppError::Config(
                "streams.read_ahead_initial_bytes must be greater than zero".into(),
            ));
        }
        if self.streams.read_ahead_limit_bytes < self.streams.read_ahead_initial_bytes {
            return Err(AppError::Config(
                "streams.read_ahead_limit_bytes must not be below read_ahead_initial_bytes".into(),
            ));
        }

        Ok(())
    }
}
