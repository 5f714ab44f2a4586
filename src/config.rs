//! Worker configuration using Figment.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults ([`BackendSettings::default`])
//! 2. A TOML file (default: `config/worker.toml`)
//! 3. Environment variables prefixed with `BEAMLINE_`, nested keys separated
//!    by a double underscore
//!
//! Durations are written in human-readable form (`"250ms"`, `"5s"`).
//!
//! ```text
//! BEAMLINE_WORKER__LOG_LEVEL=debug
//! BEAMLINE_BACKEND__HOST=192.168.1.20
//! BEAMLINE_BACKEND__MESSAGE_REPLY_TIMEOUT=250ms
//! ```
//!
//! # Example
//!
//! ```no_run
//! use beamline_daq::config::WorkerConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = WorkerConfig::load_from("config/worker.toml")?;
//!     println!("Device: {} at {}:{}", config.worker.device, config.backend.host, config.backend.port);
//!     Ok(())
//! }
//! ```

use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default location of the worker configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/worker.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "BEAMLINE_";

/// Timing and sizing parameters of one device backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Device name used in log records
    pub name: String,
    /// Hostname or address of the device (or its serial-to-TCP converter)
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Give up connecting after this long
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Residual input arriving within this window after connecting is discarded
    #[serde(with = "humantime_serde")]
    pub connect_flush: Duration,
    /// Wait this long for a reply before re-sending a message
    #[serde(with = "humantime_serde")]
    pub message_reply_timeout: Duration,
    /// Retransmissions allowed before the link is declared broken
    pub message_max_retries: u32,
    /// Outstanding queries older than this (with auto-query on) kill the link
    #[serde(with = "humantime_serde")]
    pub outstanding_query_fail_timeout: Duration,
    /// Minimum delay between two consecutive sends
    #[serde(with = "humantime_serde")]
    pub min_send_interval: Duration,
    /// Telemetry period once every variable has a value
    #[serde(with = "humantime_serde")]
    pub telemetry_period: Duration,
    /// Telemetry period while variables are still pending
    #[serde(with = "humantime_serde")]
    pub telemetry_pending_period: Duration,
    /// Auto-querier wake-up interval while some variable is overdue
    #[serde(with = "humantime_serde")]
    pub fast_poll_interval: Duration,
    /// How often the inbound command queue is polled
    #[serde(with = "humantime_serde")]
    pub frontend_poll_interval: Duration,
    /// Maximum number of bytes read from the socket at once
    pub read_chunk_size: usize,
    /// Soft limit of the outbound buffer; defaults to the number of variables
    pub outbuffer_capacity: Option<usize>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            name: "device".to_string(),
            host: "localhost".to_string(),
            port: 0,
            connect_timeout: Duration::from_secs(5),
            connect_flush: Duration::from_millis(100),
            message_reply_timeout: Duration::from_secs(1),
            message_max_retries: 10,
            outstanding_query_fail_timeout: Duration::from_secs(5),
            min_send_interval: Duration::ZERO,
            telemetry_period: Duration::from_secs(5),
            telemetry_pending_period: Duration::from_millis(500),
            fast_poll_interval: Duration::from_millis(100),
            frontend_poll_interval: Duration::from_millis(100),
            read_chunk_size: 1024,
            outbuffer_capacity: None,
        }
    }
}

impl BackendSettings {
    /// Settings for a device at `host:port`, everything else default.
    pub fn for_device(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// The reply-timeout policy of the sender.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.message_max_retries,
            reply_timeout: self.message_reply_timeout,
        }
    }

    /// Checks the values that would make the backend misbehave.
    pub fn validate(&self) -> AppResult<()> {
        if self.host.trim().is_empty() {
            return Err(DaqError::Configuration("host must not be empty".into()));
        }
        let nonzero = [
            ("message_reply_timeout", self.message_reply_timeout),
            ("outstanding_query_fail_timeout", self.outstanding_query_fail_timeout),
            ("telemetry_period", self.telemetry_period),
            ("telemetry_pending_period", self.telemetry_pending_period),
            ("fast_poll_interval", self.fast_poll_interval),
            ("frontend_poll_interval", self.frontend_poll_interval),
        ];
        if let Some((key, _)) = nonzero.iter().find(|(_, value)| value.is_zero()) {
            return Err(DaqError::Configuration(format!("{key} must be positive")));
        }
        if self.read_chunk_size == 0 {
            return Err(DaqError::Configuration(
                "read_chunk_size must be positive".into(),
            ));
        }
        if self.outbuffer_capacity == Some(0) {
            return Err(DaqError::Configuration(
                "outbuffer_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Process-level settings of the worker binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Key of the device protocol in the instrument registry
    pub device: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            device: "tpg201".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Top-level worker configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Process settings
    pub worker: WorkerSection,
    /// Backend engine settings
    pub backend: BackendSettings,
}

impl WorkerConfig {
    /// Loads from [`DEFAULT_CONFIG_PATH`]; a missing file means defaults.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads from a TOML file, applies environment overrides and validates.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(WorkerConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validates both sections.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.worker.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'",
                self.worker.log_level
            )));
        }
        self.backend.validate()
    }
}
