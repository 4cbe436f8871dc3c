//! Service configuration.
//!
//! Loaded from a YAML file (`--config`, default `config.yaml`) with
//! `SFU_`-prefixed environment variable overrides. Every section has
//! sensible defaults; only the Matrix credentials are genuinely required to
//! do anything useful. The access token is redacted in Debug output.

use config::{Config as ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::errors::SfuError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// One of trace, debug, info, warn, error, fatal, panic.
    pub log_level: LogLevel,
    pub matrix: MatrixConfig,
    pub webrtc: WebRtcConfig,
    pub conference: ConferenceConfig,
    /// Accepted for CLI compatibility; profiling is not wired into this
    /// build and the paths are reported as inert at startup.
    pub cpu_profile_path: Option<String>,
    pub mem_profile_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    /// Mapped to `error`; tracing has no fatal level.
    Fatal,
    /// Mapped to `error`; tracing has no panic level.
    Panic,
}

impl LogLevel {
    /// The `tracing_subscriber` filter directive for this level.
    #[must_use]
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Fatal | LogLevel::Panic => "error",
        }
    }
}

/// Credentials and endpoint for the Matrix signaling substrate.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    pub homeserver_url: String,
    pub user_id: String,
    pub device_id: String,
    pub access_token: String,
}

/// Custom Debug that redacts the access token.
impl fmt::Debug for MatrixConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatrixConfig")
            .field("homeserver_url", &self.homeserver_url)
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<IceServerConfig>,
    /// UDP port range for media; zeros mean any ephemeral port.
    pub udp_port_min: u16,
    pub udp_port_max: u16,
    /// Optional DTLS certificate; generated per-process when unset.
    pub dtls_cert_path: Option<String>,
    pub dtls_key_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConferenceConfig {
    /// How often the SFU pings each peer over the data channel.
    pub keepalive_ping_interval_secs: u64,
    /// How long without a pong before a participant is removed.
    pub keepalive_timeout_secs: u64,
    /// Minimum spacing between upstream key frame requests per layer.
    pub send_keyframe_interval_ms: u64,
    /// Bound on each conference's inbound event queue.
    pub max_event_queue_depth: usize,
}

impl Default for ConferenceConfig {
    fn default() -> Self {
        Self {
            keepalive_ping_interval_secs: 10,
            keepalive_timeout_secs: 30,
            send_keyframe_interval_ms: 500,
            max_event_queue_depth: 256,
        }
    }
}

impl ConferenceConfig {
    #[must_use]
    pub fn keepalive_ping_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_ping_interval_secs)
    }

    #[must_use]
    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }

    #[must_use]
    pub fn send_keyframe_interval(&self) -> Duration {
        Duration::from_millis(self.send_keyframe_interval_ms)
    }
}

impl SfuConfig {
    /// Load configuration from a YAML file plus `SFU_*` environment
    /// overrides (e.g. `SFU_MATRIX__ACCESS_TOKEN`).
    pub fn load(path: &Path) -> Result<Self, SfuError> {
        let builder = ConfigBuilder::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("SFU").separator("__"))
            .build()
            .map_err(|e| SfuError::Config(e.to_string()))?;

        let config: SfuConfig = builder
            .try_deserialize()
            .map_err(|e| SfuError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), SfuError> {
        if self.matrix.homeserver_url.is_empty() {
            return Err(SfuError::Config(
                "matrix.homeserver_url must be set".to_owned(),
            ));
        }
        if self.matrix.access_token.is_empty() {
            return Err(SfuError::Config(
                "matrix.access_token must be set".to_owned(),
            ));
        }
        if self.matrix.device_id.is_empty() {
            return Err(SfuError::Config("matrix.device_id must be set".to_owned()));
        }
        if self.webrtc.udp_port_min > self.webrtc.udp_port_max {
            return Err(SfuError::Config(format!(
                "invalid UDP port range {}-{}",
                self.webrtc.udp_port_min, self.webrtc.udp_port_max
            )));
        }
        if self.conference.max_event_queue_depth == 0 {
            return Err(SfuError::Config(
                "conference.max_event_queue_depth must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}
