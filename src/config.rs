//! Configuration for the screen streaming server
//!
//! Everything has a default, so an empty file (or no file at all) is a valid
//! configuration. Command-line flags are applied on top by the binary.

use crate::streaming::multipart::{is_valid_boundary, DEFAULT_BOUNDARY};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub encoder: EncoderConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    /// Only used by the built-in test pattern source; a real capture
    /// facility reports its own geometry.
    #[serde(default)]
    pub capture: CaptureConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_ip")]
    pub bind_ip: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Concurrent viewer cap; unlimited when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sessions: Option<usize>,

    /// How long viewers get to disconnect on shutdown before being cut off
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            port: default_port(),
            max_sessions: None,
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// JPEG quality (1-100)
    #[serde(default = "default_quality")]
    pub quality: u8,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            quality: default_quality(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Multipart boundary token
    #[serde(default = "default_boundary")]
    pub boundary: String,

    /// Longest a viewer waits on the frame slot in one go (milliseconds)
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,

    /// How long a write to a viewer may make no progress before the viewer
    /// is dropped (milliseconds)
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Statistics log interval (seconds); 0 disables it
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            boundary: default_boundary(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

impl StreamConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_fps")]
    pub fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
        }
    }
}

fn default_bind_ip() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_port() -> u16 {
    8080
}
fn default_shutdown_timeout_ms() -> u64 {
    2000
}
fn default_quality() -> u8 {
    55
}
fn default_boundary() -> String {
    DEFAULT_BOUNDARY.to_string()
}
fn default_liveness_timeout_ms() -> u64 {
    100
}
fn default_write_timeout_ms() -> u64 {
    5000
}

fn default_stats_interval() -> u64 {
    10
}
fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    720
}
fn default_fps() -> u32 {
    30
}

impl Config {
    /// Loads configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Loads configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encoder.quality == 0 || self.encoder.quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "encoder.quality must be between 1 and 100, got {}",
                self.encoder.quality
            )));
        }

        if self.server.max_sessions == Some(0) {
            return Err(ConfigError::Invalid(
                "server.max_sessions must be > 0 (omit it for no limit)".to_string(),
            ));
        }

        if self.server.shutdown_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "server.shutdown_timeout_ms must be > 0".to_string(),
            ));
        }

        if !is_valid_boundary(&self.stream.boundary) {
            return Err(ConfigError::Invalid(format!(
                "stream.boundary {:?} is not a valid multipart boundary",
                self.stream.boundary
            )));
        }

        if self.stream.liveness_timeout_ms == 0 || self.stream.liveness_timeout_ms > 10_000 {
            return Err(ConfigError::Invalid(format!(
                "stream.liveness_timeout_ms must be between 1 and 10000, got {}",
                self.stream.liveness_timeout_ms
            )));
        }

        if self.stream.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "stream.write_timeout_ms must be > 0".to_string(),
            ));
        }

        let cap = &self.capture;
        if cap.width == 0 || cap.height == 0 {
            return Err(ConfigError::Invalid(
                "capture: width and height must be > 0".to_string(),
            ));
        }
        if cap.fps == 0 || cap.fps > 120 {
            return Err(ConfigError::Invalid(format!(
                "capture: fps must be between 1 and 120, got {}",
                cap.fps
            )));
        }

        Ok(())
    }

    /// Saves configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
