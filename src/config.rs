//! Configuration management for the event service.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the event service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service-level configuration
    #[serde(default)]
    pub service: ServiceSection,

    /// Event storage configuration
    pub storage: StorageConfig,

    /// Queue monitor configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Event processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Event cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Service-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSection {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
}

/// Event storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base directory holding per-camera event trees and the queue directory
    pub base_dir: PathBuf,
}

/// Queue monitor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Seconds between queue directory polls
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Maximum concurrent event processors (0 = half the CPUs, minimum 1)
    #[serde(default)]
    pub max_workers: usize,

    /// Capacity of the finished-event handoff channel
    #[serde(default = "default_handoff_capacity")]
    pub handoff_capacity: usize,
}

/// Event processing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Input framerate assumed for the raw image sequence
    #[serde(default = "default_framerate")]
    pub framerate: u32,

    /// Output video width (height follows the aspect ratio)
    #[serde(default = "default_video_width")]
    pub video_width: u32,

    /// Output video bitrate (ffmpeg syntax, e.g. "2M")
    #[serde(default = "default_video_bitrate")]
    pub video_bitrate: String,

    /// Frame count above which an event is encoded as a timelapse
    #[serde(default = "default_timelapse_threshold")]
    pub timelapse_threshold: usize,

    /// Maximum thumbnail width
    #[serde(default = "default_thumbnail_width")]
    pub thumbnail_width: u32,

    /// Maximum thumbnail height
    #[serde(default = "default_thumbnail_height")]
    pub thumbnail_height: u32,
}

/// Event cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Days an event is retained before becoming eligible for eviction
    #[serde(default = "default_keep_days")]
    pub keep_days: i64,

    /// Minutes between expiration sweeps
    #[serde(default = "default_check_interval_mins")]
    pub check_interval_mins: i64,

    /// Walk the event tree at startup and warm the cache
    #[serde(default = "default_true")]
    pub preload: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_service_name() -> String {
    "camtrap-events".to_string()
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_handoff_capacity() -> usize {
    64
}
fn default_framerate() -> u32 {
    5
}
fn default_video_width() -> u32 {
    1280
}
fn default_video_bitrate() -> String {
    "2M".to_string()
}
fn default_timelapse_threshold() -> usize {
    // Five minutes of frames at the default capture rate
    5 * 60 * 5
}
fn default_thumbnail_width() -> u32 {
    640
}
fn default_thumbnail_height() -> u32 {
    480
}
fn default_keep_days() -> i64 {
    30
}
fn default_check_interval_mins() -> i64 {
    15
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: default_service_name(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_workers: 0,
            handoff_capacity: default_handoff_capacity(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            framerate: default_framerate(),
            video_width: default_video_width(),
            video_bitrate: default_video_bitrate(),
            timelapse_threshold: default_timelapse_threshold(),
            thumbnail_width: default_thumbnail_width(),
            thumbnail_height: default_thumbnail_height(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            keep_days: default_keep_days(),
            check_interval_mins: default_check_interval_mins(),
            preload: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. System config (/etc/camtrap/events.toml)
    /// 3. Environment variables (prefixed with CAMTRAP_)
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("/etc/camtrap/events").required(false))
            // Override with environment variables (e.g. CAMTRAP_STORAGE__BASE_DIR)
            .add_source(
                Environment::with_prefix("CAMTRAP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.storage.base_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.base_dir".to_string(),
            ));
        }

        if self.queue.poll_interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "queue.poll_interval_secs".to_string(),
                message: "Poll interval must be greater than 0".to_string(),
            });
        }

        if self.processing.framerate == 0 || self.processing.video_width == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "processing.framerate/video_width".to_string(),
                message: "Encoding parameters must be greater than 0".to_string(),
            });
        }

        if self.processing.thumbnail_width == 0 || self.processing.thumbnail_height == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "processing.thumbnail_width/height".to_string(),
                message: "Thumbnail dimensions must be greater than 0".to_string(),
            });
        }

        if self.cache.keep_days < 1 {
            return Err(ConfigValidationError::InvalidValue {
                field: "cache.keep_days".to_string(),
                message: "Retention must be at least one day".to_string(),
            });
        }

        if self.cache.check_interval_mins < 1 {
            return Err(ConfigValidationError::InvalidValue {
                field: "cache.check_interval_mins".to_string(),
                message: "Check interval must be at least one minute".to_string(),
            });
        }

        Ok(())
    }
}

impl StorageConfig {
    /// Directory the camera daemon drops queue markers into.
    pub fn queue_dir(&self) -> PathBuf {
        self.base_dir.join("queue")
    }
}

impl QueueConfig {
    /// Get poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Resolve the worker bound: configured value, or half the available
    /// CPUs with a minimum of one.
    pub fn worker_bound(&self) -> usize {
        if self.max_workers > 0 {
            return self.max_workers;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (cpus / 2).max(1)
    }
}

impl CacheConfig {
    /// Get retention window as a chrono Duration.
    pub fn keep_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.keep_days)
    }

    /// Get sweep check interval as a chrono Duration.
    pub fn check_interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.check_interval_mins)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
