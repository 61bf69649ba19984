//! # Pipeline Configuration
//!
//! Every tunable of the submission pipeline lives here as an explicit value
//! instead of a hard-coded constant. The structures are serializable so a
//! renderer can be configured from a TOML or RON file.
//!
//! ## Configuration Categories
//!
//! - **Frame pacing**: frames in flight, which governs deferred resource release
//! - **GPU timing**: size of the timestamp query ring used by every GPU timer
//! - **Threading**: whether a dedicated render thread drains the queue
//! - **Diagnostics**: message pump cadence, severity filter, break-on-error
//! - **Logging**: default log level

use serde::{Deserialize, Serialize};

use crate::diagnostics::SeverityFilter;

/// Configuration trait
///
/// Implemented by every top-level configuration structure. The file format is
/// picked from the extension: `.toml` or `.ron`.
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;

        if path.ends_with(".toml") {
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else if path.ends_with(".ron") {
            ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            Err(ConfigError::UnsupportedFormat(path.to_string()))
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = if path.ends_with(".toml") {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else if path.ends_with(".ron") {
            ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.to_string()));
        };

        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Where render commands are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ThreadingPolicy {
    /// A dedicated render thread drains the queue once per frame
    #[default]
    MultiThreaded,
    /// The thread that created the renderer drains the queue inline
    SingleThreaded,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter, e.g. `"info"` or `"render_pipeline=debug"`.
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// # Renderer Configuration
///
/// Configuration for the submission pipeline: frame pacing, GPU timing,
/// threading and diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Number of frames the GPU may still be working on while the CPU submits.
    /// A resource released during frame `F` is destroyed no earlier than frame
    /// `F + frames_in_flight`.
    pub frames_in_flight: u32,
    /// Number of start/end query pairs in every GPU timer ring
    pub timer_ring_size: usize,
    /// Render thread policy
    pub threading: ThreadingPolicy,
    /// Initial capacity of each half of the double-buffered command queue
    pub command_queue_capacity: usize,
    /// Polling cadence of the diagnostic message pump
    pub message_poll_interval_ms: u64,
    /// Severities the message pump drops instead of logging
    pub message_filter: SeverityFilter,
    /// Panic on transient backend errors in debug builds
    pub break_on_error: bool,
    /// Logging setup
    pub logging: LoggingConfig,
}

impl RendererConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self {
            frames_in_flight: 2,
            timer_ring_size: 3,
            threading: ThreadingPolicy::MultiThreaded,
            command_queue_capacity: 1024,
            message_poll_interval_ms: 100,
            message_filter: SeverityFilter::empty(),
            break_on_error: cfg!(debug_assertions),
            logging: LoggingConfig::default(),
        }
    }

    /// Set frames in flight
    pub fn with_frames_in_flight(mut self, frames: u32) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set the GPU timer ring size
    pub fn with_timer_ring_size(mut self, size: usize) -> Self {
        self.timer_ring_size = size;
        self
    }

    /// Set the threading policy
    pub fn with_threading(mut self, threading: ThreadingPolicy) -> Self {
        self.threading = threading;
        self
    }

    /// Set the initial command queue capacity
    pub fn with_command_queue_capacity(mut self, capacity: usize) -> Self {
        self.command_queue_capacity = capacity;
        self
    }

    /// Set the message pump polling interval
    pub fn with_message_poll_interval(mut self, millis: u64) -> Self {
        self.message_poll_interval_ms = millis;
        self
    }

    /// Set which message severities are dropped
    pub fn with_message_filter(mut self, filter: SeverityFilter) -> Self {
        self.message_filter = filter;
        self
    }

    /// Enable or disable break-on-error
    pub fn with_break_on_error(mut self, enabled: bool) -> Self {
        self.break_on_error = enabled;
        self
    }

    /// Set the default log level
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.logging.level = level.into();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.frames_in_flight == 0 {
            return Err("Frames in flight must be at least 1".to_string());
        }

        if self.frames_in_flight > 8 {
            return Err("Frames in flight should not exceed 8".to_string());
        }

        if self.timer_ring_size < 2 {
            return Err("GPU timer ring size must be at least 2".to_string());
        }

        if self.timer_ring_size > 16 {
            return Err("GPU timer ring size should not exceed 16".to_string());
        }

        if self.message_poll_interval_ms == 0 {
            return Err("Message poll interval must be non-zero".to_string());
        }

        Ok(())
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl Config for RendererConfig {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::SeverityFilter;

    #[test]
    fn test_default_config_is_valid() {
        let config = RendererConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.timer_ring_size, 3);
        assert_eq!(config.threading, ThreadingPolicy::MultiThreaded);
    }

    #[test]
    fn test_validation_rejects_out_of_range_values() {
        assert!(RendererConfig::new().with_frames_in_flight(0).validate().is_err());
        assert!(RendererConfig::new().with_frames_in_flight(9).validate().is_err());
        assert!(RendererConfig::new().with_timer_ring_size(1).validate().is_err());
        assert!(RendererConfig::new().with_message_poll_interval(0).validate().is_err());

        assert!(RendererConfig::new().with_frames_in_flight(1).validate().is_ok());
        assert!(RendererConfig::new().with_timer_ring_size(2).validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip_through_file() {
        let path = std::env::temp_dir().join(format!("render_pipeline_cfg_{}.toml", std::process::id()));
        let path = path.to_string_lossy().into_owned();

        let config = RendererConfig::new()
            .with_frames_in_flight(3)
            .with_timer_ring_size(5)
            .with_threading(ThreadingPolicy::SingleThreaded)
            .with_message_filter(SeverityFilter::MESSAGE | SeverityFilter::INFO);
        config.save_to_file(&path).expect("save config");

        let loaded = RendererConfig::load_from_file(&path).expect("load config");
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.frames_in_flight, 3);
        assert_eq!(loaded.timer_ring_size, 5);
        assert_eq!(loaded.threading, ThreadingPolicy::SingleThreaded);
        assert_eq!(loaded.message_filter, SeverityFilter::MESSAGE | SeverityFilter::INFO);
    }

    #[test]
    fn test_partial_ron_uses_defaults() {
        let config: RendererConfig = ron::from_str("(frames_in_flight: 4)").expect("parse ron");
        assert_eq!(config.frames_in_flight, 4);
        assert_eq!(config.timer_ring_size, 3);
    }

    #[test]
    fn test_unsupported_extension() {
        let result = RendererConfig::default().save_to_file("renderer.json");
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }
}
