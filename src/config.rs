//! # Ingest configuration
//!
//! ```toml
//! [dispatch]
//! queue_len = 4
//! idle_wait_ms = 10
//! done_message = "Done printing file\r\n"
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Dispatch task settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Capacity of the interactive queue. Zero makes startup fail.
    ///
    /// The message being dispatched has already left the queue, so up to
    /// `queue_len + 1` interactive messages can be held at once.
    #[serde(default = "default_queue_len")]
    pub queue_len: usize,
    /// Longest time an idle task waits for input before polling again.
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,
    /// Written to the playback sink when a file runs out of lines.
    #[serde(default = "default_done_message")]
    pub done_message: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_len: default_queue_len(),
            idle_wait_ms: default_idle_wait_ms(),
            done_message: default_done_message(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LoggingConfig {
    /// Parsed log level; unknown names fall back to INFO.
    pub fn max_level(&self) -> tracing::Level {
        self.level.parse().unwrap_or(tracing::Level::INFO)
    }
}

fn default_queue_len() -> usize { 4 }
fn default_idle_wait_ms() -> u64 { 10 }
fn default_done_message() -> String { "Done printing file\r\n".to_string() }
fn default_log_level() -> String { "info".to_string() }

pub fn load_config(path: &str) -> Result<IngestConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                Err(ConfigError::Toml(e))
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            Err(ConfigError::Io(e))
        }
    }
}
