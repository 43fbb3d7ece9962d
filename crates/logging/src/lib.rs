//! Logging for the Sync Orchestrator
//!
//! This crate installs the process-wide `tracing` subscriber: an env filter
//! (`RUST_LOG` wins over the configured level), a console layer in pretty or
//! JSON format, and an optional daily rolling JSON file.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
pub use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use common::error::{Error, Result};
use settings::ConfigManager;

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    /// Human-readable
    Pretty,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Unknown log format: {}", s)),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default filter directive, e.g. "info" or "orchestrator_core=debug"
    pub level: String,

    /// Console format
    pub format: LogFormat,

    /// Directory for the rolling log file; no file output when unset
    pub directory: Option<PathBuf>,

    /// File name prefix of the rolling log file
    pub file_prefix: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            directory: None,
            file_prefix: "sync-orchestrator.log".to_string(),
        }
    }
}

impl LoggingSettings {
    /// Reads the `logging.*` keys
    pub fn from_config(config_manager: &ConfigManager) -> Self {
        let defaults = Self::default();

        Self {
            level: config_manager
                .get_string("logging.level")
                .unwrap_or(defaults.level),
            format: config_manager
                .get_string("logging.format")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.format),
            directory: config_manager
                .get_string("logging.directory")
                .ok()
                .map(PathBuf::from),
            file_prefix: config_manager
                .get_string("logging.file_prefix")
                .unwrap_or(defaults.file_prefix),
        }
    }
}

/// Installs the global subscriber
///
/// Returns the file writer guard when file output is enabled; it must be held
/// for the life of the process or buffered lines are lost. Fails if a global
/// subscriber is already installed.
pub fn init_logging(settings: &LoggingSettings) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .map_err(|e| Error::Config(format!("Invalid log filter '{}': {}", settings.level, e)))?;

    let console_layer = match settings.format {
        LogFormat::Json => fmt::layer().json().with_target(true).boxed(),
        LogFormat::Pretty => fmt::layer().with_target(true).boxed(),
    };

    let (file_layer, guard) = match &settings.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, &settings.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {}", e)))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_defaults() {
        let manager = ConfigManager::defaults().unwrap();
        let settings = LoggingSettings::from_config(&manager);
        assert_eq!(settings.level, "info");
        assert_eq!(settings.format, LogFormat::Pretty);
        assert!(settings.directory.is_none());
    }

    #[test]
    fn test_settings_json_format() {
        let manager = ConfigManager::from_toml("[logging]\nformat = \"json\"\nlevel = \"debug\"").unwrap();
        let settings = LoggingSettings::from_config(&manager);
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.level, "debug");
    }

    #[test]
    fn test_second_init_fails_instead_of_panicking() {
        let settings = LoggingSettings::default();
        let _first = init_logging(&settings);
        let second = init_logging(&settings);
        assert!(second.is_err());
    }
}
