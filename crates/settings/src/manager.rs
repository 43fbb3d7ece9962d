//! Configuration manager
//!
//! This module provides the [`ConfigManager`] through which every component
//! reads its settings. Components fall back to their own defaults when a key
//! is missing, so a partially populated file is always valid.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use common::error::{Error, Result};
use common::types::{Domain, ResourceKind};

use crate::defaults::DefaultConfig;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "SYNC_ORCH";

/// Layered configuration manager
#[derive(Debug, Clone)]
pub struct ConfigManager {
    /// Merged configuration
    config: Config,

    /// File the configuration was loaded from, if any
    source_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Creates a new configuration manager
    ///
    /// Layers, lowest precedence first: built-in defaults, the given file (or
    /// the user config file if present), then `SYNC_ORCH__*` environment
    /// variables with `__` separating nested keys.
    pub fn new(path: Option<&Path>) -> Result<Self> {
        let source_path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_config_path().filter(|p| p.exists()),
        };

        let mut builder =
            Config::builder().add_source(File::from_str(DefaultConfig::TOML, FileFormat::Toml));

        if let Some(path) = &source_path {
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(File::from(path.clone()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().map_err(config_error)?;

        Ok(Self { config, source_path })
    }

    /// Creates a configuration manager holding only the built-in defaults
    pub fn defaults() -> Result<Self> {
        Self::from_toml("")
    }

    /// Creates a configuration manager from the defaults plus a TOML overlay
    ///
    /// Neither the user config file nor the environment is consulted.
    pub fn from_toml(overlay: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(DefaultConfig::TOML, FileFormat::Toml))
            .add_source(File::from_str(overlay, FileFormat::Toml))
            .build()
            .map_err(config_error)?;

        Ok(Self {
            config,
            source_path: None,
        })
    }

    /// Path of the per-user configuration file
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("sync-orchestrator").join("config.toml"))
    }

    /// File the configuration was loaded from, if any
    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// Gets a value of any deserializable type
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.config.get::<T>(key).map_err(config_error)
    }

    /// Gets a string value
    pub fn get_string(&self, key: &str) -> Result<String> {
        self.get(key)
    }

    /// Gets a boolean value
    pub fn get_bool(&self, key: &str) -> Result<bool> {
        self.get(key)
    }

    /// Gets a floating point value
    pub fn get_f64(&self, key: &str) -> Result<f64> {
        self.get(key)
    }

    /// Gets an unsigned integer value
    pub fn get_u64(&self, key: &str) -> Result<u64> {
        self.get(key)
    }

    /// Gets a size value
    pub fn get_usize(&self, key: &str) -> Result<usize> {
        self.get(key)
    }

    /// Gets a duration stored as integer milliseconds
    pub fn get_duration(&self, key: &str) -> Result<Duration> {
        self.get_u64(key).map(Duration::from_millis)
    }

    /// Gets a list of floating point values
    pub fn get_f64_list(&self, key: &str) -> Result<Vec<f64>> {
        self.get(key)
    }

    /// Gets the declared capacity table `capacity.<domain>.<resource_kind>`
    pub fn get_capacities(&self) -> Result<Vec<(Domain, ResourceKind, u64)>> {
        let table: HashMap<String, HashMap<String, u64>> = self.get("capacity")?;

        let mut capacities = Vec::new();
        for (domain_name, kinds) in table {
            let domain: Domain = domain_name.parse().map_err(Error::Config)?;
            for (kind_name, amount) in kinds {
                capacities.push((domain, ResourceKind::from(kind_name), amount));
            }
        }

        // Deterministic order for logging and lock ordering
        capacities.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        debug!("Loaded {} capacity declarations", capacities.len());

        Ok(capacities)
    }
}

fn config_error(err: ConfigError) -> Error {
    Error::Config(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_loaded() {
        let manager = ConfigManager::defaults().unwrap();
        assert_eq!(manager.get_f64("priority.weight_operation_class").unwrap(), 0.4);
        assert_eq!(manager.get_duration("monitor.interval_ms").unwrap(), Duration::from_secs(5));
        assert_eq!(manager.get_f64("monitor.threshold").unwrap(), 0.90);
        assert_eq!(
            manager.get_f64_list("recovery.memory_tiers").unwrap(),
            vec![0.80, 0.85, 0.90, 0.95]
        );
        assert!(!manager.get_bool("persistence.enabled").unwrap());
    }

    #[test]
    fn test_overlay_wins_over_defaults() {
        let manager = ConfigManager::from_toml(
            r#"
            [monitor]
            threshold = 0.75

            [capacity.memory]
            memory_bytes = 10
            "#,
        )
        .unwrap();
        assert_eq!(manager.get_f64("monitor.threshold").unwrap(), 0.75);

        let capacities = manager.get_capacities().unwrap();
        assert!(capacities.contains(&(Domain::Memory, ResourceKind::MemoryBytes, 10)));
        assert!(capacities.contains(&(Domain::Model, ResourceKind::ModelSlot, 4)));
        assert_eq!(capacities[0].0, Domain::Device);
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let manager = ConfigManager::defaults().unwrap();
        let err = manager.get_u64("no.such.key").unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_file_layer() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[bus]\nmax_redeliveries = 9").unwrap();

        let manager = ConfigManager::new(Some(file.path())).unwrap();
        assert_eq!(manager.get_u64("bus.max_redeliveries").unwrap(), 9);
        assert_eq!(manager.source_path(), Some(file.path()));
    }

    #[test]
    fn test_unknown_capacity_domain_rejected() {
        let manager = ConfigManager::from_toml("[capacity.gpu]\nslots = 1").unwrap();
        assert!(manager.get_capacities().is_err());
    }
}
