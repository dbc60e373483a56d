//! Configuration management for watchpoint
//!
//! Settings start from the built-in defaults or a TOML file. Environment
//! variables override either, and command line flags override everything.

use std::path::Path;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for path watchers and their subscriptions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchpointConfig {
    /// Events a subscriber can have queued before new ones are dropped
    pub channel_capacity: usize,
    /// Subscribe to the whole directory tree instead of direct children only
    pub recursive: bool,
}

impl Default for WatchpointConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            recursive: false,
        }
    }
}

impl WatchpointConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Override fields with environment variables if present
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("WATCHPOINT_CHANNEL_CAPACITY") {
            match val.parse::<usize>() {
                Ok(capacity) => self.channel_capacity = capacity,
                Err(_) => tracing::warn!("Ignoring invalid WATCHPOINT_CHANNEL_CAPACITY: {}", val),
            }
        }

        if let Ok(val) = std::env::var("WATCHPOINT_RECURSIVE") {
            match val.parse::<bool>() {
                Ok(recursive) => self.recursive = recursive,
                Err(_) => tracing::warn!("Ignoring invalid WATCHPOINT_RECURSIVE: {}", val),
            }
        }

        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.channel_capacity == 0 {
            return Err("channel_capacity must be greater than 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = WatchpointConfig::default();

        assert_eq!(config.channel_capacity, 64);
        assert!(!config.recursive);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = WatchpointConfig::default();
        config.channel_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_partial_fields_use_defaults() {
        let config = WatchpointConfig::from_toml_str("recursive = true\n").unwrap();

        assert!(config.recursive);
        assert_eq!(config.channel_capacity, 64);
    }

    #[test]
    fn test_toml_rejects_wrong_types() {
        assert!(WatchpointConfig::from_toml_str("channel_capacity = \"lots\"\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "channel_capacity = 8").unwrap();
        writeln!(file, "recursive = true").unwrap();

        let config = WatchpointConfig::load(file.path()).unwrap();
        assert_eq!(config, WatchpointConfig { channel_capacity: 8, recursive: true });
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = WatchpointConfig::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_env_config_loading() {
        std::env::set_var("WATCHPOINT_CHANNEL_CAPACITY", "256");
        std::env::set_var("WATCHPOINT_RECURSIVE", "not-a-bool");

        let config = WatchpointConfig::from_env();

        assert_eq!(config.channel_capacity, 256);
        assert!(!config.recursive);

        // Environment wins over values read from a file.
        let from_file = WatchpointConfig::from_toml_str("channel_capacity = 8\nrecursive = true\n")
            .unwrap()
            .with_env_overrides();
        assert_eq!(from_file.channel_capacity, 256);
        assert!(from_file.recursive);

        // Cleanup
        std::env::remove_var("WATCHPOINT_CHANNEL_CAPACITY");
        std::env::remove_var("WATCHPOINT_RECURSIVE");
    }
}
