use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StowError};

/// Stow configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StowConfig {
    /// Local image store settings
    pub store: StoreConfig,

    /// Pull-through proxy settings
    pub proxy: ProxyConfig,

    /// Log level
    pub log_level: LogLevel,
}

impl StowConfig {
    /// Load configuration from a YAML (or JSON) file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            StowError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&data)
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml_str(data: &str) -> Result<Self> {
        let config: StowConfig = serde_yaml::from_str(data)
            .map_err(|e| StowError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.store.validate()?;
        Ok(config)
    }
}

/// Local store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Storage driver name, part of the store's identity
    pub driver: String,

    /// Root directory for persistent image data
    pub graph_root: PathBuf,

    /// Root directory for transient state
    pub run_root: PathBuf,

    /// Driver options
    pub options: Vec<String>,

    /// Digest algorithm used for content addressing ("sha256" or "sha512")
    pub digest_algorithm: String,

    /// Permission bits applied to published blobs
    pub blob_mode: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let base = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join(".stow");
        Self {
            driver: "overlay".to_string(),
            graph_root: base.join("storage"),
            run_root: base.join("run"),
            options: Vec::new(),
            digest_algorithm: "sha256".to_string(),
            blob_mode: 0o644,
        }
    }
}

impl StoreConfig {
    fn validate(&self) -> Result<()> {
        if self.driver.is_empty() || self.driver.contains(['@', '[', ']', '+']) {
            return Err(StowError::ConfigError(format!(
                "Invalid storage driver name '{}'",
                self.driver
            )));
        }
        if !self.graph_root.is_absolute() || !self.run_root.is_absolute() {
            return Err(StowError::ConfigError(
                "graph_root and run_root must be absolute paths".to_string(),
            ));
        }
        for root in [&self.graph_root, &self.run_root] {
            if root.to_string_lossy().contains([']', ':', '+', '@']) {
                return Err(StowError::ConfigError(format!(
                    "Store root '{}' must not contain ']', ':', '+' or '@'",
                    root.display()
                )));
            }
        }
        if !matches!(self.digest_algorithm.as_str(), "sha256" | "sha512") {
            return Err(StowError::ConfigError(format!(
                "Unsupported digest algorithm '{}'",
                self.digest_algorithm
            )));
        }
        Ok(())
    }
}

/// Pull-through proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// How long proxied repositories and blobs stay cached, in seconds
    pub repository_ttl_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            repository_ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl ProxyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.repository_ttl_secs)
    }
}

/// Log level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}
