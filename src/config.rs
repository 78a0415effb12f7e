//! Node configuration: JSON file, environment overrides, validation.

use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::errors::{ErrorKind, Result, VaultError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub storage_root: String,
    pub bootstrap_nodes: Vec<String>,

    pub log_level: String,
    pub log_file: Option<String>,

    pub encryption_enabled: bool,
    /// Hex-encoded 32-byte key; empty means a random per-node key. Set the
    /// same value on every node of a cluster.
    pub encryption_key: String,

    pub max_connections: usize,
    pub read_timeout_seconds: u64,
    pub write_timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            storage_root: "storage".to_string(),
            bootstrap_nodes: Vec::new(),
            log_level: "info".to_string(),
            log_file: None,
            encryption_enabled: true,
            encryption_key: String::new(),
            max_connections: 100,
            read_timeout_seconds: 30,
            write_timeout_seconds: 30,
        }
    }
}

impl Config {
    /// Load configuration: file (missing file falls back to defaults), then
    /// environment overrides, then validation.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let config = Self::from_file(path)?;
            info!("loaded configuration from {}", path.display());
            config
        } else {
            warn!("config file {} not found, using defaults", path.display());
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            VaultError::wrap(e, ErrorKind::Config, "failed to read config file")
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        serde_json::from_str(contents)
            .map_err(|e| VaultError::wrap(e, ErrorKind::Config, "failed to parse config file"))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| VaultError::wrap(e, ErrorKind::Config, "failed to encode config"))?;
        std::fs::write(path, contents)
            .map_err(|e| VaultError::wrap(e, ErrorKind::Config, "failed to write config file"))
    }

    /// Override fields from `PV_*` environment variables.
    pub fn apply_env(&mut self) {
        if let Ok(val) = std::env::var("PV_LISTEN_ADDR") {
            self.listen_addr = val;
        }
        if let Ok(val) = std::env::var("PV_STORAGE_ROOT") {
            self.storage_root = val;
        }
        if let Ok(val) = std::env::var("PV_BOOTSTRAP_NODES") {
            self.bootstrap_nodes = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(val) = std::env::var("PV_LOG_LEVEL") {
            self.log_level = val;
        }
        if let Ok(val) = std::env::var("PV_LOG_FILE") {
            self.log_file = Some(val);
        }
        if let Ok(val) = std::env::var("PV_ENCRYPTION_ENABLED") {
            if let Ok(enabled) = val.parse() {
                self.encryption_enabled = enabled;
            }
        }
        if let Ok(val) = std::env::var("PV_ENCRYPTION_KEY") {
            self.encryption_key = val;
        }
        if let Ok(val) = std::env::var("PV_MAX_CONNECTIONS") {
            if let Ok(n) = val.parse() {
                self.max_connections = n;
            }
        }
        if let Ok(val) = std::env::var("PV_READ_TIMEOUT") {
            if let Ok(n) = val.parse() {
                self.read_timeout_seconds = n;
            }
        }
        if let Ok(val) = std::env::var("PV_WRITE_TIMEOUT") {
            if let Ok(n) = val.parse() {
                self.write_timeout_seconds = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(VaultError::config("listen address cannot be empty"));
        }
        if self.storage_root.is_empty() {
            return Err(VaultError::config("storage root cannot be empty"));
        }
        if self.log_level_filter().is_none() {
            return Err(VaultError::config(format!(
                "invalid log level: {}",
                self.log_level
            )));
        }
        if self.max_connections == 0 {
            return Err(VaultError::config("max connections must be positive"));
        }
        if self.read_timeout_seconds == 0 {
            return Err(VaultError::config("read timeout must be positive"));
        }
        if self.write_timeout_seconds == 0 {
            return Err(VaultError::config("write timeout must be positive"));
        }
        if !self.encryption_key.is_empty() {
            crypto::parse_encryption_key(&self.encryption_key)?;
        }
        Ok(())
    }

    /// The configured encryption key, or a fresh random one when unset.
    pub fn encryption_key(&self) -> Result<[u8; crate::KEY_SIZE]> {
        if self.encryption_key.is_empty() {
            Ok(crypto::new_encryption_key())
        } else {
            crypto::parse_encryption_key(&self.encryption_key)
        }
    }

    pub fn log_level_filter(&self) -> Option<log::LevelFilter> {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Some(log::LevelFilter::Trace),
            "debug" => Some(log::LevelFilter::Debug),
            "info" => Some(log::LevelFilter::Info),
            "warn" => Some(log::LevelFilter::Warn),
            "error" => Some(log::LevelFilter::Error),
            _ => None,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_seconds)
    }
}
