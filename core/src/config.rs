//! Application configuration persisted under the data directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

const CONFIG_FILE: &str = "familyvault.toml";
const CONFIG_VERSION: u32 = 1;

/// Network port assignments. Defaults match the protocol documentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    /// TCP port of the secure transport.
    pub service_port: u16,
    /// UDP port of LAN discovery.
    pub discovery_port: u16,
    /// TCP port of the (plaintext) pairing listener.
    pub pairing_port: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            service_port: 45678,
            discovery_port: 45679,
            pairing_port: 45680,
        }
    }
}

/// Tuning knobs for scanning and content extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Hard cap on bytes fed to a text extractor.
    pub max_extract_bytes: u64,
    /// Page cap for PDF extraction.
    pub max_pdf_pages: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_extract_bytes: 10 * 1024 * 1024,
            max_pdf_pages: 50,
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Config schema version.
    pub version: u32,
    /// Data directory holding the database, cache and logs.
    pub data_dir: PathBuf,
    /// Human-readable device name shown to peers.
    pub device_name: String,
    pub ports: PortConfig,
    pub index: IndexConfig,
}

impl AppConfig {
    /// Load the config from `data_dir`, creating a default one if absent.
    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE);
        if config_path.exists() {
            info!(path = %config_path.display(), "loading config");
            let raw = fs::read_to_string(&config_path)?;
            let config: AppConfig = toml::from_str(&raw)
                .map_err(|e| Error::InvalidArgument(format!("config parse: {e}")))?;
            if config.version > CONFIG_VERSION {
                return Err(Error::InvalidArgument(format!(
                    "config version {} is newer than supported {}",
                    config.version, CONFIG_VERSION
                )));
            }
            Ok(config)
        } else {
            warn!(path = %config_path.display(), "no config found, creating default");
            let config = Self::default_with_dir(data_dir.to_path_buf());
            config.save()?;
            Ok(config)
        }
    }

    pub fn default_with_dir(data_dir: PathBuf) -> Self {
        Self {
            version: CONFIG_VERSION,
            data_dir,
            device_name: default_device_name(),
            ports: PortConfig::default(),
            index: IndexConfig::default(),
        }
    }

    /// Persist the config to its data directory.
    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        let raw = toml::to_string_pretty(self)
            .map_err(|e| Error::Internal(format!("config serialize: {e}")))?;
        fs::write(self.data_dir.join(CONFIG_FILE), raw)?;
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("familyvault.db")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    /// Create the directories the daemon writes to.
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        fs::create_dir_all(self.cache_dir())?;
        Ok(())
    }
}

/// Platform data directory, e.g. `~/.local/share/familyvault`.
pub fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|d| d.join("familyvault"))
        .ok_or_else(|| Error::Internal("no platform data directory".into()))
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "FamilyVault Device".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_reload() {
        let dir = tempdir().unwrap();
        let created = AppConfig::load_or_create(dir.path()).unwrap();
        assert_eq!(created.version, CONFIG_VERSION);
        assert_eq!(created.ports.service_port, 45678);

        let reloaded = AppConfig::load_or_create(dir.path()).unwrap();
        assert_eq!(reloaded.device_name, created.device_name);
        assert_eq!(reloaded.data_dir, created.data_dir);
    }

    #[test]
    fn newer_version_is_rejected() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default_with_dir(dir.path().to_path_buf());
        config.version = CONFIG_VERSION + 1;
        config.save().unwrap();
        assert!(AppConfig::load_or_create(dir.path()).is_err());
    }
}
