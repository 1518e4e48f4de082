//! Application configuration management.
//!
//! Configuration holds the API base URL, timeouts, the credential storage
//! backend, and the last used login email.
//!
//! Configuration is stored at `~/.config/fitsocial/config.json`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::GatewaySettings;

/// Application name used for config/data directory paths
const APP_NAME: &str = "fitsocial";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Local development server used by the web client.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3000";

/// Environment variable overriding `api_base_url`.
pub const API_URL_ENV: &str = "FITSOCIAL_API_URL";

/// Where the credential store keeps the session triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// `session.json` in the data directory
    #[default]
    File,
    /// OS keychain entry
    Keyring,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub refresh_timeout_secs: u64,
    pub logout_timeout_secs: u64,
    pub storage: StorageKind,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: 30,
            refresh_timeout_secs: 10,
            logout_timeout_secs: 5,
            storage: StorageKind::File,
            last_email: None,
        }
    }
}

impl Config {
    /// Load the config file, falling back to defaults when it does not exist,
    /// then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                self.api_base_url = url;
            }
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the session file and logs.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            refresh_timeout: Duration::from_secs(self.refresh_timeout_secs),
            logout_timeout: Duration::from_secs(self.logout_timeout_secs),
        }
    }
}
