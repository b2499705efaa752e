use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "config.toml";
const APP_DIR: &str = "mediacheck";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteConfig,
    pub probe: ProbeConfig,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
}

/// Remote API connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the API server, without trailing slash
    pub base_url: String,
    /// Scheme used in the Authorization header ("Token" or "Bearer")
    pub auth_scheme: String,
    /// Timeout applied to every API request
    pub request_timeout_secs: u64,
    /// TCP connect timeout
    pub connect_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            auth_scheme: "Token".to_string(),
            request_timeout_secs: 10,
            connect_timeout_secs: 5,
        }
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Connectivity probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Liveness endpoint, relative to the remote base URL
    pub health_path: String,
    /// Probe timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            health_path: "/health/".to_string(),
            timeout_ms: 2000,
        }
    }
}

/// How a pull decides whether a remote state overwrites the local one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Remote wins when its `updated_at` is newer than the local record's
    #[default]
    PerRecord,
    /// Remote wins when its `updated_at` is newer than the last sync
    Watermark,
}

/// Sync behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub conflict_policy: ConflictPolicy,
    /// Run a sync pass before listing media while online
    pub sync_on_list: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicy::PerRecord,
            sync_on_list: true,
        }
    }
}

/// Local store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Store path (empty = default data dir)
    pub db_path: Option<String>,
}

impl StorageConfig {
    /// Resolve the store path, creating the default data directory if needed
    pub fn resolve_db_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.db_path {
            return Ok(PathBuf::from(path));
        }
        let data_dir = dirs::data_dir()
            .context("Failed to get data directory")?
            .join(APP_DIR);
        fs::create_dir_all(&data_dir)
            .context("Failed to create data directory")?;
        Ok(data_dir.join("store.redb"))
    }
}

impl Config {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join(APP_DIR);

        fs::create_dir_all(&config_dir)
            .context("Failed to create config directory")?;

        Ok(config_dir.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load configuration from `path`, or write defaults there if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;

            let config: Config = toml::from_str(&contents)
                .context("Failed to parse config file")?;

            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }
}
