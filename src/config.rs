// Configuration for the handoff core, loaded from YAML with env
// overrides supplied by the embedding dashboard host.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub inbox: InboxConfig,
    #[serde(default)]
    pub transcript: TranscriptConfig,
    /// Default tracing level; RUST_LOG still overrides it.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            feed: FeedConfig::default(),
            inbox: InboxConfig::default(),
            transcript: TranscriptConfig::default(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// "sqlite" or "memory".
    pub backend: String,
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            db_path: "./data/imovia.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Broadcast buffer per (tenant, table) channel; overflow is treated
    /// as a gap and resolved by resync.
    pub buffer: usize,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            buffer: 256,
            reconnect_initial_ms: 200,
            reconnect_max_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InboxConfig {
    /// Upper bound on conversations held by one inbox projection.
    pub max_cached: usize,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self { max_cached: 2_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptConfig {
    /// Most recent messages fetched on open; no pagination beyond it.
    pub initial_limit: i64,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self { initial_limit: 500 }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_default() -> Self {
        let path = env::var("IMOVIA_CONFIG").unwrap_or_else(|_| "./config.yaml".to_string());
        let mut config = if Path::new(&path).exists() {
            Self::load(&path).unwrap_or_else(|err| {
                tracing::warn!(error = %err, "config load failed, using defaults");
                Config::default()
            })
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = env::var("IMOVIA_STORAGE_BACKEND") {
            if !value.trim().is_empty() {
                self.storage.backend = value.trim().to_string();
            }
        }
        if let Ok(value) = env::var("IMOVIA_DB_PATH") {
            if !value.trim().is_empty() {
                self.storage.db_path = value.trim().to_string();
            }
        }
    }
}
