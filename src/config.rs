use crate::doppler::{DEFAULT_CACHE_SIZE, DEFAULT_INTERVAL};
use crate::doppler::fetch::DEFAULT_TIMEOUT;
use crate::engine::EngineSettings;
use crate::engine::gap::{DEFAULT_MAX_GAP_RESETS, GapPolicy};
use crate::summary::DEFAULT_DEBOUNCE;
use crate::supervisor::DEFAULT_RECONNECT_DELAY;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";
pub const CONFIG_PATH_ENV: &str = "WEATHER_COLLECTOR_CONFIG";
pub const DEFAULT_SERVER_PORT: u16 = 8080;
pub const DEFAULT_LISTEN_PORT: u16 = 11461;
pub const DEFAULT_STATION_NAME: &str = "Weather Station";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub app: AppSection,
    pub logging: LoggingSection,
    #[serde(default)]
    pub collector: Option<CollectorSection>,
    #[serde(default)]
    pub summary: Option<SummarySection>,
    #[serde(default)]
    pub doppler: Option<DopplerSection>,
    #[serde(default)]
    pub server: Option<ServerSection>,
    #[serde(default)]
    pub storage: Option<StorageSection>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppSection {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSection {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectorSection {
    /// Port the weather station connects to (default: 11461)
    pub listen_port: Option<u16>,
    pub station_name: Option<String>,
    #[serde(default)]
    pub gap_policy: Option<GapPolicy>,
    /// Resets in a row for one gap before the batch is stored anyway (default: 3)
    pub max_gap_resets: Option<u32>,
    pub reconnect_delay_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SummarySection {
    pub debounce_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DopplerSection {
    pub url: Option<String>,
    pub interval_secs: Option<u64>,
    pub cache_size: Option<usize>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSection {
    /// Port to listen on (default: 8080)
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSection {
    /// SQLite database file; in-memory when absent
    pub path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// The file named by `WEATHER_COLLECTOR_CONFIG`, else [`DEFAULT_CONFIG_PATH`].
pub fn config_path() -> PathBuf {
    match std::env::var_os(CONFIG_PATH_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_CONFIG_PATH),
    }
}

pub fn load_default() -> Result<Config, ConfigError> {
    load_from_path(config_path())
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&contents)?;
    Ok(config)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

impl Config {
    pub fn listen_port(&self) -> u16 {
        self.collector
            .as_ref()
            .and_then(|c| c.listen_port)
            .unwrap_or(DEFAULT_LISTEN_PORT)
    }

    pub fn station_name(&self) -> &str {
        non_empty(self.collector.as_ref().and_then(|c| c.station_name.as_deref()))
            .unwrap_or(DEFAULT_STATION_NAME)
    }

    pub fn gap_policy(&self) -> GapPolicy {
        self.collector
            .as_ref()
            .and_then(|c| c.gap_policy)
            .unwrap_or_default()
    }

    pub fn max_gap_resets(&self) -> u32 {
        self.collector
            .as_ref()
            .and_then(|c| c.max_gap_resets)
            .unwrap_or(DEFAULT_MAX_GAP_RESETS)
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.collector
            .as_ref()
            .and_then(|c| c.reconnect_delay_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RECONNECT_DELAY)
    }

    pub fn summary_debounce(&self) -> Duration {
        self.summary
            .as_ref()
            .and_then(|s| s.debounce_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_DEBOUNCE)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            debounce: self.summary_debounce(),
            gap_policy: self.gap_policy(),
            max_gap_resets: self.max_gap_resets(),
        }
    }

    /// Returns the doppler URL, or None when polling is disabled.
    pub fn doppler_url(&self) -> Option<&str> {
        non_empty(self.doppler.as_ref().and_then(|d| d.url.as_deref()))
    }

    pub fn doppler_interval(&self) -> Duration {
        self.doppler
            .as_ref()
            .and_then(|d| d.interval_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_INTERVAL)
    }

    /// Never below one.
    pub fn doppler_cache_size(&self) -> usize {
        self.doppler
            .as_ref()
            .and_then(|d| d.cache_size)
            .unwrap_or(DEFAULT_CACHE_SIZE)
            .max(1)
    }

    pub fn doppler_timeout(&self) -> Duration {
        self.doppler
            .as_ref()
            .and_then(|d| d.timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Returns the server port (default: 8080)
    pub fn server_port(&self) -> u16 {
        self.server
            .as_ref()
            .and_then(|s| s.port)
            .unwrap_or(DEFAULT_SERVER_PORT)
    }

    pub fn storage_path(&self) -> Option<&Path> {
        let path = self.storage.as_ref()?.path.as_deref()?;
        if path.as_os_str().is_empty() {
            None
        } else {
            Some(path)
        }
    }
}
