//! Config loading and persistence.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runner::RunnerConfig;
use crate::{Error, Result};

pub const DEFAULT_CONFIG_FILE: &str = "viewsync.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub runner: RunnerSettings,
    pub logging: LoggingConfig,
    pub schema: SchemaConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            sync: SyncConfig::default(),
            runner: RunnerSettings::default(),
            logging: LoggingConfig::default(),
            schema: SchemaConfig::default(),
        }
    }
}

/// Primary-key declarations per table, used to derive client row ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub tables: std::collections::BTreeMap<String, Vec<String>>,
}

impl SchemaConfig {
    pub fn to_schema_map(&self) -> crate::client::SchemaMap {
        let mut map = crate::client::SchemaMap::new();
        for (table, primary_key) in &self.tables {
            let columns: Vec<&str> = primary_key.iter().map(String::as_str).collect();
            map = map.with_table(table.clone(), &columns);
        }
        map
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("viewsync.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Catch-up row batch size per poke part.
    pub catchup_batch_size: usize,
    /// Lease heartbeat cadence in milliseconds.
    pub heartbeat_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            catchup_batch_size: 256,
            heartbeat_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_connections: usize,
    pub watchdog_interval_ms: u64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            min_delay_ms: 30,
            max_delay_ms: 60_000,
            max_connections: 3,
            watchdog_interval_ms: 5_000,
        }
    }
}

impl RunnerSettings {
    pub fn to_runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            min_delay: Duration::from_millis(self.min_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_connections: self.max_connections.max(1),
            watchdog_interval: Duration::from_millis(self.watchdog_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

pub fn load(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .map_err(|e| config_error(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&contents)
        .map_err(|e| config_error(format!("failed to parse {}: {e}", path.display())))
}

pub fn load_or_init(path: &Path) -> Config {
    if path.exists() {
        match load(path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                tracing::warn!("config load failed, using defaults: {e}");
                return Config::default();
            }
        }
    }

    let cfg = Config::default();
    if let Err(e) = write_config(path, &cfg) {
        tracing::warn!("failed to write default config: {e}");
    }
    cfg
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir)
            .map_err(|e| config_error(format!("failed to create {}: {e}", dir.display())))?;
    }
    let contents = toml::to_string_pretty(cfg)
        .map_err(|e| config_error(format!("failed to render config: {e}")))?;
    atomic_write(path, contents.as_bytes())
}

pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(path) = std::env::var("VIEWSYNC_STORE") {
        cfg.store.path = PathBuf::from(path);
    }
    if let Ok(filter) = std::env::var("VIEWSYNC_LOG") {
        cfg.logging.filter = filter;
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let temp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| {
        config_error(format!(
            "failed to create temp file in {}: {e}",
            dir.display()
        ))
    })?;
    fs::write(temp.path(), data)
        .map_err(|e| config_error(format!("failed to write config temp file: {e}")))?;
    temp.persist(path).map_err(|e| {
        config_error(format!(
            "failed to persist config to {}: {e}",
            path.display()
        ))
    })?;
    Ok(())
}

fn config_error(reason: String) -> Error {
    Error::Config(reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("viewsync.toml");
        let cfg = Config {
            store: StoreConfig {
                path: PathBuf::from("/tmp/cvr.db"),
            },
            sync: SyncConfig {
                catchup_batch_size: 64,
                heartbeat_interval_ms: 1_000,
            },
            runner: RunnerSettings {
                min_delay_ms: 5,
                max_delay_ms: 500,
                max_connections: 7,
                watchdog_interval_ms: 250,
            },
            logging: LoggingConfig {
                filter: "debug".to_string(),
                format: LogFormat::Json,
            },
            schema: SchemaConfig::default(),
        };
        write_config(&path, &cfg).expect("write config");
        let loaded = load(&path).expect("load config");
        assert_eq!(loaded.store.path, PathBuf::from("/tmp/cvr.db"));
        assert_eq!(loaded.sync.catchup_batch_size, 64);
        assert_eq!(loaded.runner.max_connections, 7);
        assert_eq!(loaded.logging.format, LogFormat::Json);
    }

    #[test]
    fn defaults_are_usable() {
        let cfg = Config::default();
        assert_eq!(cfg.sync.heartbeat_interval_ms, 30_000);
        let runner = cfg.runner.to_runner_config();
        assert!(runner.min_delay < runner.max_delay);
        assert!(runner.max_connections >= 1);
    }

    #[test]
    fn missing_file_initializes_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("viewsync.toml");
        let cfg = load_or_init(&path);
        assert_eq!(cfg.sync.catchup_batch_size, 256);
        assert!(path.exists());
    }
}
