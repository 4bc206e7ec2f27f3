use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "karte.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Name of the document collection holding the records.
    pub collection: String,
    /// When set, records are persisted to this snapshot file.
    pub data_file: Option<PathBuf>,
    /// Maximum number of records returned by a list.
    pub list_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            collection: "karte".to_string(),
            data_file: None,
            list_limit: 50,
        }
    }
}

/// Timing and sizing knobs of an editing session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub autosave_debounce_ms: u64,
    pub recalc_debounce_ms: u64,
    pub heartbeat_secs: u64,
    pub presence_ttl_secs: u64,
    pub suppression_window_ms: u64,
    pub min_rows: usize,
    pub min_cols: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            autosave_debounce_ms: 3_000,
            recalc_debounce_ms: 200,
            heartbeat_secs: 60,
            presence_ttl_secs: 300,
            suppression_window_ms: 1_000,
            min_rows: 30,
            min_cols: 8,
        }
    }
}

impl SessionConfig {
    pub fn autosave_debounce(&self) -> Duration {
        Duration::from_millis(self.autosave_debounce_ms)
    }

    pub fn recalc_debounce(&self) -> Duration {
        Duration::from_millis(self.recalc_debounce_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }

    pub fn suppression_window(&self) -> Duration {
        Duration::from_millis(self.suppression_window_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KarteConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub session: SessionConfig,
}

impl KarteConfig {
    /// Load `KARTE_CONFIG` (or `karte.toml`) when present, then apply env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("KARTE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(path)
    }

    /// A missing file is not an error; defaults are used instead.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = match fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(bind) = env::var("KARTE_BIND") {
            if !bind.is_empty() {
                self.server.bind = bind;
            }
        }

        if let Ok(file) = env::var("KARTE_DATA_FILE") {
            if !file.is_empty() {
                self.store.data_file = Some(PathBuf::from(file));
            }
        }

        if let Ok(collection) = env::var("KARTE_COLLECTION") {
            if !collection.is_empty() {
                self.store.collection = collection;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = KarteConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.store.collection, "karte");
        assert_eq!(config.session, SessionConfig::default());
        assert_eq!(config.session.autosave_debounce(), Duration::from_secs(3));
        assert_eq!(config.session.presence_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("karte.toml");
        fs::write(
            &path,
            "[session]\nheartbeat_secs = 15\n\n[store]\nlist_limit = 10\n",
        )
        .unwrap();

        let config = KarteConfig::load_from(&path).unwrap();
        assert_eq!(config.session.heartbeat(), Duration::from_secs(15));
        assert_eq!(config.session.min_rows, 30);
        assert_eq!(config.store.list_limit, 10);
        assert_eq!(config.store.collection, "karte");
    }

    #[test]
    fn malformed_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("karte.toml");
        fs::write(&path, "[session\nheartbeat_secs = ").unwrap();
        assert!(matches!(
            KarteConfig::load_from(&path),
            Err(ConfigError::Toml(_))
        ));
    }
}
