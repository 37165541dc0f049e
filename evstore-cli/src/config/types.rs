use std::path::PathBuf;

use directories::ProjectDirs;
use evstore_bus::BusConfig;
use evstore_core::EventStoreConfig;
use serde::{Deserialize, Serialize};

/// Database files kept under the data directory.
pub const EVENTS_DB: &str = "events.db";
pub const PROJECTIONS_DB: &str = "projections.db";
pub const SNAPSHOTS_DB: &str = "snapshots.db";

/// Configuration as stored in TOML files (with optional fields for merging)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawEvstoreConfig {
    #[serde(default)]
    pub storage: RawStorageConfig,

    #[serde(default)]
    pub bus: RawBusSection,

    /// Pipeline settings, merged table by table.
    #[serde(default)]
    pub core: Option<toml::Table>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawStorageConfig {
    pub data_dir: Option<PathBuf>,
    pub url: Option<String>,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawBusSection {
    pub enabled: Option<bool>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub stream: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Final configuration with defaults applied
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EvstoreConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub bus: BusSection,

    #[serde(default)]
    pub core: EventStoreConfig,
}

/// Where the durable log, read models and snapshots live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the local libSQL files.
    pub data_dir: PathBuf,

    /// Remote libSQL/Turso URL. Takes precedence over `data_dir` when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            url: None,
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BusSection {
    /// Publish to Iggy. Without it events stay in-process.
    pub enabled: bool,

    #[serde(flatten)]
    pub iggy: BusConfig,
}

impl StorageConfig {
    pub fn events_db(&self) -> PathBuf {
        self.data_dir.join(EVENTS_DB)
    }

    pub fn projections_db(&self) -> PathBuf {
        self.data_dir.join(PROJECTIONS_DB)
    }

    pub fn snapshots_db(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOTS_DB)
    }
}

/// Platform data directory, or `.evstore/data` when there is none.
pub fn default_data_dir() -> PathBuf {
    ProjectDirs::from("", "", "evstore")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".evstore").join("data"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_values() {
        let config = EvstoreConfig::default();
        assert!(config.storage.events_db().ends_with(EVENTS_DB));
        assert!(config.storage.url.is_none());
        assert!(!config.bus.enabled);
        assert_eq!(config.bus.iggy.port, 8090);
        assert_eq!(config.core.cache.ttl, Duration::from_secs(300));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = EvstoreConfig::default();
        config.storage.data_dir = PathBuf::from("/tmp/evstore");
        config.bus.enabled = true;
        config.bus.iggy.host = "iggy.internal".to_string();
        config.core.snapshot.keep = 7;

        let toml_str = toml::to_string(&config).unwrap();
        let parsed: EvstoreConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.storage.data_dir, PathBuf::from("/tmp/evstore"));
        assert_eq!(parsed.storage.snapshots_db(), PathBuf::from("/tmp/evstore/snapshots.db"));
        assert!(parsed.bus.enabled);
        assert_eq!(parsed.bus.iggy.host, "iggy.internal");
        assert_eq!(parsed.core.snapshot.keep, 7);
    }

    #[test]
    fn test_raw_config_partial_parsing() {
        let toml_str = r#"
[storage]
data_dir = "/data/evstore"

[core.cache]
ttl = "30s"
"#;
        let raw: RawEvstoreConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(raw.storage.data_dir, Some(PathBuf::from("/data/evstore")));
        assert!(raw.storage.url.is_none());
        assert!(raw.bus.enabled.is_none());
        assert!(raw.core.unwrap().contains_key("cache"));
    }

    #[test]
    fn test_raw_config_empty_uses_none() {
        let raw: RawEvstoreConfig = toml::from_str("").unwrap();
        assert!(raw.storage.data_dir.is_none());
        assert!(raw.bus.port.is_none());
        assert!(raw.core.is_none());
    }
}
