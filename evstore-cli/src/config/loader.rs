use super::types::{
    BusSection, EvstoreConfig, RawBusSection, RawEvstoreConfig, RawStorageConfig, StorageConfig,
    default_data_dir,
};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use evstore_bus::BusConfig;
use evstore_core::EventStoreConfig;
use std::path::{Path, PathBuf};

/// Environment variable naming the project config file.
pub const CONFIG_ENV: &str = "EVSTORE_CONFIG";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load merged configuration (user + project)
    pub fn load() -> Result<EvstoreConfig> {
        Self::load_from_paths(
            Self::user_config_path().as_deref(),
            &Self::project_config_path(),
        )
    }

    /// Load and merge the given layers; missing files are skipped.
    pub fn load_from_paths(user: Option<&Path>, project: &Path) -> Result<EvstoreConfig> {
        let mut raw = RawEvstoreConfig::default();

        // Layer 1: User config
        if let Some(user_path) = user
            && user_path.exists()
        {
            raw = Self::merge_raw(raw, Self::read_raw(user_path)?);
        }

        // Layer 2: Project config
        if project.exists() {
            raw = Self::merge_raw(raw, Self::read_raw(project)?);
        }

        Self::finalize(raw)
    }

    /// Get user config path (platform-specific)
    pub fn user_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "evstore").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get project config path
    /// Can be overridden with EVSTORE_CONFIG (useful for isolated e2e tests)
    pub fn project_config_path() -> PathBuf {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => PathBuf::from(path),
            Err(_) => PathBuf::from(".evstore/config.toml"),
        }
    }

    fn read_raw(path: &Path) -> Result<RawEvstoreConfig> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Merge two raw configs (overlay values override base only if explicitly set)
    fn merge_raw(base: RawEvstoreConfig, overlay: RawEvstoreConfig) -> RawEvstoreConfig {
        RawEvstoreConfig {
            storage: RawStorageConfig {
                data_dir: overlay.storage.data_dir.or(base.storage.data_dir),
                url: overlay.storage.url.or(base.storage.url),
                auth_token: overlay.storage.auth_token.or(base.storage.auth_token),
            },
            bus: RawBusSection {
                enabled: overlay.bus.enabled.or(base.bus.enabled),
                host: overlay.bus.host.or(base.bus.host),
                port: overlay.bus.port.or(base.bus.port),
                stream: overlay.bus.stream.or(base.bus.stream),
                username: overlay.bus.username.or(base.bus.username),
                password: overlay.bus.password.or(base.bus.password),
            },
            core: match (base.core, overlay.core) {
                (Some(base), Some(overlay)) => Some(merge_tables(base, overlay)),
                (base, overlay) => overlay.or(base),
            },
        }
    }

    /// Convert raw config to final config with defaults applied
    fn finalize(raw: RawEvstoreConfig) -> Result<EvstoreConfig> {
        let iggy = BusConfig::default();
        let core: EventStoreConfig = match raw.core {
            Some(table) => toml::Value::Table(table)
                .try_into()
                .context("Invalid [core] configuration")?,
            None => Default::default(),
        };

        Ok(EvstoreConfig {
            storage: StorageConfig {
                data_dir: raw.storage.data_dir.unwrap_or_else(default_data_dir),
                url: raw.storage.url,
                auth_token: raw.storage.auth_token,
            },
            bus: BusSection {
                enabled: raw.bus.enabled.unwrap_or(false),
                iggy: BusConfig {
                    host: raw.bus.host.unwrap_or(iggy.host),
                    port: raw.bus.port.unwrap_or(iggy.port),
                    stream: raw.bus.stream.unwrap_or(iggy.stream),
                    username: raw.bus.username.unwrap_or(iggy.username),
                    password: raw.bus.password.unwrap_or(iggy.password),
                    ..iggy
                },
            },
            core,
        })
    }
}

/// Recursively overlay `overlay` onto `base`. Non-table values replace.
fn merge_tables(mut base: toml::Table, overlay: toml::Table) -> toml::Table {
    for (key, value) in overlay {
        let merged = match (base.remove(&key), value) {
            (Some(toml::Value::Table(b)), toml::Value::Table(o)) => {
                toml::Value::Table(merge_tables(b, o))
            }
            (_, value) => value,
        };
        base.insert(key, merged);
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use evstore_core::config::ProjectionSource;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_missing_files_yield_defaults() {
        let dir = TempDir::new().unwrap();
        let config =
            ConfigLoader::load_from_paths(None, &dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.core, Default::default());
        assert!(!config.bus.enabled);
    }

    #[test]
    fn test_project_overrides_user() {
        let dir = TempDir::new().unwrap();
        let user = write(
            &dir,
            "user.toml",
            r#"
[storage]
data_dir = "/user/evstore"

[bus]
enabled = true
host = "user-host"

[core.cache]
ttl = "1m"
enabled = false
"#,
        );
        let project = write(
            &dir,
            "project.toml",
            r#"
[bus]
host = "project-host"

[core.cache]
ttl = "10s"

[core.projection]
source = "log"
"#,
        );

        let config = ConfigLoader::load_from_paths(Some(user.as_path()), &project).unwrap();

        assert_eq!(config.storage.data_dir, PathBuf::from("/user/evstore"));
        assert!(config.bus.enabled);
        assert_eq!(config.bus.iggy.host, "project-host");
        assert_eq!(config.bus.iggy.port, 8090);
        assert_eq!(config.core.cache.ttl, Duration::from_secs(10));
        assert!(!config.core.cache.enabled);
        assert_eq!(config.core.projection.source, ProjectionSource::Log);
    }

    #[test]
    fn test_invalid_core_section_is_reported() {
        let dir = TempDir::new().unwrap();
        let project = write(&dir, "bad.toml", "[core.cache]\nttl = \"soon\"\n");

        let err = ConfigLoader::load_from_paths(None, &project).unwrap_err();
        assert!(err.to_string().contains("[core]"));
    }

    #[test]
    fn test_merge_tables_is_recursive() {
        let base: toml::Table = toml::from_str("[a]\nx = 1\ny = 2\n").unwrap();
        let overlay: toml::Table = toml::from_str("[a]\ny = 3\n[b]\nz = 4\n").unwrap();
        let merged = merge_tables(base, overlay);
        assert_eq!(merged["a"]["x"].as_integer(), Some(1));
        assert_eq!(merged["a"]["y"].as_integer(), Some(3));
        assert_eq!(merged["b"]["z"].as_integer(), Some(4));
    }
}
