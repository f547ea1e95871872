//! On-disk registry storage
//!
//! The registry lives in a single JSON document. Loading never fails: a
//! missing file yields an empty registry and a malformed one is set aside and
//! replaced by an empty registry with a warning. Saving always rewrites the
//! whole document through a temporary file and a rename.

use chrono::Utc;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::migrate::migrate;
use crate::registry::Registry;

/// Registry file manager
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Create a store for the given registry file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Registry file path (for display purposes)
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and migrate the registry, falling back to an empty one
    pub fn load(&self) -> Registry {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("No registry at {:?}, starting empty", self.path);
                return Registry::new();
            }
            Err(e) => {
                tracing::warn!("Failed to read registry {:?}: {}; starting empty", self.path, e);
                return Registry::new();
            }
        };

        match Self::parse(&content) {
            Ok(registry) => registry,
            Err(e) => {
                tracing::warn!("Registry {:?} is malformed: {}; starting empty", self.path, e);
                self.set_aside(&content);
                Registry::new()
            }
        }
    }

    fn parse(content: &str) -> Result<Registry, ConfigError> {
        let raw: serde_json::Value = serde_json::from_str(content)?;
        Ok(migrate(raw)?)
    }

    /// Keep a copy of an unreadable registry before it gets overwritten
    fn set_aside(&self, content: &str) {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%SZ")));
        let backup = PathBuf::from(name);

        match fs::write(&backup, content) {
            Ok(()) => tracing::warn!("Saved unreadable registry to {:?}", backup),
            Err(e) => tracing::debug!("Could not save unreadable registry copy: {}", e),
        }
    }

    /// Write the full registry, replacing the previous file atomically
    pub fn save(&self, registry: &Registry) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(registry)?;

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let write_tmp = || -> io::Result<()> {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()
        };

        if let Err(source) = write_tmp().and_then(|()| fs::rename(&tmp_path, &self.path)) {
            let _ = fs::remove_file(&tmp_path);
            return Err(ConfigError::Io {
                path: self.path.clone(),
                source,
            });
        }

        tracing::debug!("Saved registry to {:?}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Protocol, Service, Tunnel, CURRENT_VERSION};
    use tempfile::TempDir;

    fn create_test_store() -> (ConfigStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = ConfigStore::new(temp_dir.path().join("flaretun").join("config.json"));
        (store, temp_dir)
    }

    fn sample_registry() -> Registry {
        let mut registry = Registry::new();
        registry.add_tunnel(Tunnel::new("t1", "one")).unwrap();
        registry.add_tunnel(Tunnel::new("t2", "two")).unwrap();
        registry.select_tunnel("t2").unwrap();
        registry
            .add_service("t2", Service::new("b.example.com", Protocol::Https, 8443).unwrap())
            .unwrap();
        registry
            .add_service("t2", Service::new("a.example.com", Protocol::Http, 3000).unwrap())
            .unwrap();
        registry.touch_last_used("t2");
        registry
    }

    #[test]
    fn test_load_missing_returns_empty() {
        let (store, _temp) = create_test_store();
        let registry = store.load();
        assert!(registry.is_empty());
        assert_eq!(registry.version, CURRENT_VERSION);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let (store, _temp) = create_test_store();
        let registry = sample_registry();

        store.save(&registry).unwrap();
        assert_eq!(store.load(), registry);
    }

    #[test]
    fn test_save_overwrites_previous_document() {
        let (store, _temp) = create_test_store();
        store.save(&sample_registry()).unwrap();

        let mut registry = store.load();
        registry.remove_tunnel("t2");
        store.save(&registry).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.tunnels.len(), 1);
        assert!(loaded.active_tunnel.is_none());
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_malformed_file_falls_back_to_empty() {
        let (store, temp) = create_test_store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "{ not json").unwrap();

        let registry = store.load();
        assert!(registry.is_empty());

        let backups: Vec<_> = fs::read_dir(temp.path().join("flaretun"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt-"))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::read_to_string(backups[0].path()).unwrap(), "{ not json");
    }

    #[test]
    fn test_wrong_shape_falls_back_to_empty() {
        let (store, _temp) = create_test_store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "[\"a\", \"b\"]").unwrap();

        assert!(store.load().is_empty());
    }

    #[test]
    fn test_legacy_file_is_migrated_on_load() {
        let (store, _temp) = create_test_store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(
            store.path(),
            r#"{"tunnelName":"t1","tunnelId":"abc","services":[{"hostname":"a.example.com","service":"http://localhost:3000"}]}"#,
        )
        .unwrap();

        let registry = store.load();
        assert_eq!(registry.active_id(), Some("abc"));

        // Saving writes the current shape only
        store.save(&registry).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], CURRENT_VERSION);
        assert!(raw.get("tunnelId").is_none());
        assert_eq!(raw["tunnels"]["abc"]["services"][0]["port"], 3000);
    }
}
