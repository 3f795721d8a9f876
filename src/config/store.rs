use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::AppConfig;
use crate::error::{CameraError, Result};

impl AppConfig {
    /// Read a JSON configuration file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&text).map_err(|e| {
            CameraError::Config(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Write the configuration as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// Configuration store backed by a JSON file
///
/// Readers get a shared snapshot; writers persist first, then swap the
/// snapshot.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    cache: Arc<RwLock<Arc<AppConfig>>>,
}

impl ConfigStore {
    /// Open the store at `path`, writing the defaults when the file does not
    /// exist yet
    pub fn open(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            AppConfig::load(path)?
        } else {
            let config = AppConfig::default();
            config.save(path)?;
            info!("Created default configuration at {}", path.display());
            config
        };
        Ok(Self {
            path: path.to_path_buf(),
            cache: Arc::new(RwLock::new(Arc::new(config))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current configuration snapshot
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.read().clone()
    }

    /// Replace the whole configuration
    pub fn set(&self, config: AppConfig) -> Result<()> {
        config.validate()?;
        config.save(&self.path)?;
        *self.cache.write() = Arc::new(config);
        Ok(())
    }

    /// Read-modify-write; the last writer wins
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (*self.get()).clone();
        f(&mut config);
        self.set(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::profile::Facing;
    use tempfile::tempdir;

    #[test]
    fn test_config_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conf").join("capture.json");

        let store = ConfigStore::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(*store.get(), AppConfig::default());

        store
            .update(|c| {
                c.camera.facing = Facing::Front;
                c.camera.buffer_count = 6;
            })
            .unwrap();

        let reopened = ConfigStore::open(&path).unwrap();
        assert_eq!(reopened.get().camera.facing, Facing::Front);
        assert_eq!(reopened.get().camera.buffer_count, 6);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("capture.json");
        fs::write(&path, r#"{"camera": {"device": "/dev/video5", "zero_copy": false}}"#).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.camera.device, "/dev/video5");
        assert!(!config.camera.zero_copy);
        assert_eq!(config.camera.buffer_count, 4);
        assert_eq!(config.camera.frame_timeout_ms, 5000);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("capture.json");

        fs::write(&path, r#"{"camera": {"buffer_count": 0}}"#).unwrap();
        assert!(matches!(AppConfig::load(&path), Err(CameraError::Config(_))));

        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(AppConfig::load(&path), Err(CameraError::Config(_))));

        let missing = dir.path().join("missing.json");
        assert!(matches!(AppConfig::load(&missing), Err(CameraError::Io(_))));

        let store = ConfigStore::open(&dir.path().join("ok.json")).unwrap();
        assert!(store.update(|c| c.camera.autofocus_poll_ms = 0).is_err());
        assert_eq!(store.get().camera.autofocus_poll_ms, 100);
    }
}
