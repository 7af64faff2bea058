//! Settings Storage
//!
//! Reads and writes the engine settings file.
//! Location: ~/.shelltether on macOS/Linux, %APPDATA%\shelltether on Windows

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::{EngineSettings, SETTINGS_VERSION};

/// Settings storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Settings version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("shelltether"));
        }
        dirs::home_dir()
            .map(|home| home.join(".shelltether"))
            .ok_or(StorageError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".shelltether"))
            .ok_or(StorageError::NoConfigDir)
    }
}

pub fn settings_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("settings.json"))
}

pub struct SettingsStorage {
    path: PathBuf,
}

impl SettingsStorage {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: settings_file()?,
        })
    }

    /// Storage at a custom path (tests, embedding applications)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings from disk.
    ///
    /// A missing file yields defaults. A corrupted file is backed up next to the
    /// original and defaults are returned.
    pub async fn load(&self) -> Result<EngineSettings, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(EngineSettings::default())
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        match serde_json::from_str::<EngineSettings>(&contents) {
            Ok(settings) if settings.version > SETTINGS_VERSION => {
                Err(StorageError::VersionTooNew {
                    found: settings.version,
                    supported: SETTINGS_VERSION,
                })
            }
            Ok(settings) => Ok(settings),
            Err(e) => {
                tracing::warn!("Settings file corrupted: {}", e);
                match self.backup().await {
                    Ok(backup_path) => tracing::warn!(
                        "Corrupted settings backed up to {:?}, using defaults",
                        backup_path
                    ),
                    Err(backup_err) => {
                        tracing::error!("Failed to backup corrupted settings: {}", backup_err)
                    }
                }
                Ok(EngineSettings::default())
            }
        }
    }

    /// Save settings (temp file + rename)
    pub async fn save(&self, settings: &EngineSettings) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(settings)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if fs::metadata(&self.path).await.is_ok() {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::ConflictPolicy;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_nonexistent_returns_defaults() {
        let temp = tempdir().unwrap();
        let storage = SettingsStorage::with_path(temp.path().join("settings.json"));

        let settings = storage.load().await.unwrap();
        assert_eq!(settings, EngineSettings::default());
        assert_eq!(settings.transfer.conflict_policy, ConflictPolicy::Ask);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let storage = SettingsStorage::with_path(temp.path().join("nested").join("settings.json"));

        let mut settings = EngineSettings::default();
        settings.transfer.max_concurrent = 5;
        settings.transfer.conflict_policy = ConflictPolicy::Rename;
        settings.connection.reconnection.max_attempts = 9;
        storage.save(&settings).await.unwrap();

        let loaded = storage.load().await.unwrap();
        assert_eq!(loaded, settings);
    }

    #[tokio::test]
    async fn test_corrupted_file_is_backed_up() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        let storage = SettingsStorage::with_path(path);

        let settings = storage.load().await.unwrap();
        assert_eq!(settings, EngineSettings::default());

        let backups = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("backup"))
            .count();
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(&path, r#"{ "version": 99 }"#).unwrap();
        let storage = SettingsStorage::with_path(path);

        match storage.load().await {
            Err(StorageError::VersionTooNew { found, supported }) => {
                assert_eq!(found, 99);
                assert_eq!(supported, SETTINGS_VERSION);
            }
            other => panic!("expected VersionTooNew, got {:?}", other.map(|_| ())),
        }
    }
}
