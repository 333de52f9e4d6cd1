use std::path::{Path, PathBuf};

use log::{debug, info};
use tokio::fs;

use crate::engine::models::InstallRecord;
use crate::env;

const INSTALL_RECORD_FILE: &str = "installed.json";

#[derive(Clone)]
pub struct StorageManager {
    base_dir: PathBuf,
}

impl StorageManager {
    pub fn new() -> Self {
        // Best-effort directory creation; failures are surfaced on write.
        let _ = env::ensure_base_dirs();
        Self::at(env::default_app_dir())
    }

    pub fn at(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base_dir.join("cache")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.base_dir.join("staging")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn viewer_page(&self) -> PathBuf {
        self.base_dir.join("viewer").join("index.html")
    }

    pub async fn read_install_record(&self) -> Option<InstallRecord> {
        let path = self.base_dir.join(INSTALL_RECORD_FILE);
        let bytes = fs::read(&path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(err) => {
                debug!("storage: ignoring unreadable {} ({err})", path.display());
                None
            }
        }
    }

    pub async fn write_install_record(&self, record: &InstallRecord) -> Result<(), String> {
        let path = self.base_dir.join(INSTALL_RECORD_FILE);
        fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| format!("unable to create state dir: {e}"))?;
        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| format!("unable to encode install record: {e}"))?;
        fs::write(&path, body)
            .await
            .map_err(|e| format!("unable to persist install record: {e}"))
    }

    pub async fn forget_install_record(&self) -> Result<bool, String> {
        let path = self.base_dir.join(INSTALL_RECORD_FILE);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(format!("failed to clear install record: {err}")),
        }
    }

    /// Remove downloads, staging, generated configs and the install record.
    pub async fn clean(&self) -> Result<Vec<PathBuf>, String> {
        let mut removed = Vec::new();
        for dir in [self.cache_dir(), self.staging_dir(), self.config_dir()] {
            if fs::metadata(&dir).await.is_ok() {
                fs::remove_dir_all(&dir)
                    .await
                    .map_err(|e| format!("failed to remove {}: {e}", dir.display()))?;
                removed.push(dir);
            }
        }

        let record = self.base_dir.join(INSTALL_RECORD_FILE);
        if fs::metadata(&record).await.is_ok() {
            fs::remove_file(&record)
                .await
                .map_err(|e| format!("failed to clear install record: {e}"))?;
            removed.push(record);
        }

        info!("storage: removed {} item(s)", removed.len());
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> InstallRecord {
        InstallRecord {
            version: "1.5.0".into(),
            packages: vec!["zenohd".into()],
            installed_at: "2026-10-19T10:00:00+00:00".into(),
        }
    }

    #[tokio::test]
    async fn persists_install_record() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::at(dir.path());
        assert!(storage.read_install_record().await.is_none());

        storage.write_install_record(&record()).await.unwrap();
        assert_eq!(storage.read_install_record().await, Some(record()));
    }

    #[tokio::test]
    async fn forgets_install_record_once() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::at(dir.path());
        storage.write_install_record(&record()).await.unwrap();
        assert!(storage.forget_install_record().await.unwrap());
        assert!(!storage.forget_install_record().await.unwrap());
    }

    #[tokio::test]
    async fn ignores_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(INSTALL_RECORD_FILE), b"garbage").unwrap();
        assert!(StorageManager::at(dir.path()).read_install_record().await.is_none());
    }

    #[tokio::test]
    async fn clean_removes_generated_state_only() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::at(dir.path());
        std::fs::create_dir_all(storage.cache_dir()).unwrap();
        std::fs::create_dir_all(storage.config_dir()).unwrap();
        std::fs::create_dir_all(storage.logs_dir()).unwrap();
        storage.write_install_record(&record()).await.unwrap();

        let removed = storage.clean().await.unwrap();
        assert_eq!(removed.len(), 3);
        assert!(!storage.cache_dir().exists());
        assert!(storage.logs_dir().exists());
        assert!(storage.read_install_record().await.is_none());
    }
}
