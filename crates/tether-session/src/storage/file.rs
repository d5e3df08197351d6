//! File-backed identity storage (feature: file).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tether_core::{IdentityStore, InstanceId, StorageError};

const APP_DIR: &str = "tether";
const IDENTITY_FILE: &str = "instance-id";

/// Stores the identity as a single line of text.
///
/// Writes go to a sibling temp file first and are renamed into place so a
/// crash never leaves a half-written identity.
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    /// Store at an explicit path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store under the platform data directory.
    ///
    /// # Errors
    /// Returns error if the platform has no data directory.
    pub fn in_data_dir() -> Result<Self, StorageError> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| StorageError::Unavailable("no data directory".to_string()))?;
        Ok(Self::new(base.join(APP_DIR).join(IDENTITY_FILE)))
    }

    /// Path of the identity file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl IdentityStore for FileIdentityStore {
    async fn load(&self) -> Result<Option<InstanceId>, StorageError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(None),
            Ok(raw) => InstanceId::parse(&raw).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, id: InstanceId) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, format!("{id}\n")).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileIdentityStore::new(dir.path().join("nested").join("id"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileIdentityStore::new(dir.path().join("nested").join("id"));
        let id = InstanceId::generate();
        store.save(id).await.unwrap();

        let reopened = FileIdentityStore::new(store.path());
        assert_eq!(reopened.load().await.unwrap(), Some(id));

        reopened.clear().await.unwrap();
        assert!(reopened.load().await.unwrap().is_none());
        tokio_test::assert_ok!(reopened.clear().await);
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id");
        std::fs::write(&path, "garbage").unwrap();
        let store = FileIdentityStore::new(&path);
        assert!(matches!(store.load().await, Err(StorageError::Corrupt(_))));
    }
}
