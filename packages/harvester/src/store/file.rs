//! File-backed state store: one JSON file per key.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::{validate_key, StateStore};
use crate::error::{StoreError, StoreResult};

/// Stores each key as `<dir>/<key>.json`.
///
/// Writes go to a sibling `.tmp` file that is synced and then renamed over
/// the target, so a crash leaves either the old or the new document.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn io_error(key: &str, source: std::io::Error) -> StoreError {
        StoreError::Io {
            key: key.to_string(),
            source,
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        validate_key(key)?;
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_error(key, e)),
        }
    }

    async fn save(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        validate_key(key)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Self::io_error(key, e))?;

        let target = self.path_for(key);
        let temp = self.dir.join(format!("{key}.json.tmp"));

        let write = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&temp, &target).await
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(Self::io_error(key, e));
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(key, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());

        assert!(store.load("suspended").await.unwrap().is_none());

        store.save("suspended", br#"{"a": 1}"#).await.unwrap();
        assert_eq!(
            store.load("suspended").await.unwrap().as_deref(),
            Some(&br#"{"a": 1}"#[..])
        );
        assert!(dir.path().join("suspended.json").exists());
        assert!(!dir.path().join("suspended.json.tmp").exists());

        store.remove("suspended").await.unwrap();
        assert!(!dir.path().join("suspended.json").exists());
        store.remove("suspended").await.unwrap();
    }

    #[tokio::test]
    async fn test_save_replaces_existing_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());

        store.save("failed_channels", b"[1]").await.unwrap();
        store.save("failed_channels", b"[1,2]").await.unwrap();

        assert_eq!(
            store.load("failed_channels").await.unwrap().as_deref(),
            Some(&b"[1,2]"[..])
        );
    }

    #[tokio::test]
    async fn test_creates_missing_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("nested").join("state"));

        store.save("last_id_a", b"{}").await.unwrap();
        assert!(store.path_for("last_id_a").exists());
    }

    #[tokio::test]
    async fn test_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());

        let err = store.save("../escape", b"{}").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }
}
