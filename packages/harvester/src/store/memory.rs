//! In-memory state store for testing and development.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{validate_key, StateStore};
use crate::error::{StoreError, StoreResult};

/// In-memory state store.
///
/// Clones share the same map, so a test can keep a handle and inspect what a
/// run persisted, or hand the same state to a second run to simulate a
/// restart. Saves can be made to fail for keys with a given prefix.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    documents: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    failing_prefixes: Arc<RwLock<Vec<String>>>,
}

impl MemoryStateStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every save to a key starting with `prefix` fail.
    pub fn fail_saves_for(&self, prefix: impl Into<String>) {
        self.failing_prefixes.write().unwrap().push(prefix.into());
    }

    /// Let saves succeed again.
    pub fn clear_failures(&self) {
        self.failing_prefixes.write().unwrap().clear();
    }

    /// Raw document under `key`, if any.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.documents.read().unwrap().get(key).cloned()
    }

    /// Decoded JSON document under `key`, if any.
    pub fn get_json(&self, key: &str) -> Option<serde_json::Value> {
        self.get(key)
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.documents.read().unwrap().contains_key(key)
    }

    /// Get the number of stored documents.
    pub fn len(&self) -> usize {
        self.documents.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.get(key))
    }

    async fn save(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        validate_key(key)?;
        let failing = self
            .failing_prefixes
            .read()
            .unwrap()
            .iter()
            .any(|prefix| key.starts_with(prefix.as_str()));
        if failing {
            return Err(StoreError::Io {
                key: key.to_string(),
                source: std::io::Error::other("simulated write failure"),
            });
        }
        self.documents
            .write()
            .unwrap()
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        self.documents.write().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = MemoryStateStore::new();
        let other = store.clone();

        store.save("k", b"v").await.unwrap();
        assert_eq!(other.get("k"), Some(b"v".to_vec()));

        other.remove("k").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_simulated_save_failure() {
        let store = MemoryStateStore::new();
        store.fail_saves_for("last_id_");

        assert!(store.save("last_id_a", b"{}").await.is_err());
        assert!(store.save("suspended", b"{}").await.is_ok());

        store.clear_failures();
        assert!(store.save("last_id_a", b"{}").await.is_ok());
    }
}
