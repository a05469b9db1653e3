//! Key-value persistence for scheduler state.
//!
//! Every piece of durable state (cursors, suspension windows, failure ledger)
//! is a single JSON document under its own key, replaced atomically:
//! - `FileStateStore`: one file per key in a state directory
//! - `MemoryStateStore`: in-memory map for tests

pub mod file;
pub mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{StoreError, StoreResult};

/// Key under which suspension windows are persisted.
pub const SUSPENDED_KEY: &str = "suspended";

/// Key under which the failure ledger is persisted.
pub const FAILED_CHANNELS_KEY: &str = "failed_channels";

/// Minimal persistence interface with atomic replace semantics.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the document stored under `key`, if any.
    async fn load(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Replace the document under `key`. Readers never observe a partial write.
    async fn save(&self, key: &str, bytes: &[u8]) -> StoreResult<()>;

    /// Delete the document under `key`. Missing keys are not an error.
    async fn remove(&self, key: &str) -> StoreResult<()>;
}

/// Load and decode a JSON document.
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> StoreResult<Option<T>> {
    match store.load(key).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

/// Encode and atomically save a JSON document.
pub async fn save_json<T: Serialize + ?Sized>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
) -> StoreResult<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Corrupt {
        key: key.to_string(),
        source,
    })?;
    store.save(key, &bytes).await
}

/// Suffix of the key an unreadable document is moved to.
pub const QUARANTINE_SUFFIX: &str = ".corrupt";

/// Move the document under `key` to `{key}.corrupt` so a fresh document can
/// be written without destroying the old bytes. Returns the new key.
pub async fn quarantine(store: &dyn StateStore, key: &str) -> StoreResult<String> {
    let target = format!("{key}{QUARANTINE_SUFFIX}");
    if let Some(bytes) = store.load(key).await? {
        store.save(&target, &bytes).await?;
    }
    store.remove(key).await?;
    Ok(target)
}

/// Keys become file names, so they are restricted to a safe alphabet.
pub(crate) fn validate_key(key: &str) -> StoreResult<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// Map an arbitrary account name onto the key alphabet.
pub fn sanitize_key_part(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("last_id_session1").is_ok());
        assert!(validate_key("failed_channels").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key(".hidden").is_err());
        assert!(validate_key("a/b").is_err());
    }

    #[test]
    fn test_sanitize_key_part() {
        assert_eq!(sanitize_key_part("acc-1"), "acc-1");
        assert_eq!(sanitize_key_part("+1 555/77"), "_1_555_77");
    }

    #[tokio::test]
    async fn test_json_helpers_round_trip_through_store() {
        let store = MemoryStateStore::new();
        save_json(&store, "numbers", &vec![1, 2, 3]).await.unwrap();

        let loaded: Option<Vec<i32>> = load_json(&store, "numbers").await.unwrap();
        assert_eq!(loaded, Some(vec![1, 2, 3]));

        let missing: Option<Vec<i32>> = load_json(&store, "absent").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_document_is_reported() {
        let store = MemoryStateStore::new();
        store.save("broken", b"{not json").await.unwrap();

        let err = load_json::<Vec<i32>>(&store, "broken").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_quarantine_keeps_original_bytes() {
        let store = MemoryStateStore::new();
        store.save("broken", b"{not json").await.unwrap();

        let moved = quarantine(&store, "broken").await.unwrap();

        assert_eq!(moved, "broken.corrupt");
        assert!(!store.contains("broken"));
        assert_eq!(store.get("broken.corrupt").unwrap(), b"{not json".to_vec());
    }

    #[tokio::test]
    async fn test_failed_quarantine_leaves_document_in_place() {
        let store = MemoryStateStore::new();
        store.save("broken", b"{not json").await.unwrap();
        store.fail_saves_for("broken.corrupt");

        assert!(quarantine(&store, "broken").await.is_err());
        assert_eq!(store.get("broken").unwrap(), b"{not json".to_vec());
    }
}
