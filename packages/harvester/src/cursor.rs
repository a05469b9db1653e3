//! Per-account pagination cursors.
//!
//! Each account keeps its own map of channel identity to the last sequence id
//! it delivered, persisted under `last_id_<account>`. Cursors only move
//! forward.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::store::{load_json, quarantine, sanitize_key_part, save_json, StateStore};

/// State key for an account's cursors.
pub fn cursor_key(account: &str) -> String {
    format!("last_id_{}", sanitize_key_part(account))
}

/// Durable identity → last sequence id map owned by one account's worker.
pub struct CursorStore {
    account: String,
    key: String,
    store: Arc<dyn StateStore>,
    cursors: BTreeMap<String, i64>,
    dirty: bool,
}

impl std::fmt::Debug for CursorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorStore")
            .field("account", &self.account)
            .field("key", &self.key)
            .field("cursors", &self.cursors)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl CursorStore {
    /// Start with no cursors.
    pub fn empty(account: impl Into<String>, store: Arc<dyn StateStore>) -> Self {
        let account = account.into();
        Self {
            key: cursor_key(&account),
            account,
            store,
            cursors: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Load the account's persisted cursors.
    ///
    /// A document that does not decode is moved to `{key}.corrupt` and the
    /// account starts from empty cursors. Any other read failure is returned,
    /// and so is a failed move: the old document is never overwritten.
    pub async fn load(account: impl Into<String>, store: Arc<dyn StateStore>) -> StoreResult<Self> {
        let mut cursors = Self::empty(account, store);
        match load_json::<BTreeMap<String, i64>>(cursors.store.as_ref(), &cursors.key).await {
            Ok(Some(saved)) => {
                cursors.cursors = saved
                    .into_iter()
                    .filter(|(_, id)| *id >= 0)
                    .collect();
            }
            Ok(None) => {}
            Err(StoreError::Corrupt { source, .. }) => {
                let moved = quarantine(cursors.store.as_ref(), &cursors.key).await?;
                warn!(
                    account = %cursors.account,
                    error = %source,
                    moved_to = %moved,
                    "cursor document unreadable, moved aside"
                );
            }
            Err(e) => return Err(e),
        }
        debug!(
            account = %cursors.account,
            channels = cursors.cursors.len(),
            "loaded cursors"
        );
        Ok(cursors)
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Last delivered sequence id, 0 when the channel was never seen.
    pub fn get(&self, identity: &str) -> i64 {
        self.cursors.get(identity).copied().unwrap_or(0)
    }

    /// Move the cursor forward. Returns false (and changes nothing) when `id`
    /// is not beyond the current position.
    pub fn advance(&mut self, identity: &str, id: i64) -> bool {
        if id <= self.get(identity) {
            return false;
        }
        self.cursors.insert(identity.to_string(), id);
        self.dirty = true;
        true
    }

    /// Whether some advance has not been persisted yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    /// Write the full map. On failure the store stays dirty so a later call
    /// retries.
    pub async fn persist(&mut self) -> StoreResult<()> {
        save_json(self.store.as_ref(), &self.key, &self.cursors).await?;
        self.dirty = false;
        Ok(())
    }
}
