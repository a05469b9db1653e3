//! Durable ledger of channels that could not be processed.
//!
//! Saves are load-merge-replace: the persisted set is read, new entries are
//! merged by identity (first write wins) and the whole set is written back
//! atomically. An empty set removes the document. Channels re-queued from the
//! ledger that later complete are resolved out of it on the next save.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::StoreResult;
use crate::store::{load_json, save_json, StateStore, FAILED_CHANNELS_KEY};
use crate::types::FailureRecord;

#[derive(Default)]
struct LedgerState {
    /// Recorded this run, not yet persisted
    pending: Vec<FailureRecord>,
    /// Completed this run; dropped from the persisted set on the next save
    resolved: HashSet<String>,
    /// Identities known to be in the persisted set
    known: HashSet<String>,
}

/// Shared failure ledger.
pub struct FailureLedger {
    store: Arc<dyn StateStore>,
    state: Mutex<LedgerState>,
}

impl FailureLedger {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Read the persisted set.
    pub async fn load(&self) -> StoreResult<Vec<FailureRecord>> {
        let records = self.read_persisted().await?;
        let mut state = self.state.lock().await;
        state
            .known
            .extend(records.iter().map(|r| r.username.clone()));
        Ok(records)
    }

    /// Add a failure and save immediately. On a failed save the entry stays
    /// pending for [`flush`](Self::flush).
    pub async fn record(&self, record: FailureRecord) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let duplicate = state.pending.iter().any(|r| r.username == record.username);
        if !duplicate {
            info!(
                channel = %record.username,
                kind = record.kind.as_str(),
                reason = %record.reason,
                "recording failed channel"
            );
            state.resolved.remove(&record.username);
            state.pending.push(record);
        }
        self.merge_and_save(&mut state).await
    }

    /// Mark a channel as completed. Only channels that are in the persisted
    /// set are tracked.
    pub async fn resolve(&self, identity: &str) {
        let mut state = self.state.lock().await;
        if state.known.contains(identity) && !state.pending.iter().any(|r| r.username == identity)
        {
            state.resolved.insert(identity.to_string());
        }
    }

    /// Persist anything still pending.
    pub async fn flush(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.pending.is_empty() && state.resolved.is_empty() {
            return Ok(());
        }
        self.merge_and_save(&mut state).await
    }

    /// Number of entries waiting to be persisted.
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    async fn read_persisted(&self) -> StoreResult<Vec<FailureRecord>> {
        Ok(
            load_json::<Vec<FailureRecord>>(self.store.as_ref(), FAILED_CHANNELS_KEY)
                .await?
                .unwrap_or_default(),
        )
    }

    async fn merge_and_save(&self, state: &mut LedgerState) -> StoreResult<()> {
        let existing = self.read_persisted().await?;

        let mut seen = HashSet::new();
        let merged: Vec<FailureRecord> = existing
            .into_iter()
            .filter(|r| !state.resolved.contains(&r.username))
            .chain(state.pending.iter().cloned())
            .filter(|r| seen.insert(r.username.clone()))
            .collect();

        if merged.is_empty() {
            self.store.remove(FAILED_CHANNELS_KEY).await?;
        } else {
            save_json(self.store.as_ref(), FAILED_CHANNELS_KEY, &merged).await?;
        }

        debug!(
            entries = merged.len(),
            added = state.pending.len(),
            resolved = state.resolved.len(),
            "failure ledger saved"
        );
        state.known = seen;
        state.pending.clear();
        state.resolved.clear();
        Ok(())
    }
}

impl Drop for FailureLedger {
    fn drop(&mut self) {
        if let Ok(state) = self.state.try_lock() {
            if !state.pending.is_empty() {
                warn!(
                    pending = state.pending.len(),
                    "failure ledger dropped with unsaved entries"
                );
            }
        }
    }
}
