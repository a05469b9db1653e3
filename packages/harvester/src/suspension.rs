//! Account-level rate-limit suspension.
//!
//! When the source tells a session to back off, the whole account is
//! suspended until a wake time (requested wait plus random jitter). Workers
//! check their own account's window before pulling work and sleep in bounded
//! slices so shutdown stays responsive. Windows survive restarts via the
//! `suspended` state key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::store::{load_json, quarantine, save_json, StateStore, SUSPENDED_KEY};

/// Jitter and sleep settings for suspensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspensionPolicy {
    /// Lower bound of the random delay added to every requested wait
    pub jitter_min: Duration,
    /// Upper bound of the random delay added to every requested wait
    pub jitter_max: Duration,
    /// Longest single sleep while waiting for a wake time
    pub sleep_slice: Duration,
}

impl Default for SuspensionPolicy {
    fn default() -> Self {
        Self {
            jitter_min: Duration::from_secs(60),
            jitter_max: Duration::from_secs(300),
            sleep_slice: Duration::from_secs(60),
        }
    }
}

impl SuspensionPolicy {
    pub fn with_jitter(mut self, min: Duration, max: Duration) -> Self {
        self.jitter_min = min.min(max);
        self.jitter_max = min.max(max);
        self
    }

    pub fn with_sleep_slice(mut self, slice: Duration) -> Self {
        self.sleep_slice = slice.max(Duration::from_millis(1));
        self
    }

    fn sample_jitter(&self) -> Duration {
        let min = self.jitter_min.as_millis() as u64;
        let max = self.jitter_max.as_millis() as u64;
        Duration::from_millis(fastrand::u64(min..=max.max(min)))
    }
}

/// Shared registry of account wake times.
pub struct SuspensionManager {
    windows: Mutex<HashMap<String, DateTime<Utc>>>,
    store: Arc<dyn StateStore>,
    policy: SuspensionPolicy,
    persist_lock: tokio::sync::Mutex<()>,
    /// Set when the persisted document could not be read or moved aside
    read_only: bool,
}

impl SuspensionManager {
    pub fn new(store: Arc<dyn StateStore>, policy: SuspensionPolicy) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            store,
            policy,
            persist_lock: tokio::sync::Mutex::new(()),
            read_only: false,
        }
    }

    /// Restore windows persisted by an earlier run. Expired entries are dropped.
    ///
    /// A document that does not decode is moved to `suspended.corrupt`. When
    /// the document cannot be read or moved, windows are kept in memory only
    /// and [`persist`](Self::persist) refuses to write.
    pub async fn load(store: Arc<dyn StateStore>, policy: SuspensionPolicy) -> Self {
        let mut manager = Self::new(store, policy);
        match load_json::<HashMap<String, DateTime<Utc>>>(manager.store.as_ref(), SUSPENDED_KEY)
            .await
        {
            Ok(Some(saved)) => {
                let now = Utc::now();
                let mut windows = manager.lock_windows();
                for (account, wake_at) in saved.into_iter().filter(|(_, at)| *at > now) {
                    info!(account = %account, wake_at = %wake_at, "account still suspended from previous run");
                    windows.insert(account, wake_at);
                }
            }
            Ok(None) => {}
            Err(StoreError::Corrupt { source, .. }) => {
                match quarantine(manager.store.as_ref(), SUSPENDED_KEY).await {
                    Ok(moved) => warn!(
                        error = %source,
                        moved_to = %moved,
                        "suspension document unreadable, moved aside"
                    ),
                    Err(e) => {
                        error!(
                            error = %e,
                            "suspension document could not be moved aside, windows will not persist"
                        );
                        manager.read_only = true;
                    }
                }
            }
            Err(e) => {
                error!(
                    error = %e,
                    "failed to read suspension windows, windows will not persist"
                );
                manager.read_only = true;
            }
        }
        manager
    }

    pub fn policy(&self) -> &SuspensionPolicy {
        &self.policy
    }

    fn lock_windows(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wake time for `account` if it is still in the future. A past entry is
    /// removed on the way.
    pub fn wake_time(&self, account: &str) -> Option<DateTime<Utc>> {
        let mut windows = self.lock_windows();
        match windows.get(account) {
            Some(wake_at) if *wake_at > Utc::now() => Some(*wake_at),
            Some(_) => {
                windows.remove(account);
                None
            }
            None => None,
        }
    }

    pub fn is_suspended(&self, account: &str) -> bool {
        self.wake_time(account).is_some()
    }

    /// Suspend `account` for `seconds` plus jitter and persist the windows.
    /// Returns the effective wake time (an existing later window is kept).
    pub async fn suspend(&self, account: &str, seconds: u64) -> DateTime<Utc> {
        let jitter = self.policy.sample_jitter();
        let total_ms = seconds
            .saturating_mul(1000)
            .saturating_add(jitter.as_millis() as u64)
            .min(i64::MAX as u64) as i64;
        let now = Utc::now();
        let candidate = now
            .checked_add_signed(TimeDelta::milliseconds(total_ms))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let wake_at = {
            let mut windows = self.lock_windows();
            let entry = windows.entry(account.to_string()).or_insert(candidate);
            if candidate > *entry {
                *entry = candidate;
            }
            *entry
        };

        warn!(
            account = %account,
            requested_secs = seconds,
            jitter_secs = jitter.as_secs(),
            wake_at = %wake_at,
            "account rate limited, suspending"
        );

        if let Err(e) = self.persist().await {
            warn!(account = %account, error = %e, "failed to persist suspension windows");
        }
        wake_at
    }

    /// Sleep until `account` is awake. Returns false if `cancel` fired first.
    pub async fn wait_until_awake(&self, account: &str, cancel: &CancellationToken) -> bool {
        let mut announced = false;
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let Some(wake_at) = self.wake_time(account) else {
                if announced {
                    info!(account = %account, "account awake, resuming");
                }
                return true;
            };

            let remaining = (wake_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                continue;
            }
            if !announced {
                info!(
                    account = %account,
                    wake_at = %wake_at,
                    remaining_secs = remaining.as_secs(),
                    "account suspended, waiting"
                );
                announced = true;
            }

            let slice = remaining.min(self.policy.sleep_slice);
            debug!(account = %account, slice_ms = slice.as_millis() as u64, "suspension sleep");
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(slice) => {}
            }
        }
    }

    /// Live (non-expired) windows.
    pub fn snapshot(&self) -> HashMap<String, DateTime<Utc>> {
        let now = Utc::now();
        self.lock_windows()
            .iter()
            .filter(|(_, wake_at)| **wake_at > now)
            .map(|(account, wake_at)| (account.clone(), *wake_at))
            .collect()
    }

    /// Write the live windows; an empty set removes the persisted document.
    pub async fn persist(&self) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::Unreadable {
                key: SUSPENDED_KEY.to_string(),
            });
        }
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            self.store.remove(SUSPENDED_KEY).await
        } else {
            save_json(self.store.as_ref(), SUSPENDED_KEY, &snapshot).await
        }
    }
}
