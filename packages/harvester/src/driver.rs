//! Run driver.
//!
//! Builds the work list from the source channel list and the failure ledger,
//! starts one [`SessionWorker`] per account and waits until the queue has
//! settled (or the run is interrupted) before asking the workers to stop.
//!
//! ```text
//! Driver::run
//!     │
//!     ├─► load ledger + suspension windows
//!     ├─► build work list, fill queue
//!     ├─► spawn one worker per account
//!     ├─► queue drained / interrupted ─► one shutdown signal per live worker
//!     └─► join workers, flush ledger, build RunSummary
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{AccountConfig, LedgerRequeue};
use crate::context::CrawlContext;
use crate::error::{AccountError, ConfigError};
use crate::fetch::FetchConfig;
use crate::ledger::FailureLedger;
use crate::queue::ChannelQueue;
use crate::stats::{RunStats, RunSummary};
use crate::store::StateStore;
use crate::suspension::{SuspensionManager, SuspensionPolicy};
use crate::traits::{RecordSink, SourceConnector};
use crate::types::{ChannelRef, ChannelTask, FailureKind, FailureRecord};
use crate::worker::{RetryPolicy, SessionWorker, WorkerExit};

/// Merge the source list with prior failures.
///
/// Source channels come first, in order. Ledger entries the policy re-queues
/// are appended after them. Identities appear once.
pub fn build_work_list(
    channels: &[ChannelRef],
    failures: &[FailureRecord],
    policy: LedgerRequeue,
) -> Vec<ChannelRef> {
    let failed: HashMap<&str, FailureKind> = failures
        .iter()
        .map(|f| (f.username.as_str(), f.kind))
        .collect();

    let mut seen = HashSet::new();
    let mut work = Vec::with_capacity(channels.len() + failures.len());

    for channel in channels {
        if let Some(kind) = failed.get(channel.username.as_str()) {
            if policy.skips(*kind) {
                info!(channel = %channel.username, kind = kind.as_str(), "skipping channel from failure ledger");
                continue;
            }
        }
        if seen.insert(channel.username.clone()) {
            work.push(channel.clone());
        }
    }

    for failure in failures {
        if policy.requeues(failure.kind) && seen.insert(failure.username.clone()) {
            work.push(failure.channel());
        }
    }

    work
}

pub struct Driver {
    connector: Arc<dyn SourceConnector>,
    sink: Arc<dyn RecordSink>,
    store: Arc<dyn StateStore>,
    fetch: FetchConfig,
    retry: RetryPolicy,
    suspension: SuspensionPolicy,
    ledger_requeue: LedgerRequeue,
    cancel: CancellationToken,
}

impl Driver {
    pub fn new(
        connector: Arc<dyn SourceConnector>,
        sink: Arc<dyn RecordSink>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            connector,
            sink,
            store,
            fetch: FetchConfig::default(),
            retry: RetryPolicy::default(),
            suspension: SuspensionPolicy::default(),
            ledger_requeue: LedgerRequeue::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_fetch(mut self, fetch: FetchConfig) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_suspension(mut self, suspension: SuspensionPolicy) -> Self {
        self.suspension = suspension;
        self
    }

    pub fn with_ledger_requeue(mut self, policy: LedgerRequeue) -> Self {
        self.ledger_requeue = policy;
        self
    }

    /// Use an externally owned shutdown token.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle that interrupts the run when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Crawl every channel with the given accounts until the queue settles.
    pub async fn run(
        self,
        accounts: Vec<AccountConfig>,
        channels: Vec<ChannelRef>,
    ) -> Result<RunSummary, ConfigError> {
        if accounts.is_empty() {
            return Err(ConfigError::Invalid {
                var: "accounts",
                reason: "at least one account is required".into(),
            });
        }

        let run_id = Uuid::now_v7();
        let started = Instant::now();

        let ledger = FailureLedger::new(self.store.clone());
        let failures = if self.ledger_requeue == LedgerRequeue::None {
            Vec::new()
        } else {
            match ledger.load().await {
                Ok(failures) => failures,
                Err(e) => {
                    warn!(error = %e, "ignoring unreadable failure ledger");
                    Vec::new()
                }
            }
        };
        let work = build_work_list(&channels, &failures, self.ledger_requeue);

        info!(
            run_id = %run_id,
            accounts = accounts.len(),
            source_channels = channels.len(),
            ledger_entries = failures.len(),
            ledger_requeue = self.ledger_requeue.as_str(),
            queued = work.len(),
            "harvest run starting"
        );

        let ctx = Arc::new(CrawlContext {
            queue: ChannelQueue::with_tasks(work.into_iter().map(ChannelTask::new)),
            suspensions: SuspensionManager::load(self.store.clone(), self.suspension.clone())
                .await,
            ledger,
            stats: RunStats::new(),
            sink: self.sink.clone(),
            store: self.store.clone(),
            fetch: self.fetch.clone(),
            retry: self.retry.clone(),
            cancel: self.cancel.clone(),
        });

        let mut workers = FuturesUnordered::new();
        for account in accounts {
            let session = account.session.clone();
            let worker = SessionWorker::new(account, self.connector.clone(), ctx.clone());
            let handle = tokio::spawn(worker.run());
            workers.push(async move { (session, handle.await) });
        }

        let mut live = workers.len();
        let mut shutdown_sent = false;
        let mut account_errors = Vec::new();

        loop {
            tokio::select! {
                _ = ctx.queue.wait_drained(), if !shutdown_sent => {
                    info!(workers = live, "queue drained, stopping workers");
                    ctx.queue.request_shutdown(live);
                    shutdown_sent = true;
                }
                _ = self.cancel.cancelled(), if !shutdown_sent => {
                    warn!(workers = live, "interrupted, stopping workers");
                    ctx.queue.request_shutdown(live);
                    shutdown_sent = true;
                }
                joined = workers.next() => {
                    let Some((session, joined)) = joined else {
                        break;
                    };
                    live -= 1;
                    let result = joined.unwrap_or_else(|e| {
                        error!(account = %session, error = %e, "session worker panicked");
                        ctx.stats.record_failed_account();
                        Err(AccountError::Aborted {
                            account: session.clone(),
                            reason: e.to_string(),
                        })
                    });
                    match result {
                        Ok(WorkerExit::Drained) | Ok(WorkerExit::Interrupted) => {}
                        Err(e) => account_errors.push(e.to_string()),
                    }
                }
            }
        }

        let pending = ctx.queue.pending_tasks();
        if !pending.is_empty() && !self.cancel.is_cancelled() {
            warn!(pending = pending.len(), "no session left to process queued channels");
        }

        if let Err(e) = ctx.ledger.flush().await {
            error!(error = %e, "failed to flush failure ledger");
        }
        if let Err(e) = ctx.suspensions.persist().await {
            error!(error = %e, "failed to persist suspension windows");
        }

        let summary = RunSummary {
            run_id,
            stats: ctx.stats.snapshot(),
            account_errors,
            pending_channels: pending.len(),
            interrupted: self.cancel.is_cancelled(),
            elapsed: started.elapsed(),
        };
        info!(
            run_id = %run_id,
            processed = summary.stats.channels_processed,
            messages = summary.stats.messages_fetched,
            created = summary.stats.created,
            updated = summary.stats.updated,
            errors = summary.errors(),
            interrupted = summary.interrupted,
            "harvest run finished"
        );
        Ok(summary)
    }
}
