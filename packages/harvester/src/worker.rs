//! Session worker: one per account.
//!
//! The worker owns its account's session and cursors and drains the shared
//! queue one channel at a time:
//!
//! ```text
//! SessionWorker
//!     │
//!     ├─► wait out the account's suspension window
//!     ├─► dequeue a task (or a shutdown signal)
//!     ├─► fetch_channel(task)
//!     │       └─► outcome routed to stats / suspension + requeue / ledger
//!     └─► short random pause, repeat
//! ```
//!
//! An account whose cursors cannot be loaded never starts.
//! On exit (shutdown signal, interrupt, or lost authorization) the worker
//! persists its cursors, flushes pending ledger entries and disconnects.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::AccountConfig;
use crate::context::CrawlContext;
use crate::cursor::CursorStore;
use crate::error::AccountError;
use crate::fetch::{fetch_channel, Completion, FetchOutcome};
use crate::queue::QueueItem;
use crate::traits::{MessageSource, SourceConnector};
use crate::types::{ChannelTask, FailureKind, FailureRecord};

/// Reason recorded for channels that hit the attempt cap on rate limits.
pub const RATE_LIMIT_EXHAUSTED: &str = "rate_limited_exhausted";

/// Attempt cap and the delays between attempts and channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts charged to a channel before it is given up
    pub max_attempts: u32,
    /// Bounds of the random base delay before an inline transient retry
    pub transient_base_min: Duration,
    pub transient_base_max: Duration,
    /// Added to the base once per attempt already made
    pub transient_step: Duration,
    /// Bounds of the random pause between channels
    pub pause_min: Duration,
    pub pause_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            transient_base_min: Duration::from_secs(5),
            transient_base_max: Duration::from_secs(15),
            transient_step: Duration::from_secs(10),
            pause_min: Duration::from_millis(500),
            pause_max: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_transient_backoff(mut self, min: Duration, max: Duration, step: Duration) -> Self {
        self.transient_base_min = min.min(max);
        self.transient_base_max = min.max(max);
        self.transient_step = step;
        self
    }

    pub fn with_channel_pause(mut self, min: Duration, max: Duration) -> Self {
        self.pause_min = min.min(max);
        self.pause_max = min.max(max);
        self
    }

    /// No delays at all; for tests and dry runs.
    pub fn immediate(self) -> Self {
        self.with_transient_backoff(Duration::ZERO, Duration::ZERO, Duration::ZERO)
            .with_channel_pause(Duration::ZERO, Duration::ZERO)
    }

    /// Delay before the retry that follows `attempt` failures.
    pub fn transient_backoff(&self, attempt: u32) -> Duration {
        uniform(self.transient_base_min, self.transient_base_max)
            + self.transient_step.saturating_mul(attempt)
    }

    pub fn channel_pause(&self) -> Duration {
        uniform(self.pause_min, self.pause_max)
    }
}

fn uniform(min: Duration, max: Duration) -> Duration {
    let min_ms = min.as_millis() as u64;
    let max_ms = (max.as_millis() as u64).max(min_ms);
    Duration::from_millis(fastrand::u64(min_ms..=max_ms))
}

/// How a worker stopped without an account error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Received its shutdown signal
    Drained,
    /// Shutdown token fired
    Interrupted,
}

/// What happened to one task.
enum Settled {
    Next,
    Interrupted,
    LostAuth(String),
}

pub struct SessionWorker {
    account: AccountConfig,
    connector: Arc<dyn SourceConnector>,
    ctx: Arc<CrawlContext>,
}

impl SessionWorker {
    pub fn new(
        account: AccountConfig,
        connector: Arc<dyn SourceConnector>,
        ctx: Arc<CrawlContext>,
    ) -> Self {
        Self {
            account,
            connector,
            ctx,
        }
    }

    pub fn account(&self) -> &str {
        &self.account.session
    }

    pub async fn run(self) -> Result<WorkerExit, AccountError> {
        let account = self.account.session.clone();
        info!(account = %account, "session worker starting");

        let mut cursors = match CursorStore::load(account.clone(), self.ctx.store.clone()).await {
            Ok(cursors) => cursors,
            Err(e) => {
                error!(account = %account, error = %e, "failed to load cursors");
                self.ctx.stats.record_failed_account();
                return Err(AccountError::State { account, source: e });
            }
        };

        let source = match self.connector.connect(&self.account).await {
            Ok(source) => source,
            Err(e) => {
                error!(account = %account, error = %e, "failed to open session");
                self.ctx.stats.record_failed_account();
                return Err(AccountError::Connect { account, source: e });
            }
        };
        info!(account = %account, "session open");

        let result = self.drain(source.as_ref(), &mut cursors).await;

        if cursors.is_dirty() {
            if let Err(e) = cursors.persist().await {
                error!(account = %account, error = %e, "failed to persist cursors on exit");
            }
        }
        if let Err(e) = self.ctx.ledger.flush().await {
            error!(account = %account, error = %e, "failed to flush failure ledger on exit");
        }
        source.disconnect().await;

        match &result {
            Ok(exit) => info!(account = %account, exit = ?exit, "session worker stopped"),
            Err(e) => {
                self.ctx.stats.record_failed_account();
                error!(account = %account, error = %e, "session worker aborted");
            }
        }
        result
    }

    async fn drain(
        &self,
        source: &dyn MessageSource,
        cursors: &mut CursorStore,
    ) -> Result<WorkerExit, AccountError> {
        let ctx = &self.ctx;
        let account = self.account();

        loop {
            if !ctx.suspensions.wait_until_awake(account, &ctx.cancel).await {
                return Ok(WorkerExit::Interrupted);
            }

            let item = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Ok(WorkerExit::Interrupted),
                item = ctx.queue.dequeue() => item,
            };
            let task = match item {
                QueueItem::Task(task) => task,
                QueueItem::Shutdown => return Ok(WorkerExit::Drained),
            };

            let settled = self.process(source, cursors, task).await;
            ctx.queue.task_done();

            match settled {
                Settled::Next => {}
                Settled::Interrupted => return Ok(WorkerExit::Interrupted),
                Settled::LostAuth(reason) => {
                    return Err(AccountError::FatalAuth {
                        account: account.to_string(),
                        reason,
                    })
                }
            }

            let pause = ctx.retry.channel_pause();
            if !pause.is_zero() {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Ok(WorkerExit::Interrupted),
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
    }

    async fn process(
        &self,
        source: &dyn MessageSource,
        cursors: &mut CursorStore,
        mut task: ChannelTask,
    ) -> Settled {
        let ctx = &self.ctx;
        let account = self.account();

        loop {
            let report = fetch_channel(
                source,
                ctx.sink.as_ref(),
                cursors,
                &task,
                &ctx.fetch,
                &ctx.cancel,
            )
            .await;
            let progress = report.progress;
            task.cursor = task.cursor.max(progress.cursor);
            ctx.stats.record_progress(&progress);

            match report.outcome {
                FetchOutcome::Done { completion } => {
                    ctx.stats.record_completion(completion);
                    info!(
                        account = %account,
                        channel = %task.identity(),
                        completion = %completion,
                        messages = progress.messages,
                        pages = progress.pages,
                        created = progress.counts.created,
                        updated = progress.counts.updated,
                        cursor = progress.cursor,
                        "channel done"
                    );
                    if completion == Completion::Interrupted {
                        return Settled::Interrupted;
                    }
                    ctx.ledger.resolve(task.identity()).await;
                    return Settled::Next;
                }

                FetchOutcome::RateLimited { seconds } => {
                    ctx.stats.record_rate_limit();
                    let wake_at = ctx.suspensions.suspend(account, seconds).await;
                    task.attempts += 1;
                    if task.attempts < ctx.retry.max_attempts {
                        warn!(
                            account = %account,
                            channel = %task.identity(),
                            attempt = task.attempts,
                            wait_secs = seconds,
                            wake_at = %wake_at,
                            "channel rate limited, requeued"
                        );
                        ctx.queue.enqueue(task);
                    } else {
                        warn!(
                            account = %account,
                            channel = %task.identity(),
                            attempt = task.attempts,
                            wake_at = %wake_at,
                            "channel rate limited too often, giving up"
                        );
                        self.record_failure(&task, RATE_LIMIT_EXHAUSTED, FailureKind::RateLimited)
                            .await;
                    }
                    return Settled::Next;
                }

                FetchOutcome::NotFound { reason } => {
                    warn!(
                        account = %account,
                        channel = %task.identity(),
                        reason = %reason,
                        "channel not found"
                    );
                    self.record_failure(&task, reason, FailureKind::NotFound)
                        .await;
                    return Settled::Next;
                }

                FetchOutcome::Transient { reason } => {
                    task.attempts += 1;
                    if task.attempts >= ctx.retry.max_attempts {
                        warn!(
                            account = %account,
                            channel = %task.identity(),
                            attempt = task.attempts,
                            reason = %reason,
                            "channel failed permanently"
                        );
                        self.record_failure(&task, reason, FailureKind::Transient)
                            .await;
                        return Settled::Next;
                    }

                    let delay = ctx.retry.transient_backoff(task.attempts);
                    ctx.stats.record_retry();
                    warn!(
                        account = %account,
                        channel = %task.identity(),
                        attempt = task.attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "transient failure, retrying"
                    );
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return Settled::Interrupted,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }

                FetchOutcome::FatalAuth { reason } => {
                    error!(
                        account = %account,
                        channel = %task.identity(),
                        reason = %reason,
                        "session lost authorization, handing channel back"
                    );
                    ctx.queue.enqueue(task);
                    return Settled::LostAuth(reason);
                }
            }
        }
    }

    async fn record_failure(&self, task: &ChannelTask, reason: impl Into<String>, kind: FailureKind) {
        self.ctx.stats.record_failed_channel();
        let record = FailureRecord::new(&task.channel, reason, kind);
        if let Err(e) = self.ctx.ledger.record(record).await {
            warn!(
                account = %self.account(),
                channel = %task.identity(),
                error = %e,
                "failed to save failure ledger, will retry on flush"
            );
        }
    }
}
