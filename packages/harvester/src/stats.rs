//! Run-wide counters and the final summary.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use uuid::Uuid;

use crate::fetch::{Completion, FetchProgress};

/// Shared additive counters, updated by every worker.
#[derive(Debug, Default)]
pub struct RunStats {
    channels_processed: AtomicU64,
    channels_capped: AtomicU64,
    messages_fetched: AtomicU64,
    created: AtomicU64,
    updated: AtomicU64,
    failed_channels: AtomicU64,
    failed_accounts: AtomicU64,
    rate_limits: AtomicU64,
    retries: AtomicU64,
}

/// Point-in-time copy of [`RunStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub channels_processed: u64,
    pub channels_capped: u64,
    pub messages_fetched: u64,
    pub created: u64,
    pub updated: u64,
    pub failed_channels: u64,
    pub failed_accounts: u64,
    pub rate_limits: u64,
    pub retries: u64,
}

impl StatsSnapshot {
    /// Channel and account failures.
    pub fn errors(&self) -> u64 {
        self.failed_channels + self.failed_accounts
    }
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count messages and sink counters delivered by one fetch.
    pub fn record_progress(&self, progress: &FetchProgress) {
        self.messages_fetched
            .fetch_add(progress.messages as u64, Ordering::Relaxed);
        self.created
            .fetch_add(progress.counts.created, Ordering::Relaxed);
        self.updated
            .fetch_add(progress.counts.updated, Ordering::Relaxed);
    }

    /// Count a channel that finished. Interrupted channels are not counted.
    pub fn record_completion(&self, completion: Completion) {
        match completion {
            Completion::Exhausted => {
                self.channels_processed.fetch_add(1, Ordering::Relaxed);
            }
            Completion::Capped => {
                self.channels_processed.fetch_add(1, Ordering::Relaxed);
                self.channels_capped.fetch_add(1, Ordering::Relaxed);
            }
            Completion::Interrupted => {}
        }
    }

    pub fn record_failed_channel(&self) {
        self.failed_channels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_account(&self) {
        self.failed_accounts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit(&self) {
        self.rate_limits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            channels_processed: self.channels_processed.load(Ordering::Relaxed),
            channels_capped: self.channels_capped.load(Ordering::Relaxed),
            messages_fetched: self.messages_fetched.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            failed_channels: self.failed_channels.load(Ordering::Relaxed),
            failed_accounts: self.failed_accounts.load(Ordering::Relaxed),
            rate_limits: self.rate_limits.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// Aggregate result of one run, printed at exit.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub stats: StatsSnapshot,
    /// One line per account whose worker stopped on an error
    pub account_errors: Vec<String>,
    /// Tasks left in the queue (all workers gone, or interrupted)
    pub pending_channels: usize,
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn errors(&self) -> u64 {
        self.stats.errors()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.stats;
        writeln!(f, "Harvest summary (run {})", self.run_id)?;
        writeln!(
            f,
            "  channels processed: {} ({} capped)",
            s.channels_processed, s.channels_capped
        )?;
        writeln!(f, "  messages fetched:   {}", s.messages_fetched)?;
        writeln!(f, "  sink created:       {}, updated: {}", s.created, s.updated)?;
        writeln!(
            f,
            "  errors:             {} ({} channels, {} accounts)",
            s.errors(),
            s.failed_channels,
            s.failed_accounts
        )?;
        writeln!(
            f,
            "  rate limits:        {}, retries: {}",
            s.rate_limits, s.retries
        )?;
        if self.pending_channels > 0 {
            writeln!(f, "  still queued:       {}", self.pending_channels)?;
        }
        for error in &self.account_errors {
            writeln!(f, "  account error:      {error}")?;
        }
        write!(
            f,
            "  status:             {} in {:.1}s",
            if self.interrupted {
                "interrupted"
            } else {
                "completed"
            },
            self.elapsed.as_secs_f64()
        )
    }
}
