//! Per-channel fetch protocol.
//!
//! ```text
//! START ──resolve──► FETCHING ──► DONE (exhausted | capped | interrupted)
//!   │                    │
//!   └─► NOT_FOUND        ├─► RATE_LIMITED
//!                        ├─► TRANSIENT
//!                        └─► FATAL_AUTH
//! ```
//!
//! Each page is sorted, transformed and delivered as one batch. The cursor
//! moves only after the sink accepted the batch and is persisted right away,
//! so a crash in between re-delivers at most that one page.

use std::fmt;

use ingest_client::ImportCounts;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cursor::CursorStore;
use crate::error::SourceError;
use crate::traits::{MessageSource, RecordSink};
use crate::transform::{build_record, DEFAULT_LINK_BASE};
use crate::types::ChannelTask;

/// Paging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    /// Messages requested per page
    pub page_size: usize,
    /// Per-run cap on messages fetched from one channel
    pub max_messages: usize,
    /// Base URL for canonical message links
    pub link_base: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_messages: 1000,
            link_base: DEFAULT_LINK_BASE.to_string(),
        }
    }
}

impl FetchConfig {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages.max(1);
        self
    }

    pub fn with_link_base(mut self, link_base: impl Into<String>) -> Self {
        self.link_base = link_base.into();
        self
    }
}

/// How a successful fetch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// No more data: empty or short page
    Exhausted,
    /// Per-run message cap reached; more may remain
    Capped,
    /// Shutdown requested between pages
    Interrupted,
}

impl Completion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Completion::Exhausted => "exhausted",
            Completion::Capped => "capped",
            Completion::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Done { completion: Completion },
    RateLimited { seconds: u64 },
    NotFound { reason: String },
    Transient { reason: String },
    FatalAuth { reason: String },
}

impl From<SourceError> for FetchOutcome {
    fn from(error: SourceError) -> Self {
        match error {
            SourceError::NotFound { reason } => FetchOutcome::NotFound { reason },
            SourceError::RateLimited { seconds } => FetchOutcome::RateLimited { seconds },
            SourceError::Auth { reason } => FetchOutcome::FatalAuth { reason },
            SourceError::Transient { reason } => FetchOutcome::Transient { reason },
        }
    }
}

/// Work delivered before the fetch ended, whatever the outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchProgress {
    pub pages: usize,
    pub messages: usize,
    pub counts: ImportCounts,
    /// Cursor after the last delivered page
    pub cursor: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub outcome: FetchOutcome,
    pub progress: FetchProgress,
}

/// Fetch one channel from its cursor until done or failed.
pub async fn fetch_channel(
    source: &dyn MessageSource,
    sink: &dyn RecordSink,
    cursors: &mut CursorStore,
    task: &ChannelTask,
    config: &FetchConfig,
    cancel: &CancellationToken,
) -> FetchReport {
    let identity = task.identity();
    let mut progress = FetchProgress {
        cursor: cursors.get(identity).max(task.cursor),
        ..Default::default()
    };

    let handle = match source.resolve(identity).await {
        Ok(handle) => handle,
        Err(e) => {
            return FetchReport {
                outcome: e.into(),
                progress,
            }
        }
    };

    let finish = |outcome: FetchOutcome, progress: FetchProgress| FetchReport { outcome, progress };
    let page_size = config.page_size.max(1);

    loop {
        if progress.messages >= config.max_messages {
            return finish(
                FetchOutcome::Done {
                    completion: Completion::Capped,
                },
                progress,
            );
        }
        if cancel.is_cancelled() {
            return finish(
                FetchOutcome::Done {
                    completion: Completion::Interrupted,
                },
                progress,
            );
        }

        let mut page = match source.fetch_page(&handle, progress.cursor, page_size).await {
            Ok(page) => page,
            Err(e) => return finish(e.into(), progress),
        };
        if page.is_empty() {
            return finish(
                FetchOutcome::Done {
                    completion: Completion::Exhausted,
                },
                progress,
            );
        }

        page.sort_by_key(|m| m.id);
        let fetched = page.len();
        let page_max = page.last().map(|m| m.id).unwrap_or(progress.cursor);
        if page_max <= progress.cursor {
            warn!(
                channel = %identity,
                cursor = progress.cursor,
                page_max,
                "source returned no messages past the cursor, stopping"
            );
            return finish(
                FetchOutcome::Done {
                    completion: Completion::Exhausted,
                },
                progress,
            );
        }

        let records: Vec<_> = page
            .iter()
            .map(|message| build_record(&task.channel, &handle, message, &config.link_base))
            .collect();

        match sink.send_batch(&records).await {
            Ok(counts) => {
                progress.counts += counts;
                progress.messages += fetched;
                progress.pages += 1;
            }
            Err(e) => {
                return finish(
                    FetchOutcome::Transient {
                        reason: format!("sink delivery failed: {e}"),
                    },
                    progress,
                )
            }
        }

        if cursors.advance(identity, page_max) {
            if let Err(e) = cursors.persist().await {
                warn!(
                    account = %cursors.account(),
                    channel = %identity,
                    error = %e,
                    "failed to persist cursor, will retry"
                );
            }
        }
        progress.cursor = page_max;

        debug!(
            channel = %identity,
            page = progress.pages,
            messages = fetched,
            cursor = page_max,
            "page delivered"
        );

        if fetched < page_size {
            return finish(
                FetchOutcome::Done {
                    completion: Completion::Exhausted,
                },
                progress,
            );
        }
    }
}
