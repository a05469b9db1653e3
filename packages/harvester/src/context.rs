//! Shared state handed to every session worker.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::fetch::FetchConfig;
use crate::ledger::FailureLedger;
use crate::queue::ChannelQueue;
use crate::stats::RunStats;
use crate::store::StateStore;
use crate::suspension::SuspensionManager;
use crate::traits::RecordSink;
use crate::worker::RetryPolicy;

/// Everything workers share during one run.
///
/// Cursor stores are not here: each worker owns its account's cursors.
pub struct CrawlContext {
    pub queue: ChannelQueue,
    pub suspensions: SuspensionManager,
    pub ledger: FailureLedger,
    pub stats: RunStats,
    pub sink: Arc<dyn RecordSink>,
    pub store: Arc<dyn StateStore>,
    pub fetch: FetchConfig,
    pub retry: RetryPolicy,
    pub cancel: CancellationToken,
}
