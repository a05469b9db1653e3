//! Multi-account channel harvester.
//!
//! Crawls paginated message history from many channels using a small pool of
//! independently rate-limited accounts and delivers normalized records to the
//! ingestion sink.
//!
//! # Architecture
//!
//! ```text
//! Driver ─► ChannelQueue ─► SessionWorker (one per account)
//!                                 │
//!                                 └─► fetch_channel
//!                                         ├─► CursorStore (per account)
//!                                         └─► RecordSink (ingest-client)
//!                                 outcome ─► stats / SuspensionManager + requeue / FailureLedger
//! ```
//!
//! Cursors, suspension windows and the failure ledger persist through a
//! [`StateStore`](store::StateStore), so a restarted run resumes where the
//! previous one stopped.
//!
//! # Example
//!
//! ```rust,ignore
//! use harvester::{Driver, FileStateStore, GatewayConnector};
//!
//! let driver = Driver::new(Arc::new(connector), Arc::new(ingest), Arc::new(store));
//! let summary = driver.run(accounts, channels).await?;
//! println!("{summary}");
//! ```

pub mod config;
pub mod context;
pub mod cursor;
pub mod driver;
pub mod error;
pub mod fetch;
pub mod ledger;
pub mod queue;
pub mod sources;
pub mod stats;
pub mod store;
pub mod suspension;
pub mod testing;
pub mod traits;
pub mod transform;
pub mod types;
pub mod worker;

pub use config::{AccountConfig, HarvesterConfig, LedgerRequeue};
pub use cursor::CursorStore;
pub use driver::{build_work_list, Driver};
pub use error::{AccountError, ConfigError, SourceError, StoreError};
pub use fetch::{fetch_channel, Completion, FetchConfig, FetchOutcome, FetchReport};
pub use ledger::FailureLedger;
pub use queue::{ChannelQueue, QueueItem};
pub use sources::{GatewayConnector, GatewaySource};
pub use stats::{RunStats, RunSummary, StatsSnapshot};
pub use store::{FileStateStore, MemoryStateStore, StateStore};
pub use suspension::{SuspensionManager, SuspensionPolicy};
pub use traits::{MessageSource, RecordSink, SourceConnector};
pub use types::{ChannelRef, ChannelTask, FailureKind, FailureRecord};
pub use worker::{RetryPolicy, SessionWorker, WorkerExit};
