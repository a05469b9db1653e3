//! Sink trait for delivering normalized records.

use async_trait::async_trait;
use ingest_client::{ImportCounts, ImportRecord, IngestClient};

/// Destination for per-page record batches.
///
/// Implementations retry internally; an error means delivery of the batch
/// was given up.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn send_batch(&self, records: &[ImportRecord]) -> ingest_client::Result<ImportCounts>;
}

#[async_trait]
impl RecordSink for IngestClient {
    async fn send_batch(&self, records: &[ImportRecord]) -> ingest_client::Result<ImportCounts> {
        IngestClient::send_batch(self, records).await
    }
}
