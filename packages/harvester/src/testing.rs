//! Testing utilities including mock implementations.
//!
//! These let the scheduler run end to end without a real message source or
//! ingestion sink: sources serve scripted channel histories and errors, the
//! sink records every batch it is handed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingest_client::{ImportCounts, ImportRecord, IngestError};

use crate::config::AccountConfig;
use crate::error::{SourceError, SourceResult};
use crate::traits::{ChannelHandle, MessageSource, RecordSink, SourceConnector, SourceMessage};

/// Record of a call made to a mock source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockSourceCall {
    Resolve { identity: String },
    FetchPage { identity: String, after: i64, limit: usize },
    Disconnect,
}

#[derive(Default)]
struct MockChannel {
    id: i64,
    public: bool,
    messages: Vec<SourceMessage>,
}

#[derive(Default)]
struct MockSourceState {
    channels: HashMap<String, MockChannel>,
    /// Errors returned on every resolve of a channel
    resolve_errors: HashMap<String, SourceError>,
    /// One-shot errors consumed by successive page fetches
    page_errors: HashMap<String, VecDeque<SourceError>>,
    /// Error returned by every call, whatever the channel
    fail_all: Option<SourceError>,
    calls: Vec<MockSourceCall>,
    fetch_times: Vec<DateTime<Utc>>,
}

/// A scripted message source.
///
/// Clones share state, so a test can keep one handle while the worker owns
/// another. Pages are returned newest first, like real sources do.
#[derive(Clone, Default)]
pub struct MockSource {
    state: Arc<RwLock<MockSourceState>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a public channel with the given history.
    pub fn with_channel(self, identity: impl Into<String>, messages: Vec<SourceMessage>) -> Self {
        self.push_messages(identity, messages);
        self
    }

    /// Add a public channel with `count` text messages, ids `1..=count`.
    pub fn with_text_messages(self, identity: impl Into<String>, count: i64) -> Self {
        let messages = (1..=count)
            .map(|id| SourceMessage::text(id, format!("message {id}")))
            .collect();
        self.with_channel(identity, messages)
    }

    /// Add a channel without a public handle.
    pub fn with_private_channel(
        self,
        identity: impl Into<String>,
        messages: Vec<SourceMessage>,
    ) -> Self {
        let identity = identity.into();
        self.push_messages(identity.clone(), messages);
        if let Some(channel) = self.state.write().unwrap().channels.get_mut(&identity) {
            channel.public = false;
        }
        self
    }

    /// Fail every resolve of `identity`.
    pub fn with_resolve_error(self, identity: impl Into<String>, error: SourceError) -> Self {
        self.state
            .write()
            .unwrap()
            .resolve_errors
            .insert(identity.into(), error);
        self
    }

    /// Fail the next page fetches of `identity`, one error per call.
    pub fn with_page_errors(self, identity: impl Into<String>, errors: Vec<SourceError>) -> Self {
        self.state
            .write()
            .unwrap()
            .page_errors
            .entry(identity.into())
            .or_default()
            .extend(errors);
        self
    }

    /// Fail every call with `error`.
    pub fn failing_with(self, error: SourceError) -> Self {
        self.state.write().unwrap().fail_all = Some(error);
        self
    }

    /// Append messages to a channel, creating it if needed.
    pub fn push_messages(&self, identity: impl Into<String>, messages: Vec<SourceMessage>) {
        let mut state = self.state.write().unwrap();
        let next_id = state.channels.len() as i64 + 1000;
        let channel = state
            .channels
            .entry(identity.into())
            .or_insert_with(|| MockChannel {
                id: next_id,
                public: true,
                messages: Vec::new(),
            });
        channel.messages.extend(messages);
        channel.messages.sort_by_key(|m| m.id);
    }

    /// Get all calls made to this mock.
    pub fn calls(&self) -> Vec<MockSourceCall> {
        self.state.read().unwrap().calls.clone()
    }

    /// Number of page fetches, successful or not.
    pub fn fetch_count(&self) -> usize {
        self.state
            .read()
            .unwrap()
            .calls
            .iter()
            .filter(|c| matches!(c, MockSourceCall::FetchPage { .. }))
            .count()
    }

    /// Page fetches made for one channel.
    pub fn fetches_for(&self, identity: &str) -> usize {
        self.state
            .read()
            .unwrap()
            .calls
            .iter()
            .filter(|c| matches!(c, MockSourceCall::FetchPage { identity: i, .. } if i == identity))
            .count()
    }

    /// Resolves made for one channel.
    pub fn resolves_for(&self, identity: &str) -> usize {
        self.state
            .read()
            .unwrap()
            .calls
            .iter()
            .filter(|c| matches!(c, MockSourceCall::Resolve { identity: i } if i == identity))
            .count()
    }

    /// Wall-clock time of every page fetch.
    pub fn fetch_times(&self) -> Vec<DateTime<Utc>> {
        self.state.read().unwrap().fetch_times.clone()
    }

    pub fn was_disconnected(&self) -> bool {
        self.state
            .read()
            .unwrap()
            .calls
            .contains(&MockSourceCall::Disconnect)
    }
}

#[async_trait]
impl MessageSource for MockSource {
    async fn resolve(&self, identity: &str) -> SourceResult<ChannelHandle> {
        let mut state = self.state.write().unwrap();
        state.calls.push(MockSourceCall::Resolve {
            identity: identity.to_string(),
        });

        if let Some(error) = state.fail_all.clone() {
            return Err(error);
        }
        if let Some(error) = state.resolve_errors.get(identity) {
            return Err(error.clone());
        }
        let channel = state
            .channels
            .get(identity)
            .ok_or_else(|| SourceError::not_found(format!("no channel named {identity}")))?;

        Ok(ChannelHandle {
            id: channel.id,
            title: Some(format!("{identity} title")),
            handle: channel.public.then(|| identity.to_string()),
            kind: "Channel".to_string(),
            description: None,
            member_count: Some(100),
        })
    }

    async fn fetch_page(
        &self,
        channel: &ChannelHandle,
        after: i64,
        limit: usize,
    ) -> SourceResult<Vec<SourceMessage>> {
        let mut state = self.state.write().unwrap();
        let identity = state
            .channels
            .iter()
            .find(|(_, c)| c.id == channel.id)
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| channel.address());

        state.calls.push(MockSourceCall::FetchPage {
            identity: identity.clone(),
            after,
            limit,
        });
        state.fetch_times.push(Utc::now());

        if let Some(error) = state.fail_all.clone() {
            return Err(error);
        }
        if let Some(error) = state
            .page_errors
            .get_mut(&identity)
            .and_then(|errors| errors.pop_front())
        {
            return Err(error);
        }

        let mut page: Vec<SourceMessage> = state
            .channels
            .get(&identity)
            .map(|c| {
                c.messages
                    .iter()
                    .filter(|m| m.id > after)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        page.reverse();
        Ok(page)
    }

    async fn disconnect(&self) {
        self.state
            .write()
            .unwrap()
            .calls
            .push(MockSourceCall::Disconnect);
    }
}

/// Hands out mock sessions per account.
#[derive(Default)]
pub struct MockConnector {
    sources: RwLock<HashMap<String, MockSource>>,
    shared: Option<MockSource>,
    connect_errors: RwLock<HashMap<String, SourceError>>,
    connects: RwLock<Vec<String>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `source` to every account without a dedicated one.
    pub fn with_shared_source(mut self, source: MockSource) -> Self {
        self.shared = Some(source);
        self
    }

    /// Serve `source` to `account`.
    pub fn with_source(self, account: impl Into<String>, source: MockSource) -> Self {
        self.sources.write().unwrap().insert(account.into(), source);
        self
    }

    /// Refuse to open a session for `account`.
    pub fn with_connect_error(self, account: impl Into<String>, error: SourceError) -> Self {
        self.connect_errors
            .write()
            .unwrap()
            .insert(account.into(), error);
        self
    }

    /// Accounts that connected, in order.
    pub fn connects(&self) -> Vec<String> {
        self.connects.read().unwrap().clone()
    }
}

#[async_trait]
impl SourceConnector for MockConnector {
    async fn connect(&self, account: &AccountConfig) -> SourceResult<Box<dyn MessageSource>> {
        self.connects.write().unwrap().push(account.session.clone());

        if let Some(error) = self.connect_errors.read().unwrap().get(&account.session) {
            return Err(error.clone());
        }
        let source = self
            .sources
            .read()
            .unwrap()
            .get(&account.session)
            .cloned()
            .or_else(|| self.shared.clone())
            .ok_or_else(|| SourceError::auth(format!("unknown account {}", account.session)))?;
        Ok(Box::new(source))
    }
}

#[derive(Default)]
struct MockSinkState {
    batches: Vec<Vec<ImportRecord>>,
    /// Batches accepted before every further batch fails
    fail_after: Option<usize>,
    attempts: usize,
}

/// A sink that records batches.
///
/// Reports every record as created unless told to fail.
#[derive(Clone, Default)]
pub struct MockSink {
    state: Arc<RwLock<MockSinkState>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `batches` more batches, then fail every delivery.
    pub fn fail_after(&self, batches: usize) {
        let mut state = self.state.write().unwrap();
        state.fail_after = Some(state.batches.len() + batches);
    }

    /// Fail every delivery from now on.
    pub fn fail_always(&self) {
        self.fail_after(0);
    }

    /// Accept deliveries again.
    pub fn recover(&self) {
        self.state.write().unwrap().fail_after = None;
    }

    pub fn batches(&self) -> Vec<Vec<ImportRecord>> {
        self.state.read().unwrap().batches.clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state
            .read()
            .unwrap()
            .batches
            .iter()
            .map(Vec::len)
            .collect()
    }

    /// Message ids of every delivered record, in delivery order.
    pub fn delivered_ids(&self) -> Vec<i64> {
        self.state
            .read()
            .unwrap()
            .batches
            .iter()
            .flatten()
            .map(|r| r.message.telegram_id)
            .collect()
    }

    /// Delivered message ids for one channel handle.
    pub fn delivered_ids_for(&self, username: &str) -> Vec<i64> {
        self.state
            .read()
            .unwrap()
            .batches
            .iter()
            .flatten()
            .filter(|r| r.channel.username.as_deref() == Some(username))
            .map(|r| r.message.telegram_id)
            .collect()
    }

    /// Deliveries attempted, including failed ones.
    pub fn attempts(&self) -> usize {
        self.state.read().unwrap().attempts
    }
}

#[async_trait]
impl RecordSink for MockSink {
    async fn send_batch(&self, records: &[ImportRecord]) -> ingest_client::Result<ImportCounts> {
        let mut state = self.state.write().unwrap();
        state.attempts += 1;

        if let Some(limit) = state.fail_after {
            if state.batches.len() >= limit {
                return Err(IngestError::Exhausted {
                    attempts: 3,
                    last: Box::new(IngestError::Status {
                        status: 503,
                        body: "sink unavailable".into(),
                    }),
                });
            }
        }

        state.batches.push(records.to_vec());
        Ok(ImportCounts {
            created: records.len() as u64,
            updated: 0,
        })
    }
}
