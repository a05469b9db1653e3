//! End-to-end runs of the driver against scripted sources and sinks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use harvester::cursor::{cursor_key, CursorStore};
use harvester::store::{save_json, FAILED_CHANNELS_KEY, SUSPENDED_KEY};
use harvester::testing::{MockConnector, MockSink, MockSource};
use harvester::worker::RATE_LIMIT_EXHAUSTED;
use harvester::{
    fetch_channel, AccountConfig, ChannelRef, ChannelTask, ConfigError, Driver, FetchConfig,
    FetchOutcome, LedgerRequeue, MemoryStateStore, RetryPolicy, SourceError, SuspensionPolicy,
};
use ingest_client::{DeliveryPolicy, IngestClient};
use secrecy::SecretString;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

fn account(name: &str) -> AccountConfig {
    AccountConfig::new(name, 12345, "0123456789abcdef")
}

fn channel(name: &str) -> ChannelRef {
    ChannelRef::new(name, false)
}

fn driver(connector: MockConnector, sink: &MockSink, store: &MemoryStateStore) -> Driver {
    Driver::new(
        Arc::new(connector),
        Arc::new(sink.clone()),
        Arc::new(store.clone()),
    )
    .with_fetch(FetchConfig::default().with_page_size(100))
    .with_retry(RetryPolicy::default().immediate())
    .with_suspension(
        SuspensionPolicy::default()
            .with_jitter(Duration::ZERO, Duration::ZERO)
            .with_sleep_slice(Duration::from_millis(50)),
    )
}

fn ledger(store: &MemoryStateStore) -> Vec<Value> {
    match store.get_json(FAILED_CHANNELS_KEY) {
        Some(Value::Array(entries)) => entries,
        _ => Vec::new(),
    }
}

fn cursor(store: &MemoryStateStore, account: &str, channel: &str) -> Option<i64> {
    store
        .get_json(&cursor_key(account))
        .and_then(|cursors| cursors.get(channel).and_then(Value::as_i64))
}

#[tokio::test]
async fn test_250_messages_in_three_pages() {
    let source = MockSource::new().with_text_messages("news", 250);
    let sink = MockSink::new();
    let store = MemoryStateStore::new();

    let summary = driver(
        MockConnector::new().with_shared_source(source.clone()),
        &sink,
        &store,
    )
    .run(vec![account("a")], vec![channel("news")])
    .await
    .unwrap();

    assert_eq!(sink.batch_sizes(), vec![100, 100, 50]);
    assert_eq!(source.fetches_for("news"), 3);
    assert_eq!(cursor(&store, "a", "news"), Some(250));

    assert_eq!(summary.stats.channels_processed, 1);
    assert_eq!(summary.stats.messages_fetched, 250);
    assert_eq!(summary.stats.created, 250);
    assert_eq!(summary.errors(), 0);
    assert_eq!(summary.pending_channels, 0);
    assert!(!summary.interrupted);
    assert!(source.was_disconnected());
}

#[tokio::test]
async fn test_private_channel_records_have_no_link() {
    let history = (1..=3)
        .map(|id| harvester::traits::SourceMessage::text(id, "members only"))
        .collect();
    let source = MockSource::new()
        .with_private_channel("inner-circle", history)
        .with_text_messages("news", 1);
    let sink = MockSink::new();
    let store = MemoryStateStore::new();

    driver(
        MockConnector::new().with_shared_source(source),
        &sink,
        &store,
    )
    .run(vec![account("a")], vec![channel("inner-circle"), channel("news")])
    .await
    .unwrap();

    let records: Vec<_> = sink.batches().into_iter().flatten().collect();
    let (private, public): (Vec<_>, Vec<_>) =
        records.iter().partition(|r| r.channel.is_private);
    assert_eq!(private.len(), 3);
    assert!(private.iter().all(|r| r.message.media_file_path.is_none()));
    assert!(private.iter().all(|r| r.channel.username.is_none()));
    assert_eq!(public.len(), 1);
    assert!(public[0].message.media_file_path.is_some());
    assert_eq!(cursor(&store, "a", "inner-circle"), Some(3));
}

#[tokio::test]
async fn test_next_run_resumes_from_cursor() {
    let source = MockSource::new().with_text_messages("news", 120);
    let sink = MockSink::new();
    let store = MemoryStateStore::new();
    let connector = || MockConnector::new().with_shared_source(source.clone());

    driver(connector(), &sink, &store)
        .run(vec![account("a")], vec![channel("news")])
        .await
        .unwrap();
    assert_eq!(cursor(&store, "a", "news"), Some(120));

    let fresh: Vec<_> = (121..=130)
        .map(|id| harvester::traits::SourceMessage::text(id, "later"))
        .collect();
    source.push_messages("news", fresh);

    let second_sink = MockSink::new();
    let summary = driver(connector(), &second_sink, &store)
        .run(vec![account("a")], vec![channel("news")])
        .await
        .unwrap();

    assert_eq!(second_sink.delivered_ids(), (121..=130).collect::<Vec<_>>());
    assert_eq!(summary.stats.messages_fetched, 10);
    assert_eq!(cursor(&store, "a", "news"), Some(130));
}

#[tokio::test]
async fn test_crash_after_delivery_redelivers_at_most_one_page() {
    let source = MockSource::new().with_text_messages("news", 150);
    let sink = MockSink::new();
    let store = MemoryStateStore::new();
    let shared: Arc<dyn harvester::StateStore> = Arc::new(store.clone());
    let cancel = CancellationToken::new();
    let task = ChannelTask::new(channel("news"));
    let one_page = FetchConfig::default()
        .with_page_size(50)
        .with_max_messages(50);

    // First page delivered and persisted.
    let mut cursors = CursorStore::load("a", shared.clone()).await.unwrap();
    fetch_channel(&source, &sink, &mut cursors, &task, &one_page, &cancel).await;
    assert_eq!(cursor(&store, "a", "news"), Some(50));

    // Second page delivered, cursor write lost, process dies.
    store.fail_saves_for("last_id_");
    let mut cursors = CursorStore::load("a", shared.clone()).await.unwrap();
    let report = fetch_channel(&source, &sink, &mut cursors, &task, &one_page, &cancel).await;
    assert!(matches!(report.outcome, FetchOutcome::Done { .. }));
    drop(cursors);
    assert_eq!(cursor(&store, "a", "news"), Some(50));

    // Restart.
    store.clear_failures();
    let mut cursors = CursorStore::load("a", shared).await.unwrap();
    let report = fetch_channel(
        &source,
        &sink,
        &mut cursors,
        &task,
        &FetchConfig::default().with_page_size(50),
        &cancel,
    )
    .await;
    assert!(matches!(report.outcome, FetchOutcome::Done { .. }));

    let delivered = sink.delivered_ids();
    let duplicates = delivered.len() - 150;
    assert!(duplicates <= 50, "redelivered {duplicates} messages");
    for id in 1..=150 {
        assert!(delivered.contains(&id));
    }
    assert_eq!(cursor(&store, "a", "news"), Some(150));
}

#[tokio::test]
async fn test_rate_limit_suspends_whole_account_then_recovers() {
    let source = MockSource::new()
        .with_text_messages("busy", 20)
        .with_text_messages("quiet", 5)
        .with_page_errors("busy", vec![SourceError::RateLimited { seconds: 1 }]);
    let sink = MockSink::new();
    let store = MemoryStateStore::new();

    let summary = driver(
        MockConnector::new().with_shared_source(source.clone()),
        &sink,
        &store,
    )
    .run(vec![account("a")], vec![channel("busy"), channel("quiet")])
    .await
    .unwrap();

    let times = source.fetch_times();
    assert_eq!(times.len(), 3);
    // Nothing on the account ran before the wake time, including the other channel.
    assert!(times[1] - times[0] >= TimeDelta::seconds(1));
    assert!(times[2] - times[0] >= TimeDelta::seconds(1));

    assert_eq!(sink.delivered_ids_for("busy"), (1..=20).collect::<Vec<_>>());
    assert_eq!(sink.delivered_ids_for("quiet"), (1..=5).collect::<Vec<_>>());
    assert_eq!(summary.stats.rate_limits, 1);
    assert_eq!(summary.stats.channels_processed, 2);
    assert_eq!(summary.errors(), 0);
    assert!(ledger(&store).is_empty());
    // Expired windows are not left behind.
    assert!(!store.contains(SUSPENDED_KEY));
}

#[tokio::test]
async fn test_rate_limit_exhaustion_goes_to_ledger() {
    let source = MockSource::new()
        .with_text_messages("busy", 5)
        .with_page_errors("busy", vec![SourceError::RateLimited { seconds: 0 }; 5]);
    let sink = MockSink::new();
    let store = MemoryStateStore::new();

    let summary = driver(
        MockConnector::new().with_shared_source(source.clone()),
        &sink,
        &store,
    )
    .run(vec![account("a")], vec![channel("busy")])
    .await
    .unwrap();

    assert_eq!(source.fetches_for("busy"), 3);
    assert_eq!(summary.stats.rate_limits, 3);
    assert_eq!(summary.stats.failed_channels, 1);

    let entries = ledger(&store);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["username"], "busy");
    assert_eq!(entries[0]["reason"], RATE_LIMIT_EXHAUSTED);
    assert_eq!(entries[0]["kind"], "rate_limited");
}

#[tokio::test]
async fn test_not_found_recorded_once_across_runs() {
    let source = MockSource::new().with_text_messages("alive", 3);
    let store = MemoryStateStore::new();
    let channels = vec![channel("gone"), channel("alive")];
    let connector = || MockConnector::new().with_shared_source(source.clone());

    let summary = driver(connector(), &MockSink::new(), &store)
        .run(vec![account("a")], channels.clone())
        .await
        .unwrap();
    assert_eq!(source.resolves_for("gone"), 1);
    assert_eq!(summary.stats.failed_channels, 1);
    assert_eq!(summary.stats.channels_processed, 1);

    // Re-queued under `all`, fails again, still one entry.
    driver(connector(), &MockSink::new(), &store)
        .with_ledger_requeue(LedgerRequeue::All)
        .run(vec![account("a")], channels.clone())
        .await
        .unwrap();
    assert_eq!(source.resolves_for("gone"), 2);

    // Default policy leaves it out of the work list.
    driver(connector(), &MockSink::new(), &store)
        .run(vec![account("a")], channels)
        .await
        .unwrap();
    assert_eq!(source.resolves_for("gone"), 2);

    let entries = ledger(&store);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["username"], "gone");
    assert_eq!(entries[0]["kind"], "not_found");
}

#[tokio::test]
async fn test_transient_failure_retried_max_minus_one_times() {
    let source = MockSource::new()
        .with_text_messages("flaky", 10)
        .with_page_errors("flaky", vec![SourceError::transient("connection reset"); 10]);
    let sink = MockSink::new();
    let store = MemoryStateStore::new();

    let summary = driver(
        MockConnector::new().with_shared_source(source.clone()),
        &sink,
        &store,
    )
    .run(vec![account("a")], vec![channel("flaky")])
    .await
    .unwrap();

    assert_eq!(source.fetches_for("flaky"), 3);
    assert_eq!(summary.stats.retries, 2);
    assert_eq!(summary.stats.failed_channels, 1);
    assert!(sink.batches().is_empty());

    let entries = ledger(&store);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["kind"], "transient");
    assert!(entries[0]["reason"]
        .as_str()
        .unwrap()
        .contains("connection reset"));
}

#[tokio::test]
async fn test_ledger_entry_cleared_once_channel_succeeds() {
    let source = MockSource::new()
        .with_text_messages("flaky", 4)
        .with_page_errors("flaky", vec![SourceError::transient("timeout")]);
    let store = MemoryStateStore::new();
    let connector = || MockConnector::new().with_shared_source(source.clone());

    driver(connector(), &MockSink::new(), &store)
        .with_retry(RetryPolicy::default().immediate().with_max_attempts(1))
        .run(vec![account("a")], vec![channel("flaky")])
        .await
        .unwrap();
    assert_eq!(ledger(&store).len(), 1);

    // Not in the source list any more; comes back from the ledger.
    let sink = MockSink::new();
    let summary = driver(connector(), &sink, &store)
        .run(vec![account("a")], Vec::new())
        .await
        .unwrap();

    assert_eq!(sink.delivered_ids_for("flaky"), vec![1, 2, 3, 4]);
    assert_eq!(summary.stats.channels_processed, 1);
    assert!(!store.contains(FAILED_CHANNELS_KEY));
}

#[tokio::test]
async fn test_unreachable_sink_keeps_transport_reason() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let ingest = IngestClient::with_policy(
        format!("http://{addr}/api/messages/import"),
        SecretString::from("token".to_string()),
        DeliveryPolicy::default()
            .with_initial_backoff(Duration::from_millis(10))
            .with_timeout(Duration::from_secs(2)),
    )
    .unwrap();
    let source = MockSource::new().with_text_messages("news", 30);
    let store = MemoryStateStore::new();

    let summary = Driver::new(
        Arc::new(MockConnector::new().with_shared_source(source)),
        Arc::new(ingest),
        Arc::new(store.clone()),
    )
    .with_retry(RetryPolicy::default().immediate().with_max_attempts(1))
    .run(vec![account("a")], vec![channel("news")])
    .await
    .unwrap();

    assert_eq!(summary.stats.failed_channels, 1);
    assert_eq!(summary.stats.messages_fetched, 0);
    assert_eq!(cursor(&store, "a", "news"), None);

    let entries = ledger(&store);
    assert_eq!(entries.len(), 1);
    let reason = entries[0]["reason"].as_str().unwrap();
    assert!(reason.contains("sink delivery failed"), "{reason}");
    assert!(reason.contains("transport error"), "{reason}");
}

#[tokio::test]
async fn test_lost_authorization_stops_only_that_account() {
    let healthy = MockSource::new()
        .with_text_messages("one", 5)
        .with_text_messages("two", 5)
        .with_text_messages("three", 5);
    let revoked = MockSource::new().failing_with(SourceError::auth("session revoked"));
    let sink = MockSink::new();
    let store = MemoryStateStore::new();

    let connector = MockConnector::new()
        .with_source("a", revoked.clone())
        .with_source("b", healthy);

    let summary = driver(connector, &sink, &store)
        .run(
            vec![account("a"), account("b")],
            vec![channel("one"), channel("two"), channel("three")],
        )
        .await
        .unwrap();

    assert_eq!(summary.stats.channels_processed, 3);
    assert_eq!(summary.stats.failed_accounts, 1);
    assert_eq!(summary.stats.failed_channels, 0);
    assert_eq!(summary.account_errors.len(), 1);
    assert!(summary.account_errors[0].contains("account a lost authorization"));
    assert_eq!(summary.pending_channels, 0);
    assert_eq!(sink.delivered_ids().len(), 15);
    assert!(revoked.was_disconnected());
    assert!(ledger(&store).is_empty());
}

#[tokio::test]
async fn test_unreadable_cursors_are_moved_aside_not_overwritten() {
    use harvester::StateStore;

    let source = MockSource::new().with_text_messages("news", 10);
    let store = MemoryStateStore::new();
    store
        .save("last_id_a", br#"{"old": 500, "bad": 1.5}"#)
        .await
        .unwrap();

    let summary = driver(
        MockConnector::new().with_shared_source(source),
        &MockSink::new(),
        &store,
    )
    .run(vec![account("a")], vec![channel("news")])
    .await
    .unwrap();

    assert_eq!(summary.stats.channels_processed, 1);
    assert_eq!(cursor(&store, "a", "news"), Some(10));
    let kept = store.get_json("last_id_a.corrupt").unwrap();
    assert_eq!(kept["old"], 500);
}

#[tokio::test]
async fn test_account_with_unmovable_cursors_does_not_start() {
    use harvester::StateStore;

    let source = MockSource::new().with_text_messages("news", 10);
    let store = MemoryStateStore::new();
    store
        .save("last_id_a", br#"{"old": 500, "bad": 1.5}"#)
        .await
        .unwrap();
    store.fail_saves_for("last_id_a.corrupt");

    let summary = driver(
        MockConnector::new().with_shared_source(source.clone()),
        &MockSink::new(),
        &store,
    )
    .run(vec![account("a"), account("b")], vec![channel("news")])
    .await
    .unwrap();

    assert_eq!(summary.stats.failed_accounts, 1);
    assert!(summary.account_errors[0].contains("could not load its cursors"));
    assert_eq!(summary.stats.channels_processed, 1);
    assert_eq!(cursor(&store, "b", "news"), Some(10));
    assert_eq!(
        store.get("last_id_a").unwrap(),
        br#"{"old": 500, "bad": 1.5}"#.to_vec()
    );
}

#[tokio::test]
async fn test_connect_failure_leaves_work_to_other_accounts() {
    let source = MockSource::new().with_text_messages("news", 5);
    let connector = MockConnector::new()
        .with_shared_source(source)
        .with_connect_error("a", SourceError::auth("bad api hash"));

    let summary = driver(connector, &MockSink::new(), &MemoryStateStore::new())
        .run(vec![account("a"), account("b")], vec![channel("news")])
        .await
        .unwrap();

    assert_eq!(summary.stats.channels_processed, 1);
    assert_eq!(summary.stats.failed_accounts, 1);
    assert!(summary.account_errors[0].contains("could not open a session"));
}

#[tokio::test]
async fn test_run_ends_when_no_account_can_work() {
    let connector = MockConnector::new().with_connect_error("a", SourceError::auth("bad api hash"));

    let summary = driver(connector, &MockSink::new(), &MemoryStateStore::new())
        .run(vec![account("a")], vec![channel("one"), channel("two")])
        .await
        .unwrap();

    assert_eq!(summary.pending_channels, 2);
    assert_eq!(summary.stats.failed_accounts, 1);
    assert!(!summary.interrupted);
}

#[tokio::test]
async fn test_cancel_while_suspended_exits_promptly() {
    let source = MockSource::new().with_text_messages("news", 5);
    let store = MemoryStateStore::new();
    let wake_at = Utc::now() + TimeDelta::hours(1);
    save_json(
        &store,
        SUSPENDED_KEY,
        &std::collections::HashMap::from([("a".to_string(), wake_at)]),
    )
    .await
    .unwrap();

    let cancel = CancellationToken::new();
    let run = driver(
        MockConnector::new().with_shared_source(source.clone()),
        &MockSink::new(),
        &store,
    )
    .with_cancel_token(cancel.clone())
    .run(vec![account("a")], vec![channel("news")]);
    let handle = tokio::spawn(run);

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("run did not stop after cancel")
        .unwrap()
        .unwrap();

    assert!(summary.interrupted);
    assert_eq!(summary.pending_channels, 1);
    assert_eq!(summary.stats.channels_processed, 0);
    assert_eq!(source.fetch_count(), 0);
    // The window survives for the next run.
    assert!(store.contains(SUSPENDED_KEY));
}

#[tokio::test]
async fn test_empty_account_list_is_rejected() {
    let result = driver(MockConnector::new(), &MockSink::new(), &MemoryStateStore::new())
        .run(Vec::new(), vec![channel("news")])
        .await;

    assert!(matches!(
        result,
        Err(ConfigError::Invalid { var: "accounts", .. })
    ));
}
