//! Integration tests for the sync engine.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use recsync_engine::{
    BelatedResponse, Credential, LeaseManager, ManualClock, MemoryStore, MetadataStore, MockCall,
    MockReply, MockTransport, ModelDescriptor, PhaseOutcome, Query, Record, RecordStore,
    RetryConfig, SkipReason, SyncConfig, SyncEngine, SyncError, SyncEvent, SyncResult,
    SyncStatus, SyncTransport, NOT_REACHABLE, REFRESH_SKIPPED,
};
use recsync_protocol::{
    BatchRequest, ReadRequest, ReadResponse, Row, WriteAck, WriteResponse, CLIENT_ID_COLUMN,
    DELETE_COLUMN, ID_COLUMN, TOMBSTONE_VALUE,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

const EMPTY_READ: &str = "m|2021-01-01T00:00:00Z\nid|client_id|text";

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn note() -> ModelDescriptor {
    ModelDescriptor::new("Note", "notes").with_columns(["text"])
}

fn config() -> SyncConfig {
    SyncConfig::new().with_retry(
        RetryConfig::new(3)
            .with_base_delay(Duration::from_secs(60))
            .with_jitter(false),
    )
}

struct Harness {
    engine: Arc<SyncEngine<MockTransport, MemoryStore>>,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new(store: MemoryStore, credential: Option<&str>) -> Self {
        Self::with_config(store, credential, config())
    }

    fn with_config(store: MemoryStore, credential: Option<&str>, config: SyncConfig) -> Self {
        let store = Arc::new(store);
        let clock = Arc::new(ManualClock::new(start()));
        let mut builder = SyncEngine::builder(MockTransport::new(), Arc::clone(&store))
            .config(config)
            .model(note())
            .model(ModelDescriptor::new("Book", "books").read_only())
            .clock(clock.clone());
        if let Some(token) = credential {
            builder = builder.credentials(Credential::new(token));
        }
        let engine = builder.build();
        engine.configure().unwrap();
        Self {
            engine,
            store,
            clock,
        }
    }

    fn transport(&self) -> &MockTransport {
        self.engine.transport()
    }

    fn record(&self, client_id: &str) -> Record {
        self.store.get("Note", client_id).unwrap().unwrap()
    }
}

fn drain(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

async fn wait_for<F>(events: &mut broadcast::Receiver<SyncEvent>, mut wanted: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    loop {
        let event = events.recv().await.unwrap();
        if wanted(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn pushed_record_gets_server_id() {
    let h = Harness::new(
        MemoryStore::with_records("Note", [Record::with_client_id("c1", fields(&[("text", "hi")]))]),
        Some("tok"),
    );
    h.transport()
        .push_write(MockReply::Body("meta\n42|c1".into()))
        .push_read(MockReply::Body(EMPTY_READ.into()));

    let report = h.engine.sync_all().await.unwrap();
    assert!(report.is_success());

    let record = h.record("c1");
    assert_eq!(record.id, Some(42));
    assert_eq!(record.sync_status, SyncStatus::Current);
    assert_eq!(record.get("text"), Some("hi"));
    assert_eq!(h.store.query("Note", &Query::all()).unwrap().len(), 1);

    let calls = h.transport().calls();
    match &calls[0] {
        MockCall::CreateOrUpdate(request) => {
            assert_eq!(request.table, "notes");
            assert_eq!(request.credential, "tok");
            assert_eq!(request.batch.encode(), "id|client_id|text\n|c1|hi");
        }
        other => panic!("unexpected call {other:?}"),
    }
    assert!(matches!(calls[1], MockCall::Read(_)));
    assert!(!h.engine.leases().is_held("Note", recsync_engine::LeaseKind::Write));
}

#[tokio::test]
async fn pull_inserts_rows_and_stores_watermark() {
    let h = Harness::new(MemoryStore::new(), None);
    h.transport().push_read(MockReply::Body(
        "meta|2021-01-01T00:00:00Z\nid|text\n7|hello".into(),
    ));

    let outcome = h.engine.pull("Note").await.unwrap();
    let watermark = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
    assert_eq!(
        outcome,
        PhaseOutcome::Pulled {
            applied: 1,
            removed: 0,
            watermark
        }
    );

    let record = h.store.find_by_server_id("Note", 7).unwrap().unwrap();
    assert_eq!(record.get("text"), Some("hello"));
    assert_eq!(record.sync_status, SyncStatus::Current);
    assert_eq!(h.engine.metadata("Note").unwrap().last_sync, Some(watermark));
    assert_eq!(h.transport().reads()[0].credential, "");
}

#[tokio::test]
async fn pull_sends_stored_watermark_and_never_moves_it_back() {
    let h = Harness::new(MemoryStore::new(), Some("tok"));
    let stored = Utc.with_ymd_and_hms(2022, 6, 1, 0, 0, 0).unwrap();
    h.store
        .update_metadata("Note", &mut |meta| meta.last_sync = Some(stored))
        .unwrap();
    h.transport().push_read(MockReply::Body(
        "meta|2021-01-01T00:00:00Z\nid|text\n7|old".into(),
    ));

    h.engine.pull("Note").await.unwrap();
    assert_eq!(h.transport().reads()[0].last_timestamp, Some(stored));
    assert_eq!(h.engine.metadata("Note").unwrap().last_sync, Some(stored));
    assert!(h.store.find_by_server_id("Note", 7).unwrap().is_some());
}

#[tokio::test]
async fn tombstones_remove_local_records() {
    let h = Harness::new(
        MemoryStore::with_records(
            "Note",
            [Record::from_server(7, Some("c7".into()), fields(&[("text", "x")]))],
        ),
        Some("tok"),
    );
    h.transport()
        .push_read(MockReply::Body(
            "m|2021-01-02T00:00:00Z\nid|text|delete\n7||true\n8||true".into(),
        ));

    let outcome = h.engine.pull("Note").await.unwrap();
    assert!(matches!(outcome, PhaseOutcome::Pulled { applied: 0, removed: 2, .. }));
    assert!(h.store.get("Note", "c7").unwrap().is_none());
}

#[tokio::test]
async fn malformed_pull_leaves_store_and_watermark_untouched() {
    let h = Harness::new(MemoryStore::new(), Some("tok"));
    let mut events = h.engine.subscribe();
    h.transport()
        .push_read(MockReply::Body("m|2021-01-01T00:00:00Z\nid|text\n7|a\n8".into()));

    let outcome = h.engine.pull("Note").await.unwrap();
    assert!(matches!(
        outcome,
        PhaseOutcome::Failed {
            error: SyncError::Protocol(_),
            retry_scheduled: false
        }
    ));
    assert!(h.store.query("Note", &Query::all()).unwrap().is_empty());
    assert_eq!(h.engine.metadata("Note").unwrap().last_sync, None);
    assert!(!h.engine.retry_pending("Note"));
    assert!(drain(&mut events)
        .iter()
        .all(|e| !matches!(e, SyncEvent::RetryScheduled { .. })));
}

#[tokio::test]
async fn fresh_query_is_served_without_refresh() {
    let h = Harness::new(
        MemoryStore::with_records(
            "Note",
            [Record::from_server(1, Some("c1".into()), fields(&[("text", "a")]))],
        ),
        Some("tok"),
    );
    let ten_seconds_ago = start() - chrono::Duration::seconds(10);
    h.store
        .update_metadata("Note", &mut |meta| meta.last_sync = Some(ten_seconds_ago))
        .unwrap();

    let listener = Arc::new(|_: BelatedResponse| panic!("no follow-up expected"));
    let result = h
        .engine
        .query("Note", Query::all(), Duration::from_secs(3600), listener)
        .unwrap();
    assert_eq!(result.records.len(), 1);
    assert!(result.pending.is_none());
    assert!(h.transport().calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stale_query_delivers_refreshed_records() {
    let h = Harness::new(MemoryStore::new(), Some("tok"));
    h.transport().push_read(MockReply::Body(
        "m|2021-01-01T00:00:00Z\nid|text\n7|hello".into(),
    ));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = Arc::new(move |response: BelatedResponse| {
        let _ = tx.send(response);
    });

    let result = h
        .engine
        .query("Note", Query::all(), Duration::from_secs(3600), listener)
        .unwrap();
    assert!(result.records.is_empty());
    result.pending.unwrap().finished().await;

    let response = rx.recv().await.unwrap();
    assert_eq!(response.model, "Note");
    assert_eq!(response.error, None);
    assert_eq!(response.records.len(), 1);
    assert_eq!(response.records[0].id, Some(7));
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn slow_refresh_falls_back_to_cached_records() {
    let h = Harness::new(
        MemoryStore::with_records(
            "Note",
            [Record::from_server(1, Some("c1".into()), fields(&[("text", "cached")]))],
        ),
        Some("tok"),
    );
    h.transport().set_latency(Duration::from_secs(10));
    h.transport().push_read(MockReply::Body(
        "m|2021-01-01T00:00:00Z\nid|text\n2|fresh".into(),
    ));
    let mut events = h.engine.subscribe();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = Arc::new(move |response: BelatedResponse| {
        let _ = tx.send(response);
    });

    let result = h
        .engine
        .query("Note", Query::all(), Duration::from_secs(3600), listener)
        .unwrap();
    assert_eq!(result.records.len(), 1);
    result.pending.unwrap().finished().await;

    let response = rx.recv().await.unwrap();
    assert_eq!(response.error.as_deref(), Some(NOT_REACHABLE));
    assert_eq!(response.records.len(), 1);
    assert_eq!(response.records[0].get("text"), Some("cached"));

    // The pull still lands, but nobody is told about it.
    wait_for(&mut events, |e| matches!(e, SyncEvent::Pulled { .. })).await;
    assert_eq!(h.store.query("Note", &Query::all()).unwrap().len(), 2);
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_reports_error_with_local_records() {
    let h = Harness::new(MemoryStore::new(), Some("tok"));
    h.transport().push_read(MockReply::Status(500));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = Arc::new(move |response: BelatedResponse| {
        let _ = tx.send(response);
    });

    let result = h
        .engine
        .query("Note", Query::all(), Duration::from_secs(3600), listener)
        .unwrap();
    result.pending.unwrap().finished().await;

    let response = rx.recv().await.unwrap();
    assert!(response.records.is_empty());
    assert!(response.error.unwrap().contains("500"));
}

#[tokio::test(start_paused = true)]
async fn refresh_blocked_by_read_lease_reports_error() {
    let h = Harness::new(MemoryStore::new(), Some("tok"));
    assert!(h
        .engine
        .leases()
        .acquire_read_lease("Note", Duration::from_secs(60))
        .unwrap());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = Arc::new(move |response: BelatedResponse| {
        let _ = tx.send(response);
    });

    let result = h
        .engine
        .query("Note", Query::all(), Duration::from_secs(3600), listener)
        .unwrap();
    result.pending.unwrap().finished().await;

    let response = rx.recv().await.unwrap();
    assert_eq!(response.error.as_deref(), Some(REFRESH_SKIPPED));
    assert!(response.records.is_empty());
    assert!(h.transport().reads().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelled_refresh_is_not_delivered() {
    let h = Harness::new(MemoryStore::new(), Some("tok"));
    h.transport().set_latency(Duration::from_secs(1));
    h.transport().push_read(MockReply::Body(
        "m|2021-01-01T00:00:00Z\nid|text\n7|hello".into(),
    ));
    let mut events = h.engine.subscribe();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = Arc::new(move |response: BelatedResponse| {
        let _ = tx.send(response);
    });

    let result = h
        .engine
        .query("Note", Query::all(), Duration::from_secs(3600), listener)
        .unwrap();
    let pending = result.pending.unwrap();
    pending.cancel();
    assert!(pending.is_cancelled());

    wait_for(&mut events, |e| matches!(e, SyncEvent::Pulled { .. })).await;
    pending.finished().await;
    assert!(h.store.find_by_server_id("Note", 7).unwrap().is_some());
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn server_error_during_push_schedules_retry() {
    let h = Harness::new(
        MemoryStore::with_records(
            "Note",
            [
                Record::with_client_id("c1", fields(&[("text", "new")])),
                Record {
                    id: Some(5),
                    client_id: "c5".into(),
                    sync_status: SyncStatus::Updated,
                    fields: fields(&[("text", "edited")]),
                },
            ],
        ),
        Some("tok"),
    );
    let mut events = h.engine.subscribe();
    h.transport()
        .push_write(MockReply::Status(500))
        .push_read(MockReply::Body(EMPTY_READ.into()));

    let report = h.engine.sync(&["Note"]).await.unwrap();
    let note = report.model("Note").unwrap();
    assert!(matches!(
        note.push,
        PhaseOutcome::Failed {
            error: SyncError::Server { status: 500, .. },
            retry_scheduled: true
        }
    ));
    assert!(note.pull.is_ok());

    assert_eq!(h.record("c1").sync_status, SyncStatus::Created);
    assert_eq!(h.record("c5").sync_status, SyncStatus::Updated);
    assert_eq!(h.engine.metadata("Note").unwrap().write_lease_expiry, None);
    assert!(h.engine.retry_pending("Note"));
    assert!(drain(&mut events).contains(&SyncEvent::RetryScheduled {
        model: "Note".into(),
        attempt: 1,
        delay: Duration::from_secs(60),
    }));
}

#[tokio::test(start_paused = true)]
async fn scheduled_retry_completes_the_push() {
    let h = Harness::new(
        MemoryStore::with_records("Note", [Record::with_client_id("c1", fields(&[("text", "hi")]))]),
        Some("tok"),
    );
    let mut events = h.engine.subscribe();
    h.transport()
        .push_write(MockReply::Network("connection reset".into()))
        .push_write(MockReply::Body("meta\n42|c1".into()))
        .push_read(MockReply::Body(EMPTY_READ.into()))
        .push_read(MockReply::Body(EMPTY_READ.into()));

    h.engine.sync_all().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Pushed { written: 1, .. })).await;
    wait_for(&mut events, |e| matches!(e, SyncEvent::Pulled { .. })).await;

    assert_eq!(h.record("c1").id, Some(42));
    assert_eq!(h.record("c1").sync_status, SyncStatus::Current);
    assert!(!h.engine.retry_pending("Note"));
    assert_eq!(h.engine.stats().retries, 1);
}

#[tokio::test(start_paused = true)]
async fn retries_stop_after_max_attempts() {
    let config = SyncConfig::new().with_retry(
        RetryConfig::new(1)
            .with_base_delay(Duration::from_secs(1))
            .with_jitter(false),
    );
    let h = Harness::with_config(
        MemoryStore::with_records("Note", [Record::with_client_id("c1", fields(&[]))]),
        Some("tok"),
        config,
    );
    let mut events = h.engine.subscribe();
    h.transport()
        .push_write(MockReply::Status(503))
        .push_write(MockReply::Status(503))
        .push_read(MockReply::Body(EMPTY_READ.into()))
        .push_read(MockReply::Body(EMPTY_READ.into()));

    h.engine.sync_all().await.unwrap();
    let abandoned = wait_for(&mut events, |e| matches!(e, SyncEvent::RetryAbandoned { .. })).await;
    assert_eq!(
        abandoned,
        SyncEvent::RetryAbandoned {
            model: "Note".into(),
            attempts: 1
        }
    );
    assert_eq!(h.record("c1").sync_status, SyncStatus::Created);
}

#[tokio::test]
async fn rejected_credential_requires_reauthentication() {
    let h = Harness::new(
        MemoryStore::with_records("Note", [Record::with_client_id("c1", fields(&[]))]),
        Some("expired"),
    );
    let mut events = h.engine.subscribe();
    h.transport()
        .push_write(MockReply::Status(403))
        .push_read(MockReply::Status(403));

    let report = h.engine.sync_all().await.unwrap();
    assert!(!report.is_success());
    let note = report.model("Note").unwrap();
    assert!(matches!(
        note.push,
        PhaseOutcome::Failed {
            error: SyncError::Unauthorized(_),
            retry_scheduled: false
        }
    ));
    assert!(!h.engine.retry_pending("Note"));
    assert!(drain(&mut events).contains(&SyncEvent::ReauthenticationRequired {
        model: "Note".into()
    }));
}

#[tokio::test]
async fn held_lease_skips_push_until_it_expires() {
    let h = Harness::new(
        MemoryStore::with_records("Note", [Record::with_client_id("c1", fields(&[("text", "hi")]))]),
        Some("tok"),
    );
    // Another worker over the same store.
    let other = LeaseManager::new(h.store.clone(), h.clock.clone(), Duration::from_secs(60));
    assert!(other
        .acquire_write_lease("Note", Duration::from_secs(60))
        .unwrap());

    h.transport()
        .push_read(MockReply::Body(EMPTY_READ.into()))
        .push_write(MockReply::Body("meta\n42|c1".into()))
        .push_read(MockReply::Body(EMPTY_READ.into()));

    h.clock.advance(Duration::from_secs(59));
    let report = h.engine.sync(&["Note"]).await.unwrap();
    assert_eq!(
        report.model("Note").unwrap().push,
        PhaseOutcome::Skipped(SkipReason::LeaseHeld)
    );
    assert_eq!(h.record("c1").sync_status, SyncStatus::Created);

    h.clock.advance(Duration::from_secs(1));
    let report = h.engine.sync(&["Note"]).await.unwrap();
    assert!(matches!(
        report.model("Note").unwrap().push,
        PhaseOutcome::Pushed { written: 1, .. }
    ));
}

#[tokio::test]
async fn deletes_are_pushed_and_unsynced_deletes_stay_local() {
    let h = Harness::new(
        MemoryStore::with_records(
            "Note",
            [
                Record::from_server(3, Some("synced".into()), fields(&[("text", "a")])),
                Record::with_client_id("local", fields(&[("text", "b")])),
            ],
        ),
        Some("tok"),
    );
    h.engine.delete("Note", "synced").unwrap();
    h.engine.delete("Note", "local").unwrap();
    assert!(h.store.get("Note", "local").unwrap().is_none());
    assert_eq!(h.record("synced").sync_status, SyncStatus::Deleted);
    assert!(h.store.query("Note", &Query::all()).unwrap().is_empty());

    h.transport()
        .push_delete(MockReply::Body(String::new()))
        .push_read(MockReply::Body(EMPTY_READ.into()));
    let report = h.engine.sync(&["Note"]).await.unwrap();
    assert_eq!(
        report.model("Note").unwrap().push,
        PhaseOutcome::Pushed {
            written: 0,
            deleted: 1,
            purged: 0
        }
    );
    assert!(h.store.get("Note", "synced").unwrap().is_none());

    let calls = h.transport().calls();
    assert!(matches!(&calls[0], MockCall::Delete(request) if request.batch.len() == 1));
    assert!(calls
        .iter()
        .all(|c| !matches!(c, MockCall::CreateOrUpdate(_))));
}

#[tokio::test]
async fn failed_delete_keeps_record_deleted() {
    let h = Harness::new(
        MemoryStore::with_records(
            "Note",
            [Record {
                id: Some(3),
                client_id: "c3".into(),
                sync_status: SyncStatus::Deleted,
                fields: BTreeMap::new(),
            }],
        ),
        Some("tok"),
    );
    h.transport()
        .push_delete(MockReply::Status(500))
        .push_read(MockReply::Body(EMPTY_READ.into()));

    let outcome = h.engine.push("Note").await.unwrap();
    assert!(matches!(outcome, PhaseOutcome::Failed { retry_scheduled: true, .. }));
    assert_eq!(h.record("c3").sync_status, SyncStatus::Deleted);
}

#[tokio::test]
async fn malformed_ack_is_not_retried() {
    let h = Harness::new(
        MemoryStore::with_records("Note", [Record::with_client_id("c1", fields(&[]))]),
        Some("tok"),
    );
    h.transport().push_write(MockReply::Body("meta\nnot-a-number|c1".into()));

    let outcome = h.engine.push("Note").await.unwrap();
    assert!(matches!(
        outcome,
        PhaseOutcome::Failed {
            error: SyncError::Protocol(_),
            retry_scheduled: false
        }
    ));
    assert_eq!(h.record("c1").sync_status, SyncStatus::Created);
}

#[tokio::test]
async fn anonymous_and_read_only_models_are_never_pushed() {
    let store = MemoryStore::with_records("Book", [Record::with_client_id("b1", fields(&[]))]);
    let h = Harness::new(store, Some("tok"));
    h.transport()
        .push_read(MockReply::Body(EMPTY_READ.into()));
    let outcome = h.engine.push("Book").await.unwrap();
    assert_eq!(outcome, PhaseOutcome::Skipped(SkipReason::ReadOnly));
    assert!(matches!(
        h.engine.create("Book", fields(&[("title", "x")])),
        Err(SyncError::InvalidWrite(_))
    ));

    let h = Harness::new(
        MemoryStore::with_records("Note", [Record::with_client_id("c1", fields(&[]))]),
        None,
    );
    h.transport()
        .push_read(MockReply::Body(EMPTY_READ.into()));
    let report = h.engine.sync(&["Note"]).await.unwrap();
    let note = report.model("Note").unwrap();
    assert_eq!(note.push, PhaseOutcome::Skipped(SkipReason::Anonymous));
    assert!(note.pull.is_ok());
    assert_eq!(h.transport().calls().len(), 1);
}

#[tokio::test]
async fn local_edit_during_push_is_pushed_again() {
    let h = Harness::new(MemoryStore::new(), Some("tok"));
    let record = h.engine.create("Note", fields(&[("text", "v1")])).unwrap();
    h.transport().set_latency(Duration::from_millis(50));
    let ack = format!("meta\n42|{}", record.client_id);
    h.transport()
        .push_write(MockReply::Body(ack))
        .push_read(MockReply::Body(EMPTY_READ.into()));

    let engine = Arc::clone(&h.engine);
    let push = tokio::spawn(async move { engine.push("Note").await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.engine
        .update("Note", &record.client_id, fields(&[("text", "v2")]))
        .unwrap();
    push.await.unwrap().unwrap();

    let stored = h.record(&record.client_id);
    assert_eq!(stored.id, Some(42));
    assert_eq!(stored.sync_status, SyncStatus::Updated);
    assert_eq!(stored.get("text"), Some("v2"));
}

#[tokio::test(start_paused = true)]
async fn pull_during_push_does_not_duplicate_record() {
    let h = Harness::new(MemoryStore::new(), Some("tok"));
    let record = h.engine.create("Note", fields(&[("text", "hi")])).unwrap();
    h.transport()
        .push_write(MockReply::Body(format!("meta\n42|{}", record.client_id)))
        .push_read(MockReply::Body(
            "m|2021-01-01T00:00:00Z\nid|text\n42|hi".into(),
        ));

    // The write answers late; the read issued meanwhile answers at once.
    h.transport().set_latency(Duration::from_millis(100));
    let engine = Arc::clone(&h.engine);
    let push = tokio::spawn(async move { engine.push("Note").await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.transport().set_latency(Duration::ZERO);

    let pulled = h.engine.pull("Note").await.unwrap();
    assert!(matches!(pulled, PhaseOutcome::Pulled { applied: 1, .. }));
    assert_eq!(h.store.query("Note", &Query::all()).unwrap().len(), 2);

    let pushed = push.await.unwrap().unwrap();
    assert!(matches!(pushed, PhaseOutcome::Pushed { written: 1, .. }));

    let records = h.store.query("Note", &Query::all()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].client_id, record.client_id);
    assert_eq!(records[0].id, Some(42));
    assert_eq!(records[0].sync_status, SyncStatus::Current);

    // Nothing is left dirty, so the next push sends no write.
    let outcome = h.engine.push("Note").await.unwrap();
    assert!(matches!(outcome, PhaseOutcome::Pushed { written: 0, .. }));
    let writes = h
        .transport()
        .calls()
        .iter()
        .filter(|call| matches!(call, MockCall::CreateOrUpdate(_)))
        .count();
    assert_eq!(writes, 1);
}

#[tokio::test(start_paused = true)]
async fn query_refresh_during_push_keeps_one_copy() {
    let h = Harness::new(MemoryStore::new(), Some("tok"));
    let record = h.engine.create("Note", fields(&[("text", "hi")])).unwrap();
    h.transport()
        .push_write(MockReply::Body(format!("meta\n42|{}", record.client_id)))
        .push_read(MockReply::Body(
            "m|2021-01-01T00:00:00Z\nid|text\n42|hi".into(),
        ));

    h.transport().set_latency(Duration::from_millis(100));
    let engine = Arc::clone(&h.engine);
    let push = tokio::spawn(async move { engine.push("Note").await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.transport().set_latency(Duration::ZERO);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = Arc::new(move |response: BelatedResponse| {
        let _ = tx.send(response);
    });
    let result = h
        .engine
        .query("Note", Query::all(), Duration::from_secs(3600), listener)
        .unwrap();
    assert_eq!(result.records.len(), 1);
    result.pending.unwrap().finished().await;

    let response = rx.recv().await.unwrap();
    assert_eq!(response.error, None);
    assert_eq!(response.records.len(), 2);

    push.await.unwrap().unwrap();
    let records = h.store.query("Note", &Query::all()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].client_id, record.client_id);
    assert_eq!(records[0].id, Some(42));
    assert_eq!(records[0].sync_status, SyncStatus::Current);
}

#[tokio::test]
async fn unknown_models_are_rejected() {
    let h = Harness::new(MemoryStore::new(), None);
    assert!(matches!(
        h.engine.sync(&["Missing"]).await,
        Err(SyncError::UnknownModel(_))
    ));
    assert!(h.transport().calls().is_empty());
}

// --- end to end against an in-memory server ---

#[derive(Default)]
struct ServerState {
    next_id: i64,
    tick: i64,
    rows: BTreeMap<i64, (BTreeMap<String, String>, i64)>,
}

/// A record server kept in memory. Every write advances a one-second tick
/// that doubles as the watermark.
#[derive(Default)]
struct InMemoryServer {
    state: Mutex<ServerState>,
}

impl InMemoryServer {
    fn watermark(tick: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(tick)
    }
}

struct InMemoryTransport {
    server: Arc<InMemoryServer>,
}

impl SyncTransport for InMemoryTransport {
    async fn create_or_update(&self, request: &BatchRequest) -> SyncResult<WriteResponse> {
        let mut state = self.server.state.lock();
        state.tick += 1;
        let tick = state.tick;
        let columns = request.batch.columns().to_vec();
        let mut acks = Vec::new();
        for values in request.batch.rows() {
            let mut row: BTreeMap<String, String> =
                columns.iter().cloned().zip(values.iter().cloned()).collect();
            let id = match row.get(ID_COLUMN).and_then(|v| v.parse::<i64>().ok()) {
                Some(id) => id,
                None => {
                    state.next_id += 1;
                    state.next_id
                }
            };
            row.remove(ID_COLUMN);
            let client_id = row.get(CLIENT_ID_COLUMN).cloned().unwrap_or_default();
            state.rows.insert(id, (row, tick));
            acks.push(WriteAck {
                server_id: id,
                client_id,
            });
        }
        Ok(WriteResponse {
            meta: "ok".into(),
            acks,
        })
    }

    async fn delete(&self, request: &BatchRequest) -> SyncResult<()> {
        let mut state = self.server.state.lock();
        state.tick += 1;
        let tick = state.tick;
        let id_index = request
            .batch
            .columns()
            .iter()
            .position(|c| c == ID_COLUMN)
            .unwrap_or(0);
        for values in request.batch.rows() {
            if let Ok(id) = values[id_index].parse::<i64>() {
                let mut tombstone = BTreeMap::new();
                tombstone.insert(DELETE_COLUMN.to_string(), TOMBSTONE_VALUE.to_string());
                state.rows.insert(id, (tombstone, tick));
            }
        }
        Ok(())
    }

    async fn read(&self, request: &ReadRequest) -> SyncResult<ReadResponse> {
        let state = self.server.state.lock();
        let since = request
            .last_timestamp
            .map(|ts| (ts - InMemoryServer::watermark(0)).num_seconds())
            .unwrap_or(-1);
        let columns: Vec<String> = [ID_COLUMN, CLIENT_ID_COLUMN, "text", DELETE_COLUMN]
            .into_iter()
            .map(String::from)
            .collect();
        let rows = state
            .rows
            .iter()
            .filter(|(_, (_, changed))| *changed > since)
            .map(|(id, (fields, _))| {
                let mut fields = fields.clone();
                for column in &columns[1..] {
                    fields.entry(column.clone()).or_default();
                }
                Row::new(*id, fields)
            })
            .collect();
        Ok(ReadResponse {
            meta: "ok".into(),
            watermark: InMemoryServer::watermark(state.tick),
            columns,
            rows,
        })
    }
}

fn client(server: &Arc<InMemoryServer>) -> Arc<SyncEngine<InMemoryTransport, MemoryStore>> {
    let engine = SyncEngine::builder(
        InMemoryTransport {
            server: Arc::clone(server),
        },
        Arc::new(MemoryStore::new()),
    )
    .model(note())
    .credentials(Credential::new("tok"))
    .build();
    engine.configure().unwrap();
    engine
}

#[tokio::test]
async fn two_clients_converge_through_the_server() {
    let server = Arc::new(InMemoryServer::default());
    let alice = client(&server);
    let bob = client(&server);

    let note = alice.create("Note", fields(&[("text", "hello")])).unwrap();
    alice.sync_all().await.unwrap();

    // Pulling its own write back must not duplicate the record.
    let alice_notes = alice.store().query("Note", &Query::all()).unwrap();
    assert_eq!(alice_notes.len(), 1);
    assert_eq!(alice_notes[0].client_id, note.client_id);
    assert_eq!(alice_notes[0].sync_status, SyncStatus::Current);
    let server_id = alice_notes[0].id.unwrap();

    bob.sync_all().await.unwrap();
    let bob_note = bob.store().find_by_server_id("Note", server_id).unwrap().unwrap();
    assert_eq!(bob_note.client_id, note.client_id);
    assert_eq!(bob_note.get("text"), Some("hello"));

    bob.update("Note", &note.client_id, fields(&[("text", "edited")]))
        .unwrap();
    bob.sync_all().await.unwrap();
    alice.sync_all().await.unwrap();
    assert_eq!(
        alice.store().get("Note", &note.client_id).unwrap().unwrap().get("text"),
        Some("edited")
    );

    alice.delete("Note", &note.client_id).unwrap();
    alice.sync_all().await.unwrap();
    bob.sync_all().await.unwrap();
    assert!(alice.store().query("Note", &Query::all().including_deleted()).unwrap().is_empty());
    assert!(bob.store().query("Note", &Query::all()).unwrap().is_empty());

    let second_pull = bob.sync_all().await.unwrap();
    assert!(matches!(
        second_pull.model("Note").unwrap().pull,
        PhaseOutcome::Pulled { applied: 0, removed: 0, .. }
    ));
}
