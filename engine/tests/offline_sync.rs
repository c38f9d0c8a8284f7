//! End-to-end scenarios for the sync engine against the in-memory gateway.

use postsync_engine::{
    Clock, EngineConfig, Error, GatewayCall, ManualClock, MemoryKv, MockGateway, NewRecord, OpKind,
    ReachabilityMonitor, Record, RecordPatch, RetryPolicy, SyncEngine, SyncState,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn config() -> EngineConfig {
    EngineConfig::default().with_retry(RetryPolicy::immediate())
}

async fn open(kv: Arc<MemoryKv>, gateway: Arc<MockGateway>) -> SyncEngine {
    SyncEngine::open(
        config(),
        kv,
        gateway,
        Arc::new(ManualClock::at_millis(1_700_000_000_000)),
    )
    .await
}

fn post(title: &str) -> NewRecord {
    NewRecord::new(title, format!("{} body", title), "ada")
}

fn titles(records: &[Record]) -> Vec<String> {
    let mut titles: Vec<String> = records.iter().map(|r| r.title.clone()).collect();
    titles.sort();
    titles
}

// ============================================================================
// Offline creation
// ============================================================================

#[tokio::test]
async fn offline_create_is_remapped_after_reconnect() {
    let gateway = Arc::new(MockGateway::new());
    let engine = open(Arc::new(MemoryKv::new()), gateway.clone()).await;

    let local = engine.create_local(post("hello")).await.unwrap();
    assert!(local.id.starts_with("local-"));
    engine.drain().await;
    assert_eq!(gateway.call_count(), 0);

    engine.set_online(true);
    engine.drain().await;

    let records = engine.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "srv-1");
    assert_eq!(records[0].title, "hello");
    assert_eq!(engine.sync_state("srv-1"), Some(SyncState::Synced));
    assert_eq!(engine.sync_state(&local.id), None);
    assert!(engine.pending_ops().is_empty());
    assert_eq!(engine.status().pending, 0);
}

#[tokio::test]
async fn failures_are_retried_without_duplicates() {
    let gateway = Arc::new(MockGateway::new());
    let engine = open(Arc::new(MemoryKv::new()), gateway.clone()).await;

    for title in ["a", "b", "c"] {
        engine.create_local(post(title)).await.unwrap();
    }
    gateway.fail_next(Error::Network("reset".into()));
    gateway.fail_next(Error::Server {
        status: 502,
        message: "bad gateway".into(),
    });

    engine.set_online(true);
    let report = engine.drain().await;

    assert_eq!(report.delivered, 3);
    assert_eq!(report.retried, 2);
    assert_eq!(gateway.remote_records().len(), 3);
    assert_eq!(titles(&engine.records()), vec!["a", "b", "c"]);
    assert!(engine.records().iter().all(|r| r.id.starts_with("srv-")));
    assert!(engine.pending_ops().is_empty());
}

#[tokio::test]
async fn lost_response_does_not_duplicate_create() {
    let gateway = Arc::new(MockGateway::new());
    let engine = open(Arc::new(MemoryKv::new()), gateway.clone()).await;
    engine.create_local(post("once")).await.unwrap();
    gateway.lose_next_response();

    engine.set_online(true);
    let first = engine.drain().await;
    assert_eq!(first.retried, 1);
    assert_eq!(gateway.remote_records().len(), 1);
    assert_eq!(engine.pending_ops()[0].attempts, 1);

    engine.drain().await;
    assert_eq!(gateway.remote_records().len(), 1);
    assert_eq!(engine.records()[0].id, "srv-1");
}

#[tokio::test]
async fn refresh_after_lost_create_response_shows_one_copy() {
    let gateway = Arc::new(MockGateway::new());
    let engine = open(Arc::new(MemoryKv::new()), gateway.clone()).await;
    let local = engine.create_local(post("A")).await.unwrap();
    gateway.lose_next_response();

    engine.set_online(true);
    engine.drain().await;
    let merged = engine.refresh().await.unwrap();

    assert!(merged.inserted.is_empty());
    assert_eq!(merged.skipped_pending, vec!["srv-1".to_string()]);
    let ids: Vec<String> = engine.records().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![local.id]);

    engine.drain().await;
    let ids: Vec<String> = engine.records().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["srv-1"]);

    // Once the create is answered, listings merge normally again.
    gateway.insert_remote(Record::new(
        "srv-9",
        post("B"),
        chrono::DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
    ));
    let merged = engine.refresh().await.unwrap();
    assert_eq!(merged.inserted, vec!["srv-9".to_string()]);
}

#[tokio::test]
async fn delete_after_lost_create_response_stays_deleted() {
    let gateway = Arc::new(MockGateway::new());
    let engine = open(Arc::new(MemoryKv::new()), gateway.clone()).await;
    let local = engine.create_local(post("A")).await.unwrap();
    gateway.lose_next_response();

    engine.set_online(true);
    engine.drain().await;
    engine.refresh().await.unwrap();
    engine.delete_local(&local.id).await.unwrap();
    engine.drain().await;

    assert!(engine.records().is_empty());
    assert!(engine.pending_ops().is_empty());
    assert!(gateway.remote_records().is_empty());
    assert_eq!(engine.sync_state("srv-1"), None);
}

// ============================================================================
// Restart
// ============================================================================

#[tokio::test]
async fn queue_survives_restart() {
    let kv = Arc::new(MemoryKv::new());
    let gateway = Arc::new(MockGateway::new());

    let a_id = {
        let engine = open(kv.clone(), gateway.clone()).await;
        let a = engine.create_local(post("a")).await.unwrap();
        engine.create_local(post("b")).await.unwrap();
        engine
            .update_local(&a.id, RecordPatch::default().title("a2"))
            .await
            .unwrap();
        a.id
    };

    let engine = open(kv.clone(), gateway.clone()).await;
    let kinds: Vec<OpKind> = engine.pending_ops().iter().map(|op| op.kind).collect();
    assert_eq!(kinds, vec![OpKind::Create, OpKind::Create, OpKind::Update]);
    assert_eq!(engine.get(&a_id).unwrap().title, "a2");

    engine.set_online(true);
    engine.drain().await;

    assert_eq!(titles(&gateway.remote_records()), vec!["a2", "b"]);
    assert_eq!(
        gateway.calls().last(),
        Some(&GatewayCall::Update {
            id: "srv-1".into(),
            patch: RecordPatch::default().title("a2"),
        })
    );

    let reopened = open(kv, gateway.clone()).await;
    assert!(reopened.pending_ops().is_empty());
    assert_eq!(titles(&reopened.records()), vec!["a2", "b"]);
    assert!(reopened.records().iter().all(|r| r.id.starts_with("srv-")));
}

// ============================================================================
// Deletes
// ============================================================================

#[tokio::test]
async fn delete_before_delivery_makes_no_calls() {
    let gateway = Arc::new(MockGateway::new());
    let engine = open(Arc::new(MemoryKv::new()), gateway.clone()).await;

    let record = engine.create_local(post("short-lived")).await.unwrap();
    engine
        .update_local(&record.id, RecordPatch::default().content("edited"))
        .await
        .unwrap();
    engine.delete_local(&record.id).await.unwrap();

    engine.set_online(true);
    engine.drain().await;

    assert_eq!(gateway.call_count(), 0);
    assert!(engine.records().is_empty());
    assert!(engine.pending_ops().is_empty());
    assert_eq!(engine.sync_state(&record.id), None);
}

#[tokio::test]
async fn delete_during_inflight_create_follows_server_id() {
    let gateway = Arc::new(MockGateway::new());
    let engine = open(Arc::new(MemoryKv::new()), gateway.clone()).await;
    let record = engine.create_local(post("racing")).await.unwrap();

    gateway.pause();
    engine.set_online(true);
    let draining = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.drain().await })
    };
    while gateway.call_count() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    engine.delete_local(&record.id).await.unwrap();
    let kinds: Vec<OpKind> = engine.pending_ops().iter().map(|op| op.kind).collect();
    assert_eq!(kinds, vec![OpKind::Create, OpKind::Delete]);

    gateway.resume();
    draining.await.unwrap();

    assert_eq!(
        gateway.calls().last(),
        Some(&GatewayCall::Delete { id: "srv-1".into() })
    );
    assert!(gateway.remote_records().is_empty());
    assert!(engine.records().is_empty());
    assert!(engine.pending_ops().is_empty());
    assert_eq!(engine.sync_state("srv-1"), None);
}

#[tokio::test]
async fn update_of_record_deleted_on_server_is_dropped() {
    let clock = Arc::new(ManualClock::at_millis(0));
    let gateway = Arc::new(MockGateway::with_clock(clock.clone()));
    gateway.insert_remote(Record::new("srv-9", post("remote"), clock.peek()));

    let engine = open(Arc::new(MemoryKv::new()), gateway.clone()).await;
    engine.set_online(true);
    engine.refresh().await.unwrap();
    assert_eq!(engine.sync_state("srv-9"), Some(SyncState::Synced));

    gateway.remove_remote("srv-9");
    engine
        .update_local("srv-9", RecordPatch::default().title("too late"))
        .await
        .unwrap();
    let report = engine.drain().await;

    assert_eq!(report.dropped, 1);
    assert!(engine.records().is_empty());
    assert!(engine.pending_ops().is_empty());
    assert_eq!(engine.sync_state("srv-9"), None);
}

// ============================================================================
// Coalescing and reconciliation
// ============================================================================

#[tokio::test]
async fn offline_updates_are_coalesced() {
    let gateway = Arc::new(MockGateway::new());
    gateway.insert_remote(Record::new("srv-1", post("orig"), chrono::Utc::now()));
    let engine = open(Arc::new(MemoryKv::new()), gateway.clone()).await;
    engine.set_online(true);
    engine.refresh().await.unwrap();
    engine.set_online(false);

    engine
        .update_local("srv-1", RecordPatch::default().title("t2"))
        .await
        .unwrap();
    engine
        .update_local("srv-1", RecordPatch::default().content("c2"))
        .await
        .unwrap();
    assert_eq!(engine.pending_ops().len(), 1);

    engine.set_online(true);
    engine.drain().await;

    assert_eq!(
        gateway.calls().last(),
        Some(&GatewayCall::Update {
            id: "srv-1".into(),
            patch: RecordPatch::default().title("t2").content("c2"),
        })
    );
    let remote = gateway.remote_record("srv-1").unwrap();
    assert_eq!((remote.title.as_str(), remote.content.as_str()), ("t2", "c2"));
}

#[tokio::test]
async fn refresh_merges_last_write_wins() {
    let clock = Arc::new(ManualClock::at_millis(1_000));
    let gateway = Arc::new(MockGateway::with_clock(clock.clone()));
    gateway.insert_remote(Record::new("srv-1", post("kept"), clock.now()));
    gateway.insert_remote(Record::new("srv-2", post("stale"), clock.now()));
    gateway.insert_remote(Record::new("srv-3", post("doomed"), clock.now()));

    let engine = SyncEngine::open(config(), Arc::new(MemoryKv::new()), gateway.clone(), clock.clone())
        .await;
    engine.set_online(true);
    let first = engine.refresh().await.unwrap();
    assert_eq!(first.inserted.len(), 3);

    let mut newer = gateway.remote_record("srv-2").unwrap();
    newer.title = "fresh".into();
    newer.updated_at = clock.now();
    gateway.insert_remote(newer);
    gateway.remove_remote("srv-3");

    engine.set_online(false);
    engine
        .update_local("srv-1", RecordPatch::default().title("local edit"))
        .await
        .unwrap();
    engine.set_online(true);
    let mut server_copy = gateway.remote_record("srv-1").unwrap();
    server_copy.title = "server edit".into();
    server_copy.updated_at = clock.now();
    gateway.insert_remote(server_copy);

    let merged = engine.refresh().await.unwrap();

    assert_eq!(merged.updated, vec!["srv-2"]);
    assert_eq!(merged.removed, vec!["srv-3"]);
    assert_eq!(merged.skipped_pending, vec!["srv-1"]);
    assert_eq!(engine.get("srv-1").unwrap().title, "local edit");
    assert_eq!(engine.get("srv-2").unwrap().title, "fresh");
    assert!(engine.get("srv-3").is_none());
}

// ============================================================================
// Background loop
// ============================================================================

#[tokio::test]
async fn run_loop_syncs_when_connectivity_returns() {
    let gateway = Arc::new(MockGateway::new());
    let engine = open(Arc::new(MemoryKv::new()), gateway.clone()).await;
    let monitor = ReachabilityMonitor::new();
    let handle = engine.spawn(monitor.subscribe());

    engine.create_local(post("queued")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(gateway.call_count(), 0);

    monitor.set_online(true);
    let mut status = engine.watch_status();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.online == Some(true) && s.pending == 0),
    )
    .await
    .expect("sync did not finish")
    .unwrap();
    assert_eq!(engine.records()[0].id, "srv-1");

    // While online, new intents are delivered without an explicit drain.
    engine.create_local(post("live")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while gateway.remote_records().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("live create not delivered");

    drop(monitor);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run loop did not stop")
        .unwrap();
}

// ============================================================================
// Replay equivalence
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Field {
    Title,
    Content,
    Author,
}

#[derive(Debug, Clone)]
enum Intent {
    Create(String),
    Edit(usize, Field, String),
    Delete(usize),
}

fn intent() -> impl Strategy<Value = Intent> {
    let field = prop_oneof![Just(Field::Title), Just(Field::Content), Just(Field::Author)];
    prop_oneof![
        "[a-z]{1,6}".prop_map(Intent::Create),
        (0usize..4, field, "[a-z]{1,6}").prop_map(|(i, f, v)| Intent::Edit(i, f, v)),
        (0usize..4).prop_map(Intent::Delete),
    ]
}

fn fields(records: &[Record]) -> Vec<(String, String, String)> {
    records
        .iter()
        .map(|r| (r.title.clone(), r.content.clone(), r.author.clone()))
        .collect()
}

async fn apply(engine: &SyncEngine, intent: &Intent) {
    let records = engine.records();
    match intent {
        Intent::Create(title) => {
            engine.create_local(post(title)).await.unwrap();
        }
        Intent::Edit(i, field, value) => {
            if let Some(target) = records.get(*i) {
                let patch = match field {
                    Field::Title => RecordPatch::default().title(value.clone()),
                    Field::Content => RecordPatch::default().content(value.clone()),
                    Field::Author => RecordPatch::default().author(value.clone()),
                };
                engine.update_local(&target.id, patch).await.unwrap();
            }
        }
        Intent::Delete(i) => {
            if let Some(target) = records.get(*i) {
                engine.delete_local(&target.id).await.unwrap();
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn offline_replay_matches_online_application(intents in prop::collection::vec(intent(), 1..12)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let (offline_local, offline_remote, online_local, online_remote) = runtime.block_on(async {
            let offline_gateway = Arc::new(MockGateway::new());
            let offline = open(Arc::new(MemoryKv::new()), offline_gateway.clone()).await;
            for intent in &intents {
                apply(&offline, intent).await;
            }
            offline.set_online(true);
            offline.drain().await;

            let online_gateway = Arc::new(MockGateway::new());
            let online = open(Arc::new(MemoryKv::new()), online_gateway.clone()).await;
            online.set_online(true);
            for intent in &intents {
                apply(&online, intent).await;
                online.drain().await;
            }

            (
                fields(&offline.records()),
                fields(&offline_gateway.remote_records()),
                fields(&online.records()),
                fields(&online_gateway.remote_records()),
            )
        });

        prop_assert_eq!(&offline_local, &online_local);
        prop_assert_eq!(&offline_remote, &online_remote);
        prop_assert_eq!(&offline_local, &offline_remote);
    }
}
