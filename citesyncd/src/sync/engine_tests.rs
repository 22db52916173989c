use super::*;
use crate::sync::connectivity::{ConnectivityMonitor, ManualConnectivity};
use crate::sync::reconcile::LocalCollection;
use serde_json::json;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config() -> EngineConfig {
    EngineConfig {
        max_attempts: 3,
        retry_base: Duration::from_millis(1),
        retry_ceiling: 3,
    }
}

async fn make_offline_engine(server: &MockServer) -> SyncEngine {
    let client = BackendClient::with_timeout(&server.uri(), Duration::from_secs(2)).unwrap();
    let store = LocalStore::in_memory().await.unwrap();
    SyncEngine::open(client, store, test_config()).await.unwrap()
}

async fn make_engine(server: &MockServer) -> SyncEngine {
    let engine = make_offline_engine(server).await;
    engine.set_online(true);
    engine
}

fn offline_record(kind: EntityKind, id: &str, parent: Option<&str>, data: Value) -> LocalRecord {
    LocalRecord {
        kind,
        id: id.into(),
        parent_id: parent.map(str::to_string),
        data,
        offline: true,
        synced: false,
    }
}

async fn received(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| format!("{} {}", request.method, request.url.path()))
        .collect()
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn update_waits_for_failed_create_of_same_entity() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/lists"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/lists"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "L-42",
            "name": "A"
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/lists/L-42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "L-42", "name": "B"})))
        .expect(1)
        .mount(&server)
        .await;

    let engine = make_engine(&server).await;
    engine
        .store()
        .put_record(&offline_record(EntityKind::List, "temp_1", None, json!({"name": "A"})))
        .await
        .unwrap();
    engine
        .enqueue_create(EntityKind::List, "temp_1", json!({"name": "A"}), None)
        .await
        .unwrap();
    engine
        .enqueue_update(EntityKind::List, "temp_1", json!({"name": "B"}), None)
        .await
        .unwrap();

    let first = engine.drain().await.unwrap();
    assert!(!first.success);
    assert_eq!(first.synced, 0);
    assert_eq!(first.deferred, 2);
    assert_eq!(first.failed, 2);
    assert!(first.errors.is_empty());
    assert_eq!(received(&server).await, vec!["POST /lists"; 3]);

    let second = engine.drain().await.unwrap();
    assert!(second.success);
    assert_eq!(second.synced, 2);
    assert_eq!(
        received(&server).await,
        vec![
            "POST /lists",
            "POST /lists",
            "POST /lists",
            "POST /lists",
            "PUT /lists/L-42"
        ]
    );

    let record = engine
        .store()
        .get_record(EntityKind::List, "L-42")
        .await
        .unwrap()
        .unwrap();
    assert!(record.synced);
    assert!(!record.offline);
    assert!(
        engine
            .store()
            .get_record(EntityKind::List, "temp_1")
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(engine.state().pending_count, 0);
}

#[tokio::test]
async fn second_drain_on_empty_queue_is_a_noop() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/lists/L-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let engine = make_engine(&server).await;
    engine
        .store()
        .put_record(&offline_record(EntityKind::List, "L-1", None, json!({})))
        .await
        .unwrap();
    engine
        .enqueue_delete(EntityKind::List, "L-1", None)
        .await
        .unwrap();
    let mut events = engine.subscribe_reconciliations();

    let first = engine.drain().await.unwrap();
    assert_eq!(first.synced, 1);
    assert_eq!(
        events.try_recv().unwrap(),
        Reconciliation::Removed {
            kind: EntityKind::List,
            id: "L-1".into(),
        }
    );
    assert!(
        engine
            .store()
            .get_record(EntityKind::List, "L-1")
            .await
            .unwrap()
            .is_none()
    );

    let second = engine.drain().await.unwrap();
    assert!(second.success);
    assert_eq!(second.synced, 0);
    assert_eq!(second.failed, 0);
    assert!(second.skipped.is_none());
    assert_eq!(received(&server).await.len(), 1);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn dependent_citation_uses_permanent_list_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/lists"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "L-42",
            "name": "Reading"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/lists/L-42/citations"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": 7,
            "title": "Dune"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let engine = make_engine(&server).await;
    let store = engine.store();
    store
        .put_record(&offline_record(EntityKind::List, "L-1", None, json!({"name": "Old"})))
        .await
        .unwrap();
    store
        .put_record(&offline_record(EntityKind::List, "temp_l", None, json!({"name": "Reading"})))
        .await
        .unwrap();
    store
        .put_record(&offline_record(
            EntityKind::Citation,
            "temp_c",
            Some("temp_l"),
            json!({"title": "Dune"}),
        ))
        .await
        .unwrap();
    engine
        .enqueue_create(EntityKind::List, "temp_l", json!({"name": "Reading"}), None)
        .await
        .unwrap();
    engine
        .enqueue_create(
            EntityKind::Citation,
            "temp_c",
            json!({"title": "Dune"}),
            Some("temp_l"),
        )
        .await
        .unwrap();

    let mut lists =
        LocalCollection::new(EntityKind::List, store.list_records(EntityKind::List, None).await.unwrap());
    let mut citations = LocalCollection::new(
        EntityKind::Citation,
        store.list_records(EntityKind::Citation, None).await.unwrap(),
    );
    let mut events = engine.subscribe_reconciliations();

    let report = engine.drain().await.unwrap();
    assert_eq!(report.synced, 2);
    assert!(report.success);

    while let Ok(event) = events.try_recv() {
        lists.apply(&event);
        citations.apply(&event);
    }
    let list_ids: Vec<_> = lists.records().iter().map(|r| r.id.as_str()).collect();
    assert_eq!(list_ids, vec!["L-1", "L-42"]);
    assert!(lists.get("L-42").unwrap().synced);

    let citation = citations.get("7").unwrap();
    assert_eq!(citation.parent_id.as_deref(), Some("L-42"));
    assert_eq!(citation.data["title"], "Dune");

    let stored = store
        .get_record(EntityKind::Citation, "7")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.parent_id.as_deref(), Some("L-42"));
    assert!(stored.synced);
    assert_eq!(store.resolve_id("temp_l").await.unwrap(), "L-42");
}

#[tokio::test]
async fn retry_ceiling_parks_item_until_retry_failed() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/projects/P-1"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(9)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/projects/P-1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let engine = make_engine(&server).await;
    let item = engine
        .enqueue_delete(EntityKind::Project, "P-1", None)
        .await
        .unwrap();

    for cycle in 1..=2u32 {
        let report = engine.drain().await.unwrap();
        assert_eq!(report.deferred, 1);
        assert!(report.errors.is_empty());
        let stored = engine.queue().get(&item.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, cycle);
    }

    let third = engine.drain().await.unwrap();
    assert_eq!(third.failed, 1);
    assert_eq!(third.errors.len(), 1);
    assert_eq!(third.errors[0].retry_count, 3);
    assert!(!third.errors[0].permanent);
    assert_eq!(received(&server).await.len(), 9);
    let state = engine.state();
    assert_eq!(state.pending_count, 1);
    assert!(state.last_error.as_deref().unwrap().contains("503"));

    let parked = engine.drain().await.unwrap();
    assert_eq!(parked.errors.len(), 1);
    assert_eq!(parked.errors[0].item_id, item.id);
    assert_eq!(received(&server).await.len(), 9);

    let retried = engine.retry_failed().await.unwrap();
    assert!(retried.success);
    assert_eq!(retried.synced, 1);
    assert_eq!(received(&server).await.len(), 10);
    assert_eq!(engine.queue().count().await.unwrap(), 0);
    assert!(engine.state().last_error.is_none());
}

#[tokio::test]
async fn concurrent_drain_is_refused_while_syncing() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/lists/L-1"))
        .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_millis(300)))
        .expect(1)
        .mount(&server)
        .await;

    let engine = Arc::new(make_engine(&server).await);
    engine
        .enqueue_delete(EntityKind::List, "L-1", None)
        .await
        .unwrap();

    let running = Arc::clone(&engine);
    let first = tokio::spawn(async move { running.drain().await });
    let watched = Arc::clone(&engine);
    wait_until(move || watched.state().is_syncing).await;

    let second = engine.drain().await.unwrap();
    assert_eq!(second.skipped, Some(SkipReason::AlreadySyncing));
    assert_eq!(second.synced, 0);
    assert_eq!(second.failed, 0);

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.synced, 1);
    assert!(!engine.state().is_syncing);
    assert_eq!(received(&server).await.len(), 1);
}

#[tokio::test]
async fn offline_queue_drains_once_on_reconnect() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/lists/L-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let engine = Arc::new(make_offline_engine(&server).await);
    let source = ManualConnectivity::new(false);
    let transitions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&transitions);
    let monitor = ConnectivityMonitor::start_with(&source, Arc::clone(&engine), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    let _subscription = engine.subscribe(move |state| sink.lock().unwrap().push(state.clone()));

    engine
        .enqueue_delete(EntityKind::List, "L-1", None)
        .await
        .unwrap();
    let skipped = engine.drain().await.unwrap();
    assert_eq!(skipped.skipped, Some(SkipReason::Offline));
    assert!(received(&server).await.is_empty());
    assert_eq!(engine.state().pending_count, 1);

    source.set_online(true);
    source.set_online(true);
    let watched = Arc::clone(&engine);
    wait_until(move || {
        let state = watched.state();
        state.pending_count == 0 && !state.is_syncing
    })
    .await;

    assert!(monitor.is_online());
    assert_eq!(transitions.load(Ordering::SeqCst), 1);
    assert_eq!(received(&server).await.len(), 1);

    let states = states.lock().unwrap().clone();
    let first_syncing = states.iter().position(|s| s.is_syncing).unwrap();
    assert!(states[..first_syncing].iter().any(|s| s.is_online));
    assert!(states.last().unwrap().last_sync_at.is_some());

    source.set_online(false);
    let seen = Arc::clone(&transitions);
    wait_until(move || seen.load(Ordering::SeqCst) == 2).await;
    assert!(!engine.is_online());

    monitor.shutdown().await;
}

#[tokio::test]
async fn unsendable_mutation_is_parked_without_network() {
    let server = MockServer::start().await;
    let engine = make_engine(&server).await;
    let item = engine
        .enqueue_create(EntityKind::Citation, "temp_c", json!({"title": "Orphan"}), None)
        .await
        .unwrap();

    let report = engine.drain().await.unwrap();
    assert!(!report.success);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].permanent);
    assert!(report.errors[0].error.contains("parent list id"));
    assert!(received(&server).await.is_empty());

    let stored = engine.queue().get(&item.id).await.unwrap().unwrap();
    assert_eq!(stored.retry_count, 3);

    let again = engine.drain().await.unwrap();
    assert_eq!(again.errors.len(), 1);
    assert!(received(&server).await.is_empty());
}

#[tokio::test]
async fn create_reply_without_id_is_a_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/projects"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"name": "Thesis"})))
        .mount(&server)
        .await;

    let engine = make_engine(&server).await;
    let item = engine
        .enqueue_create(EntityKind::Project, "temp_p", json!({"name": "Thesis"}), None)
        .await
        .unwrap();

    let report = engine.drain().await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(received(&server).await.len(), 1);
    let stored = engine.queue().get(&item.id).await.unwrap().unwrap();
    assert_eq!(stored.retry_count, 1);
    assert!(stored.last_error.unwrap().contains("did not include an id"));
}

#[tokio::test]
async fn update_marks_local_record_synced() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/lists/L-5/citations/C-9"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let engine = make_engine(&server).await;
    engine
        .store()
        .put_record(&offline_record(
            EntityKind::Citation,
            "C-9",
            Some("L-5"),
            json!({"title": "Revised"}),
        ))
        .await
        .unwrap();
    engine
        .enqueue_update(
            EntityKind::Citation,
            "C-9",
            json!({"title": "Revised"}),
            Some("L-5"),
        )
        .await
        .unwrap();

    let report = engine.drain().await.unwrap();
    assert_eq!(report.synced, 1);
    let record = engine
        .store()
        .get_record(EntityKind::Citation, "C-9")
        .await
        .unwrap()
        .unwrap();
    assert!(record.synced);
}

#[tokio::test]
async fn storage_failure_aborts_drain() {
    let server = MockServer::start().await;
    let engine = make_engine(&server).await;
    engine.store().close().await;

    let err = engine.drain().await.unwrap_err();
    assert!(matches!(err, EngineError::Storage(_)));
    let state = engine.state();
    assert!(!state.is_syncing);
    assert!(state.last_error.is_some());

    // The drain flag is released after an aborted cycle.
    assert!(engine.drain().await.is_err());
}

#[tokio::test]
async fn clear_queue_resets_pending_count() {
    let server = MockServer::start().await;
    let engine = make_offline_engine(&server).await;
    for id in ["P-1", "P-2"] {
        engine
            .enqueue_delete(EntityKind::Project, id, None)
            .await
            .unwrap();
    }
    assert_eq!(engine.state().pending_count, 2);

    assert_eq!(engine.clear_queue().await.unwrap(), 2);
    assert_eq!(engine.state().pending_count, 0);
}

#[tokio::test]
async fn created_record_keeps_pending_local_edit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/lists"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "L-42",
            "name": "A",
            "owner": "u-1"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/lists/L-42"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/lists/L-42"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let engine = make_engine(&server).await;
    engine
        .store()
        .put_record(&offline_record(EntityKind::List, "temp_1", None, json!({"name": "B"})))
        .await
        .unwrap();
    engine
        .enqueue_create(EntityKind::List, "temp_1", json!({"name": "A"}), None)
        .await
        .unwrap();
    engine
        .enqueue_update(EntityKind::List, "temp_1", json!({"name": "B"}), None)
        .await
        .unwrap();
    let mut events = engine.subscribe_reconciliations();

    let first = engine.drain().await.unwrap();
    assert_eq!(first.synced, 1);
    assert_eq!(first.deferred, 1);

    let record = engine
        .store()
        .get_record(EntityKind::List, "L-42")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.data, json!({"id": "L-42", "name": "B", "owner": "u-1"}));
    assert!(!record.synced);
    assert!(!record.offline);
    match events.try_recv().unwrap() {
        Reconciliation::IdReplaced { temp_id, record } => {
            assert_eq!(temp_id, "temp_1");
            assert!(!record.synced);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(events.try_recv().is_err());

    let second = engine.drain().await.unwrap();
    assert!(second.success);
    assert_eq!(second.synced, 1);
    let record = engine
        .store()
        .get_record(EntityKind::List, "L-42")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.data["name"], "B");
    assert!(record.synced);
    assert_eq!(
        events.try_recv().unwrap(),
        Reconciliation::Synced {
            kind: EntityKind::List,
            id: "L-42".into(),
        }
    );
}

#[tokio::test]
async fn create_update_delete_replay_in_order_after_failed_create() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/lists"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/lists"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "L-42"})))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/lists/L-42"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/lists/L-42"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let engine = make_engine(&server).await;
    engine
        .enqueue_create(EntityKind::List, "temp_1", json!({"name": "A"}), None)
        .await
        .unwrap();
    engine
        .enqueue_update(EntityKind::List, "temp_1", json!({"name": "B"}), None)
        .await
        .unwrap();
    engine
        .enqueue_delete(EntityKind::List, "temp_1", None)
        .await
        .unwrap();

    let first = engine.drain().await.unwrap();
    assert_eq!(first.synced, 0);
    assert_eq!(first.deferred, 3);
    assert_eq!(received(&server).await, vec!["POST /lists"; 3]);

    let second = engine.drain().await.unwrap();
    assert!(second.success);
    assert_eq!(second.synced, 3);
    assert_eq!(
        received(&server).await[3..],
        ["POST /lists", "PUT /lists/L-42", "DELETE /lists/L-42"]
    );
    assert_eq!(engine.queue().count().await.unwrap(), 0);
    for id in ["temp_1", "L-42"] {
        assert!(
            engine
                .store()
                .get_record(EntityKind::List, id)
                .await
                .unwrap()
                .is_none()
        );
    }
}

#[tokio::test]
async fn rapid_connectivity_flip_reports_every_edge() {
    let server = MockServer::start().await;
    let engine = Arc::new(make_offline_engine(&server).await);
    let source = ManualConnectivity::new(false);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let monitor = ConnectivityMonitor::start_with(&source, Arc::clone(&engine), move |online| {
        sink.lock().unwrap().push(online);
    });

    source.set_online(true);
    source.set_online(false);
    source.set_online(true);

    let watched = Arc::clone(&seen);
    wait_until(move || watched.lock().unwrap().len() == 3).await;
    assert_eq!(*seen.lock().unwrap(), vec![true, false, true]);
    assert!(monitor.is_online());
    assert!(engine.is_online());

    monitor.shutdown().await;
}
