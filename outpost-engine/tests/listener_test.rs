mod common;

use common::*;
use outpost_engine::Listened;
use outpost_model::ProjectId;
use outpost_store::ChangeSubscription;
use serde_json::json;
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn listener_survives_store_recreation_without_missed_events() {
    let tmp = tempfile::tempdir().unwrap();
    let (engine, _api) = engine_with_project(&tmp, "survey").await;
    let id = engine
        .activate_project(&listing_id(), &ProjectId::from("survey"), true)
        .await
        .unwrap();

    let attaches = Arc::new(Mutex::new(0usize));
    let teardowns = Arc::new(Mutex::new(0usize));
    let changes: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let attaches2 = attaches.clone();
    let teardowns2 = teardowns.clone();
    let changes2 = changes.clone();
    let subscription = engine.listen_project(
        id.clone(),
        Box::new(move |project, _sink, _meta_changed, data_changed| {
            if !data_changed {
                return Ok(Listened::Keep);
            }
            *attaches2.lock().unwrap() += 1;
            let changes = changes2.clone();
            let feed = ChangeSubscription::spawn(&project.data.changes, move |event| {
                changes.lock().unwrap().push(event.id);
            });
            let teardowns = teardowns2.clone();
            Ok(Listened::Replace(Box::new(move |_replaced| {
                *teardowns.lock().unwrap() += 1;
                feed.cancel();
                Ok(())
            })))
        }),
        Box::new(|e| panic!("unexpected listener error: {e}")),
    );

    // Known project: the listener fired once, synchronously.
    assert_eq!(*attaches.lock().unwrap(), 1);

    let data = engine.data_db(&id).unwrap();
    data.local.put("rec-1", &json!({"v": 1})).unwrap();
    wait_until("first change delivered", || {
        changes.lock().unwrap().len() == 1
    })
    .await;

    // Destroy and recreate the data store (the credential-switch shape):
    // exactly one teardown, then exactly one fresh attach.
    engine.deactivate_project(&id).unwrap();
    assert_eq!(*teardowns.lock().unwrap(), 1);
    assert_eq!(*attaches.lock().unwrap(), 1);

    engine
        .activate_project(&listing_id(), &ProjectId::from("survey"), true)
        .await
        .unwrap();
    assert_eq!(*attaches.lock().unwrap(), 2);
    assert_eq!(*teardowns.lock().unwrap(), 1);

    let data = engine.data_db(&id).unwrap();
    data.local.put("rec-2", &json!({"v": 2})).unwrap();
    wait_until("second change delivered", || {
        changes.lock().unwrap().len() == 2
    })
    .await;

    // No missed or duplicated change events across the recreation.
    assert_eq!(
        *changes.lock().unwrap(),
        vec!["rec-1".to_string(), "rec-2".to_string()]
    );

    subscription.detach();
    assert_eq!(*teardowns.lock().unwrap(), 2);
    subscription.detach();
    assert_eq!(*teardowns.lock().unwrap(), 2);
}

#[tokio::test]
async fn unknown_project_errors_once_after_settlement() {
    let tmp = tempfile::tempdir().unwrap();
    let api = MemServerApi::new();
    api.add_server(SERVER_URL, test_listing(), vec![]);
    let engine = outpost_engine::SyncEngineBuilder::new(outpost_engine::DataDir::new(tmp.path()))
        .with_server_url(SERVER_URL)
        .with_api(api)
        .build()
        .unwrap();

    let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let errors2 = errors.clone();
    let _subscription = engine.listen_project(
        full_id("ghost"),
        Box::new(|_, _, _, _| Ok(Listened::Noop)),
        Box::new(move |e| errors2.lock().unwrap().push(e.to_string())),
    );

    // Settlement propagates within the directory pass.
    engine.update_directory().await.unwrap();
    wait_until("unknown-project error", || !errors.lock().unwrap().is_empty()).await;

    // Later settlement cycles must not re-fire the error listener.
    engine.bus().emit(outpost_model::SyncEvent::AllState);
    engine.bus().emit(outpost_model::SyncEvent::AllState);
    let observed = errors.lock().unwrap().clone();
    assert_eq!(observed.len(), 1);
    assert!(observed[0].contains("is not known"), "got: {observed:?}");
}

#[tokio::test]
async fn listener_error_detaches_and_fires_error_listener_once() {
    let tmp = tempfile::tempdir().unwrap();
    let (engine, _api) = engine_with_project(&tmp, "survey").await;
    let id = engine
        .activate_project(&listing_id(), &ProjectId::from("survey"), true)
        .await
        .unwrap();

    let errors = Arc::new(Mutex::new(0usize));
    let errors2 = errors.clone();
    let calls = Arc::new(Mutex::new(0usize));
    let calls2 = calls.clone();
    let subscription = engine.listen_project(
        id.clone(),
        Box::new(move |_, _, _, _| {
            *calls2.lock().unwrap() += 1;
            Err("listener exploded".into())
        }),
        Box::new(move |_| {
            *errors2.lock().unwrap() += 1;
        }),
    );

    // The initial synchronous invocation failed, routed to the error
    // listener, and detached the subscription.
    assert_eq!(*calls.lock().unwrap(), 1);
    assert_eq!(*errors.lock().unwrap(), 1);

    // Further project updates no longer reach the listener.
    engine.deactivate_project(&id).unwrap();
    engine
        .activate_project(&listing_id(), &ProjectId::from("survey"), true)
        .await
        .unwrap();
    assert_eq!(*calls.lock().unwrap(), 1);
    assert_eq!(*errors.lock().unwrap(), 1);

    subscription.detach();
    assert_eq!(*errors.lock().unwrap(), 1);
}

#[tokio::test]
async fn keep_leaves_the_existing_teardown_installed() {
    let tmp = tempfile::tempdir().unwrap();
    let (engine, _api) = engine_with_project(&tmp, "survey").await;
    let id = engine
        .activate_project(&listing_id(), &ProjectId::from("survey"), true)
        .await
        .unwrap();

    let teardowns = Arc::new(Mutex::new(0usize));
    let teardowns2 = teardowns.clone();
    let first_call = Arc::new(Mutex::new(true));
    let subscription = engine.listen_project(
        id.clone(),
        Box::new(move |_, _, _, _| {
            let mut first = first_call.lock().unwrap();
            if *first {
                *first = false;
                let teardowns = teardowns2.clone();
                Ok(Listened::Replace(Box::new(move |_| {
                    *teardowns.lock().unwrap() += 1;
                    Ok(())
                })))
            } else {
                Ok(Listened::Keep)
            }
        }),
        Box::new(|e| panic!("unexpected listener error: {e}")),
    );

    // Re-announce the project without recreating stores: the listener
    // keeps its teardown, so nothing runs.
    let record = engine.active().get(&id).unwrap().unwrap();
    let project = engine
        .project_from_directory(&listing_id(), &ProjectId::from("survey"))
        .unwrap()
        .unwrap();
    engine
        .ensure_project_databases(&record, &project)
        .await
        .unwrap();
    assert_eq!(*teardowns.lock().unwrap(), 0);

    subscription.detach();
    assert_eq!(*teardowns.lock().unwrap(), 1);
}

#[tokio::test]
async fn listen_data_db_attaches_only_on_data_changes() {
    let tmp = tempfile::tempdir().unwrap();
    let (engine, _api) = engine_with_project(&tmp, "survey").await;
    let id = engine
        .activate_project(&listing_id(), &ProjectId::from("survey"), true)
        .await
        .unwrap();

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    let subscription = engine.listen_data_db(
        id.clone(),
        move |event| seen2.lock().unwrap().push(event.id),
        Box::new(|e| panic!("unexpected listener error: {e}")),
    );

    let data = engine.data_db(&id).unwrap();
    data.local.put("obs-1", &json!({"n": 1})).unwrap();
    wait_until("change observed", || seen.lock().unwrap().len() == 1).await;

    subscription.detach();
    data.local.put("obs-2", &json!({"n": 2})).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(seen.lock().unwrap().len(), 1);
}
