use asupersync::runtime::RuntimeBuilder;
use serde_json::json;
use std::sync::Arc;

use flowdoc::prelude::*;
use flowdoc::{Intent, SessionState, StoreErrorKind, WriteOp};

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn doc(value: serde_json::Value) -> Document {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Document::new(),
    }
}

fn engine(store: &MemoryStore) -> PersistenceEngine<MemoryStore> {
    PersistenceEngine::builder(store.clone())
        .register(Arc::new(DocumentManager::new("vars")))
        .register(Arc::new(DocumentManager::new("executions")))
        .register_with_dependencies(Arc::new(DocumentManager::new("tasks")), &["executions"])
        .build()
        .expect("build engine")
}

fn log_lines(store: &MemoryStore) -> Vec<String> {
    store.write_log().iter().map(ToString::to_string).collect()
}

#[test]
fn same_id_loads_to_one_shared_instance() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    store.seed("vars", vec![doc(json!({"_id": "v1", "value": 1}))]);
    let engine = engine(&store);
    let mut session = engine.open_session();

    rt.block_on(async {
        let a = unwrap_outcome(session.load(&cx, "vars", &EntityId::new("v1")).await).unwrap();
        let b = unwrap_outcome(session.load(&cx, "vars", &EntityId::new("v1")).await).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        write_entity(&a).set("note", "seen");
        assert_eq!(read_entity(&b).get_str("note"), Some("seen"));
    });
    assert_eq!(store.reads(), 1);
}

#[test]
fn insert_then_delete_writes_nothing() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    let engine = engine(&store);
    let mut session = engine.open_session();

    let x = session.insert(Entity::new("vars", "x").with_field("value", 1)).unwrap();
    session.delete("vars", &x).unwrap();
    assert_eq!(session.intent_of("vars", &EntityId::new("x")), Intent::None);
    assert!(!session.contains("vars", &EntityId::new("x")));

    rt.block_on(async {
        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.total(), 0);
    });
    assert!(store.write_log().is_empty());
    assert!(store.is_empty("vars"));
}

#[test]
fn successive_updates_become_one_partial_write() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    store.seed(
        "vars",
        vec![doc(json!({"_id": "x", "a": 0, "b": 0, "c": "untouched"}))],
    );
    let engine = engine(&store);
    let mut session = engine.open_session();

    rt.block_on(async {
        let x = unwrap_outcome(session.load(&cx, "vars", &EntityId::new("x")).await).unwrap();
        session.update(&x, doc(json!({"a": 1}))).unwrap();
        session.update(&x, doc(json!({"b": 2}))).unwrap();
        assert_eq!(session.pending_counts().updates, 1);

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.updated, 1);
    });

    assert_eq!(log_lines(&store), vec!["update vars/x"]);
    let stored = store.get("vars", "x").unwrap();
    assert_eq!(stored.get("a"), Some(&json!(1)));
    assert_eq!(stored.get("b"), Some(&json!(2)));
    assert_eq!(stored.get("c"), Some(&json!("untouched")));
}

#[test]
fn field_removed_in_place_is_unset_in_the_store() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    store.seed(
        "vars",
        vec![doc(json!({"_id": "x", "taskId": "t1", "value": 1}))],
    );
    let engine = engine(&store);

    rt.block_on(async {
        let mut session = engine.open_session();
        let x = unwrap_outcome(session.load(&cx, "vars", &EntityId::new("x")).await).unwrap();
        write_entity(&x).remove("taskId");
        assert_eq!(session.mark_dirty(&x).unwrap(), vec!["taskId".to_string()]);
        unwrap_outcome(session.flush(&cx).await);
        session.close();

        let mut session = engine.open_session();
        let with_task = unwrap_outcome(
            session
                .find(&cx, "vars", &Filter::exists("taskId"), FindOptions::new())
                .await,
        );
        assert!(with_task.is_empty());
    });

    let stored = store.get("vars", "x").unwrap();
    assert!(!stored.contains_key("taskId"));
    assert_eq!(stored.get("value"), Some(&json!(1)));
}

#[test]
fn second_insert_of_same_id_is_rejected() {
    let store = MemoryStore::new();
    let engine = engine(&store);
    let mut session = engine.open_session();

    let first = session.insert(Entity::new("vars", "x").with_field("value", 1)).unwrap();
    let before = session.debug_state();

    let err = session
        .insert(Entity::new("vars", "x").with_field("value", 2))
        .unwrap_err();
    assert!(err.is_duplicate_entity());

    let after = session.debug_state();
    assert_eq!(after.tracked, before.tracked);
    assert_eq!(after.pending, before.pending);
    assert_eq!(read_entity(&first).get("value"), Some(&json!(1)));
}

#[test]
fn insert_matching_cached_query_forces_requery() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    store.seed(
        "tasks",
        vec![
            doc(json!({"_id": "a", "parentId": "P"})),
            doc(json!({"_id": "b", "parentId": "P"})),
        ],
    );
    let engine = engine(&store);
    let mut session = engine.open_session();
    let filter = Filter::eq("parentId", "P");
    let options = || FindOptions::cached("byParent:P", FieldEquals::new("parentId", "P"));

    rt.block_on(async {
        let first = unwrap_outcome(session.find(&cx, "tasks", &filter, options()).await);
        assert_eq!(first.len(), 2);
        assert_eq!(store.reads(), 1);

        session
            .insert(Entity::new("tasks", "c").with_field("parentId", "P"))
            .unwrap();

        let second = unwrap_outcome(session.find(&cx, "tasks", &filter, options()).await);
        assert_eq!(store.reads(), 2);
        let ids: Vec<String> = second
            .iter()
            .map(|e| read_entity(e).id().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    });
}

#[test]
fn flush_orders_buckets_and_parents() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    store.seed(
        "vars",
        vec![
            doc(json!({"_id": "old", "value": 0})),
            doc(json!({"_id": "keep", "value": 0})),
        ],
    );
    let engine = engine(&store);
    let mut session = engine.open_session();

    rt.block_on(async {
        let old = unwrap_outcome(session.load(&cx, "vars", &EntityId::new("old")).await).unwrap();
        let keep = unwrap_outcome(session.load(&cx, "vars", &EntityId::new("keep")).await).unwrap();

        // Tracked children first, deletes and updates before inserts.
        session.delete("vars", &old).unwrap();
        session.update(&keep, doc(json!({"value": 1}))).unwrap();
        session
            .insert(Entity::new("tasks", "t1").with_field("executionId", "e1"))
            .unwrap();
        session.insert(Entity::new("vars", "v1")).unwrap();
        session.insert(Entity::new("executions", "e1")).unwrap();
        session
            .insert(Entity::new("tasks", "t2").with_field("executionId", "e1"))
            .unwrap();

        unwrap_outcome(session.flush(&cx).await);
    });

    assert_eq!(
        log_lines(&store),
        vec![
            "insert vars/v1",
            "insert executions/e1",
            "insert tasks/t1",
            "insert tasks/t2",
            "update vars/keep",
            "delete vars/old",
        ]
    );
}

#[test]
fn partial_failure_reports_every_write_and_does_not_retry() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    store.fail_on(WriteOp::Insert, "vars", "b", StoreErrorKind::Timeout);
    let engine = engine(&store);
    let mut session = engine.open_session();

    for id in ["a", "b", "c"] {
        session.insert(Entity::new("vars", id)).unwrap();
    }

    rt.block_on(async {
        match session.flush(&cx).await {
            Outcome::Err(Error::FlushPartialFailure(report)) => {
                let succeeded: Vec<String> =
                    report.succeeded.iter().map(ToString::to_string).collect();
                assert_eq!(succeeded, vec!["insert vars/a", "insert vars/c"]);
                assert_eq!(report.failed.len(), 1);
                assert_eq!(report.failed[0].write.id.as_str(), "b");
                assert_eq!(report.failed[0].error.store_kind(), Some(StoreErrorKind::Timeout));
                assert!(report.failed[0].error.is_retryable());
                assert!(report.skipped.is_empty());
                assert_eq!(report.total(), 3);
            }
            other => panic!("expected partial failure, got {other:?}"),
        }

        assert_eq!(session.state(), SessionState::Flushed);
        let again = session.flush(&cx).await;
        assert!(matches!(again, Outcome::Err(Error::Session(_))));
    });

    assert_eq!(store.write_log().len(), 2);
    assert!(store.get("vars", "b").is_none());
}

#[test]
fn fail_fast_skips_remaining_writes() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    store.fail_on(WriteOp::Insert, "vars", "a", StoreErrorKind::Rejected);
    let engine = engine(&store);
    let mut session = engine.open_session_with(SessionConfig::new().flush_mode(FlushMode::FailFast));

    for id in ["a", "b"] {
        session.insert(Entity::new("vars", id)).unwrap();
    }

    rt.block_on(async {
        let Outcome::Err(err) = session.flush(&cx).await else {
            panic!("expected flush failure");
        };
        let report = err.as_flush_failure().expect("partial failure report");
        assert!(report.succeeded.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].id.as_str(), "b");
    });
    assert!(store.write_log().is_empty());
}

#[test]
fn end_to_end_insert_find_update_find_flush() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    let engine = engine(&store);
    let mut session = engine.open_session();
    let filter = Filter::eq("executionId", "e1");
    let options = || FindOptions::cached("byExecutionId:e1", FieldEquals::new("executionId", "e1"));

    rt.block_on(async {
        let v1 = session
            .insert(
                Entity::new("vars", "v1")
                    .with_field("executionId", "e1")
                    .with_field("name", "x")
                    .with_field("value", 1),
            )
            .unwrap();

        let found = unwrap_outcome(session.find(&cx, "vars", &filter, options()).await);
        assert_eq!(found.len(), 1);
        assert!(Arc::ptr_eq(&found[0], &v1));
        assert_eq!(session.stats().cache_misses, 1);

        session.update(&v1, doc(json!({"value": 2}))).unwrap();
        assert_eq!(session.stats().cache_invalidations, 1);

        let found = unwrap_outcome(session.find(&cx, "vars", &filter, options()).await);
        assert_eq!(found.len(), 1);
        assert_eq!(read_entity(&found[0]).get("value"), Some(&json!(2)));
        assert_eq!(session.stats().cache_misses, 2);

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.inserted, 1);
        assert_eq!(result.updated, 0);
    });
    session.close();

    assert_eq!(store.len("vars"), 1);
    let stored = store.get("vars", "v1").unwrap();
    assert_eq!(stored.get("value"), Some(&json!(2)));
    assert_eq!(stored.get("name"), Some(&json!("x")));
    assert_eq!(log_lines(&store), vec!["insert vars/v1"]);
}

#[test]
fn collection_prefix_reaches_the_store() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    let engine = PersistenceEngine::builder(store.clone())
        .collection_prefix("act_")
        .register(Arc::new(DocumentManager::new("vars")))
        .build()
        .unwrap();
    let mut session = engine.open_session();
    session.insert(Entity::new("vars", "v1")).unwrap();

    rt.block_on(async {
        unwrap_outcome(session.flush(&cx).await);
    });
    assert_eq!(store.len("act_vars"), 1);
    assert!(store.is_empty("vars"));
}

#[test]
fn store_unavailable_on_read_is_reported() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = MemoryStore::new();
    store.set_unavailable(true);
    let engine = engine(&store);
    let mut session = engine.open_session();

    rt.block_on(async {
        match session.load(&cx, "vars", &EntityId::new("v1")).await {
            Outcome::Err(err) => {
                assert_eq!(err.store_kind(), Some(StoreErrorKind::Connect));
                assert!(err.is_retryable());
            }
            other => panic!("expected store error, got {other:?}"),
        }
    });
}
