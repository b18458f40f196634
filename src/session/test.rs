use pretty_assertions::assert_eq;

use super::{SessionKey, SessionManager};
use crate::{
    bson::{doc, Document},
    engine::{StoreRead, StoreWrite},
    error::TRANSIENT_TRANSACTION_ERROR,
    Engine, Namespace,
};

fn lsid(tag: i32) -> Document {
    doc! { "id": tag }
}

fn key(tag: i32) -> SessionKey {
    SessionKey::from_lsid(&lsid(tag)).unwrap()
}

fn users() -> Namespace {
    Namespace::new("app", "users")
}

fn global_count(engine: &Engine) -> usize {
    engine.read(|store| store.collection(&users()).map(|c| c.len()).unwrap_or(0))
}

fn snapshot_insert(_engine: &Engine, manager: &SessionManager, tag: i32, txn: i64, id: i32) {
    let binding = manager
        .bind_transaction(&key(tag), &lsid(tag), txn, false)
        .unwrap();
    let session = match binding {
        super::StoreBinding::Transaction(session) => session,
        _ => panic!("expected transactional binding"),
    };
    super::with_active_snapshot(&session, |snapshot| {
        snapshot.write(|store| {
            store
                .collection_mut(&users())
                .insert(&users(), doc! { "_id": id })
                .map(|_| ())
        })
    })
    .unwrap()
    .unwrap();
}

#[test]
fn transactional_writes_are_invisible_until_commit() {
    let engine = Engine::new();
    let manager = SessionManager::new(engine.clone());

    manager
        .bind_transaction(&key(1), &lsid(1), 1, true)
        .unwrap();
    snapshot_insert(&engine, &manager, 1, 1, 1);

    // Outside the session, nothing happened yet.
    assert_eq!(global_count(&engine), 0);

    manager.commit(&key(1), &lsid(1), 1).unwrap();
    assert_eq!(global_count(&engine), 1);
}

#[test]
fn snapshot_reads_see_transaction_local_writes() {
    let engine = Engine::new();
    let manager = SessionManager::new(engine.clone());
    manager
        .bind_transaction(&key(1), &lsid(1), 1, true)
        .unwrap();
    snapshot_insert(&engine, &manager, 1, 1, 1);

    let binding = manager
        .bind_transaction(&key(1), &lsid(1), 1, false)
        .unwrap();
    let session = match binding {
        super::StoreBinding::Transaction(session) => session,
        _ => panic!("expected transactional binding"),
    };
    let seen = super::with_active_snapshot(&session, |snapshot| {
        snapshot.read(|store| store.collection(&users()).map(|c| c.len()).unwrap_or(0))
    })
    .unwrap();
    assert_eq!(seen, 1);
}

#[test]
fn abort_discards_writes_and_is_terminal() {
    let engine = Engine::new();
    let manager = SessionManager::new(engine.clone());
    manager
        .bind_transaction(&key(1), &lsid(1), 1, true)
        .unwrap();
    snapshot_insert(&engine, &manager, 1, 1, 1);

    manager.abort(&key(1), &lsid(1), 1).unwrap();
    assert_eq!(global_count(&engine), 0);

    // Re-referencing the aborted transaction number is transiently retryable.
    let err = manager
        .bind_transaction(&key(1), &lsid(1), 1, false)
        .unwrap_err();
    assert_eq!(err.code(), 251);
    assert!(err.contains_label(TRANSIENT_TRANSACTION_ERROR));

    // But aborting again is a plain NoSuchTransaction.
    let err = manager.abort(&key(1), &lsid(1), 1).unwrap_err();
    assert_eq!(err.code(), 251);
    assert!(!err.contains_label(TRANSIENT_TRANSACTION_ERROR));
}

#[test]
fn commit_replay_is_idempotent_within_grace_window() {
    let engine = Engine::new();
    let manager = SessionManager::new(engine.clone());
    manager
        .bind_transaction(&key(1), &lsid(1), 1, true)
        .unwrap();
    snapshot_insert(&engine, &manager, 1, 1, 1);

    manager.commit(&key(1), &lsid(1), 1).unwrap();
    // Replay inside the window: still ok, nothing double-applied.
    manager.commit(&key(1), &lsid(1), 1).unwrap();
    assert_eq!(global_count(&engine), 1);
}

#[test]
fn nested_start_is_rejected() {
    let engine = Engine::new();
    let manager = SessionManager::new(engine.clone());
    manager
        .bind_transaction(&key(1), &lsid(1), 1, true)
        .unwrap();
    let err = manager
        .bind_transaction(&key(1), &lsid(1), 2, true)
        .unwrap_err();
    assert_eq!(err.code_name(), "BadValue");
}

#[test]
fn txn_numbers_must_increase() {
    let engine = Engine::new();
    let manager = SessionManager::new(engine.clone());
    manager
        .bind_transaction(&key(1), &lsid(1), 5, true)
        .unwrap();
    manager.abort(&key(1), &lsid(1), 5).unwrap();
    let err = manager
        .bind_transaction(&key(1), &lsid(1), 5, true)
        .unwrap_err();
    assert_eq!(err.code_name(), "BadValue");
}

#[test]
fn sessions_are_independent() {
    let engine = Engine::new();
    let manager = SessionManager::new(engine.clone());
    manager
        .bind_transaction(&key(1), &lsid(1), 1, true)
        .unwrap();
    manager
        .bind_transaction(&key(2), &lsid(2), 1, true)
        .unwrap();
    snapshot_insert(&engine, &manager, 1, 1, 1);
    snapshot_insert(&engine, &manager, 2, 1, 2);

    manager.commit(&key(1), &lsid(1), 1).unwrap();
    assert_eq!(global_count(&engine), 1);
    manager.commit(&key(2), &lsid(2), 1).unwrap();
    assert_eq!(global_count(&engine), 2);
}

#[test]
fn concurrent_global_writes_to_other_ids_survive_commit() {
    let engine = Engine::new();
    let manager = SessionManager::new(engine.clone());

    engine
        .write(|store| {
            store
                .collection_mut(&users())
                .insert(&users(), doc! { "_id": 100 })
                .map(|_| ())
        })
        .unwrap();

    manager
        .bind_transaction(&key(1), &lsid(1), 1, true)
        .unwrap();
    snapshot_insert(&engine, &manager, 1, 1, 1);

    // A concurrent out-of-transaction write to a different _id after the clone.
    engine
        .write(|store| {
            store
                .collection_mut(&users())
                .insert(&users(), doc! { "_id": 200 })
                .map(|_| ())
        })
        .unwrap();

    manager.commit(&key(1), &lsid(1), 1).unwrap();
    assert_eq!(global_count(&engine), 3);
}

#[test]
fn same_id_race_resolves_to_transactional_version() {
    let engine = Engine::new();
    let manager = SessionManager::new(engine.clone());

    engine
        .write(|store| {
            store
                .collection_mut(&users())
                .insert(&users(), doc! { "_id": 1, "v": "original" })
                .map(|_| ())
        })
        .unwrap();

    manager
        .bind_transaction(&key(1), &lsid(1), 1, true)
        .unwrap();
    let binding = manager
        .bind_transaction(&key(1), &lsid(1), 1, false)
        .unwrap();
    let session = match binding {
        super::StoreBinding::Transaction(session) => session,
        _ => panic!("expected transactional binding"),
    };
    super::with_active_snapshot(&session, |snapshot| {
        snapshot.write(|store| {
            let spec =
                crate::engine::update::parse_update(&doc! { "$set": { "v": "txn" } }).unwrap();
            store
                .collection_mut(&users())
                .update_docs(&users(), &doc! { "_id": 1 }, &spec, false, false, &[], None)
                .map(|_| ())
        })
    })
    .unwrap()
    .unwrap();

    // Concurrent global update to the same _id.
    engine
        .write(|store| {
            let spec =
                crate::engine::update::parse_update(&doc! { "$set": { "v": "global" } }).unwrap();
            store
                .collection_mut(&users())
                .update_docs(&users(), &doc! { "_id": 1 }, &spec, false, false, &[], None)
                .map(|_| ())
        })
        .unwrap();

    manager.commit(&key(1), &lsid(1), 1).unwrap();
    let v = engine.read(|store| {
        store.collection(&users()).unwrap().documents()[0]
            .get_str("v")
            .unwrap()
            .to_string()
    });
    assert_eq!(v, "txn");
}

#[test]
fn commit_time_unique_conflict_aborts_with_transient_label() {
    let engine = Engine::new();
    let manager = SessionManager::new(engine.clone());

    engine
        .write(|store| {
            let collection = store.collection_mut(&users());
            let index = crate::engine::IndexDescriptor::from_spec(
                &doc! { "key": { "email": 1 }, "unique": true },
            )
            .unwrap();
            collection.create_index(&users(), index).map(|_| ())
        })
        .unwrap();

    manager
        .bind_transaction(&key(1), &lsid(1), 1, true)
        .unwrap();
    let binding = manager
        .bind_transaction(&key(1), &lsid(1), 1, false)
        .unwrap();
    let session = match binding {
        super::StoreBinding::Transaction(session) => session,
        _ => panic!("expected transactional binding"),
    };
    super::with_active_snapshot(&session, |snapshot| {
        snapshot.write(|store| {
            store
                .collection_mut(&users())
                .insert(&users(), doc! { "_id": 1, "email": "a@x" })
                .map(|_| ())
        })
    })
    .unwrap()
    .unwrap();

    // Meanwhile a global insert claims the same unique key.
    engine
        .write(|store| {
            store
                .collection_mut(&users())
                .insert(&users(), doc! { "_id": 2, "email": "a@x" })
                .map(|_| ())
        })
        .unwrap();

    let err = manager.commit(&key(1), &lsid(1), 1).unwrap_err();
    assert_eq!(err.code(), 112);
    assert_eq!(err.code_name(), "WriteConflict");
    assert!(err.contains_label(TRANSIENT_TRANSACTION_ERROR));

    // The transaction is aborted; commit replay reports it as such.
    let err = manager.commit(&key(1), &lsid(1), 1).unwrap_err();
    assert_eq!(err.code(), 251);
    assert!(!err.contains_label(TRANSIENT_TRANSACTION_ERROR));

    // The global write survived untouched.
    assert_eq!(global_count(&engine), 1);
}
