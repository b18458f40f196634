use pretty_assertions::assert_eq;

use super::CursorRegistry;
use crate::{bson::doc, session::SessionKey, Namespace};

fn docs(n: usize) -> Vec<crate::bson::Document> {
    (0..n).map(|i| doc! { "_id": i as i64 }).collect()
}

fn ns() -> Namespace {
    Namespace::new("app", "users")
}

#[test]
fn small_result_sets_have_no_cursor() {
    let registry = CursorRegistry::default();
    let (batch, id) = registry.create(ns(), docs(3), Some(10), None);
    assert_eq!(id, 0);
    assert_eq!(batch.len(), 3);
    assert_eq!(registry.len(), 0);
}

#[test]
fn spill_creates_unique_nonzero_ids() {
    let registry = CursorRegistry::default();
    let (batch_a, id_a) = registry.create(ns(), docs(5), Some(2), None);
    let (batch_b, id_b) = registry.create(ns(), docs(5), Some(2), None);
    assert_eq!(batch_a.len(), 2);
    assert_eq!(batch_b.len(), 2);
    assert_ne!(id_a, 0);
    assert_ne!(id_b, 0);
    assert_ne!(id_a, id_b);
    assert_eq!(registry.len(), 2);
}

#[test]
fn get_more_drains_and_removes_on_exhaustion() {
    let registry = CursorRegistry::default();
    let (_, id) = registry.create(ns(), docs(5), Some(2), None);

    let first = registry.get_more(id, Some(2), None).unwrap();
    assert_eq!(first.id, id);
    assert_eq!(first.batch.len(), 2);

    let second = registry.get_more(id, Some(2), None).unwrap();
    assert_eq!(second.id, 0);
    assert_eq!(second.batch.len(), 1);
    assert_eq!(registry.len(), 0);

    // Exhaustion removed the cursor.
    let err = registry.get_more(id, None, None).unwrap_err();
    assert_eq!(err.code(), 43);
}

#[test]
fn kill_partitions_ids() {
    let registry = CursorRegistry::default();
    let (_, id) = registry.create(ns(), docs(5), Some(1), None);
    let outcome = registry.kill(&[id, 9999]);
    assert_eq!(outcome.killed, vec![id]);
    assert_eq!(outcome.not_found, vec![9999]);
    assert!(outcome.alive.is_empty());
    assert_eq!(registry.len(), 0);
}

#[test]
fn session_bound_cursors_reject_other_sessions() {
    let registry = CursorRegistry::default();
    let owner = SessionKey::from_lsid(&doc! { "id": 1 }).unwrap();
    let stranger = SessionKey::from_lsid(&doc! { "id": 2 }).unwrap();
    let (_, id) = registry.create(ns(), docs(5), Some(1), Some(owner.clone()));

    let err = registry.get_more(id, None, Some(&stranger)).unwrap_err();
    assert_eq!(err.code(), 43);
    let err = registry.get_more(id, None, None).unwrap_err();
    assert_eq!(err.code(), 43);

    let advanced = registry.get_more(id, Some(1), Some(&owner)).unwrap();
    assert_eq!(advanced.batch.len(), 1);
}

#[test]
fn session_teardown_kills_bound_cursors() {
    let registry = CursorRegistry::default();
    let owner = SessionKey::from_lsid(&doc! { "id": 1 }).unwrap();
    let (_, bound) = registry.create(ns(), docs(5), Some(1), Some(owner.clone()));
    let (_, unbound) = registry.create(ns(), docs(5), Some(1), None);

    registry.kill_for_session(&owner);
    assert!(registry.get_more(bound, None, Some(&owner)).is_err());
    assert!(registry.get_more(unbound, Some(1), None).is_ok());
}

#[test]
fn capacity_reaps_oldest() {
    let registry = CursorRegistry::with_capacity(2);
    let (_, first) = registry.create(ns(), docs(5), Some(1), None);
    std::thread::sleep(std::time::Duration::from_millis(5));
    let (_, _second) = registry.create(ns(), docs(5), Some(1), None);
    std::thread::sleep(std::time::Duration::from_millis(5));
    let (_, _third) = registry.create(ns(), docs(5), Some(1), None);
    assert_eq!(registry.len(), 2);
    // The oldest idle cursor was evicted to make room.
    assert!(registry.get_more(first, Some(1), None).is_err());
}
