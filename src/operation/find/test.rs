use pretty_assertions::assert_eq;

use crate::{
    bson::{doc, Bson, Document},
    operation::test_util::{dispatch_err, dispatch_ok, dispatcher},
    Dispatcher,
};

fn seed(dispatcher: &Dispatcher) {
    dispatch_ok(
        dispatcher,
        "app",
        doc! {
            "insert": "users",
            "documents": [
                { "_id": 1, "name": "alpha", "age": 30, "tags": ["x", "y"] },
                { "_id": 2, "name": "beta", "age": 25 },
                { "_id": 3, "name": "gamma", "age": 35 },
            ],
        },
    );
}

fn first_batch(response: &Document) -> Vec<Document> {
    response
        .get_document("cursor")
        .unwrap()
        .get_array("firstBatch")
        .unwrap()
        .iter()
        .map(|d| match d {
            Bson::Document(d) => d.clone(),
            other => panic!("expected document, got {:?}", other),
        })
        .collect()
}

#[test]
fn empty_filter_returns_everything_in_natural_order() {
    let dispatcher = dispatcher();
    seed(&dispatcher);
    let response = dispatch_ok(&dispatcher, "app", doc! { "find": "users", "filter": {} });
    let cursor = response.get_document("cursor").unwrap();
    assert_eq!(cursor.get_i64("id"), Ok(0));
    assert_eq!(cursor.get_str("ns"), Ok("app.users"));
    let batch = first_batch(&response);
    assert_eq!(batch.len(), 3);
    assert_eq!(batch[0].get_i32("_id"), Ok(1));
}

#[test]
fn find_on_missing_collection_is_empty() {
    let dispatcher = dispatcher();
    let response = dispatch_ok(&dispatcher, "app", doc! { "find": "nothing" });
    assert_eq!(first_batch(&response).len(), 0);
    assert_eq!(
        response.get_document("cursor").unwrap().get_i64("id"),
        Ok(0)
    );
}

#[test]
fn sort_skip_limit_compose() {
    let dispatcher = dispatcher();
    seed(&dispatcher);
    let response = dispatch_ok(
        &dispatcher,
        "app",
        doc! {
            "find": "users",
            "filter": {},
            "sort": { "age": -1 },
            "skip": 1,
            "limit": 1,
        },
    );
    let batch = first_batch(&response);
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].get_str("name"), Ok("alpha"));
}

#[test]
fn projection_applies() {
    let dispatcher = dispatcher();
    seed(&dispatcher);
    let response = dispatch_ok(
        &dispatcher,
        "app",
        doc! {
            "find": "users",
            "filter": { "_id": 1 },
            "projection": { "name": 1, "_id": 0 },
        },
    );
    let batch = first_batch(&response);
    assert_eq!(batch, vec![doc! { "name": "alpha" }]);
}

#[test]
fn batch_size_spills_into_cursor() {
    let dispatcher = dispatcher();
    seed(&dispatcher);
    let response = dispatch_ok(
        &dispatcher,
        "app",
        doc! { "find": "users", "filter": {}, "sort": { "_id": 1 }, "batchSize": 2 },
    );
    let cursor = response.get_document("cursor").unwrap();
    let id = cursor.get_i64("id").unwrap();
    assert_ne!(id, 0);
    assert_eq!(first_batch(&response).len(), 2);

    let more = dispatch_ok(
        &dispatcher,
        "app",
        doc! { "getMore": id, "collection": "users" },
    );
    let next = more.get_document("cursor").unwrap();
    assert_eq!(next.get_i64("id"), Ok(0));
    assert_eq!(next.get_array("nextBatch").unwrap().len(), 1);
}

#[test]
fn negative_limit_is_single_batch() {
    let dispatcher = dispatcher();
    seed(&dispatcher);
    let response = dispatch_ok(
        &dispatcher,
        "app",
        doc! { "find": "users", "filter": {}, "limit": -2, "batchSize": 1 },
    );
    let cursor = response.get_document("cursor").unwrap();
    assert_eq!(cursor.get_i64("id"), Ok(0));
    assert_eq!(first_batch(&response).len(), 2);
}

#[test]
fn operator_filters_apply() {
    let dispatcher = dispatcher();
    seed(&dispatcher);
    let response = dispatch_ok(
        &dispatcher,
        "app",
        doc! { "find": "users", "filter": { "age": { "$gte": 30 }, "tags": "x" } },
    );
    let batch = first_batch(&response);
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].get_i32("_id"), Ok(1));
}

#[test]
fn invalid_sort_direction_is_rejected() {
    let dispatcher = dispatcher();
    seed(&dispatcher);
    let response = dispatch_err(
        &dispatcher,
        "app",
        doc! { "find": "users", "filter": {}, "sort": { "age": 2 } },
    );
    assert_eq!(response.get_i32("code"), Ok(14));
}
