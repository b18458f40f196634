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
                { "_id": 1, "status": "new", "age": 30 },
                { "_id": 2, "status": "new", "age": 25 },
                { "_id": 3, "status": "done", "age": 35 },
            ],
        },
    );
}

fn find_all(dispatcher: &Dispatcher) -> Vec<Document> {
    let response = dispatch_ok(
        dispatcher,
        "app",
        doc! { "find": "users", "filter": {}, "sort": { "_id": 1 } },
    );
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
fn multi_update_counts_matched_and_modified() {
    let dispatcher = dispatcher();
    seed(&dispatcher);
    let response = dispatch_ok(
        &dispatcher,
        "app",
        doc! {
            "update": "users",
            "updates": [ { "q": { "status": "new" }, "u": { "$set": { "status": "active" } }, "multi": true } ],
        },
    );
    assert_eq!(response.get_i64("n"), Ok(2));
    assert_eq!(response.get_i64("nModified"), Ok(2));
}

#[test]
fn no_match_returns_zero_counts() {
    let dispatcher = dispatcher();
    seed(&dispatcher);
    let response = dispatch_ok(
        &dispatcher,
        "app",
        doc! {
            "update": "users",
            "updates": [ { "q": { "status": "missing" }, "u": { "$set": { "status": "x" } }, "multi": true } ],
        },
    );
    assert_eq!(response.get_i64("n"), Ok(0));
    assert_eq!(response.get_i64("nModified"), Ok(0));
}

#[test]
fn set_to_same_value_matches_without_modifying() {
    let dispatcher = dispatcher();
    seed(&dispatcher);
    let response = dispatch_ok(
        &dispatcher,
        "app",
        doc! {
            "update": "users",
            "updates": [ { "q": { "_id": 1 }, "u": { "$set": { "status": "new" } } } ],
        },
    );
    assert_eq!(response.get_i64("n"), Ok(1));
    assert_eq!(response.get_i64("nModified"), Ok(0));
}

#[test]
fn upsert_reports_index_and_id() {
    let dispatcher = dispatcher();
    seed(&dispatcher);
    let response = dispatch_ok(
        &dispatcher,
        "app",
        doc! {
            "update": "users",
            "updates": [ { "q": { "_id": 9 }, "u": { "$set": { "status": "fresh" } }, "upsert": true } ],
        },
    );
    assert_eq!(response.get_i64("n"), Ok(1));
    assert_eq!(response.get_i64("nModified"), Ok(0));
    let upserted = response.get_array("upserted").unwrap();
    let entry = match &upserted[0] {
        Bson::Document(entry) => entry,
        other => panic!("expected document, got {:?}", other),
    };
    assert_eq!(entry.get_i32("index"), Ok(0));
    assert_eq!(entry.get_i32("_id"), Ok(9));

    let docs = find_all(&dispatcher);
    assert_eq!(docs.len(), 4);
}

#[test]
fn replacement_update_preserves_id() {
    let dispatcher = dispatcher();
    seed(&dispatcher);
    dispatch_ok(
        &dispatcher,
        "app",
        doc! {
            "update": "users",
            "updates": [ { "q": { "_id": 2 }, "u": { "name": "replaced" } } ],
        },
    );
    let docs = find_all(&dispatcher);
    assert_eq!(docs[1], doc! { "_id": 2, "name": "replaced" });
}

#[test]
fn positional_operator_updates_first_matching_element() {
    let dispatcher = dispatcher();
    dispatch_ok(
        &dispatcher,
        "app",
        doc! {
            "insert": "grades",
            "documents": [ { "_id": 1, "scores": [ 80, 92, 85 ] } ],
        },
    );
    dispatch_ok(
        &dispatcher,
        "app",
        doc! {
            "update": "grades",
            "updates": [ { "q": { "_id": 1, "scores": { "$gte": 90 } }, "u": { "$set": { "scores.$": 100 } } } ],
        },
    );
    let response = dispatch_ok(&dispatcher, "app", doc! { "find": "grades", "filter": {} });
    let batch = response
        .get_document("cursor")
        .unwrap()
        .get_array("firstBatch")
        .unwrap();
    let doc = match &batch[0] {
        Bson::Document(doc) => doc,
        other => panic!("expected document, got {:?}", other),
    };
    assert_eq!(
        doc.get_array("scores").unwrap(),
        &vec![Bson::Int32(80), Bson::Int32(100), Bson::Int32(85)]
    );
}

#[test]
fn array_filters_target_identified_elements() {
    let dispatcher = dispatcher();
    dispatch_ok(
        &dispatcher,
        "app",
        doc! {
            "insert": "grades",
            "documents": [ { "_id": 1, "scores": [ 80, 92, 95 ] } ],
        },
    );
    dispatch_ok(
        &dispatcher,
        "app",
        doc! {
            "update": "grades",
            "updates": [ {
                "q": { "_id": 1 },
                "u": { "$set": { "scores.$[high]": 100 } },
                "arrayFilters": [ { "high": { "$gte": 90 } } ],
            } ],
        },
    );
    let response = dispatch_ok(&dispatcher, "app", doc! { "find": "grades", "filter": {} });
    let batch = response
        .get_document("cursor")
        .unwrap()
        .get_array("firstBatch")
        .unwrap();
    let doc = match &batch[0] {
        Bson::Document(doc) => doc,
        other => panic!("expected document, got {:?}", other),
    };
    assert_eq!(
        doc.get_array("scores").unwrap(),
        &vec![Bson::Int32(80), Bson::Int32(100), Bson::Int32(100)]
    );
}

#[test]
fn updates_must_be_an_array() {
    let dispatcher = dispatcher();
    let response = dispatch_err(
        &dispatcher,
        "app",
        doc! { "update": "users", "updates": "nope" },
    );
    assert_eq!(response.get_i32("code"), Ok(14));
    assert_eq!(response.get_str("codeName"), Ok("TypeMismatch"));
}

#[test]
fn multi_replacement_is_rejected() {
    let dispatcher = dispatcher();
    let response = dispatch_err(
        &dispatcher,
        "app",
        doc! {
            "update": "users",
            "updates": [ { "q": {}, "u": { "plain": 1 }, "multi": true } ],
        },
    );
    assert_eq!(response.get_str("codeName"), Ok("BadValue"));
}

#[test]
fn mixed_modifier_and_replacement_is_rejected() {
    let dispatcher = dispatcher();
    let response = dispatch_err(
        &dispatcher,
        "app",
        doc! {
            "update": "users",
            "updates": [ { "q": {}, "u": { "$set": { "a": 1 }, "b": 2 } } ],
        },
    );
    assert_eq!(response.get_str("codeName"), Ok("BadValue"));
}
