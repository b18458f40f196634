use pretty_assertions::assert_eq;

use super::{evaluate, is_truthy};
use crate::bson::{bson, doc, Bson};

fn eval(expr: Bson, doc: crate::bson::Document) -> Bson {
    evaluate(&expr, &doc, None).unwrap()
}

#[test]
fn field_paths_resolve_against_current() {
    let doc = doc! { "a": { "b": 7 }, "n": 3 };
    assert_eq!(eval(bson!("$n"), doc.clone()), bson!(3));
    assert_eq!(eval(bson!("$a.b"), doc.clone()), bson!(7));
    assert_eq!(eval(bson!("$missing"), doc), Bson::Undefined);
}

#[test]
fn paths_map_over_arrays() {
    let doc = doc! { "items": [ { "qty": 1 }, { "qty": 2 }, { "other": 3 } ] };
    assert_eq!(eval(bson!("$items.qty"), doc), bson!([1, 2]));
}

#[test]
fn root_and_variables() {
    let doc = doc! { "x": 1 };
    assert_eq!(eval(bson!("$$ROOT"), doc.clone()), bson!({ "x": 1 }));
    assert_eq!(eval(bson!("$$CURRENT.x"), doc.clone()), bson!(1));
    assert!(evaluate(&bson!("$$nope"), &doc, None).is_err());
}

#[test]
fn literal_shields_operators() {
    let value = eval(bson!({ "$literal": { "$add": [1, 2] } }), doc! {});
    assert_eq!(value, bson!({ "$add": [1, 2] }));
}

#[test]
fn arithmetic_operators() {
    assert_eq!(eval(bson!({ "$add": [1, 2, 3] }), doc! {}), bson!(6));
    assert_eq!(eval(bson!({ "$subtract": [10, 4] }), doc! {}), bson!(6));
    assert_eq!(eval(bson!({ "$multiply": [2, 3.5] }), doc! {}), bson!(7.0));
    assert_eq!(eval(bson!({ "$divide": [7, 2] }), doc! {}), bson!(3.5));
    assert_eq!(eval(bson!({ "$mod": [7, 3] }), doc! {}), Bson::Int64(1));
    // Nullish operands poison arithmetic.
    assert_eq!(eval(bson!({ "$add": [1, null] }), doc! {}), Bson::Null);
    assert!(evaluate(&bson!({ "$divide": [1, 0] }), &doc! {}, None).is_err());
}

#[test]
fn comparison_operators_use_canonical_order() {
    assert_eq!(eval(bson!({ "$cmp": [5, "5"] }), doc! {}), bson!(-1));
    assert_eq!(eval(bson!({ "$eq": [1, 1.0] }), doc! {}), bson!(true));
    assert_eq!(eval(bson!({ "$gt": ["b", "a"] }), doc! {}), bson!(true));
    assert_eq!(eval(bson!({ "$lte": [2, 1] }), doc! {}), bson!(false));
}

#[test]
fn logical_operators_and_truthiness() {
    assert_eq!(
        eval(bson!({ "$and": [1, "yes", true] }), doc! {}),
        bson!(true)
    );
    assert_eq!(eval(bson!({ "$and": [1, 0] }), doc! {}), bson!(false));
    assert_eq!(eval(bson!({ "$or": [0, null, 2] }), doc! {}), bson!(true));
    assert_eq!(eval(bson!({ "$not": [0] }), doc! {}), bson!(true));

    assert!(!is_truthy(&Bson::Null));
    assert!(!is_truthy(&Bson::Undefined));
    assert!(!is_truthy(&bson!(0.0)));
    assert!(!is_truthy(&Bson::Double(f64::NAN)));
    assert!(is_truthy(&bson!("")));
    assert!(is_truthy(&bson!([])));
}

#[test]
fn conditional_operators() {
    let doc = doc! { "n": 5 };
    assert_eq!(
        eval(
            bson!({ "$cond": { "if": { "$gt": ["$n", 3] }, "then": "big", "else": "small" } }),
            doc.clone()
        ),
        bson!("big")
    );
    assert_eq!(
        eval(bson!({ "$cond": [false, 1, 2] }), doc.clone()),
        bson!(2)
    );
    assert_eq!(
        eval(bson!({ "$ifNull": ["$missing", null, "fallback"] }), doc.clone()),
        bson!("fallback")
    );
    assert_eq!(
        eval(
            bson!({ "$switch": {
                "branches": [
                    { "case": { "$lt": ["$n", 3] }, "then": "low" },
                    { "case": { "$lt": ["$n", 10] }, "then": "mid" },
                ],
                "default": "high",
            } }),
            doc
        ),
        bson!("mid")
    );
}

#[test]
fn string_operators() {
    assert_eq!(
        eval(bson!({ "$concat": ["a", "-", "b"] }), doc! {}),
        bson!("a-b")
    );
    assert_eq!(eval(bson!({ "$concat": ["a", null] }), doc! {}), Bson::Null);
    assert_eq!(eval(bson!({ "$toUpper": "ab" }), doc! {}), bson!("AB"));
    assert_eq!(eval(bson!({ "$toLower": "AB" }), doc! {}), bson!("ab"));
    assert_eq!(
        eval(bson!({ "$substrBytes": ["hello", 1, 3] }), doc! {}),
        bson!("ell")
    );
    assert_eq!(
        eval(bson!({ "$substrCP": ["héllo", 1, 2] }), doc! {}),
        bson!("él")
    );
    assert_eq!(
        eval(bson!({ "$split": ["a,b,c", ","] }), doc! {}),
        bson!(["a", "b", "c"])
    );
}

#[test]
fn array_operators() {
    assert_eq!(eval(bson!({ "$size": [[1, 2, 3]] }), doc! {}), bson!(3));
    assert_eq!(
        eval(bson!({ "$arrayElemAt": [[10, 20, 30], -1] }), doc! {}),
        bson!(30)
    );
    assert_eq!(
        eval(bson!({ "$in": [2, [1, 2, 3]] }), doc! {}),
        bson!(true)
    );
    assert_eq!(
        eval(
            bson!({ "$map": { "input": [1, 2], "as": "n", "in": { "$multiply": ["$$n", 10] } } }),
            doc! {}
        ),
        bson!([10, 20])
    );
    assert_eq!(
        eval(
            bson!({ "$filter": { "input": [1, 5, 9], "cond": { "$gte": ["$$this", 5] } } }),
            doc! {}
        ),
        bson!([5, 9])
    );
}

#[test]
fn type_operators() {
    assert_eq!(eval(bson!({ "$type": "$a" }), doc! { "a": 1 }), bson!("int"));
    assert_eq!(eval(bson!({ "$type": "$nope" }), doc! {}), bson!("missing"));
    assert_eq!(
        eval(
            bson!({ "$convert": { "input": "12", "to": "int" } }),
            doc! {}
        ),
        bson!(12)
    );
    assert_eq!(
        eval(
            bson!({ "$convert": { "input": "x", "to": "int", "onError": -1 } }),
            doc! {}
        ),
        bson!(-1)
    );
    assert_eq!(eval(bson!({ "$toString": 5 }), doc! {}), bson!("5"));
    assert_eq!(eval(bson!({ "$toBool": 0 }), doc! {}), bson!(false));
}

#[test]
fn unsupported_operator_is_unsupported_feature() {
    let err = evaluate(&bson!({ "$dateToString": {} }), &doc! {}, None).unwrap_err();
    assert_eq!(err.code(), 238);
}

#[test]
fn document_literals_evaluate_values_and_drop_missing() {
    let doc = doc! { "a": 1 };
    assert_eq!(
        eval(bson!({ "kept": "$a", "gone": "$missing" }), doc),
        bson!({ "kept": 1 })
    );
}
