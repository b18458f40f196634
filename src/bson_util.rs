use std::cmp::Ordering;

use crate::{
    bson::{Bson, Document},
    collation::Collation,
};

/// Coerce numeric types into an `i64` if it would be lossless to do so. If this Bson is not
/// numeric or the conversion would be lossy (e.g. 1.5 -> 1), this returns `None`.
pub(crate) fn get_int(val: &Bson) -> Option<i64> {
    match *val {
        Bson::Int32(i) => Some(i64::from(i)),
        Bson::Int64(i) => Some(i),
        Bson::Double(f) if (f - (f as i64 as f64)).abs() <= f64::EPSILON => Some(f as i64),
        _ => None,
    }
}

/// Coerce numeric types into an `f64`, including `Decimal128` by way of its string form.
pub(crate) fn get_f64(val: &Bson) -> Option<f64> {
    match val {
        Bson::Int32(i) => Some(f64::from(*i)),
        Bson::Int64(i) => Some(*i as f64),
        Bson::Double(f) => Some(*f),
        Bson::Decimal128(d) => d.to_string().parse().ok(),
        _ => None,
    }
}

pub(crate) fn is_numeric(val: &Bson) -> bool {
    matches!(
        val,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_)
    )
}

/// The canonical inter-type sort rank. All numeric types share a rank so that `5` and `5.0`
/// compare equal across representations.
pub(crate) fn type_rank(val: &Bson) -> u8 {
    match val {
        Bson::MinKey => 1,
        Bson::Null | Bson::Undefined => 2,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 3,
        Bson::String(_) | Bson::Symbol(_) => 4,
        Bson::Document(_) => 5,
        Bson::Array(_) => 6,
        Bson::Binary(_) => 7,
        Bson::ObjectId(_) => 8,
        Bson::Boolean(_) => 9,
        Bson::DateTime(_) => 10,
        Bson::Timestamp(_) => 11,
        Bson::RegularExpression(_) => 12,
        Bson::JavaScriptCode(_) | Bson::JavaScriptCodeWithScope(_) | Bson::DbPointer(_) => 13,
        Bson::MaxKey => 14,
    }
}

/// Total order over document values following the canonical inter-type ordering, with numeric
/// types unified. `collation`, when present, substitutes locale-aware comparison for strings and
/// nothing else.
pub(crate) fn cmp_bson_with(a: &Bson, b: &Bson, collation: Option<&Collation>) -> Ordering {
    let (rank_a, rank_b) = (type_rank(a), type_rank(b));
    if rank_a != rank_b {
        return rank_a.cmp(&rank_b);
    }

    match (a, b) {
        (Bson::MinKey, Bson::MinKey)
        | (Bson::MaxKey, Bson::MaxKey)
        | (Bson::Null, Bson::Null)
        | (Bson::Undefined, Bson::Undefined)
        | (Bson::Null, Bson::Undefined)
        | (Bson::Undefined, Bson::Null) => Ordering::Equal,
        _ if rank_a == 3 => cmp_numbers(a, b),
        (Bson::String(_) | Bson::Symbol(_), Bson::String(_) | Bson::Symbol(_)) => {
            let (sa, sb) = (str_value(a), str_value(b));
            match collation {
                Some(c) => c.compare_str(sa, sb),
                None => sa.cmp(sb),
            }
        }
        (Bson::Document(da), Bson::Document(db)) => cmp_documents(da, db, collation),
        (Bson::Array(aa), Bson::Array(ab)) => {
            for (va, vb) in aa.iter().zip(ab.iter()) {
                let ord = cmp_bson_with(va, vb, collation);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            aa.len().cmp(&ab.len())
        }
        (Bson::Binary(ba), Bson::Binary(bb)) => ba
            .bytes
            .len()
            .cmp(&bb.bytes.len())
            .then(u8::from(ba.subtype).cmp(&u8::from(bb.subtype)))
            .then_with(|| ba.bytes.cmp(&bb.bytes)),
        (Bson::ObjectId(oa), Bson::ObjectId(ob)) => oa.bytes().cmp(&ob.bytes()),
        (Bson::Boolean(ba), Bson::Boolean(bb)) => ba.cmp(bb),
        (Bson::DateTime(da), Bson::DateTime(db)) => {
            da.timestamp_millis().cmp(&db.timestamp_millis())
        }
        (Bson::Timestamp(ta), Bson::Timestamp(tb)) => {
            ta.time.cmp(&tb.time).then(ta.increment.cmp(&tb.increment))
        }
        (Bson::RegularExpression(ra), Bson::RegularExpression(rb)) => {
            ra.pattern.cmp(&rb.pattern).then(ra.options.cmp(&rb.options))
        }
        // Remaining same-rank pairs (code, code-with-scope, db pointer) have no meaningful
        // ordering in this engine; fall back to their debug forms for a stable result.
        _ => format!("{:?}", a).cmp(&format!("{:?}", b)),
    }
}

pub(crate) fn cmp_bson(a: &Bson, b: &Bson) -> Ordering {
    cmp_bson_with(a, b, None)
}

/// Logical equality. Field order within embedded documents is not significant.
pub(crate) fn bson_eq(a: &Bson, b: &Bson, collation: Option<&Collation>) -> bool {
    cmp_bson_with(a, b, collation) == Ordering::Equal
}

fn str_value(val: &Bson) -> &str {
    match val {
        Bson::String(s) => s,
        Bson::Symbol(s) => s,
        _ => "",
    }
}

// Documents compare by their sorted field sets: order is preserved for round-tripping but is not
// significant for logical equality.
fn cmp_documents(a: &Document, b: &Document, collation: Option<&Collation>) -> Ordering {
    let mut fields_a: Vec<_> = a.iter().collect();
    let mut fields_b: Vec<_> = b.iter().collect();
    fields_a.sort_by(|x, y| x.0.cmp(y.0));
    fields_b.sort_by(|x, y| x.0.cmp(y.0));

    for ((key_a, val_a), (key_b, val_b)) in fields_a.iter().zip(fields_b.iter()) {
        let ord = key_a.cmp(key_b);
        if ord != Ordering::Equal {
            return ord;
        }
        let ord = cmp_bson_with(val_a, val_b, collation);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    fields_a.len().cmp(&fields_b.len())
}

fn cmp_numbers(a: &Bson, b: &Bson) -> Ordering {
    if let (Bson::Int32(x), Bson::Int32(y)) = (a, b) {
        return x.cmp(y);
    }
    if let (Some(x), Some(y)) = (exact_i64(a), exact_i64(b)) {
        return x.cmp(&y);
    }
    let x = get_f64(a).unwrap_or(f64::NAN);
    let y = get_f64(b).unwrap_or(f64::NAN);
    // NaN sorts before every other number and equal to itself.
    match (x.is_nan(), y.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
    }
}

fn exact_i64(val: &Bson) -> Option<i64> {
    match val {
        Bson::Int32(i) => Some(i64::from(*i)),
        Bson::Int64(i) => Some(*i),
        _ => None,
    }
}

/// The `$type`-style name of a value.
pub(crate) fn type_name(val: &Bson) -> &'static str {
    match val {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Document(_) => "object",
        Bson::Array(_) => "array",
        Bson::Binary(_) => "binData",
        Bson::Undefined => "undefined",
        Bson::ObjectId(_) => "objectId",
        Bson::Boolean(_) => "bool",
        Bson::DateTime(_) => "date",
        Bson::Null => "null",
        Bson::RegularExpression(_) => "regex",
        Bson::DbPointer(_) => "dbPointer",
        Bson::JavaScriptCode(_) => "javascript",
        Bson::Symbol(_) => "symbol",
        Bson::JavaScriptCodeWithScope(_) => "javascriptWithScope",
        Bson::Int32(_) => "int",
        Bson::Timestamp(_) => "timestamp",
        Bson::Int64(_) => "long",
        Bson::Decimal128(_) => "decimal",
        Bson::MinKey => "minKey",
        Bson::MaxKey => "maxKey",
    }
}

/// The numeric `$type` code of a value.
pub(crate) fn type_code(val: &Bson) -> i32 {
    match val {
        Bson::Double(_) => 1,
        Bson::String(_) => 2,
        Bson::Document(_) => 3,
        Bson::Array(_) => 4,
        Bson::Binary(_) => 5,
        Bson::Undefined => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Null => 10,
        Bson::RegularExpression(_) => 11,
        Bson::DbPointer(_) => 12,
        Bson::JavaScriptCode(_) => 13,
        Bson::Symbol(_) => 14,
        Bson::JavaScriptCodeWithScope(_) => 15,
        Bson::Int32(_) => 16,
        Bson::Timestamp(_) => 17,
        Bson::Int64(_) => 18,
        Bson::Decimal128(_) => 19,
        Bson::MinKey => -1,
        Bson::MaxKey => 127,
    }
}

/// Collects every value reachable at `path` using dot notation. Numeric path components traverse
/// arrays by index; non-numeric components applied to an array descend into every element.
pub(crate) fn path_values<'a>(doc: &'a Document, path: &str) -> Vec<&'a Bson> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    for (key, value) in doc.iter() {
        if key == segments[0] {
            walk(value, &segments[1..], &mut out);
        }
    }
    out
}

fn walk<'a>(value: &'a Bson, segments: &[&str], out: &mut Vec<&'a Bson>) {
    if segments.is_empty() {
        out.push(value);
        return;
    }
    let segment = segments[0];
    match value {
        Bson::Document(doc) => {
            if let Some(next) = doc.get(segment) {
                walk(next, &segments[1..], out);
            }
        }
        Bson::Array(elements) => {
            if let Ok(index) = segment.parse::<usize>() {
                if let Some(next) = elements.get(index) {
                    walk(next, &segments[1..], out);
                }
            } else {
                for element in elements {
                    if matches!(element, Bson::Document(_)) {
                        walk(element, segments, out);
                    }
                }
            }
        }
        _ => {}
    }
}

/// Reads the single value at `path` without implicit array descent: documents are traversed by
/// field name and arrays only by numeric index. Used for index key extraction and expressions.
pub(crate) fn first_path_value<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut current: Option<&Bson> = None;
    for (i, segment) in path.split('.').enumerate() {
        let next = if i == 0 {
            doc.get(segment)
        } else {
            match current {
                Some(Bson::Document(d)) => d.get(segment),
                Some(Bson::Array(elements)) => segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| elements.get(index)),
                _ => None,
            }
        };
        match next {
            Some(value) => current = Some(value),
            None => return None,
        }
    }
    current
}

/// Compares two documents under a `sort` specification: an ordered list of `(path, direction)`
/// with direction `1` or `-1`. Array-valued fields contribute their least element for ascending
/// keys and their greatest for descending ones; missing fields sort as null.
pub(crate) fn cmp_by_sort_spec(
    a: &Document,
    b: &Document,
    spec: &[(String, i32)],
    collation: Option<&Collation>,
) -> Ordering {
    for (path, direction) in spec {
        let key_a = sort_key(a, path, *direction, collation);
        let key_b = sort_key(b, path, *direction, collation);
        let ord = cmp_bson_with(&key_a, &key_b, collation);
        let ord = if *direction < 0 { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn sort_key(doc: &Document, path: &str, direction: i32, collation: Option<&Collation>) -> Bson {
    let mut leaves = path_values(doc, path);
    // Arrays sort by their extreme element in the sort direction.
    let mut expanded: Vec<&Bson> = Vec::new();
    for leaf in leaves.drain(..) {
        match leaf {
            Bson::Array(elements) if !elements.is_empty() => expanded.extend(elements.iter()),
            other => expanded.push(other),
        }
    }
    let selected = if direction < 0 {
        expanded
            .into_iter()
            .max_by(|x, y| cmp_bson_with(x, y, collation))
    } else {
        expanded
            .into_iter()
            .min_by(|x, y| cmp_bson_with(x, y, collation))
    };
    selected.cloned().unwrap_or(Bson::Null)
}

/// Parses a `sort` document into the ordered `(path, direction)` list used by
/// [`cmp_by_sort_spec`]. Directions must be numeric 1 or -1.
pub(crate) fn parse_sort_spec(sort: &Document) -> crate::error::Result<Vec<(String, i32)>> {
    let mut spec = Vec::with_capacity(sort.len());
    for (path, direction) in sort.iter() {
        match get_int(direction) {
            Some(1) => spec.push((path.clone(), 1)),
            Some(-1) => spec.push((path.clone(), -1)),
            _ => {
                return Err(crate::error::Error::bad_value(format!(
                    "Invalid sort direction for field '{}': must be 1 or -1",
                    path
                )))
            }
        }
    }
    Ok(spec)
}
