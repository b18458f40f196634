//! Application of the update language: atomic field modifiers and whole-document replacement.

use std::cmp::Ordering;

use crate::{
    bson::{doc, Bson, DateTime, Document, Timestamp},
    bson_util,
    collation::Collation,
    engine::matcher::{self, MatchContext},
    error::{Error, Result},
};

/// A parsed update document: either a set of `$`-prefixed atomic modifiers or a replacement
/// document.
#[derive(Clone, Debug)]
pub(crate) enum UpdateSpec {
    Modifiers(Document),
    Replacement(Document),
}

/// Classifies an update document. Mixing modifier and replacement-style fields is rejected.
pub(crate) fn parse_update(update: &Document) -> Result<UpdateSpec> {
    let modifier_keys = update.keys().filter(|k| k.starts_with('$')).count();
    if modifier_keys == 0 {
        Ok(UpdateSpec::Replacement(update.clone()))
    } else if modifier_keys == update.len() {
        Ok(UpdateSpec::Modifiers(update.clone()))
    } else {
        Err(Error::bad_value(
            "update document must contain either only update operators or only replacement fields",
        ))
    }
}

/// Context threaded through modifier application: the originating filter (for the positional `$`
/// operator), `arrayFilters` (for `$[ident]`), and the active collation.
pub(crate) struct UpdateContext<'a> {
    pub(crate) filter: &'a Document,
    pub(crate) array_filters: &'a [Document],
    pub(crate) collation: Option<&'a Collation>,
}

/// Applies an update in place. Returns whether the document actually changed.
pub(crate) fn apply(doc: &mut Document, spec: &UpdateSpec, ctx: &UpdateContext<'_>) -> Result<bool> {
    match spec {
        UpdateSpec::Replacement(replacement) => {
            let changed = !bson_util::bson_eq(
                &Bson::Document(doc.clone()),
                &Bson::Document(replacement.clone()),
                None,
            );
            *doc = replacement.clone();
            Ok(changed)
        }
        UpdateSpec::Modifiers(modifiers) => {
            let mut changed = false;
            for (op, argument) in modifiers.iter() {
                let fields = match argument {
                    Bson::Document(fields) => fields,
                    _ => {
                        return Err(Error::type_mismatch(format!(
                            "modifier {} expects a document argument",
                            op
                        )))
                    }
                };
                for (path, value) in fields.iter() {
                    changed |= apply_modifier(doc, op, path, value, ctx)?;
                }
            }
            Ok(changed)
        }
    }
}

fn apply_modifier(
    doc: &mut Document,
    op: &str,
    path: &str,
    value: &Bson,
    ctx: &UpdateContext<'_>,
) -> Result<bool> {
    let create = !matches!(op, "$unset" | "$pop" | "$pull" | "$pullAll" | "$rename");
    let paths = expand_paths(doc, path, ctx)?;

    let mut changed = false;
    for concrete in paths {
        changed |= match op {
            "$set" => {
                let slot = resolve_slot(doc, &concrete, create)?;
                set_slot(slot, value.clone())?
            }
            "$unset" => unset_slot(resolve_slot(doc, &concrete, false)?),
            "$inc" => arithmetic(doc, &concrete, op, value, |a, b| a + b)?,
            "$mul" => arithmetic(doc, &concrete, op, value, |a, b| a * b)?,
            "$min" => min_max(doc, &concrete, value, ctx.collation, Ordering::Less)?,
            "$max" => min_max(doc, &concrete, value, ctx.collation, Ordering::Greater)?,
            "$rename" => rename(doc, &concrete, value)?,
            "$currentDate" => current_date(doc, &concrete, value)?,
            "$push" => push(doc, &concrete, value, ctx)?,
            "$addToSet" => add_to_set(doc, &concrete, value)?,
            "$pull" => pull(doc, &concrete, value, ctx)?,
            "$pullAll" => pull_all(doc, &concrete, value)?,
            "$pop" => pop(doc, &concrete, value)?,
            other => {
                return Err(Error::not_implemented(format!(
                    "unsupported update modifier '{}'",
                    other
                )))
            }
        };
    }
    Ok(changed)
}

// ---- path machinery ----

/// Expands a modifier path into concrete segment lists: the positional `$` resolves to the first
/// filter-matched element, `$[]` to every element, and `$[ident]` to the elements matched by the
/// corresponding `arrayFilters` entry.
fn expand_paths(doc: &Document, path: &str, ctx: &UpdateContext<'_>) -> Result<Vec<Vec<String>>> {
    let mut concrete: Vec<Vec<String>> = vec![Vec::new()];
    for segment in path.split('.') {
        if segment == "$" {
            let mut next = Vec::new();
            for prefix in &concrete {
                let index = positional_index(doc, prefix, ctx)?;
                let mut extended = prefix.clone();
                extended.push(index.to_string());
                next.push(extended);
            }
            concrete = next;
        } else if segment == "$[]" || (segment.starts_with("$[") && segment.ends_with(']')) {
            let identifier = &segment[2..segment.len() - 1];
            let mut next = Vec::new();
            for prefix in &concrete {
                let elements = array_at(doc, prefix).ok_or_else(|| {
                    Error::bad_value(format!(
                        "the path '{}' must exist as an array in the document to apply array \
                         updates",
                        prefix.join(".")
                    ))
                })?;
                for (i, element) in elements.iter().enumerate() {
                    let included = if identifier.is_empty() {
                        true
                    } else {
                        array_filter_matches(identifier, element, ctx)?
                    };
                    if included {
                        let mut extended = prefix.clone();
                        extended.push(i.to_string());
                        next.push(extended);
                    }
                }
            }
            concrete = next;
        } else {
            for prefix in &mut concrete {
                prefix.push(segment.to_string());
            }
        }
    }
    Ok(concrete)
}

fn array_at<'a>(doc: &'a Document, path: &[String]) -> Option<&'a Vec<Bson>> {
    let joined = path.join(".");
    match bson_util::first_path_value(doc, &joined) {
        Some(Bson::Array(elements)) => Some(elements),
        _ => None,
    }
}

/// Finds the array element selected by the positional `$` operator: the first element of the
/// array at `prefix` that satisfies the filter conditions naming that array.
fn positional_index(doc: &Document, prefix: &[String], ctx: &UpdateContext<'_>) -> Result<usize> {
    let no_match = || {
        Error::bad_value(
            "the positional operator did not find the match needed from the query",
        )
    };

    let array_path = prefix.join(".");
    let elements = array_at(doc, prefix).ok_or_else(no_match)?;

    let mut conditions: Vec<(String, Bson)> = Vec::new();
    collect_conditions(ctx.filter, &array_path, &mut conditions);
    if conditions.is_empty() {
        return Err(no_match());
    }

    'element: for (i, element) in elements.iter().enumerate() {
        for (relative, condition) in &conditions {
            if !element_condition_matches(element, relative, condition, ctx.collation)? {
                continue 'element;
            }
        }
        return Ok(i);
    }
    Err(no_match())
}

fn collect_conditions(filter: &Document, array_path: &str, out: &mut Vec<(String, Bson)>) {
    for (key, condition) in filter.iter() {
        if key == "$and" {
            if let Bson::Array(clauses) = condition {
                for clause in clauses {
                    if let Bson::Document(clause) = clause {
                        collect_conditions(clause, array_path, out);
                    }
                }
            }
        } else if key == array_path {
            out.push((String::new(), condition.clone()));
        } else if let Some(relative) = key.strip_prefix(&format!("{}.", array_path)) {
            out.push((relative.to_string(), condition.clone()));
        }
    }
}

/// Tests a single filter condition against one array element by wrapping the element in a
/// synthetic document and reusing the matcher.
fn element_condition_matches(
    element: &Bson,
    relative: &str,
    condition: &Bson,
    collation: Option<&Collation>,
) -> Result<bool> {
    // An `$elemMatch` condition on the array itself tests each element against its inner filter.
    if relative.is_empty() {
        if let Bson::Document(spec) = condition {
            if let Some(Bson::Document(inner)) = spec.get("$elemMatch") {
                if let Bson::Document(element_doc) = element {
                    return matcher::matches(inner, element_doc, &MatchContext::new(collation));
                }
                return Ok(false);
            }
        }
    }
    let key = if relative.is_empty() {
        "element".to_string()
    } else {
        format!("element.{}", relative)
    };
    let probe = doc! { "element": element.clone() };
    let filter = doc! { key: condition.clone() };
    matcher::matches(&filter, &probe, &MatchContext::new(collation))
}

fn array_filter_matches(
    identifier: &str,
    element: &Bson,
    ctx: &UpdateContext<'_>,
) -> Result<bool> {
    let mut found = false;
    for filter in ctx.array_filters {
        let mut applies = false;
        for (key, condition) in filter.iter() {
            let (head, rest) = match key.split_once('.') {
                Some((head, rest)) => (head, Some(rest)),
                None => (key.as_str(), None),
            };
            if head != identifier {
                continue;
            }
            applies = true;
            if !element_condition_matches(element, rest.unwrap_or(""), condition, ctx.collation)? {
                return Ok(false);
            }
        }
        found |= applies;
    }
    if !found {
        return Err(Error::bad_value(format!(
            "no array filter found for identifier '{}' in path",
            identifier
        )));
    }
    Ok(true)
}

/// A mutable slot at the end of a concrete path: a document field or an array element.
enum Slot<'a> {
    Doc {
        parent: &'a mut Document,
        key: String,
    },
    Array {
        parent: &'a mut Vec<Bson>,
        index: usize,
    },
    /// The path does not resolve and creation was not requested.
    Missing,
}

impl Slot<'_> {
    fn get(&self) -> Option<&Bson> {
        match self {
            Slot::Doc { parent, key } => parent.get(key),
            Slot::Array { parent, index } => parent.get(*index),
            Slot::Missing => None,
        }
    }

    fn set(self, value: Bson) {
        match self {
            Slot::Doc { parent, key } => {
                parent.insert(key, value);
            }
            Slot::Array { parent, index } => {
                while parent.len() <= index {
                    parent.push(Bson::Null);
                }
                parent[index] = value;
            }
            Slot::Missing => {}
        }
    }
}

/// Walks `path` through `doc`, optionally creating missing intermediate documents, and returns
/// the final slot. Numeric segments traverse existing arrays; elsewhere they are field names.
fn resolve_slot<'a>(doc: &'a mut Document, path: &[String], create: bool) -> Result<Slot<'a>> {
    enum Node<'a> {
        Doc(&'a mut Document),
        Array(&'a mut Vec<Bson>),
    }

    let (last, intermediate) = path.split_last().expect("update paths are never empty");
    let mut node = Node::Doc(doc);

    for segment in intermediate {
        node = match node {
            Node::Doc(parent) => {
                if !parent.contains_key(segment) {
                    if !create {
                        return Ok(Slot::Missing);
                    }
                    parent.insert(segment.clone(), Bson::Document(Document::new()));
                }
                match parent.get_mut(segment) {
                    Some(Bson::Document(next)) => Node::Doc(next),
                    Some(Bson::Array(next)) => Node::Array(next),
                    Some(other) => {
                        return Err(Error::bad_value(format!(
                            "cannot use the part ({}) to traverse the element of type {}",
                            segment,
                            bson_util::type_name(other)
                        )))
                    }
                    None => return Ok(Slot::Missing),
                }
            }
            Node::Array(parent) => {
                let index: usize = segment.parse().map_err(|_| {
                    Error::bad_value(format!(
                        "cannot use the part ({}) to traverse an array",
                        segment
                    ))
                })?;
                if parent.len() <= index {
                    if !create {
                        return Ok(Slot::Missing);
                    }
                    while parent.len() <= index {
                        parent.push(Bson::Null);
                    }
                    parent[index] = Bson::Document(Document::new());
                }
                match &mut parent[index] {
                    Bson::Document(next) => Node::Doc(next),
                    Bson::Array(next) => Node::Array(next),
                    other => {
                        return Err(Error::bad_value(format!(
                            "cannot use the part ({}) to traverse the element of type {}",
                            segment,
                            bson_util::type_name(other)
                        )))
                    }
                }
            }
        };
    }

    match node {
        Node::Doc(parent) => Ok(Slot::Doc {
            parent,
            key: last.clone(),
        }),
        Node::Array(parent) => {
            let index: usize = last.parse().map_err(|_| {
                Error::bad_value(format!("cannot use the part ({}) to traverse an array", last))
            })?;
            Ok(Slot::Array { parent, index })
        }
    }
}

/// Sets a path to a literal value, creating intermediates. Used by upsert seeding.
pub(crate) fn set_path(doc: &mut Document, path: &str, value: Bson) -> Result<()> {
    let segments: Vec<String> = path.split('.').map(str::to_string).collect();
    let slot = resolve_slot(doc, &segments, true)?;
    slot.set(value);
    Ok(())
}

// ---- individual modifiers ----

fn set_slot(slot: Slot<'_>, value: Bson) -> Result<bool> {
    let changed = match slot.get() {
        Some(existing) => !bson_util::bson_eq(existing, &value, None),
        None => true,
    };
    slot.set(value);
    Ok(changed)
}

fn unset_slot(slot: Slot<'_>) -> bool {
    match slot {
        Slot::Doc { parent, key } => parent.remove(&key).is_some(),
        // Unsetting an array element nulls it rather than shifting its siblings.
        Slot::Array { parent, index } => {
            if index < parent.len() && !matches!(parent[index], Bson::Null) {
                parent[index] = Bson::Null;
                true
            } else {
                false
            }
        }
        Slot::Missing => false,
    }
}

fn arithmetic(
    doc: &mut Document,
    path: &[String],
    op: &str,
    operand: &Bson,
    combine: impl Fn(f64, f64) -> f64,
) -> Result<bool> {
    let operand_num = bson_util::get_f64(operand).ok_or_else(|| {
        Error::type_mismatch(format!(
            "cannot {} with non-numeric argument: {}",
            op, operand
        ))
    })?;

    let slot = resolve_slot(doc, path, true)?;
    let current = match slot.get() {
        Some(existing) => bson_util::get_f64(existing).ok_or_else(|| {
            Error::bad_value(format!(
                "cannot apply {} to a value of non-numeric type {}",
                op,
                bson_util::type_name(existing)
            ))
        })?,
        // Missing fields start from zero: $inc sets the increment, $mul sets 0.
        None => 0.0,
    };
    let both_int = matches!(operand, Bson::Int32(_) | Bson::Int64(_))
        && matches!(slot.get(), None | Some(Bson::Int32(_)) | Some(Bson::Int64(_)));
    let result = combine(current, operand_num);

    let value = if both_int {
        let as_int = result as i64;
        match i32::try_from(as_int) {
            Ok(small)
                if matches!(operand, Bson::Int32(_))
                    && matches!(slot.get(), None | Some(Bson::Int32(_))) =>
            {
                Bson::Int32(small)
            }
            _ => Bson::Int64(as_int),
        }
    } else {
        Bson::Double(result)
    };
    set_slot(slot, value)
}

fn min_max(
    doc: &mut Document,
    path: &[String],
    operand: &Bson,
    collation: Option<&Collation>,
    keep_when: Ordering,
) -> Result<bool> {
    let slot = resolve_slot(doc, path, true)?;
    let replace = match slot.get() {
        Some(existing) => bson_util::cmp_bson_with(operand, existing, collation) == keep_when,
        None => true,
    };
    if replace {
        slot.set(operand.clone());
        Ok(true)
    } else {
        Ok(false)
    }
}

fn rename(doc: &mut Document, path: &[String], target: &Bson) -> Result<bool> {
    let target_path = match target {
        Bson::String(target_path) if !target_path.is_empty() => target_path.clone(),
        _ => {
            return Err(Error::bad_value(
                "the 'to' field for $rename must be a non-empty string",
            ))
        }
    };
    if path.iter().any(|s| s.parse::<usize>().is_ok()) || target_path.split('.').any(|s| s.parse::<usize>().is_ok()) {
        return Err(Error::bad_value(
            "the source and target field for $rename must not traverse arrays",
        ));
    }

    let taken = match resolve_slot(doc, path, false)? {
        Slot::Doc { parent, key } => parent.remove(&key),
        _ => None,
    };
    match taken {
        Some(value) => {
            set_path(doc, &target_path, value)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

fn current_date(doc: &mut Document, path: &[String], spec: &Bson) -> Result<bool> {
    let value = match spec {
        Bson::Boolean(true) => Bson::DateTime(DateTime::now()),
        Bson::Document(spec_doc) => match spec_doc.get_str("$type") {
            Ok("date") => Bson::DateTime(DateTime::now()),
            Ok("timestamp") => {
                let now = DateTime::now().timestamp_millis() / 1000;
                Bson::Timestamp(Timestamp {
                    time: now as u32,
                    increment: 1,
                })
            }
            _ => {
                return Err(Error::bad_value(
                    "$currentDate $type must be 'date' or 'timestamp'",
                ))
            }
        },
        _ => {
            return Err(Error::bad_value(
                "$currentDate expects true or a {$type: ...} document",
            ))
        }
    };
    let slot = resolve_slot(doc, path, true)?;
    slot.set(value);
    Ok(true)
}

fn with_array<T>(
    doc: &mut Document,
    path: &[String],
    op: &str,
    create: bool,
    f: impl FnOnce(&mut Vec<Bson>) -> Result<T>,
) -> Result<Option<T>> {
    let slot = resolve_slot(doc, path, create)?;
    match slot {
        Slot::Doc { parent, key } => {
            if !parent.contains_key(&key) {
                if !create {
                    return Ok(None);
                }
                parent.insert(key.clone(), Bson::Array(Vec::new()));
            }
            match parent.get_mut(&key) {
                Some(Bson::Array(elements)) => Ok(Some(f(elements)?)),
                Some(other) => Err(Error::bad_value(format!(
                    "the field '{}' must be an array but is of type {} in document",
                    key,
                    bson_util::type_name(other)
                ))),
                None => Ok(None),
            }
        }
        Slot::Array { parent, index } => match parent.get_mut(index) {
            Some(Bson::Array(elements)) => Ok(Some(f(elements)?)),
            Some(other) => Err(Error::bad_value(format!(
                "the field '{}' must be an array but is of type {} in document",
                op,
                bson_util::type_name(other)
            ))),
            None => Ok(None),
        },
        Slot::Missing => Ok(None),
    }
}

fn push(doc: &mut Document, path: &[String], value: &Bson, ctx: &UpdateContext<'_>) -> Result<bool> {
    let (each, position, slice, sort) = parse_push_argument(value)?;
    let collation = ctx.collation;
    with_array(doc, path, "$push", true, move |elements| {
        let insert_at = match position {
            Some(position) if position < 0 => {
                elements.len().saturating_sub(position.unsigned_abs() as usize)
            }
            Some(position) => (position as usize).min(elements.len()),
            None => elements.len(),
        };
        for (offset, item) in each.iter().enumerate() {
            elements.insert(insert_at + offset, item.clone());
        }

        if let Some(ref sort) = sort {
            match sort {
                Bson::Document(spec) => {
                    let spec = bson_util::parse_sort_spec(spec)?;
                    elements.sort_by(|a, b| match (a, b) {
                        (Bson::Document(a), Bson::Document(b)) => {
                            bson_util::cmp_by_sort_spec(a, b, &spec, collation)
                        }
                        _ => Ordering::Equal,
                    });
                }
                direction => match bson_util::get_int(direction) {
                    Some(1) => elements.sort_by(|a, b| bson_util::cmp_bson_with(a, b, collation)),
                    Some(-1) => {
                        elements.sort_by(|a, b| bson_util::cmp_bson_with(b, a, collation))
                    }
                    _ => return Err(Error::bad_value("$sort must be 1, -1, or a document")),
                },
            }
        }

        if let Some(slice) = slice {
            if slice == 0 {
                elements.clear();
            } else if slice > 0 {
                elements.truncate(slice as usize);
            } else {
                let keep = slice.unsigned_abs() as usize;
                if elements.len() > keep {
                    let drop = elements.len() - keep;
                    elements.drain(..drop);
                }
            }
        }
        Ok(true)
    })
    .map(|r| r.unwrap_or(false))
}

type PushParts = (Vec<Bson>, Option<i64>, Option<i64>, Option<Bson>);

fn parse_push_argument(value: &Bson) -> Result<PushParts> {
    if let Bson::Document(spec) = value {
        if spec.contains_key("$each") {
            let each = match spec.get("$each") {
                Some(Bson::Array(each)) => each.clone(),
                _ => return Err(Error::bad_value("the argument to $each must be an array")),
            };
            let mut position = None;
            let mut slice = None;
            let mut sort = None;
            for (key, modifier) in spec.iter() {
                match key.as_str() {
                    "$each" => {}
                    "$position" => {
                        position = Some(bson_util::get_int(modifier).ok_or_else(|| {
                            Error::bad_value("$position must be a number")
                        })?)
                    }
                    "$slice" => {
                        slice = Some(bson_util::get_int(modifier).ok_or_else(|| {
                            Error::bad_value("$slice must be a number")
                        })?)
                    }
                    "$sort" => sort = Some(modifier.clone()),
                    other => {
                        return Err(Error::bad_value(format!(
                            "unrecognized clause in $push: {}",
                            other
                        )))
                    }
                }
            }
            return Ok((each, position, slice, sort));
        }
    }
    Ok((vec![value.clone()], None, None, None))
}

fn add_to_set(doc: &mut Document, path: &[String], value: &Bson) -> Result<bool> {
    let additions: Vec<Bson> = match value {
        Bson::Document(spec) if spec.contains_key("$each") => match spec.get("$each") {
            Some(Bson::Array(each)) => {
                if spec.len() > 1 {
                    return Err(Error::bad_value(
                        "$addToSet takes no clauses besides $each",
                    ));
                }
                each.clone()
            }
            _ => return Err(Error::bad_value("the argument to $each must be an array")),
        },
        other => vec![other.clone()],
    };

    with_array(doc, path, "$addToSet", true, move |elements| {
        let mut changed = false;
        for addition in additions {
            if !elements
                .iter()
                .any(|existing| bson_util::bson_eq(existing, &addition, None))
            {
                elements.push(addition);
                changed = true;
            }
        }
        Ok(changed)
    })
    .map(|r| r.unwrap_or(false))
}

fn pull(doc: &mut Document, path: &[String], condition: &Bson, ctx: &UpdateContext<'_>) -> Result<bool> {
    let collation = ctx.collation;
    let condition = condition.clone();
    with_array(doc, path, "$pull", false, move |elements| {
        let before = elements.len();
        let mut err = None;
        elements.retain(|element| {
            if err.is_some() {
                return true;
            }
            match pull_condition_matches(element, &condition, collation) {
                Ok(hit) => !hit,
                Err(e) => {
                    err = Some(e);
                    true
                }
            }
        });
        if let Some(e) = err {
            return Err(e);
        }
        Ok(elements.len() != before)
    })
    .map(|r| r.unwrap_or(false))
}

fn pull_condition_matches(
    element: &Bson,
    condition: &Bson,
    collation: Option<&Collation>,
) -> Result<bool> {
    match condition {
        Bson::Document(spec) if spec.keys().any(|k| k.starts_with('$')) => {
            element_condition_matches(element, "", condition, collation)
        }
        Bson::Document(filter) => match element {
            Bson::Document(element_doc) => {
                matcher::matches(filter, element_doc, &MatchContext::new(collation))
            }
            _ => Ok(false),
        },
        literal => Ok(bson_util::bson_eq(element, literal, collation)),
    }
}

fn pull_all(doc: &mut Document, path: &[String], value: &Bson) -> Result<bool> {
    let targets = match value {
        Bson::Array(targets) => targets.clone(),
        _ => return Err(Error::bad_value("$pullAll requires an array argument")),
    };
    with_array(doc, path, "$pullAll", false, move |elements| {
        let before = elements.len();
        elements.retain(|element| {
            !targets
                .iter()
                .any(|target| bson_util::bson_eq(element, target, None))
        });
        Ok(elements.len() != before)
    })
    .map(|r| r.unwrap_or(false))
}

fn pop(doc: &mut Document, path: &[String], value: &Bson) -> Result<bool> {
    let from_front = match bson_util::get_int(value) {
        Some(-1) => true,
        Some(1) => false,
        _ => return Err(Error::bad_value("$pop expects 1 or -1")),
    };
    with_array(doc, path, "$pop", false, move |elements| {
        if elements.is_empty() {
            return Ok(false);
        }
        if from_front {
            elements.remove(0);
        } else {
            elements.pop();
        }
        Ok(true)
    })
    .map(|r| r.unwrap_or(false))
}

// ---- upsert seeding ----

/// Builds the document inserted by an upsert that matched nothing: the filter's equality
/// conditions seed the document, then the update is applied on top. Replacement updates are the
/// inserted document themselves (with `_id` drawn from the filter when present).
pub(crate) fn build_upsert_document(
    filter: &Document,
    spec: &UpdateSpec,
    array_filters: &[Document],
    collation: Option<&Collation>,
) -> Result<Document> {
    match spec {
        UpdateSpec::Replacement(replacement) => {
            let mut seed = replacement.clone();
            if !seed.contains_key("_id") {
                if let Some(id) = equality_condition(filter, "_id") {
                    seed.insert("_id", id);
                }
            }
            Ok(seed)
        }
        UpdateSpec::Modifiers(_) => {
            let mut seed = Document::new();
            seed_from_filter(filter, &mut seed)?;
            let ctx = UpdateContext {
                filter,
                array_filters,
                collation,
            };
            apply(&mut seed, spec, &ctx)?;
            Ok(seed)
        }
    }
}

fn seed_from_filter(filter: &Document, seed: &mut Document) -> Result<()> {
    for (key, condition) in filter.iter() {
        if key == "$and" {
            if let Bson::Array(clauses) = condition {
                for clause in clauses {
                    if let Bson::Document(clause) = clause {
                        seed_from_filter(clause, seed)?;
                    }
                }
            }
            continue;
        }
        if key.starts_with('$') {
            continue;
        }
        match condition {
            Bson::Document(spec) if spec.keys().any(|k| k.starts_with('$')) => {
                if let Some(value) = spec.get("$eq") {
                    set_path(seed, key, value.clone())?;
                }
            }
            Bson::RegularExpression(_) => {}
            literal => set_path(seed, key, literal.clone())?,
        }
    }
    Ok(())
}

fn equality_condition(filter: &Document, path: &str) -> Option<Bson> {
    match filter.get(path) {
        Some(Bson::Document(spec)) if spec.keys().any(|k| k.starts_with('$')) => {
            spec.get("$eq").cloned()
        }
        Some(Bson::RegularExpression(_)) | None => None,
        Some(literal) => Some(literal.clone()),
    }
}
