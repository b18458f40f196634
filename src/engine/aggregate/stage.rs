use std::collections::HashMap;

use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};

use crate::{
    bson::{doc, Bson, Document},
    bson_util,
    collation::Collation,
    engine::{
        aggregate::{expr, projection},
        matcher::{self, MatchContext},
        update,
        StoreRead,
    },
    error::{Error, Result},
    Namespace,
};

/// One parsed pipeline stage.
#[derive(Clone, Debug)]
pub(crate) enum Stage {
    Match(Document),
    Project(Document),
    AddFields(Document),
    Unset(Vec<String>),
    ReplaceRoot(Bson),
    Sort(Document),
    Limit(i64),
    Skip(i64),
    Unwind {
        path: String,
        include_array_index: Option<String>,
        preserve_null_and_empty: bool,
    },
    Sample {
        size: i64,
    },
    Count(String),
    Group {
        id: Bson,
        accumulators: Vec<(String, Accumulator, Bson)>,
    },
    Lookup(LookupSpec),
    UnionWith {
        coll: String,
        pipeline: Vec<Stage>,
    },
}

/// A `$out` or `$merge` sink. Must be the final stage of its pipeline.
#[derive(Clone, Debug)]
pub(crate) enum TerminalStage {
    Out(String),
    Merge(String),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Accumulator {
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    Push,
    AddToSet,
}

#[derive(Clone, Debug)]
pub(crate) struct LookupSpec {
    pub(crate) from: String,
    pub(crate) local_field: Option<String>,
    pub(crate) foreign_field: Option<String>,
    pub(crate) let_vars: Vec<(String, Bson)>,
    pub(crate) pipeline: Option<Vec<Stage>>,
    pub(crate) as_field: String,
}

/// A fully parsed pipeline: its streaming stages plus an optional terminal sink.
#[derive(Clone, Debug)]
pub(crate) struct ParsedPipeline {
    pub(crate) stages: Vec<Stage>,
    pub(crate) terminal: Option<TerminalStage>,
}

/// Parses a raw pipeline. `$out`/`$merge` anywhere but the final position fail with
/// `NotImplemented`.
pub(crate) fn parse_pipeline(pipeline: &[Bson], allow_terminal: bool) -> Result<ParsedPipeline> {
    let mut stages = Vec::with_capacity(pipeline.len());
    let mut terminal = None;

    for (i, stage) in pipeline.iter().enumerate() {
        let stage_doc = match stage {
            Bson::Document(stage_doc) if stage_doc.len() == 1 => stage_doc,
            Bson::Document(_) => {
                return Err(Error::bad_value(
                    "a pipeline stage specification object must contain exactly one field",
                ))
            }
            _ => return Err(Error::type_mismatch("each pipeline element must be a document")),
        };
        let (name, spec) = stage_doc.iter().next().expect("stage has one entry");
        let last = i + 1 == pipeline.len();

        match name.as_str() {
            "$out" | "$merge" => {
                if !allow_terminal || !last {
                    return Err(Error::not_implemented(format!(
                        "{} is only supported as the final stage of the pipeline",
                        name
                    )));
                }
                terminal = Some(parse_terminal(name, spec)?);
            }
            _ => stages.push(parse_stage(name, spec)?),
        }
    }

    Ok(ParsedPipeline { stages, terminal })
}

fn parse_terminal(name: &str, spec: &Bson) -> Result<TerminalStage> {
    match name {
        "$out" => match spec {
            Bson::String(coll) => Ok(TerminalStage::Out(coll.clone())),
            _ => Err(Error::not_implemented("$out targets must be collection names")),
        },
        _ => {
            let into = match spec {
                Bson::String(coll) => coll.clone(),
                Bson::Document(spec_doc) => {
                    for key in spec_doc.keys() {
                        match key.as_str() {
                            "into" => {}
                            "on" | "whenMatched" | "whenNotMatched" | "let" => {
                                return Err(Error::not_implemented(format!(
                                    "$merge option '{}' is not supported",
                                    key
                                )))
                            }
                            other => {
                                return Err(Error::bad_value(format!(
                                    "unknown $merge option '{}'",
                                    other
                                )))
                            }
                        }
                    }
                    match spec_doc.get("into") {
                        Some(Bson::String(coll)) => coll.clone(),
                        _ => {
                            return Err(Error::not_implemented(
                                "$merge 'into' must be a collection name",
                            ))
                        }
                    }
                }
                _ => return Err(Error::type_mismatch("$merge requires a string or document")),
            };
            Ok(TerminalStage::Merge(into))
        }
    }
}

fn parse_stage(name: &str, spec: &Bson) -> Result<Stage> {
    match name {
        "$match" => match spec {
            Bson::Document(filter) => Ok(Stage::Match(filter.clone())),
            _ => Err(Error::type_mismatch("the $match stage specification must be an object")),
        },
        "$project" => match spec {
            Bson::Document(projection) if !projection.is_empty() => {
                Ok(Stage::Project(projection.clone()))
            }
            _ => Err(Error::bad_value("$project specification must be a non-empty object")),
        },
        "$addFields" | "$set" => match spec {
            Bson::Document(fields) => Ok(Stage::AddFields(fields.clone())),
            _ => Err(Error::type_mismatch(format!("{} must be an object", name))),
        },
        "$unset" => match spec {
            Bson::String(path) => Ok(Stage::Unset(vec![path.clone()])),
            Bson::Array(paths) => {
                let paths = paths
                    .iter()
                    .map(|p| match p {
                        Bson::String(p) => Ok(p.clone()),
                        _ => Err(Error::type_mismatch("$unset fields must be strings")),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Stage::Unset(paths))
            }
            _ => Err(Error::type_mismatch("$unset must be a string or array of strings")),
        },
        "$replaceRoot" => match spec {
            Bson::Document(spec_doc) => {
                let new_root = spec_doc
                    .get("newRoot")
                    .ok_or_else(|| Error::bad_value("$replaceRoot requires 'newRoot'"))?;
                Ok(Stage::ReplaceRoot(new_root.clone()))
            }
            _ => Err(Error::type_mismatch("$replaceRoot must be a document")),
        },
        "$replaceWith" => Ok(Stage::ReplaceRoot(spec.clone())),
        "$sort" => match spec {
            Bson::Document(sort) if !sort.is_empty() => Ok(Stage::Sort(sort.clone())),
            _ => Err(Error::bad_value("$sort stage must have at least one sort key")),
        },
        "$limit" => match bson_util::get_int(spec) {
            Some(limit) if limit > 0 => Ok(Stage::Limit(limit)),
            Some(_) => Err(Error::bad_value("the limit must be positive")),
            None => Err(Error::type_mismatch("the limit must be a number")),
        },
        "$skip" => match bson_util::get_int(spec) {
            Some(skip) if skip >= 0 => Ok(Stage::Skip(skip)),
            Some(_) => Err(Error::bad_value("the skip must be non-negative")),
            None => Err(Error::type_mismatch("the skip must be a number")),
        },
        "$unwind" => parse_unwind(spec),
        "$sample" => match spec {
            Bson::Document(spec_doc) => match spec_doc.get("size").and_then(bson_util::get_int) {
                Some(size) if size >= 0 => Ok(Stage::Sample { size }),
                _ => Err(Error::bad_value("$sample size must be a non-negative number")),
            },
            _ => Err(Error::type_mismatch("the $sample stage specification must be an object")),
        },
        "$count" => match spec {
            Bson::String(field) if !field.is_empty() && !field.contains('$') && !field.contains('.') => {
                Ok(Stage::Count(field.clone()))
            }
            _ => Err(Error::bad_value(
                "$count requires a non-empty string field name without '.' or '$'",
            )),
        },
        "$group" => parse_group(spec),
        "$lookup" => parse_lookup(spec),
        "$unionWith" => parse_union_with(spec),
        other => Err(Error::not_implemented(format!(
            "unsupported pipeline stage '{}'",
            other
        ))),
    }
}

fn parse_unwind(spec: &Bson) -> Result<Stage> {
    let (path, include_array_index, preserve) = match spec {
        Bson::String(path) => (path.clone(), None, false),
        Bson::Document(spec_doc) => {
            let path = match spec_doc.get("path") {
                Some(Bson::String(path)) => path.clone(),
                _ => return Err(Error::bad_value("$unwind requires a string 'path'")),
            };
            let include = match spec_doc.get("includeArrayIndex") {
                Some(Bson::String(name)) if !name.is_empty() => Some(name.clone()),
                None => None,
                _ => {
                    return Err(Error::bad_value(
                        "includeArrayIndex must be a non-empty string",
                    ))
                }
            };
            let preserve = match spec_doc.get("preserveNullAndEmptyArrays") {
                Some(Bson::Boolean(preserve)) => *preserve,
                None => false,
                _ => {
                    return Err(Error::type_mismatch(
                        "preserveNullAndEmptyArrays must be a boolean",
                    ))
                }
            };
            (path, include, preserve)
        }
        _ => return Err(Error::type_mismatch("$unwind must be a string or document")),
    };
    let path = path
        .strip_prefix('$')
        .ok_or_else(|| Error::bad_value("$unwind path must start with '$'"))?
        .to_string();
    Ok(Stage::Unwind {
        path,
        include_array_index,
        preserve_null_and_empty: preserve,
    })
}

fn parse_group(spec: &Bson) -> Result<Stage> {
    let spec = match spec {
        Bson::Document(spec) => spec,
        _ => return Err(Error::type_mismatch("a group's fields must be specified in an object")),
    };
    let id = spec
        .get("_id")
        .ok_or_else(|| Error::bad_value("a group specification must include an _id"))?
        .clone();

    let mut accumulators = Vec::new();
    for (field, accumulator) in spec.iter() {
        if field == "_id" {
            continue;
        }
        let accumulator_doc = match accumulator {
            Bson::Document(accumulator_doc) if accumulator_doc.len() == 1 => accumulator_doc,
            _ => {
                return Err(Error::bad_value(format!(
                    "the field '{}' must be an accumulator object",
                    field
                )))
            }
        };
        let (op, argument) = accumulator_doc.iter().next().expect("len checked above");
        let op = match op.as_str() {
            "$sum" => Accumulator::Sum,
            "$avg" => Accumulator::Avg,
            "$min" => Accumulator::Min,
            "$max" => Accumulator::Max,
            "$first" => Accumulator::First,
            "$last" => Accumulator::Last,
            "$push" => Accumulator::Push,
            "$addToSet" => Accumulator::AddToSet,
            other => {
                return Err(Error::not_implemented(format!(
                    "unsupported group accumulator '{}'",
                    other
                )))
            }
        };
        accumulators.push((field.clone(), op, argument.clone()));
    }

    Ok(Stage::Group { id, accumulators })
}

fn parse_lookup(spec: &Bson) -> Result<Stage> {
    let spec = match spec {
        Bson::Document(spec) => spec,
        _ => return Err(Error::type_mismatch("the $lookup specification must be an object")),
    };

    let get_string = |field: &str| -> Result<Option<String>> {
        match spec.get(field) {
            Some(Bson::String(value)) => Ok(Some(value.clone())),
            None => Ok(None),
            Some(_) => Err(Error::type_mismatch(format!(
                "$lookup '{}' must be a string",
                field
            ))),
        }
    };

    let from = get_string("from")?
        .ok_or_else(|| Error::bad_value("$lookup requires a 'from' collection"))?;
    let as_field = get_string("as")?
        .ok_or_else(|| Error::bad_value("$lookup requires an 'as' field"))?;
    let local_field = get_string("localField")?;
    let foreign_field = get_string("foreignField")?;

    let let_vars = match spec.get("let") {
        Some(Bson::Document(vars)) => vars
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
        None => Vec::new(),
        Some(_) => return Err(Error::type_mismatch("$lookup 'let' must be a document")),
    };

    let pipeline = match spec.get("pipeline") {
        Some(Bson::Array(pipeline)) => {
            let parsed = parse_pipeline(pipeline, false)?;
            Some(parsed.stages)
        }
        None => None,
        Some(_) => return Err(Error::type_mismatch("$lookup 'pipeline' must be an array")),
    };

    match (&local_field, &foreign_field, &pipeline) {
        (Some(_), Some(_), None) | (None, None, Some(_)) => {}
        (Some(_), Some(_), Some(_)) => {
            return Err(Error::not_implemented(
                "$lookup with both localField/foreignField and a pipeline is not supported",
            ))
        }
        _ => {
            return Err(Error::bad_value(
                "$lookup requires either localField+foreignField or a pipeline",
            ))
        }
    }

    Ok(Stage::Lookup(LookupSpec {
        from,
        local_field,
        foreign_field,
        let_vars,
        pipeline,
        as_field,
    }))
}

fn parse_union_with(spec: &Bson) -> Result<Stage> {
    match spec {
        Bson::String(coll) => Ok(Stage::UnionWith {
            coll: coll.clone(),
            pipeline: Vec::new(),
        }),
        Bson::Document(spec_doc) => {
            let coll = match spec_doc.get("coll") {
                Some(Bson::String(coll)) => coll.clone(),
                _ => return Err(Error::bad_value("$unionWith requires a 'coll' name")),
            };
            let pipeline = match spec_doc.get("pipeline") {
                Some(Bson::Array(pipeline)) => parse_pipeline(pipeline, false)?.stages,
                None => Vec::new(),
                Some(_) => {
                    return Err(Error::type_mismatch("$unionWith 'pipeline' must be an array"))
                }
            };
            Ok(Stage::UnionWith { coll, pipeline })
        }
        _ => Err(Error::type_mismatch("$unionWith must be a string or document")),
    }
}

/// Runs the streaming stages of a pipeline over `input`. `store` and `db` resolve the foreign
/// collections of `$lookup` and `$unionWith`; `vars` carries `$$` bindings into `$expr` and
/// expressions (used by `$lookup` inner pipelines).
pub(crate) fn run_pipeline(
    store: &dyn StoreRead,
    db: &str,
    input: Vec<Document>,
    stages: &[Stage],
    collation: Option<&Collation>,
    vars: &HashMap<String, Bson>,
) -> Result<Vec<Document>> {
    let mut docs = input;
    for stage in stages {
        docs = run_stage(store, db, docs, stage, collation, vars)?;
    }
    Ok(docs)
}

fn run_stage(
    store: &dyn StoreRead,
    db: &str,
    input: Vec<Document>,
    stage: &Stage,
    collation: Option<&Collation>,
    vars: &HashMap<String, Bson>,
) -> Result<Vec<Document>> {
    match stage {
        Stage::Match(filter) => {
            let ctx = MatchContext::with_variables(collation, vars);
            let mut out = Vec::new();
            for doc in input {
                if matcher::matches(filter, &doc, &ctx)? {
                    out.push(doc);
                }
            }
            Ok(out)
        }
        Stage::Project(spec) => input
            .iter()
            .map(|doc| projection::apply_projection_with_vars(doc, spec, Some(vars)))
            .collect(),
        Stage::AddFields(fields) => {
            let mut out = Vec::with_capacity(input.len());
            for mut doc in input {
                for (path, expression) in fields.iter() {
                    let value = expr::evaluate(expression, &doc, Some(vars))?;
                    if matches!(value, Bson::Undefined) {
                        remove_path(&mut doc, path);
                    } else {
                        update::set_path(&mut doc, path, value)?;
                    }
                }
                out.push(doc);
            }
            Ok(out)
        }
        Stage::Unset(paths) => {
            let mut out = Vec::with_capacity(input.len());
            for mut doc in input {
                for path in paths {
                    remove_path(&mut doc, path);
                }
                out.push(doc);
            }
            Ok(out)
        }
        Stage::ReplaceRoot(expression) => {
            let mut out = Vec::with_capacity(input.len());
            for doc in input {
                match expr::evaluate(expression, &doc, Some(vars))? {
                    Bson::Document(new_root) => out.push(new_root),
                    other => {
                        return Err(Error::bad_value(format!(
                            "'newRoot' expression must evaluate to an object, but resulting value \
                             was of type {}",
                            bson_util::type_name(&other)
                        )))
                    }
                }
            }
            Ok(out)
        }
        Stage::Sort(sort) => {
            let spec = bson_util::parse_sort_spec(sort)?;
            let mut docs = input;
            docs.sort_by(|a, b| bson_util::cmp_by_sort_spec(a, b, &spec, collation));
            Ok(docs)
        }
        Stage::Limit(limit) => {
            let mut docs = input;
            docs.truncate(*limit as usize);
            Ok(docs)
        }
        Stage::Skip(skip) => {
            let skip = *skip as usize;
            if skip >= input.len() {
                Ok(Vec::new())
            } else {
                let mut docs = input;
                Ok(docs.split_off(skip))
            }
        }
        Stage::Unwind {
            path,
            include_array_index,
            preserve_null_and_empty,
        } => {
            let mut out = Vec::new();
            for doc in input {
                unwind_document(
                    doc,
                    path,
                    include_array_index.as_deref(),
                    *preserve_null_and_empty,
                    &mut out,
                )?;
            }
            Ok(out)
        }
        Stage::Sample { size } => {
            let mut docs = input;
            let size = *size as usize;
            if size >= docs.len() {
                return Ok(docs);
            }
            let mut rng = SmallRng::from_rng(&mut rand::rng());
            let (sampled, _) = docs.partial_shuffle(&mut rng, size);
            Ok(sampled.to_vec())
        }
        Stage::Count(field) => {
            let count = input.len();
            let count = if count <= i32::MAX as usize {
                Bson::Int32(count as i32)
            } else {
                Bson::Int64(count as i64)
            };
            let mut counted = Document::new();
            counted.insert(field.clone(), count);
            Ok(vec![counted])
        }
        Stage::Group { id, accumulators } => run_group(input, id, accumulators, vars),
        Stage::Lookup(spec) => run_lookup(store, db, input, spec, collation, vars),
        Stage::UnionWith { coll, pipeline } => {
            let foreign = Namespace::new(db, coll.clone());
            let foreign_docs = store
                .collection(&foreign)
                .map(|c| c.documents().to_vec())
                .unwrap_or_default();
            let unioned = run_pipeline(store, db, foreign_docs, pipeline, collation, vars)?;
            let mut docs = input;
            docs.extend(unioned);
            Ok(docs)
        }
    }
}

fn unwind_document(
    doc: Document,
    path: &str,
    include_array_index: Option<&str>,
    preserve: bool,
    out: &mut Vec<Document>,
) -> Result<()> {
    let value = bson_util::first_path_value(&doc, path).cloned();
    match value {
        Some(Bson::Array(elements)) => {
            if elements.is_empty() {
                if preserve {
                    let mut kept = doc;
                    remove_path(&mut kept, path);
                    if let Some(index_field) = include_array_index {
                        update::set_path(&mut kept, index_field, Bson::Null)?;
                    }
                    out.push(kept);
                }
                return Ok(());
            }
            for (i, element) in elements.into_iter().enumerate() {
                let mut unwound = doc.clone();
                update::set_path(&mut unwound, path, element)?;
                if let Some(index_field) = include_array_index {
                    update::set_path(&mut unwound, index_field, Bson::Int64(i as i64))?;
                }
                out.push(unwound);
            }
        }
        Some(Bson::Null) | None => {
            if preserve {
                let mut kept = doc;
                if let Some(index_field) = include_array_index {
                    update::set_path(&mut kept, index_field, Bson::Null)?;
                }
                out.push(kept);
            }
        }
        // A non-array value unwinds to itself.
        Some(_) => {
            let mut kept = doc;
            if let Some(index_field) = include_array_index {
                update::set_path(&mut kept, index_field, Bson::Null)?;
            }
            out.push(kept);
        }
    }
    Ok(())
}

/// Removes a dotted path from a document, descending into array elements for intermediate
/// segments.
fn remove_path(doc: &mut Document, path: &str) {
    fn remove(value: &mut Bson, segments: &[&str]) {
        match value {
            Bson::Document(doc) => remove_from_doc(doc, segments),
            Bson::Array(elements) => {
                for element in elements {
                    remove(element, segments);
                }
            }
            _ => {}
        }
    }

    fn remove_from_doc(doc: &mut Document, segments: &[&str]) {
        if segments.len() == 1 {
            doc.remove(segments[0]);
        } else if let Some(next) = doc.get_mut(segments[0]) {
            remove(next, &segments[1..]);
        }
    }

    let segments: Vec<&str> = path.split('.').collect();
    remove_from_doc(doc, &segments);
}

enum AccumulatorState {
    Sum { total: f64, all_int: bool },
    Avg { total: f64, count: u64 },
    MinMax { current: Option<Bson>, want_max: bool },
    FirstLast { value: Option<Bson>, keep_first: bool },
    Push(Vec<Bson>),
    AddToSet(Vec<Bson>),
}

impl AccumulatorState {
    fn new(op: Accumulator) -> Self {
        match op {
            Accumulator::Sum => AccumulatorState::Sum {
                total: 0.0,
                all_int: true,
            },
            Accumulator::Avg => AccumulatorState::Avg {
                total: 0.0,
                count: 0,
            },
            Accumulator::Min => AccumulatorState::MinMax {
                current: None,
                want_max: false,
            },
            Accumulator::Max => AccumulatorState::MinMax {
                current: None,
                want_max: true,
            },
            Accumulator::First => AccumulatorState::FirstLast {
                value: None,
                keep_first: true,
            },
            Accumulator::Last => AccumulatorState::FirstLast {
                value: None,
                keep_first: false,
            },
            Accumulator::Push => AccumulatorState::Push(Vec::new()),
            Accumulator::AddToSet => AccumulatorState::AddToSet(Vec::new()),
        }
    }

    fn observe(&mut self, value: Bson) {
        match self {
            // Non-numeric values are ignored by the numeric accumulators.
            AccumulatorState::Sum { total, all_int } => {
                if let Some(f) = bson_util::get_f64(&value) {
                    *all_int &= matches!(value, Bson::Int32(_) | Bson::Int64(_));
                    *total += f;
                }
            }
            AccumulatorState::Avg { total, count } => {
                if let Some(f) = bson_util::get_f64(&value) {
                    *total += f;
                    *count += 1;
                }
            }
            AccumulatorState::MinMax { current, want_max } => {
                if matches!(value, Bson::Null | Bson::Undefined) {
                    return;
                }
                let replace = match current {
                    Some(existing) => {
                        let ord = bson_util::cmp_bson(&value, existing);
                        if *want_max {
                            ord == std::cmp::Ordering::Greater
                        } else {
                            ord == std::cmp::Ordering::Less
                        }
                    }
                    None => true,
                };
                if replace {
                    *current = Some(value);
                }
            }
            AccumulatorState::FirstLast { value: slot, keep_first } => {
                if *keep_first {
                    if slot.is_none() {
                        *slot = Some(value);
                    }
                } else {
                    *slot = Some(value);
                }
            }
            AccumulatorState::Push(values) => {
                if !matches!(value, Bson::Undefined) {
                    values.push(value);
                }
            }
            AccumulatorState::AddToSet(values) => {
                if matches!(value, Bson::Undefined) {
                    return;
                }
                if !values.iter().any(|v| bson_util::bson_eq(v, &value, None)) {
                    values.push(value);
                }
            }
        }
    }

    fn finalize(self) -> Bson {
        match self {
            AccumulatorState::Sum { total, all_int } => {
                if all_int && total.fract() == 0.0 && total.abs() < i64::MAX as f64 {
                    let as_int = total as i64;
                    match i32::try_from(as_int) {
                        Ok(small) => Bson::Int32(small),
                        Err(_) => Bson::Int64(as_int),
                    }
                } else {
                    Bson::Double(total)
                }
            }
            AccumulatorState::Avg { total, count } => {
                if count == 0 {
                    Bson::Null
                } else {
                    Bson::Double(total / count as f64)
                }
            }
            AccumulatorState::MinMax { current, .. } => current.unwrap_or(Bson::Null),
            AccumulatorState::FirstLast { value, .. } => match value {
                Some(Bson::Undefined) | None => Bson::Null,
                Some(value) => value,
            },
            AccumulatorState::Push(values) => Bson::Array(values),
            AccumulatorState::AddToSet(values) => Bson::Array(values),
        }
    }
}

fn run_group(
    input: Vec<Document>,
    id: &Bson,
    accumulators: &[(String, Accumulator, Bson)],
    vars: &HashMap<String, Bson>,
) -> Result<Vec<Document>> {
    // Groups are kept in first-seen order for deterministic output.
    let mut groups: Vec<(Bson, Vec<AccumulatorState>)> = Vec::new();

    for doc in &input {
        let mut key = expr::evaluate(id, doc, Some(vars))?;
        if matches!(key, Bson::Undefined) {
            key = Bson::Null;
        }

        let position = groups
            .iter()
            .position(|(existing, _)| bson_util::bson_eq(existing, &key, None));
        let position = match position {
            Some(position) => position,
            None => {
                groups.push((
                    key,
                    accumulators
                        .iter()
                        .map(|(_, op, _)| AccumulatorState::new(*op))
                        .collect(),
                ));
                groups.len() - 1
            }
        };

        for (slot, (_, _, argument)) in groups[position].1.iter_mut().zip(accumulators.iter()) {
            let value = expr::evaluate(argument, doc, Some(vars))?;
            slot.observe(value);
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    for (key, states) in groups {
        let mut group_doc = doc! { "_id": key };
        for ((field, _, _), state) in accumulators.iter().zip(states) {
            group_doc.insert(field.clone(), state.finalize());
        }
        out.push(group_doc);
    }
    Ok(out)
}

fn run_lookup(
    store: &dyn StoreRead,
    db: &str,
    input: Vec<Document>,
    spec: &LookupSpec,
    collation: Option<&Collation>,
    vars: &HashMap<String, Bson>,
) -> Result<Vec<Document>> {
    let foreign_ns = Namespace::new(db, spec.from.clone());
    let foreign_docs: Vec<Document> = store
        .collection(&foreign_ns)
        .map(|c| c.documents().to_vec())
        .unwrap_or_default();

    let mut out = Vec::with_capacity(input.len());
    for mut doc in input {
        let joined: Vec<Bson> = match (&spec.local_field, &spec.foreign_field) {
            (Some(local), Some(foreign)) => {
                let local_values = lookup_values(&doc, local);
                foreign_docs
                    .iter()
                    .filter(|foreign_doc| {
                        let foreign_values = lookup_values(foreign_doc, foreign);
                        local_values.iter().any(|lv| {
                            foreign_values
                                .iter()
                                .any(|fv| bson_util::bson_eq(lv, fv, None))
                        })
                    })
                    .cloned()
                    .map(Bson::Document)
                    .collect()
            }
            _ => {
                // Pipeline form: bind `let` variables from the outer document, then run the
                // inner pipeline over the foreign collection.
                let mut scoped = vars.clone();
                for (name, expression) in &spec.let_vars {
                    let value = expr::evaluate(expression, &doc, Some(vars))?;
                    scoped.insert(name.clone(), value);
                }
                let pipeline = spec.pipeline.as_deref().unwrap_or(&[]);
                run_pipeline(store, db, foreign_docs.clone(), pipeline, collation, &scoped)?
                    .into_iter()
                    .map(Bson::Document)
                    .collect()
            }
        };
        update::set_path(&mut doc, &spec.as_field, Bson::Array(joined))?;
        out.push(doc);
    }
    Ok(out)
}

/// The values a `$lookup` equality join considers for one side: the leaf values at the path with
/// array elements expanded, and null standing in for a missing field.
fn lookup_values(doc: &Document, path: &str) -> Vec<Bson> {
    let leaves = bson_util::path_values(doc, path);
    if leaves.is_empty() {
        return vec![Bson::Null];
    }
    let mut values = Vec::new();
    for leaf in leaves {
        match leaf {
            Bson::Array(elements) => {
                values.push(leaf.clone());
                values.extend(elements.iter().cloned());
            }
            other => values.push(other.clone()),
        }
    }
    values
}
