use crate::{
    bson::{doc, Bson, Document},
    dispatch::{command, Command, Dispatcher, ExecCtx},
    engine::{update::UpdateSpec, StoreWrite},
    error::{Error, Result},
    Namespace,
};

/// One parsed bulk operation.
enum BulkOp {
    InsertOne(Document),
    Update {
        filter: Document,
        spec: UpdateSpec,
        multi: bool,
        upsert: bool,
        array_filters: Vec<Document>,
    },
    Delete {
        filter: Document,
        limit_one: bool,
    },
}

/// Handles `bulkWrite` (ordered only): a mixed sequence of insert/update/replace/delete
/// operations executed in order, halting at the first failure. Counters reflect only the
/// operations fully applied before the failure.
pub(crate) fn run(_: &Dispatcher, ctx: &mut ExecCtx<'_>, cmd: &Command) -> Result<Document> {
    super::reject_unknown_options(cmd, &["ops", "operations", "ordered"])?;

    let ns = Namespace::new(cmd.db.clone(), cmd.collection()?);
    if let Some(false) = command::get_bool(&cmd.body, "ordered")? {
        // Unordered execution would forfeit the deterministic halt-on-first-error guarantee.
        return Err(Error::bad_value("bulkWrite only supports ordered: true"));
    }

    let ops = match command::get_array(&cmd.body, "ops")? {
        Some(ops) => Some(ops),
        None => command::get_array(&cmd.body, "operations")?,
    }
    .ok_or_else(|| Error::type_mismatch("'ops' is required and must be an array"))?;
    if ops.is_empty() {
        return Err(Error::bad_value("'ops' must not be empty"));
    }

    let parsed = ops.iter().map(parse_op).collect::<Result<Vec<_>>>()?;

    let mut counters = Counters::default();
    let mut upserted: Vec<Document> = Vec::new();
    let mut write_errors: Vec<Document> = Vec::new();

    for (index, op) in parsed.iter().enumerate() {
        let applied = ctx.store.write(|store| apply_op(store, &ns, op));
        match applied {
            Ok(outcome) => {
                counters.absorb(&outcome);
                if let Some(id) = outcome.upserted_id {
                    upserted.push(doc! { "index": index as i32, "_id": id });
                }
            }
            Err(e) => {
                write_errors.push(e.to_write_error_document(index));
                break;
            }
        }
    }

    let mut response = doc! {
        "nInserted": counters.inserted,
        "nMatched": counters.matched,
        "nModified": counters.modified,
        "nDeleted": counters.deleted,
        "nUpserted": upserted.len() as i64,
    };
    if !upserted.is_empty() {
        response.insert(
            "upserted",
            Bson::Array(upserted.into_iter().map(Bson::Document).collect()),
        );
    }
    if !write_errors.is_empty() {
        response.insert(
            "writeErrors",
            Bson::Array(write_errors.into_iter().map(Bson::Document).collect()),
        );
    }
    Ok(response)
}

#[derive(Debug, Default)]
struct Counters {
    inserted: i64,
    matched: i64,
    modified: i64,
    deleted: i64,
}

#[derive(Debug, Default)]
struct OpOutcome {
    inserted: i64,
    matched: i64,
    modified: i64,
    deleted: i64,
    upserted_id: Option<Bson>,
}

impl Counters {
    fn absorb(&mut self, outcome: &OpOutcome) {
        self.inserted += outcome.inserted;
        self.matched += outcome.matched;
        self.modified += outcome.modified;
        self.deleted += outcome.deleted;
    }
}

fn parse_op(entry: &Bson) -> Result<BulkOp> {
    let entry = match entry {
        Bson::Document(entry) if entry.len() == 1 => entry,
        Bson::Document(_) => {
            return Err(Error::bad_value(
                "each bulkWrite op must have exactly one operation field",
            ))
        }
        _ => return Err(Error::type_mismatch("'ops' entries must be documents")),
    };
    let (name, spec) = entry.iter().next().expect("len checked above");
    let spec = match spec {
        Bson::Document(spec) => spec,
        _ => {
            return Err(Error::type_mismatch(format!(
                "bulkWrite op '{}' must be a document",
                name
            )))
        }
    };

    match name.as_str() {
        "insertOne" => {
            let document = command::get_document(spec, "document")?
                .ok_or_else(|| Error::type_mismatch("insertOne requires a 'document'"))?;
            Ok(BulkOp::InsertOne(document.clone()))
        }
        "updateOne" | "updateMany" => {
            let filter = required_document(spec, "filter")?;
            let update = required_document(spec, "update")?;
            let update = crate::engine::update::parse_update(&update)?;
            if matches!(update, UpdateSpec::Replacement(_)) {
                return Err(Error::bad_value(
                    "update operations require atomic update modifiers",
                ));
            }
            let array_filters = match command::get_array(spec, "arrayFilters")? {
                Some(filters) => filters
                    .iter()
                    .map(|f| match f {
                        Bson::Document(f) => Ok(f.clone()),
                        _ => Err(Error::type_mismatch("'arrayFilters' entries must be documents")),
                    })
                    .collect::<Result<Vec<_>>>()?,
                None => Vec::new(),
            };
            Ok(BulkOp::Update {
                filter,
                spec: update,
                multi: name == "updateMany",
                upsert: command::get_bool(spec, "upsert")?.unwrap_or(false),
                array_filters,
            })
        }
        "replaceOne" => {
            let filter = required_document(spec, "filter")?;
            let replacement = required_document(spec, "replacement")?;
            if replacement.keys().any(|k| k.starts_with('$')) {
                return Err(Error::bad_value(
                    "replacement document must not contain update modifiers",
                ));
            }
            Ok(BulkOp::Update {
                filter,
                spec: UpdateSpec::Replacement(replacement),
                multi: false,
                upsert: command::get_bool(spec, "upsert")?.unwrap_or(false),
                array_filters: Vec::new(),
            })
        }
        "deleteOne" | "deleteMany" => {
            let filter = required_document(spec, "filter")?;
            Ok(BulkOp::Delete {
                filter,
                limit_one: name == "deleteOne",
            })
        }
        other => Err(Error::not_implemented(format!(
            "unsupported bulkWrite operation '{}'",
            other
        ))),
    }
}

fn required_document(spec: &Document, field: &str) -> Result<Document> {
    command::get_document(spec, field)?
        .cloned()
        .ok_or_else(|| Error::type_mismatch(format!("'{}' is required and must be a document", field)))
}

fn apply_op(store: &mut dyn StoreWrite, ns: &Namespace, op: &BulkOp) -> Result<OpOutcome> {
    match op {
        BulkOp::InsertOne(doc) => {
            store.collection_mut(ns).insert(ns, doc.clone())?;
            Ok(OpOutcome {
                inserted: 1,
                ..Default::default()
            })
        }
        BulkOp::Update {
            filter,
            spec,
            multi,
            upsert,
            array_filters,
        } => {
            if store.collection(ns).is_none() && !*upsert {
                return Ok(OpOutcome::default());
            }
            let outcome = store.collection_mut(ns).update_docs(
                ns,
                filter,
                spec,
                *multi,
                *upsert,
                array_filters,
                None,
            )?;
            Ok(OpOutcome {
                matched: outcome.matched as i64,
                modified: outcome.modified as i64,
                upserted_id: outcome.upserted_id,
                ..Default::default()
            })
        }
        BulkOp::Delete { filter, limit_one } => {
            if store.collection(ns).is_none() {
                return Ok(OpOutcome::default());
            }
            let deleted = store
                .collection_mut(ns)
                .delete_docs(filter, *limit_one, None)?;
            Ok(OpOutcome {
                deleted: deleted as i64,
                ..Default::default()
            })
        }
    }
}
