use crate::{
    bson::{doc, Bson, Document},
    dispatch::{command, Command, Dispatcher, ExecCtx},
    engine::UpdateOutcome,
    error::{Error, Result},
    Namespace,
};

/// One parsed `updates` entry.
struct UpdateStatement {
    filter: Document,
    update: crate::engine::update::UpdateSpec,
    multi: bool,
    upsert: bool,
    array_filters: Vec<Document>,
    collation: Option<crate::collation::Collation>,
}

fn parse_statement(entry: &Bson) -> Result<UpdateStatement> {
    let entry = match entry {
        Bson::Document(entry) => entry,
        _ => return Err(Error::type_mismatch("'updates' entries must be documents")),
    };

    let filter = command::get_document(entry, "q")?
        .ok_or_else(|| Error::type_mismatch("update statement requires a 'q' filter document"))?
        .clone();
    let update_doc = command::get_document(entry, "u")?
        .ok_or_else(|| Error::type_mismatch("update statement requires a 'u' document"))?;
    let update = crate::engine::update::parse_update(update_doc)?;
    let multi = command::get_bool(entry, "multi")?.unwrap_or(false);
    let upsert = command::get_bool(entry, "upsert")?.unwrap_or(false);

    if multi && matches!(update, crate::engine::update::UpdateSpec::Replacement(_)) {
        return Err(Error::bad_value(
            "multi update is not supported for replacement-style update",
        ));
    }

    let array_filters = match command::get_array(entry, "arrayFilters")? {
        Some(filters) => filters
            .iter()
            .map(|filter| match filter {
                Bson::Document(filter) => Ok(filter.clone()),
                _ => Err(Error::type_mismatch("'arrayFilters' entries must be documents")),
            })
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };
    let collation = command::get_collation(entry)?;

    Ok(UpdateStatement {
        filter,
        update,
        multi,
        upsert,
        array_filters,
        collation,
    })
}

/// Handles `update`: a list of update statements applied in order. `n` counts matched (plus
/// upserted), `nModified` counts documents actually changed, and upserts report `{index, _id}`.
pub(crate) fn run(_: &Dispatcher, ctx: &mut ExecCtx<'_>, cmd: &Command) -> Result<Document> {
    super::reject_unknown_options(cmd, &["updates", "ordered", "bypassDocumentValidation"])?;

    let ns = Namespace::new(cmd.db.clone(), cmd.collection()?);
    let updates = command::get_array(&cmd.body, "updates")?
        .ok_or_else(|| Error::type_mismatch("'updates' is required and must be an array"))?;
    if updates.is_empty() {
        return Err(Error::bad_value("'updates' must not be empty"));
    }
    let statements = updates
        .iter()
        .map(parse_statement)
        .collect::<Result<Vec<_>>>()?;

    let mut n = 0i64;
    let mut n_modified = 0i64;
    let mut upserted: Vec<Document> = Vec::new();
    let mut write_errors: Vec<Document> = Vec::new();

    for (index, statement) in statements.iter().enumerate() {
        let outcome: Result<UpdateOutcome> = ctx.store.write(|store| {
            // Updating a missing namespace only creates it when upserting.
            if store.collection(&ns).is_none() && !statement.upsert {
                return Ok(UpdateOutcome::default());
            }
            store.collection_mut(&ns).update_docs(
                &ns,
                &statement.filter,
                &statement.update,
                statement.multi,
                statement.upsert,
                &statement.array_filters,
                statement.collation.as_ref(),
            )
        });
        match outcome {
            Ok(outcome) => {
                n += outcome.matched as i64;
                n_modified += outcome.modified as i64;
                if let Some(id) = outcome.upserted_id {
                    n += 1;
                    upserted.push(doc! { "index": index as i32, "_id": id });
                }
            }
            Err(e) => {
                // Statements are applied in order; the first failure stops the batch.
                write_errors.push(e.to_write_error_document(index));
                break;
            }
        }
    }

    let mut response = doc! { "n": n, "nModified": n_modified };
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

#[cfg(test)]
mod test;
