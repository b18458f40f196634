use crate::{
    bson::Document,
    cursor::DEFAULT_BATCH_SIZE,
    dispatch::{command, cursor_response, Command, Dispatcher, ExecCtx},
    engine::FindOptions,
    error::{Error, Result},
    Namespace,
};

/// Handles `find`: filter, sort, projection, skip, limit, collation, and first-batch cursor
/// creation.
pub(crate) fn run(dispatcher: &Dispatcher, ctx: &mut ExecCtx<'_>, cmd: &Command) -> Result<Document> {
    super::reject_unknown_options(
        cmd,
        &[
            "filter",
            "sort",
            "projection",
            "skip",
            "limit",
            "batchSize",
            "singleBatch",
            "collation",
        ],
    )?;

    let ns = Namespace::new(cmd.db.clone(), cmd.collection()?);

    let filter = command::get_document(&cmd.body, "filter")?
        .cloned()
        .unwrap_or_default();
    let sort = command::get_document(&cmd.body, "sort")?.cloned();
    let projection = command::get_document(&cmd.body, "projection")?.cloned();
    let skip = match command::get_int(&cmd.body, "skip")? {
        Some(skip) if skip < 0 => return Err(Error::bad_value("'skip' must be non-negative")),
        Some(skip) => skip as u64,
        None => 0,
    };
    let limit = command::get_int(&cmd.body, "limit")?;
    let mut single_batch = command::get_bool(&cmd.body, "singleBatch")?.unwrap_or(false);
    // A negative limit requests a single batch of its magnitude.
    let limit = match limit {
        Some(limit) if limit < 0 => {
            single_batch = true;
            Some(-limit)
        }
        Some(0) | None => None,
        Some(limit) => Some(limit),
    };
    let batch_size = match command::get_int(&cmd.body, "batchSize")? {
        Some(size) if size < 0 => return Err(Error::bad_value("'batchSize' must be non-negative")),
        Some(size) => Some(size as usize),
        None => None,
    };
    let collation = command::get_collation(&cmd.body)?;

    let options = FindOptions {
        filter,
        sort,
        projection,
        skip,
        limit,
        collation,
    };
    let results = ctx.store.read(|store| match store.collection(&ns) {
        Some(collection) => collection.query(&options),
        None => Ok(Vec::new()),
    })?;

    let (batch, id) = if single_batch {
        (results, 0)
    } else {
        dispatcher.cursors.create(
            ns.clone(),
            results,
            batch_size.or(Some(DEFAULT_BATCH_SIZE)),
            ctx.cursor_binding(),
        )
    };
    Ok(cursor_response(id, &ns, "firstBatch", batch))
}

#[cfg(test)]
mod test;
