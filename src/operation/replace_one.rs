use crate::{
    bson::{doc, Document},
    dispatch::{command, Command, Dispatcher, ExecCtx},
    engine::update::UpdateSpec,
    error::{Error, Result},
    Namespace,
};

/// Handles `replaceOne`: replaces the first document matching `filter` with `replacement`,
/// preserving its `_id`.
pub(crate) fn run(_: &Dispatcher, ctx: &mut ExecCtx<'_>, cmd: &Command) -> Result<Document> {
    super::reject_unknown_options(cmd, &["filter", "replacement", "upsert", "collation"])?;

    let ns = Namespace::new(cmd.db.clone(), cmd.collection()?);
    let filter = command::get_document(&cmd.body, "filter")?
        .ok_or_else(|| Error::type_mismatch("'filter' is required and must be a document"))?
        .clone();
    let replacement = command::get_document(&cmd.body, "replacement")?
        .ok_or_else(|| Error::type_mismatch("'replacement' is required and must be a document"))?
        .clone();
    if replacement.keys().any(|k| k.starts_with('$')) {
        return Err(Error::bad_value(
            "replacement document must not contain update modifiers",
        ));
    }
    let upsert = command::get_bool(&cmd.body, "upsert")?.unwrap_or(false);
    let collation = command::get_collation(&cmd.body)?;

    let outcome = ctx.store.write(|store| {
        store.collection_mut(&ns).update_docs(
            &ns,
            &filter,
            &UpdateSpec::Replacement(replacement.clone()),
            false,
            upsert,
            &[],
            collation.as_ref(),
        )
    })?;

    let mut response = doc! {
        "n": (outcome.matched + u64::from(outcome.upserted_id.is_some())) as i64,
        "nModified": outcome.modified as i64,
    };
    if let Some(id) = outcome.upserted_id {
        response.insert("upserted", vec![doc! { "index": 0, "_id": id }]);
    }
    Ok(response)
}
