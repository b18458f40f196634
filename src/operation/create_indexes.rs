use crate::{
    bson::{doc, Bson, Document},
    dispatch::{command, Command, Dispatcher, ExecCtx},
    engine::IndexDescriptor,
    error::{Error, Result},
    Namespace,
};

/// Handles `createIndexes`. Re-creating an index with an identical name and key specification is
/// a no-op; conflicting redefinitions fail.
pub(crate) fn run(_: &Dispatcher, ctx: &mut ExecCtx<'_>, cmd: &Command) -> Result<Document> {
    super::reject_unknown_options(cmd, &["indexes"])?;

    let ns = Namespace::new(cmd.db.clone(), cmd.collection()?);
    let indexes = command::get_array(&cmd.body, "indexes")?
        .ok_or_else(|| Error::type_mismatch("'indexes' is required and must be an array"))?;
    if indexes.is_empty() {
        return Err(Error::bad_value(
            "'indexes' must contain at least one index specification",
        ));
    }
    let descriptors = indexes
        .iter()
        .map(|spec| match spec {
            Bson::Document(spec) => IndexDescriptor::from_spec(spec),
            _ => Err(Error::type_mismatch("'indexes' entries must be documents")),
        })
        .collect::<Result<Vec<_>>>()?;

    let (created_collection, before, after) = ctx.store.write(|store| {
        let created_collection = store.collection(&ns).is_none();
        let collection = store.collection_mut(&ns);
        let before = collection.indexes().len();
        for descriptor in descriptors {
            collection.create_index(&ns, descriptor)?;
        }
        Ok((created_collection, before, collection.indexes().len()))
    })?;

    let mut response = doc! {
        "createdCollectionAutomatically": created_collection,
        "numIndexesBefore": before as i32,
        "numIndexesAfter": after as i32,
    };
    if before == after {
        response.insert("note", "all indexes already exist");
    }
    Ok(response)
}
