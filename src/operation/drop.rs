use crate::{
    bson::{doc, Document},
    dispatch::{Command, Dispatcher, ExecCtx},
    error::{Error, Result},
    Namespace,
};

/// Handles `drop`: removes one collection. Dropping a collection that does not exist reports
/// `NamespaceNotFound`.
pub(crate) fn run(_: &Dispatcher, ctx: &mut ExecCtx<'_>, cmd: &Command) -> Result<Document> {
    super::reject_unknown_options(cmd, &[])?;

    let ns = Namespace::new(cmd.db.clone(), cmd.collection()?);
    let n_indexes = ctx.store.write(|store| {
        let n_indexes = store
            .collection(&ns)
            .map(|collection| collection.indexes().len());
        store.remove_collection(&ns);
        Ok(n_indexes)
    })?;

    match n_indexes {
        Some(n_indexes) => Ok(doc! { "ns": ns.to_string(), "nIndexesWas": n_indexes as i32 }),
        None => Err(Error::namespace_not_found(&ns)),
    }
}
