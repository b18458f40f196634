use crate::{
    bson::{doc, Document},
    dispatch::{Command, Dispatcher, ExecCtx},
    error::Result,
};

/// Handles `dropDatabase`: removes every collection of the target database. Always succeeds,
/// whether or not the database had any collections.
pub(crate) fn run(_: &Dispatcher, ctx: &mut ExecCtx<'_>, cmd: &Command) -> Result<Document> {
    super::reject_unknown_options(cmd, &[])?;

    ctx.store.write(|store| {
        store.remove_database(&cmd.db);
        Ok(())
    })?;
    Ok(doc! { "dropped": cmd.db.clone() })
}
