use crate::{
    bson::{doc, Bson, Document},
    dispatch::{command, Command, Dispatcher, ExecCtx},
    error::{Error, Result},
};

/// Handles `killCursors`: removes the named cursors and reports the outcome in four arrays.
/// Ids that are not integers at all land in `cursorsUnknown`.
pub(crate) fn run(dispatcher: &Dispatcher, _: &mut ExecCtx<'_>, cmd: &Command) -> Result<Document> {
    super::reject_unknown_options(cmd, &["cursors"])?;
    // The collection name is required by the command shape even though cursor ids are global.
    cmd.collection()?;

    let cursors = command::get_array(&cmd.body, "cursors")?
        .ok_or_else(|| Error::type_mismatch("'cursors' is required and must be an array"))?;
    if cursors.is_empty() {
        return Err(Error::bad_value("'cursors' must not be empty"));
    }

    let mut ids = Vec::new();
    let mut unknown = Vec::new();
    for entry in cursors {
        match entry {
            Bson::Int64(id) => ids.push(*id),
            Bson::Int32(id) => ids.push(i64::from(*id)),
            other => unknown.push(other.clone()),
        }
    }

    let outcome = dispatcher.cursors.kill(&ids);
    Ok(doc! {
        "cursorsKilled": outcome.killed,
        "cursorsNotFound": outcome.not_found,
        "cursorsAlive": outcome.alive,
        "cursorsUnknown": unknown,
    })
}
