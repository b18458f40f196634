use crate::{
    bson::{doc, Document},
    dispatch::{command, cursor_response, Command, Dispatcher, ExecCtx},
    engine::matcher::{self, MatchContext},
    error::Result,
    Namespace,
};

/// Handles `listCollections`: one descriptor per collection of the database, optionally
/// filtered, in the standard cursor envelope.
pub(crate) fn run(dispatcher: &Dispatcher, ctx: &mut ExecCtx<'_>, cmd: &Command) -> Result<Document> {
    super::reject_unknown_options(cmd, &["filter", "nameOnly", "cursor", "authorizedCollections"])?;

    let filter = command::get_document(&cmd.body, "filter")?.cloned();
    let name_only = command::get_bool(&cmd.body, "nameOnly")?.unwrap_or(false);
    let batch_size = command::get_batch_size(&cmd.body)?;

    let descriptors = ctx.store.read(|store| {
        let mut descriptors = Vec::new();
        for ns in store.namespaces(&cmd.db) {
            let descriptor = if name_only {
                doc! { "name": ns.coll.clone(), "type": "collection" }
            } else {
                doc! {
                    "name": ns.coll.clone(),
                    "type": "collection",
                    "options": {},
                    "info": { "readOnly": false },
                    "idIndex": { "v": 2, "key": { "_id": 1 }, "name": "_id_" },
                }
            };
            descriptors.push(descriptor);
        }
        Ok(descriptors)
    })?;

    let descriptors = match filter {
        Some(ref filter) => {
            let match_ctx = MatchContext::new(None);
            let mut kept = Vec::new();
            for descriptor in descriptors {
                if matcher::matches(filter, &descriptor, &match_ctx)? {
                    kept.push(descriptor);
                }
            }
            kept
        }
        None => descriptors,
    };

    let cursor_ns = Namespace::new(cmd.db.clone(), "$cmd.listCollections".to_string());
    let (batch, id) =
        dispatcher
            .cursors
            .create(cursor_ns.clone(), descriptors, batch_size, ctx.cursor_binding());
    Ok(cursor_response(id, &cursor_ns, "firstBatch", batch))
}
