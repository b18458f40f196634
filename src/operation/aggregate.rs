use std::collections::HashMap;

use crate::{
    bson::{Bson, Document},
    cursor::DEFAULT_BATCH_SIZE,
    dispatch::{command, cursor_response, Command, Dispatcher, ExecCtx},
    engine::{
        aggregate::{parse_pipeline, run_pipeline, TerminalStage},
        Collection, StoreWrite,
    },
    error::{Error, Result},
    Namespace,
};

/// Handles `aggregate`: runs the pipeline over the source collection, optionally applying a
/// terminal `$out`/`$merge` sink under the same store access as the pipeline run.
pub(crate) fn run(dispatcher: &Dispatcher, ctx: &mut ExecCtx<'_>, cmd: &Command) -> Result<Document> {
    super::reject_unknown_options(cmd, &["pipeline", "cursor", "collation", "let", "allowDiskUse"])?;

    let ns = Namespace::new(cmd.db.clone(), cmd.collection()?);
    let pipeline = command::get_array(&cmd.body, "pipeline")?
        .ok_or_else(|| Error::type_mismatch("'pipeline' is required and must be an array"))?;
    let collation = command::get_collation(&cmd.body)?;
    let batch_size = command::get_batch_size(&cmd.body)?;

    let mut vars: HashMap<String, Bson> = HashMap::new();
    if let Some(lets) = command::get_document(&cmd.body, "let")? {
        for (name, expression) in lets.iter() {
            let value = crate::engine::aggregate::expr::evaluate(
                expression,
                &Document::new(),
                None,
            )?;
            vars.insert(name.clone(), value);
        }
    }

    let parsed = parse_pipeline(pipeline, true)?;

    let results = match parsed.terminal {
        Some(ref terminal) => {
            let terminal = terminal.clone();
            let stages = parsed.stages.clone();
            let db = cmd.db.clone();
            let source = ns.clone();
            ctx.store.write(move |store| {
                let input = store
                    .collection(&source)
                    .map(|c| c.documents().to_vec())
                    .unwrap_or_default();
                let results =
                    run_pipeline(store.as_read(), &db, input, &stages, collation.as_ref(), &vars)?;
                apply_terminal(store, &db, &terminal, results)?;
                Ok(Vec::new())
            })?
        }
        None => {
            let stages = parsed.stages.clone();
            let db = cmd.db.clone();
            let source = ns.clone();
            ctx.store.read(move |store| {
                let input = store
                    .collection(&source)
                    .map(|c| c.documents().to_vec())
                    .unwrap_or_default();
                run_pipeline(store, &db, input, &stages, collation.as_ref(), &vars)
            })?
        }
    };

    let (batch, id) = dispatcher.cursors.create(
        ns.clone(),
        results,
        batch_size.or(Some(DEFAULT_BATCH_SIZE)),
        ctx.cursor_binding(),
    );
    Ok(cursor_response(id, &ns, "firstBatch", batch))
}

/// Applies a terminal sink. `$out` replaces the target collection; `$merge` upserts by `_id`,
/// preserving fields the merged documents do not touch.
fn apply_terminal(
    store: &mut dyn StoreWrite,
    db: &str,
    terminal: &TerminalStage,
    results: Vec<Document>,
) -> Result<()> {
    match terminal {
        TerminalStage::Out(coll) => {
            let target = Namespace::new(db, coll.clone());
            let mut replacement = Collection::default();
            for doc in results {
                replacement.insert(&target, doc)?;
            }
            store.replace_collection(&target, replacement);
            Ok(())
        }
        TerminalStage::Merge(coll) => {
            let target = Namespace::new(db, coll.clone());
            let collection = store.collection_mut(&target);
            for doc in results {
                merge_document(collection, &target, doc)?;
            }
            Ok(())
        }
    }
}

fn merge_document(collection: &mut Collection, ns: &Namespace, doc: Document) -> Result<()> {
    let id = match doc.get("_id") {
        Some(id) => id.clone(),
        None => return collection.insert(ns, doc).map(|_| ()),
    };

    let existing = collection
        .documents()
        .iter()
        .position(|existing| match existing.get("_id") {
            Some(existing_id) => crate::bson_util::bson_eq(existing_id, &id, None),
            None => false,
        });
    match existing {
        Some(position) => {
            let mut documents = collection.documents().to_vec();
            // Merge semantics: fields from the result overwrite, untouched fields survive.
            let merged = &mut documents[position];
            for (key, value) in doc {
                merged.insert(key, value);
            }
            collection.set_documents(documents);
            Ok(())
        }
        None => collection.insert(ns, doc).map(|_| ()),
    }
}
