use crate::{
    bson::{doc, Bson, Document},
    dispatch::{command, Command, Dispatcher, ExecCtx, MAX_WRITE_BATCH_SIZE},
    error::{Error, Result},
    Namespace,
};

/// Handles `insert`. Each document is applied independently; failures produce per-document
/// `writeErrors` entries, and with `ordered` (the default) the first failure stops the batch.
pub(crate) fn run(_: &Dispatcher, ctx: &mut ExecCtx<'_>, cmd: &Command) -> Result<Document> {
    super::reject_unknown_options(cmd, &["documents", "ordered", "bypassDocumentValidation"])?;

    let ns = Namespace::new(cmd.db.clone(), cmd.collection()?);
    // Documents keep applying past a write error unless the batch explicitly asks for ordered
    // execution.
    let ordered = command::get_bool(&cmd.body, "ordered")?.unwrap_or(false);
    let documents = command::get_array(&cmd.body, "documents")?
        .ok_or_else(|| Error::type_mismatch("'documents' is required and must be an array"))?;
    if documents.is_empty() {
        return Err(Error::bad_value("'documents' must not be empty"));
    }
    if documents.len() > MAX_WRITE_BATCH_SIZE as usize {
        return Err(Error::bad_value(format!(
            "write batch sizes must be between 1 and {}",
            MAX_WRITE_BATCH_SIZE
        )));
    }
    let documents: Vec<Document> = documents
        .iter()
        .map(|doc| match doc {
            Bson::Document(doc) => Ok(doc.clone()),
            _ => Err(Error::type_mismatch("'documents' entries must be documents")),
        })
        .collect::<Result<_>>()?;

    let (inserted, write_errors) = ctx.store.write(|store| {
        let collection = store.collection_mut(&ns);
        let mut inserted = 0i64;
        let mut write_errors: Vec<Document> = Vec::new();
        for (index, doc) in documents.into_iter().enumerate() {
            match collection.insert(&ns, doc) {
                Ok(_) => inserted += 1,
                Err(e) => {
                    write_errors.push(e.to_write_error_document(index));
                    if ordered {
                        break;
                    }
                }
            }
        }
        Ok((inserted, write_errors))
    })?;

    let mut response = doc! { "n": inserted };
    if !write_errors.is_empty() {
        response.insert(
            "writeErrors",
            Bson::Array(write_errors.into_iter().map(Bson::Document).collect()),
        );
    }
    Ok(response)
}
