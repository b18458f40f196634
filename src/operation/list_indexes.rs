use crate::{
    bson::Document,
    dispatch::{command, cursor_response, Command, Dispatcher, ExecCtx},
    error::{Error, Result},
    Namespace,
};

/// Handles `listIndexes`: the index catalog of one collection, in the standard cursor envelope.
pub(crate) fn run(dispatcher: &Dispatcher, ctx: &mut ExecCtx<'_>, cmd: &Command) -> Result<Document> {
    super::reject_unknown_options(cmd, &["cursor"])?;

    let ns = Namespace::new(cmd.db.clone(), cmd.collection()?);
    let batch_size = command::get_batch_size(&cmd.body)?;

    let specs = ctx.store.read(|store| match store.collection(&ns) {
        Some(collection) => Ok(collection
            .indexes()
            .iter()
            .map(|index| index.to_document())
            .collect::<Vec<_>>()),
        None => Err(Error::namespace_not_found(&ns)),
    })?;

    let cursor_ns = Namespace::new(ns.db.clone(), format!("$cmd.listIndexes.{}", ns.coll));
    let (batch, id) = dispatcher
        .cursors
        .create(cursor_ns.clone(), specs, batch_size, ctx.cursor_binding());
    Ok(cursor_response(id, &cursor_ns, "firstBatch", batch))
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use crate::{
        bson::{doc, Bson},
        operation::test_util::{dispatch_err, dispatch_ok, dispatcher},
    };

    #[test]
    fn lists_id_index_and_created_indexes() {
        let dispatcher = dispatcher();
        dispatch_ok(
            &dispatcher,
            "app",
            doc! { "insert": "users", "documents": [ { "_id": 1 } ] },
        );
        dispatch_ok(
            &dispatcher,
            "app",
            doc! {
                "createIndexes": "users",
                "indexes": [ { "name": "email_1", "key": { "email": 1 }, "unique": true } ],
            },
        );
        let response = dispatch_ok(&dispatcher, "app", doc! { "listIndexes": "users" });
        let batch = response
            .get_document("cursor")
            .unwrap()
            .get_array("firstBatch")
            .unwrap();
        let names: Vec<&str> = batch
            .iter()
            .map(|spec| match spec {
                Bson::Document(spec) => spec.get_str("name").unwrap(),
                other => panic!("expected document, got {:?}", other),
            })
            .collect();
        assert_eq!(names, vec!["_id_", "email_1"]);

        let email = match &batch[1] {
            Bson::Document(spec) => spec,
            other => panic!("expected document, got {:?}", other),
        };
        assert_eq!(email.get_bool("unique"), Ok(true));
        assert_eq!(email.get_document("key").unwrap(), &doc! { "email": 1 });
    }

    #[test]
    fn missing_collection_is_namespace_not_found() {
        let dispatcher = dispatcher();
        let response = dispatch_err(&dispatcher, "app", doc! { "listIndexes": "ghost" });
        assert_eq!(response.get_i32("code"), Ok(26));
        assert_eq!(response.get_str("codeName"), Ok("NamespaceNotFound"));
    }
}
