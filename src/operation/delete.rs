use crate::{
    bson::{doc, Bson, Document},
    dispatch::{command, Command, Dispatcher, ExecCtx},
    error::{Error, Result},
    Namespace,
};

/// Handles `delete`: a list of `{q, limit}` statements. `limit: 0` removes every match,
/// `limit: 1` removes at most the first match in natural order.
pub(crate) fn run(_: &Dispatcher, ctx: &mut ExecCtx<'_>, cmd: &Command) -> Result<Document> {
    super::reject_unknown_options(cmd, &["deletes", "ordered"])?;

    let ns = Namespace::new(cmd.db.clone(), cmd.collection()?);
    let deletes = command::get_array(&cmd.body, "deletes")?
        .ok_or_else(|| Error::type_mismatch("'deletes' is required and must be an array"))?;
    if deletes.is_empty() {
        return Err(Error::bad_value("'deletes' must not be empty"));
    }

    let mut statements = Vec::with_capacity(deletes.len());
    for entry in deletes {
        let entry = match entry {
            Bson::Document(entry) => entry,
            _ => return Err(Error::type_mismatch("'deletes' entries must be documents")),
        };
        let filter = command::get_document(entry, "q")?
            .ok_or_else(|| Error::type_mismatch("delete statement requires a 'q' filter document"))?
            .clone();
        let limit_one = match command::get_int(entry, "limit")? {
            Some(0) => false,
            Some(1) => true,
            Some(_) => {
                return Err(Error::bad_value(
                    "the limit field in delete objects must be 0 or 1",
                ))
            }
            None => {
                return Err(Error::type_mismatch(
                    "delete statement requires a numeric 'limit'",
                ))
            }
        };
        let collation = command::get_collation(entry)?;
        statements.push((filter, limit_one, collation));
    }

    let mut n = 0i64;
    for (filter, limit_one, collation) in &statements {
        n += ctx.store.write(|store| {
            // Deleting against a missing namespace must not create it.
            if store.collection(&ns).is_none() {
                return Ok(0);
            }
            store
                .collection_mut(&ns)
                .delete_docs(filter, *limit_one, collation.as_ref())
        })? as i64;
    }

    Ok(doc! { "n": n })
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use crate::{
        bson::doc,
        operation::test_util::{dispatch_err, dispatch_ok, dispatcher},
        Dispatcher,
    };

    fn seed(dispatcher: &Dispatcher) {
        dispatch_ok(
            dispatcher,
            "app",
            doc! {
                "insert": "users",
                "documents": [
                    { "_id": 1, "status": "stale" },
                    { "_id": 2, "status": "stale" },
                    { "_id": 3, "status": "live" },
                ],
            },
        );
    }

    fn count(dispatcher: &Dispatcher) -> i64 {
        let response = dispatch_ok(dispatcher, "app", doc! { "count": "users" });
        response.get_i64("n").unwrap()
    }

    #[test]
    fn limit_zero_removes_all_matches() {
        let dispatcher = dispatcher();
        seed(&dispatcher);
        let response = dispatch_ok(
            &dispatcher,
            "app",
            doc! { "delete": "users", "deletes": [ { "q": { "status": "stale" }, "limit": 0 } ] },
        );
        assert_eq!(response.get_i64("n"), Ok(2));
        assert_eq!(count(&dispatcher), 1);
    }

    #[test]
    fn limit_one_removes_first_in_natural_order() {
        let dispatcher = dispatcher();
        seed(&dispatcher);
        let response = dispatch_ok(
            &dispatcher,
            "app",
            doc! { "delete": "users", "deletes": [ { "q": { "status": "stale" }, "limit": 1 } ] },
        );
        assert_eq!(response.get_i64("n"), Ok(1));

        let remaining = dispatch_ok(
            &dispatcher,
            "app",
            doc! { "find": "users", "filter": { "status": "stale" } },
        );
        let batch = remaining
            .get_document("cursor")
            .unwrap()
            .get_array("firstBatch")
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn out_of_range_limit_is_rejected() {
        let dispatcher = dispatcher();
        seed(&dispatcher);
        let response = dispatch_err(
            &dispatcher,
            "app",
            doc! { "delete": "users", "deletes": [ { "q": {}, "limit": 2 } ] },
        );
        assert_eq!(response.get_i32("code"), Ok(14));
        assert_eq!(response.get_str("codeName"), Ok("BadValue"));
    }

    #[test]
    fn delete_from_missing_collection_is_zero() {
        let dispatcher = dispatcher();
        let response = dispatch_ok(
            &dispatcher,
            "app",
            doc! { "delete": "ghost", "deletes": [ { "q": {}, "limit": 0 } ] },
        );
        assert_eq!(response.get_i64("n"), Ok(0));
    }
}
