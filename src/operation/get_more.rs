use crate::{
    bson::{Bson, Document},
    dispatch::{command, cursor_response, Command, Dispatcher, ExecCtx},
    error::{Error, Result},
};

/// Handles `getMore`: advances a registered cursor by one batch. An exhausted cursor reports
/// id 0 and is removed from the registry.
pub(crate) fn run(dispatcher: &Dispatcher, ctx: &mut ExecCtx<'_>, cmd: &Command) -> Result<Document> {
    super::reject_unknown_options(cmd, &["collection", "batchSize"])?;

    let id = match cmd.body.get(&cmd.wire_name) {
        Some(Bson::Int64(id)) => *id,
        Some(Bson::Int32(id)) => i64::from(*id),
        _ => return Err(Error::type_mismatch("'getMore' must be an integer cursor id")),
    };
    let collection = command::get_string(&cmd.body, "collection")?
        .ok_or_else(|| Error::type_mismatch("'collection' is required and must be a string"))?;
    let batch_size = match command::get_int(&cmd.body, "batchSize")? {
        Some(size) if size <= 0 => return Err(Error::bad_value("'batchSize' must be positive")),
        Some(size) => Some(size as usize),
        None => None,
    };

    let advanced = dispatcher
        .cursors
        .get_more(id, batch_size, ctx.session.as_ref())?;
    if advanced.ns.coll != collection {
        return Err(Error::bad_value(format!(
            "cursor {} belongs to namespace {}, not collection '{}'",
            id, advanced.ns, collection
        )));
    }
    Ok(cursor_response(
        advanced.id,
        &advanced.ns,
        "nextBatch",
        advanced.batch,
    ))
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use crate::{
        bson::doc,
        operation::test_util::{dispatch_err, dispatch_ok, dispatcher},
    };

    #[test]
    fn unknown_cursor_is_not_found() {
        let dispatcher = dispatcher();
        let response = dispatch_err(
            &dispatcher,
            "app",
            doc! { "getMore": 12345_i64, "collection": "users" },
        );
        assert_eq!(response.get_i32("code"), Ok(43));
        assert_eq!(response.get_str("codeName"), Ok("CursorNotFound"));
    }

    #[test]
    fn exhausted_cursor_is_removed_then_not_found() {
        let dispatcher = dispatcher();
        dispatch_ok(
            &dispatcher,
            "app",
            doc! {
                "insert": "users",
                "documents": [ { "_id": 1 }, { "_id": 2 }, { "_id": 3 } ],
            },
        );
        let response = dispatch_ok(
            &dispatcher,
            "app",
            doc! { "find": "users", "filter": {}, "batchSize": 1 },
        );
        let id = response
            .get_document("cursor")
            .unwrap()
            .get_i64("id")
            .unwrap();

        let more = dispatch_ok(
            &dispatcher,
            "app",
            doc! { "getMore": id, "collection": "users" },
        );
        assert_eq!(more.get_document("cursor").unwrap().get_i64("id"), Ok(0));

        // The registry entry is gone; replays see CursorNotFound.
        let replay = dispatch_err(
            &dispatcher,
            "app",
            doc! { "getMore": id, "collection": "users" },
        );
        assert_eq!(replay.get_i32("code"), Ok(43));
    }

    #[test]
    fn cursor_id_must_be_integer() {
        let dispatcher = dispatcher();
        let response = dispatch_err(
            &dispatcher,
            "app",
            doc! { "getMore": "nope", "collection": "users" },
        );
        assert_eq!(response.get_str("codeName"), Ok("TypeMismatch"));
    }
}
