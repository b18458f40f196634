use crate::{
    bson::{doc, Document},
    dispatch::{command, Command, Dispatcher, ExecCtx},
    engine::matcher::{self, MatchContext},
    error::Result,
    Namespace,
};

/// Handles `countDocuments` (and its `count` alias): the number of documents matching the
/// filter, reported as 64-bit `n` and `count`.
pub(crate) fn run(_: &Dispatcher, ctx: &mut ExecCtx<'_>, cmd: &Command) -> Result<Document> {
    super::reject_unknown_options(cmd, &["query", "filter", "limit", "skip", "collation"])?;

    let ns = Namespace::new(cmd.db.clone(), cmd.collection()?);
    // The classic command calls the filter `query`; the driver-level name uses `filter`.
    let filter = match command::get_document(&cmd.body, "query")? {
        Some(filter) => Some(filter.clone()),
        None => command::get_document(&cmd.body, "filter")?.cloned(),
    }
    .unwrap_or_default();
    let skip = command::get_int(&cmd.body, "skip")?.unwrap_or(0).max(0) as u64;
    let limit = command::get_int(&cmd.body, "limit")?.unwrap_or(0).max(0) as u64;
    let collation = command::get_collation(&cmd.body)?;

    let mut n = ctx.store.read(|store| match store.collection(&ns) {
        Some(collection) => {
            let ctx = MatchContext::new(collation.as_ref());
            let mut n = 0u64;
            for doc in collection.documents() {
                if matcher::matches(&filter, doc, &ctx)? {
                    n += 1;
                }
            }
            Ok(n)
        }
        None => Ok(0),
    })?;

    n = n.saturating_sub(skip);
    if limit > 0 {
        n = n.min(limit);
    }

    Ok(doc! { "n": n as i64, "count": n as i64 })
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use crate::{
        bson::doc,
        operation::test_util::{dispatch_ok, dispatcher},
    };

    #[test]
    fn counts_matching_documents() {
        let dispatcher = dispatcher();
        dispatch_ok(
            &dispatcher,
            "app",
            doc! {
                "insert": "users",
                "documents": [
                    { "_id": 1, "age": 20 },
                    { "_id": 2, "age": 30 },
                    { "_id": 3, "age": 40 },
                ],
            },
        );
        let response = dispatch_ok(
            &dispatcher,
            "app",
            doc! { "countDocuments": "users", "filter": { "age": { "$gt": 25 } } },
        );
        assert_eq!(response.get_i64("n"), Ok(2));
        assert_eq!(response.get_i64("count"), Ok(2));
    }

    #[test]
    fn count_alias_and_query_field() {
        let dispatcher = dispatcher();
        dispatch_ok(
            &dispatcher,
            "app",
            doc! { "insert": "users", "documents": [ { "_id": 1 }, { "_id": 2 } ] },
        );
        let response = dispatch_ok(
            &dispatcher,
            "app",
            doc! { "count": "users", "query": { "_id": 1 } },
        );
        assert_eq!(response.get_i64("n"), Ok(1));
    }

    #[test]
    fn missing_collection_counts_zero() {
        let dispatcher = dispatcher();
        let response = dispatch_ok(&dispatcher, "app", doc! { "count": "ghost" });
        assert_eq!(response.get_i64("n"), Ok(0));
    }

    #[test]
    fn skip_and_limit_shape_the_count() {
        let dispatcher = dispatcher();
        dispatch_ok(
            &dispatcher,
            "app",
            doc! {
                "insert": "users",
                "documents": [ { "_id": 1 }, { "_id": 2 }, { "_id": 3 }, { "_id": 4 } ],
            },
        );
        let response = dispatch_ok(
            &dispatcher,
            "app",
            doc! { "count": "users", "skip": 1, "limit": 2 },
        );
        assert_eq!(response.get_i64("n"), Ok(2));
    }
}
