use crate::{
    bson::{doc, Bson, Document},
    bson_util,
    dispatch::{command, Command, Dispatcher, ExecCtx},
    engine::{aggregate, matcher, update::UpdateSpec, StoreWrite},
    error::{Error, Result},
    Namespace,
};

/// Handles `findAndModify` and the `findOneAndUpdate`/`findOneAndReplace` forms: atomically
/// selects one document (by query and sort), then updates, replaces, or removes it. `new`
/// selects whether the pre- or post-image is returned; `fields` projects it.
pub(crate) fn run(_: &Dispatcher, ctx: &mut ExecCtx<'_>, cmd: &Command) -> Result<Document> {
    super::reject_unknown_options(
        cmd,
        &[
            "query",
            "filter",
            "sort",
            "remove",
            "update",
            "replacement",
            "new",
            "returnDocument",
            "fields",
            "projection",
            "upsert",
            "arrayFilters",
            "collation",
        ],
    )?;

    let ns = Namespace::new(cmd.db.clone(), cmd.collection()?);
    let filter = match command::get_document(&cmd.body, "query")? {
        Some(filter) => Some(filter.clone()),
        None => command::get_document(&cmd.body, "filter")?.cloned(),
    }
    .unwrap_or_default();
    let sort = command::get_document(&cmd.body, "sort")?.cloned();
    let remove = command::get_bool(&cmd.body, "remove")?.unwrap_or(false);
    let upsert = command::get_bool(&cmd.body, "upsert")?.unwrap_or(false);
    let return_new = match command::get_string(&cmd.body, "returnDocument")? {
        Some("after") => true,
        Some("before") => false,
        Some(other) => {
            return Err(Error::bad_value(format!(
                "'returnDocument' must be 'before' or 'after', got '{}'",
                other
            )))
        }
        None => command::get_bool(&cmd.body, "new")?.unwrap_or(false),
    };
    let projection = match command::get_document(&cmd.body, "fields")? {
        Some(projection) => Some(projection.clone()),
        None => command::get_document(&cmd.body, "projection")?.cloned(),
    };
    let collation = command::get_collation(&cmd.body)?;
    let array_filters = match command::get_array(&cmd.body, "arrayFilters")? {
        Some(filters) => filters
            .iter()
            .map(|f| match f {
                Bson::Document(f) => Ok(f.clone()),
                _ => Err(Error::type_mismatch("'arrayFilters' entries must be documents")),
            })
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };

    let update_spec = parse_update_argument(cmd, remove)?;
    if remove && upsert {
        return Err(Error::bad_value("cannot specify both 'remove' and 'upsert'"));
    }
    if remove && return_new {
        return Err(Error::bad_value(
            "'new' cannot be true for a remove operation",
        ));
    }

    let (value, last_error) = ctx.store.write(|store| {
        execute(
            store,
            &ns,
            &filter,
            sort.as_ref(),
            update_spec.as_ref(),
            remove,
            upsert,
            return_new,
            &array_filters,
            collation.as_ref(),
        )
    })?;

    let value = match value {
        Some(doc) => match projection {
            Some(ref projection) => Bson::Document(aggregate::apply_projection(&doc, projection)?),
            None => Bson::Document(doc),
        },
        None => Bson::Null,
    };
    Ok(doc! { "lastErrorObject": last_error, "value": value })
}

fn parse_update_argument(cmd: &Command, remove: bool) -> Result<Option<UpdateSpec>> {
    let argument = match command::get_document(&cmd.body, "update")? {
        Some(update) => Some(update),
        None => command::get_document(&cmd.body, "replacement")?,
    };
    match (argument, remove) {
        (Some(_), true) => Err(Error::bad_value("cannot specify both 'update' and 'remove'")),
        (None, false) => Err(Error::bad_value("either 'update' or 'remove' is required")),
        (None, true) => Ok(None),
        (Some(update), false) => {
            let spec = crate::engine::update::parse_update(update)?;
            match (cmd.name, &spec) {
                ("findOneAndReplace", UpdateSpec::Modifiers(_)) => Err(Error::bad_value(
                    "replacement document must not contain update modifiers",
                )),
                ("findOneAndUpdate", UpdateSpec::Replacement(_)) => Err(Error::bad_value(
                    "update document requires atomic operators",
                )),
                _ => Ok(Some(spec)),
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn execute(
    store: &mut dyn StoreWrite,
    ns: &Namespace,
    filter: &Document,
    sort: Option<&Document>,
    update_spec: Option<&UpdateSpec>,
    remove: bool,
    upsert: bool,
    return_new: bool,
    array_filters: &[Document],
    collation: Option<&crate::collation::Collation>,
) -> Result<(Option<Document>, Document)> {
    // Select the target: first match in sort order (natural order without a sort).
    let target: Option<Document> = match store.collection(ns) {
        Some(collection) => {
            let indices = collection.matching_indices(filter, collation)?;
            let mut matched: Vec<&Document> =
                indices.iter().map(|&i| &collection.documents()[i]).collect();
            if let Some(sort) = sort {
                let spec = bson_util::parse_sort_spec(sort)?;
                matched.sort_by(|a, b| bson_util::cmp_by_sort_spec(a, b, &spec, collation));
            }
            matched.first().map(|&doc| doc.clone())
        }
        None => None,
    };

    match target {
        Some(target) => {
            let id = target.get("_id").cloned().unwrap_or(Bson::Null);
            if remove {
                let id_filter = doc! { "_id": id };
                store
                    .collection_mut(ns)
                    .delete_docs(&id_filter, true, None)?;
                return Ok((Some(target), doc! { "n": 1 }));
            }

            let spec = update_spec.expect("update required when not removing");
            // Narrow to the selected document while keeping the original filter visible to the
            // positional operator.
            let narrowed = doc! { "$and": [ filter.clone(), { "_id": id } ] };
            let outcome = store.collection_mut(ns).update_docs(
                ns,
                &narrowed,
                spec,
                false,
                false,
                array_filters,
                collation,
            )?;

            let value = if return_new {
                lookup_by_filter(store, ns, &narrowed, collation)?
            } else {
                Some(target)
            };
            Ok((
                value,
                doc! { "n": outcome.matched as i64, "updatedExisting": true },
            ))
        }
        None => {
            if !upsert {
                let n = doc! { "n": 0, "updatedExisting": false };
                return Ok((None, n));
            }
            let spec = update_spec.expect("update required when not removing");
            let outcome = store.collection_mut(ns).update_docs(
                ns,
                filter,
                spec,
                false,
                true,
                array_filters,
                collation,
            )?;
            let upserted_id = outcome.upserted_id.clone().unwrap_or(Bson::Null);
            let value = if return_new {
                let id_filter = doc! { "_id": upserted_id.clone() };
                lookup_by_filter(store, ns, &id_filter, collation)?
            } else {
                None
            };
            Ok((
                value,
                doc! { "n": 1, "updatedExisting": false, "upserted": upserted_id },
            ))
        }
    }
}

fn lookup_by_filter(
    store: &dyn StoreWrite,
    ns: &Namespace,
    filter: &Document,
    collation: Option<&crate::collation::Collation>,
) -> Result<Option<Document>> {
    match store.collection(ns) {
        Some(collection) => {
            let ctx = matcher::MatchContext::new(collation);
            for doc in collection.documents() {
                if matcher::matches(filter, doc, &ctx)? {
                    return Ok(Some(doc.clone()));
                }
            }
            Ok(None)
        }
        None => Ok(None),
    }
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
                "insert": "jobs",
                "documents": [
                    { "_id": 1, "state": "queued", "priority": 2 },
                    { "_id": 2, "state": "queued", "priority": 5 },
                ],
            },
        );
    }

    #[test]
    fn returns_pre_image_by_default() {
        let dispatcher = dispatcher();
        seed(&dispatcher);
        let response = dispatch_ok(
            &dispatcher,
            "app",
            doc! {
                "findAndModify": "jobs",
                "query": { "state": "queued" },
                "sort": { "priority": -1 },
                "update": { "$set": { "state": "running" } },
            },
        );
        let value = response.get_document("value").unwrap();
        assert_eq!(value.get_i32("_id"), Ok(2));
        assert_eq!(value.get_str("state"), Ok("queued"));
        let leo = response.get_document("lastErrorObject").unwrap();
        assert_eq!(leo.get_bool("updatedExisting"), Ok(true));
    }

    #[test]
    fn new_returns_post_image() {
        let dispatcher = dispatcher();
        seed(&dispatcher);
        let response = dispatch_ok(
            &dispatcher,
            "app",
            doc! {
                "findAndModify": "jobs",
                "query": { "_id": 1 },
                "update": { "$inc": { "priority": 1 } },
                "new": true,
            },
        );
        let value = response.get_document("value").unwrap();
        assert_eq!(value.get_i32("priority"), Ok(3));
    }

    #[test]
    fn remove_returns_removed_document() {
        let dispatcher = dispatcher();
        seed(&dispatcher);
        let response = dispatch_ok(
            &dispatcher,
            "app",
            doc! { "findAndModify": "jobs", "query": { "_id": 1 }, "remove": true },
        );
        let value = response.get_document("value").unwrap();
        assert_eq!(value.get_i32("_id"), Ok(1));

        let count = dispatch_ok(&dispatcher, "app", doc! { "count": "jobs" });
        assert_eq!(count.get_i64("n"), Ok(1));
    }

    #[test]
    fn no_match_returns_null_value() {
        let dispatcher = dispatcher();
        seed(&dispatcher);
        let response = dispatch_ok(
            &dispatcher,
            "app",
            doc! {
                "findAndModify": "jobs",
                "query": { "_id": 42 },
                "update": { "$set": { "state": "x" } },
            },
        );
        assert!(matches!(
            response.get("value"),
            Some(crate::bson::Bson::Null)
        ));
    }

    #[test]
    fn upsert_reports_upserted_id() {
        let dispatcher = dispatcher();
        let response = dispatch_ok(
            &dispatcher,
            "app",
            doc! {
                "findAndModify": "jobs",
                "query": { "_id": 9 },
                "update": { "$set": { "state": "queued" } },
                "upsert": true,
                "new": true,
            },
        );
        let leo = response.get_document("lastErrorObject").unwrap();
        assert_eq!(leo.get_i32("upserted"), Ok(9));
        let value = response.get_document("value").unwrap();
        assert_eq!(value.get_str("state"), Ok("queued"));
    }

    #[test]
    fn find_one_and_replace_rejects_modifiers() {
        let dispatcher = dispatcher();
        let response = dispatch_err(
            &dispatcher,
            "app",
            doc! {
                "findOneAndReplace": "jobs",
                "filter": { "_id": 1 },
                "replacement": { "$set": { "a": 1 } },
            },
        );
        assert_eq!(response.get_str("codeName"), Ok("BadValue"));
    }

    #[test]
    fn update_and_remove_conflict() {
        let dispatcher = dispatcher();
        let response = dispatch_err(
            &dispatcher,
            "app",
            doc! {
                "findAndModify": "jobs",
                "query": {},
                "update": { "$set": { "a": 1 } },
                "remove": true,
            },
        );
        assert_eq!(response.get_str("codeName"), Ok("BadValue"));
    }
}
