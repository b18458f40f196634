//! Per-command handlers. Each module owns one command's option parsing, execution against the
//! bound store, and response shape.

mod aggregate;
mod bulk_write;
mod count_documents;
mod create_indexes;
mod delete;
mod diagnostics;
mod drop;
mod drop_database;
mod find;
mod find_and_modify;
mod get_more;
mod hello;
mod insert;
mod kill_cursors;
mod list_collections;
mod list_indexes;
mod replace_one;
mod update;

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::{
    bson::Document,
    dispatch::{Command, Dispatcher, ExecCtx},
    error::{Error, Result},
};

pub(crate) type Handler = fn(&Dispatcher, &mut ExecCtx<'_>, &Command) -> Result<Document>;

static HANDLERS: Lazy<HashMap<&'static str, Handler>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, Handler> = HashMap::new();
    table.insert("hello", hello::run);
    table.insert("ping", diagnostics::ping);
    table.insert("buildInfo", diagnostics::build_info);
    table.insert("getParameter", diagnostics::get_parameter);
    table.insert("insert", insert::run);
    table.insert("find", find::run);
    table.insert("update", update::run);
    table.insert("delete", delete::run);
    table.insert("countDocuments", count_documents::run);
    table.insert("replaceOne", replace_one::run);
    table.insert("findAndModify", find_and_modify::run);
    table.insert("findOneAndUpdate", find_and_modify::run);
    table.insert("findOneAndReplace", find_and_modify::run);
    table.insert("bulkWrite", bulk_write::run);
    table.insert("aggregate", aggregate::run);
    table.insert("getMore", get_more::run);
    table.insert("killCursors", kill_cursors::run);
    table.insert("createIndexes", create_indexes::run);
    table.insert("listIndexes", list_indexes::run);
    table.insert("listCollections", list_collections::run);
    table.insert("drop", drop::run);
    table.insert("dropDatabase", drop_database::run);
    table
});

/// Looks up the handler for a canonical command name.
pub(crate) fn handler(name: &str) -> Option<Handler> {
    HANDLERS.get(name).copied()
}

/// Fields every command may carry: the database hint, the transactional envelope, and generic
/// options this engine accepts without effect.
const GENERIC_FIELDS: &[&str] = &[
    "$db",
    "$clusterTime",
    "$readPreference",
    "lsid",
    "txnNumber",
    "autocommit",
    "startTransaction",
    "comment",
    "maxTimeMS",
    "writeConcern",
    "readConcern",
    "apiVersion",
    "apiStrict",
    "apiDeprecationErrors",
];

/// Rejects options outside a handler's supported surface with `NotImplemented` and the
/// `UnsupportedFeature` label. The command key itself and [`GENERIC_FIELDS`] are always allowed.
pub(crate) fn reject_unknown_options(cmd: &Command, supported: &[&str]) -> Result<()> {
    for key in cmd.body.keys() {
        if key == &cmd.wire_name
            || GENERIC_FIELDS.contains(&key.as_str())
            || supported.contains(&key.as_str())
        {
            continue;
        }
        return Err(Error::not_implemented(format!(
            "option '{}' is not supported for command {}",
            key, cmd.name
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_util {
    use crate::{bson::Document, Dispatcher, Engine};

    /// A dispatcher over a fresh engine, for handler tests.
    pub(crate) fn dispatcher() -> Dispatcher {
        Dispatcher::new(Engine::new())
    }

    /// Dispatches and asserts command-level success, returning the response.
    pub(crate) fn dispatch_ok(dispatcher: &Dispatcher, db: &str, body: Document) -> Document {
        let response = dispatcher.dispatch(db, body);
        assert_eq!(
            response.get_f64("ok"),
            Ok(1.0),
            "expected ok response, got: {}",
            response
        );
        response
    }

    /// Dispatches and asserts failure, returning the response.
    pub(crate) fn dispatch_err(dispatcher: &Dispatcher, db: &str, body: Document) -> Document {
        let response = dispatcher.dispatch(db, body);
        assert_eq!(
            response.get_f64("ok"),
            Ok(0.0),
            "expected error response, got: {}",
            response
        );
        response
    }
}
