use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::{
    bson::{Bson, Document},
    bson_util,
    error::{Error, Result},
};

/// Maps lowercased wire-level command names (and aliases) to canonical handler names.
static COMMAND_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut table = HashMap::new();
    table.insert("hello", "hello");
    table.insert("ismaster", "hello");
    table.insert("ping", "ping");
    table.insert("buildinfo", "buildInfo");
    table.insert("getparameter", "getParameter");
    table.insert("insert", "insert");
    table.insert("find", "find");
    table.insert("update", "update");
    table.insert("delete", "delete");
    table.insert("countdocuments", "countDocuments");
    table.insert("count", "countDocuments");
    table.insert("replaceone", "replaceOne");
    table.insert("findandmodify", "findAndModify");
    table.insert("findoneandupdate", "findOneAndUpdate");
    table.insert("findoneandreplace", "findOneAndReplace");
    table.insert("bulkwrite", "bulkWrite");
    table.insert("aggregate", "aggregate");
    table.insert("getmore", "getMore");
    table.insert("killcursors", "killCursors");
    table.insert("createindexes", "createIndexes");
    table.insert("listindexes", "listIndexes");
    table.insert("listcollections", "listCollections");
    table.insert("drop", "drop");
    table.insert("dropdatabase", "dropDatabase");
    table.insert("committransaction", "commitTransaction");
    table.insert("aborttransaction", "abortTransaction");
    table
});

/// The `{lsid, txnNumber, autocommit, startTransaction}` fields that lift a command into a
/// session/transaction context.
#[derive(Clone, Debug, Default)]
pub(crate) struct TxnEnvelope {
    pub(crate) lsid: Option<Document>,
    pub(crate) txn_number: Option<i64>,
    pub(crate) autocommit: Option<bool>,
    pub(crate) start_transaction: bool,
}

/// A canonicalized command: its resolved handler name, target database, raw body, and
/// transactional envelope.
#[derive(Clone, Debug)]
pub(crate) struct Command {
    /// The canonical command name used for handler dispatch.
    pub(crate) name: &'static str,
    /// The command name as it appeared on the wire (`isMaster` vs `hello`).
    pub(crate) wire_name: String,
    pub(crate) db: String,
    pub(crate) body: Document,
    pub(crate) envelope: TxnEnvelope,
}

impl Command {
    /// Canonicalizes a decoded command document: identifies the command by its first field
    /// (case-insensitively, applying aliases), and extracts and validates the transactional
    /// envelope. Types are validated before values.
    pub(crate) fn parse(db: String, body: Document) -> Result<Self> {
        let wire_name = match body.keys().next() {
            Some(first) => first.clone(),
            None => return Err(Error::bad_value("no command found in request body")),
        };
        let name = match COMMAND_ALIASES.get(wire_name.to_lowercase().as_str()) {
            Some(name) => *name,
            None => return Err(Error::command_not_found(&wire_name)),
        };

        let envelope = parse_envelope(&body)?;

        Ok(Self {
            name,
            wire_name,
            db,
            body,
            envelope,
        })
    }

    /// The target collection: the command key's string value, when it is one.
    pub(crate) fn collection(&self) -> Result<&str> {
        match self.body.get(&self.wire_name) {
            Some(Bson::String(coll)) if !coll.is_empty() => Ok(coll),
            _ => Err(Error::type_mismatch(format!(
                "collection name has invalid type for command {}",
                self.wire_name
            ))),
        }
    }
}

fn parse_envelope(body: &Document) -> Result<TxnEnvelope> {
    let lsid = match body.get("lsid") {
        Some(Bson::Document(lsid)) => Some(lsid.clone()),
        Some(_) => return Err(Error::type_mismatch("'lsid' must be a document")),
        None => None,
    };
    let txn_number = match body.get("txnNumber") {
        Some(value) => match value {
            Bson::Int32(n) => Some(i64::from(*n)),
            Bson::Int64(n) => Some(*n),
            _ => return Err(Error::type_mismatch("'txnNumber' must be an integer")),
        },
        None => None,
    };
    let autocommit = match body.get("autocommit") {
        Some(Bson::Boolean(autocommit)) => Some(*autocommit),
        Some(_) => return Err(Error::type_mismatch("'autocommit' must be a boolean")),
        None => None,
    };
    let start_transaction = match body.get("startTransaction") {
        Some(Bson::Boolean(true)) => true,
        Some(Bson::Boolean(false)) => {
            return Err(Error::no_such_transaction(
                "the 'startTransaction' field can only be set to true",
                false,
            ))
        }
        Some(_) => return Err(Error::type_mismatch("'startTransaction' must be a boolean")),
        None => false,
    };

    if lsid.is_none() && (txn_number.is_some() || autocommit.is_some() || start_transaction) {
        return Err(Error::no_such_transaction(
            "transaction fields require an 'lsid' session id document",
            false,
        ));
    }
    if start_transaction {
        if txn_number.is_none() {
            return Err(Error::no_such_transaction(
                "'startTransaction' requires a 'txnNumber'",
                false,
            ));
        }
        if autocommit != Some(false) {
            return Err(Error::no_such_transaction(
                "'startTransaction' requires 'autocommit' to be false",
                false,
            ));
        }
    }
    if autocommit == Some(true) {
        return Err(Error::no_such_transaction(
            "'autocommit' must be false when provided",
            false,
        ));
    }
    if autocommit.is_some() && txn_number.is_none() {
        return Err(Error::no_such_transaction(
            "'autocommit' requires a 'txnNumber'",
            false,
        ));
    }

    Ok(TxnEnvelope {
        lsid,
        txn_number,
        autocommit,
        start_transaction,
    })
}

// Typed option accessors. Shape and type violations short-circuit before any handler touches
// state, with field names spelled out in the error message.

pub(crate) fn get_document<'a>(body: &'a Document, field: &str) -> Result<Option<&'a Document>> {
    match body.get(field) {
        Some(Bson::Document(doc)) => Ok(Some(doc)),
        Some(_) => Err(Error::type_mismatch(format!(
            "'{}' must be a document",
            field
        ))),
        None => Ok(None),
    }
}

pub(crate) fn get_array<'a>(body: &'a Document, field: &str) -> Result<Option<&'a Vec<Bson>>> {
    match body.get(field) {
        Some(Bson::Array(array)) => Ok(Some(array)),
        Some(_) => Err(Error::type_mismatch(format!("'{}' must be an array", field))),
        None => Ok(None),
    }
}

pub(crate) fn get_string<'a>(body: &'a Document, field: &str) -> Result<Option<&'a str>> {
    match body.get(field) {
        Some(Bson::String(value)) => Ok(Some(value)),
        Some(_) => Err(Error::type_mismatch(format!("'{}' must be a string", field))),
        None => Ok(None),
    }
}

pub(crate) fn get_bool(body: &Document, field: &str) -> Result<Option<bool>> {
    match body.get(field) {
        Some(Bson::Boolean(value)) => Ok(Some(*value)),
        Some(_) => Err(Error::type_mismatch(format!(
            "'{}' must be a boolean",
            field
        ))),
        None => Ok(None),
    }
}

pub(crate) fn get_int(body: &Document, field: &str) -> Result<Option<i64>> {
    match body.get(field) {
        Some(value) => match bson_util::get_int(value) {
            Some(value) => Ok(Some(value)),
            None => Err(Error::type_mismatch(format!(
                "'{}' must be a number",
                field
            ))),
        },
        None => Ok(None),
    }
}

/// Reads `cursor.batchSize`, validating its shape.
pub(crate) fn get_batch_size(body: &Document) -> Result<Option<usize>> {
    let cursor = match get_document(body, "cursor")? {
        Some(cursor) => cursor,
        None => return Ok(None),
    };
    match get_int(cursor, "batchSize")? {
        Some(size) if size < 0 => Err(Error::bad_value("'batchSize' must be non-negative")),
        Some(size) => Ok(Some(size as usize)),
        None => Ok(None),
    }
}

/// Parses an optional `collation` option.
pub(crate) fn get_collation(body: &Document) -> Result<Option<crate::collation::Collation>> {
    match get_document(body, "collation")? {
        Some(collation) => Ok(Some(crate::collation::Collation::from_document(collation)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::Command;
    use crate::bson::doc;

    #[test]
    fn aliases_map_to_canonical_names() {
        let cmd = Command::parse("admin".into(), doc! { "isMaster": 1 }).unwrap();
        assert_eq!(cmd.name, "hello");
        assert_eq!(cmd.wire_name, "isMaster");

        let cmd = Command::parse("app".into(), doc! { "COUNT": "users" }).unwrap();
        assert_eq!(cmd.name, "countDocuments");
    }

    #[test]
    fn unknown_commands_are_rejected() {
        let err = Command::parse("app".into(), doc! { "mapReduce": "users" }).unwrap_err();
        assert_eq!(err.code(), 59);
        assert_eq!(err.code_name(), "CommandNotFound");
    }

    #[test]
    fn envelope_requires_lsid() {
        let err = Command::parse(
            "app".into(),
            doc! { "find": "users", "txnNumber": 1_i64, "autocommit": false },
        )
        .unwrap_err();
        assert_eq!(err.code(), 251);
    }

    #[test]
    fn start_transaction_false_is_rejected() {
        let err = Command::parse(
            "app".into(),
            doc! {
                "find": "users",
                "lsid": { "id": 7 },
                "txnNumber": 1_i64,
                "autocommit": false,
                "startTransaction": false,
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), 251);
        assert_eq!(err.code_name(), "NoSuchTransaction");
    }

    #[test]
    fn lsid_type_is_checked_before_values() {
        let err = Command::parse(
            "app".into(),
            doc! { "find": "users", "lsid": "not-a-document" },
        )
        .unwrap_err();
        assert_eq!(err.code_name(), "TypeMismatch");
    }

    #[test]
    fn collection_must_be_a_string() {
        let cmd = Command::parse("app".into(), doc! { "find": 17 }).unwrap();
        assert!(cmd.collection().is_err());

        let cmd = Command::parse("app".into(), doc! { "find": "users" }).unwrap();
        assert_eq!(cmd.collection().unwrap(), "users");
    }
}
