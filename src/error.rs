//! Contains the `Error` and `Result` types that `jongodb` uses.

use std::{
    collections::HashSet,
    fmt::{self, Debug},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bson::{doc, Bson, Document};

/// Transient transaction error label. This label is attached to a failure when the driver may
/// retry the entire transaction with a reasonable expectation that it will succeed.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";

/// Unsupported feature error label. This label is attached to a failure when the command shape is
/// recognized but the behavior is intentionally unimplemented.
pub const UNSUPPORTED_FEATURE: &str = "UnsupportedFeature";

/// The result type for all fallible operations in the `jongodb` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `jongodb` crate. The inner [`ErrorKind`] is boxed to keep the
/// type small, and errors are cloneable so they can be both journaled and returned.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
    labels: HashSet<String>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        Self {
            kind: Box::new(kind),
            labels: labels
                .map(|labels| labels.into_iter().collect())
                .unwrap_or_default(),
        }
    }

    fn command_error(code: i32, code_name: &str, message: impl Into<String>) -> Self {
        ErrorKind::Command(CommandError {
            code,
            code_name: code_name.to_string(),
            message: message.into(),
        })
        .into()
    }

    /// A semantic violation in command options (code 14, `BadValue`).
    pub fn bad_value(message: impl Into<String>) -> Self {
        Self::command_error(14, "BadValue", message)
    }

    /// A wrong value type for a required field (code 14, `TypeMismatch`).
    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::command_error(14, "TypeMismatch", message)
    }

    /// A unique-index constraint violation (code 11000, `DuplicateKey`).
    pub fn duplicate_key(message: impl Into<String>) -> Self {
        Self::command_error(11000, "DuplicateKey", message)
    }

    /// A session/transaction envelope violation (code 251, `NoSuchTransaction`). When `transient`
    /// is set the response is labeled `TransientTransactionError`, signaling that the client may
    /// retry the whole transaction.
    pub fn no_such_transaction(message: impl Into<String>, transient: bool) -> Self {
        let labels = transient.then(|| vec![TRANSIENT_TRANSACTION_ERROR.to_string()]);
        Error::new(
            ErrorKind::Command(CommandError {
                code: 251,
                code_name: "NoSuchTransaction".to_string(),
                message: message.into(),
            }),
            labels,
        )
    }

    /// A commit-time write-write conflict (code 112, `WriteConflict`). Always carries the
    /// transient label since the transaction as a whole is retryable.
    pub fn write_conflict(message: impl Into<String>) -> Self {
        Error::new(
            ErrorKind::Command(CommandError {
                code: 112,
                code_name: "WriteConflict".to_string(),
                message: message.into(),
            }),
            Some(vec![TRANSIENT_TRANSACTION_ERROR.to_string()]),
        )
    }

    /// A `getMore`/`killCursors` referencing an unknown cursor id (code 43, `CursorNotFound`).
    pub fn cursor_not_found(cursor_id: i64) -> Self {
        Self::command_error(
            43,
            "CursorNotFound",
            format!("cursor id {} not found", cursor_id),
        )
    }

    /// A recognized command or option that is intentionally unimplemented (code 238,
    /// `NotImplemented`), labeled `UnsupportedFeature`.
    pub fn not_implemented(message: impl Into<String>) -> Self {
        Error::new(
            ErrorKind::Command(CommandError {
                code: 238,
                code_name: "NotImplemented".to_string(),
                message: message.into(),
            }),
            Some(vec![UNSUPPORTED_FEATURE.to_string()]),
        )
    }

    /// An unrecognized command name (code 59, `CommandNotFound`).
    pub fn command_not_found(name: &str) -> Self {
        Self::command_error(59, "CommandNotFound", format!("no such command: '{}'", name))
    }

    /// A collection namespace that does not exist (code 26, `NamespaceNotFound`).
    pub fn namespace_not_found(ns: impl fmt::Display) -> Self {
        Self::command_error(26, "NamespaceNotFound", format!("ns not found: {}", ns))
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_message(message: impl Into<String>) -> Self {
        ErrorKind::InvalidMessage {
            message: message.into(),
        }
        .into()
    }

    /// Returns the labels for this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels.contains(label.as_ref())
    }

    /// Adds the given label to this error.
    #[allow(dead_code)]
    pub(crate) fn add_label<T: AsRef<str>>(&mut self, label: T) {
        self.labels.insert(label.as_ref().to_string());
    }

    /// Gets the numeric code from this error. Errors that never cross the wire report as
    /// internal failures (code 1, `InternalError`).
    pub fn code(&self) -> i32 {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => command_error.code,
            _ => 1,
        }
    }

    /// Gets the code name from this error.
    pub fn code_name(&self) -> &str {
        match self.kind.as_ref() {
            ErrorKind::Command(ref command_error) => command_error.code_name.as_str(),
            _ => "InternalError",
        }
    }

    /// Gets the server-visible message for this error.
    pub fn message(&self) -> String {
        match self.kind.as_ref() {
            ErrorKind::Command(ref command_error) => command_error.message.clone(),
            ErrorKind::Io(ref io_err) => io_err.to_string(),
            ErrorKind::InvalidMessage { ref message } => message.clone(),
            ErrorKind::Internal { ref message } => message.clone(),
        }
    }

    /// Whether this error represents a malformed wire message or an I/O failure. Framing errors
    /// close the connection rather than producing a response document.
    pub(crate) fn is_connection_fatal(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::InvalidMessage { .. } | ErrorKind::Io(..)
        )
    }

    /// Renders this error as a command failure response document:
    /// `{ok: 0.0, code, codeName, errmsg}` plus `errorLabels` when any labels are attached.
    pub fn to_response_document(&self) -> Document {
        let mut response = doc! {
            "ok": 0.0,
            "errmsg": self.message(),
            "code": self.code(),
            "codeName": self.code_name(),
        };
        if !self.labels.is_empty() {
            let mut labels: Vec<_> = self.labels.iter().cloned().collect();
            labels.sort();
            response.insert(
                "errorLabels",
                Bson::Array(labels.into_iter().map(Bson::String).collect()),
            );
        }
        response
    }

    /// Renders this error as an entry of a `writeErrors` array: `{index, code, codeName, errmsg}`.
    pub(crate) fn to_write_error_document(&self, index: usize) -> Document {
        doc! {
            "index": index as i32,
            "code": self.code(),
            "codeName": self.code_name(),
            "errmsg": self.message(),
        }
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Self::new(err.into(), None::<Option<String>>)
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        Self::InvalidMessage {
            message: err.to_string(),
        }
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }
}

/// The types of errors that can occur.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A command failure with a stable code, code name, and message. This is the only kind that
    /// is rendered into a wire response.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// Wrapper around `std::io::Error`.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// A malformed wire message. The connection that produced it is closed.
    #[error("Invalid message: {message}")]
    InvalidMessage {
        /// A description of the framing problem.
        message: String,
    },

    /// An unexpected internal condition.
    #[error("Internal error: {message}")]
    Internal {
        /// A description of the condition.
        message: String,
    },
}

/// An error that occurred while executing a command, as surfaced in the response document.
#[derive(Clone, Debug, Deserialize, Serialize, Error)]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "Error code {} ({}): {}",
            self.code, self.code_name, self.message
        )
    }
}
