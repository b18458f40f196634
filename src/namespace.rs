use std::{fmt, str::FromStr};

use crate::error::{Error, Result};

/// A fully qualified collection name: the `(database, collection)` pair that identifies one
/// document set in the engine.
///
/// On the wire a namespace travels as a single dotted string (`"app.users"`, or `"app.$cmd"` for
/// legacy command queries). The database is everything before the first dot; collection names may
/// themselves contain dots.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Namespace {
    /// The database name.
    pub db: String,

    /// The collection name.
    pub coll: String,
}

impl Namespace {
    /// Builds a namespace from its parts.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}.{}", self.db, self.coll)
    }
}

impl FromStr for Namespace {
    type Err = Error;

    /// Splits a dotted wire-form namespace at the first dot. Both halves must be non-empty.
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(Error::bad_value(format!(
                "'{}' is not a valid db.collection namespace",
                s
            ))),
        }
    }
}
