use crate::{
    bson::{doc, Bson, Document},
    bson_util,
    collation::Collation,
    engine::matcher::{self, MatchContext},
    error::{Error, Result},
};

/// A secondary-index descriptor: a name, an ordered key specification, and the flags that affect
/// constraint enforcement. Keys with direction 1/-1 define ordering; `expireAfterSeconds` and
/// ordering hints are carried as metadata without changing result semantics.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct IndexDescriptor {
    pub(crate) name: String,
    pub(crate) keys: Vec<(String, i32)>,
    pub(crate) unique: bool,
    pub(crate) sparse: bool,
    pub(crate) partial_filter: Option<Document>,
    pub(crate) expire_after_seconds: Option<i64>,
    pub(crate) collation: Option<Collation>,
}

impl IndexDescriptor {
    /// The default unique index on `_id`, present on every collection.
    pub(crate) fn id_index() -> Self {
        Self {
            name: "_id_".to_string(),
            keys: vec![("_id".to_string(), 1)],
            unique: true,
            sparse: false,
            partial_filter: None,
            expire_after_seconds: None,
            collation: None,
        }
    }

    /// Parses one entry of a `createIndexes` specification list.
    pub(crate) fn from_spec(spec: &Document) -> Result<Self> {
        let key = match spec.get("key") {
            Some(Bson::Document(key)) if !key.is_empty() => key,
            Some(Bson::Document(_)) => {
                return Err(Error::bad_value("index key specification must not be empty"))
            }
            _ => return Err(Error::type_mismatch("index spec requires a 'key' document")),
        };

        let mut keys = Vec::with_capacity(key.len());
        for (path, direction) in key.iter() {
            match bson_util::get_int(direction) {
                Some(1) => keys.push((path.clone(), 1)),
                Some(-1) => keys.push((path.clone(), -1)),
                _ => {
                    return Err(Error::not_implemented(format!(
                        "unsupported index key direction for field '{}'",
                        path
                    )))
                }
            }
        }

        let name = match spec.get("name") {
            Some(Bson::String(name)) if !name.is_empty() => name.clone(),
            Some(_) => return Err(Error::type_mismatch("index 'name' must be a string")),
            // Derived names follow the server convention: field_direction pairs.
            None => keys
                .iter()
                .map(|(path, dir)| format!("{}_{}", path, dir))
                .collect::<Vec<_>>()
                .join("_"),
        };

        let unique = match spec.get("unique") {
            Some(Bson::Boolean(b)) => *b,
            None => false,
            Some(_) => return Err(Error::type_mismatch("index 'unique' must be a boolean")),
        };
        let sparse = match spec.get("sparse") {
            Some(Bson::Boolean(b)) => *b,
            None => false,
            Some(_) => return Err(Error::type_mismatch("index 'sparse' must be a boolean")),
        };
        let partial_filter = match spec.get("partialFilterExpression") {
            Some(Bson::Document(filter)) => Some(filter.clone()),
            None => None,
            Some(_) => {
                return Err(Error::type_mismatch(
                    "'partialFilterExpression' must be a document",
                ))
            }
        };
        let expire_after_seconds = match spec.get("expireAfterSeconds") {
            Some(value) => Some(bson_util::get_int(value).ok_or_else(|| {
                Error::type_mismatch("'expireAfterSeconds' must be a number")
            })?),
            None => None,
        };
        let collation = match spec.get("collation") {
            Some(Bson::Document(collation)) => Some(Collation::from_document(collation)?),
            None => None,
            Some(_) => return Err(Error::type_mismatch("index 'collation' must be a document")),
        };

        Ok(Self {
            name,
            keys,
            unique,
            sparse,
            partial_filter,
            expire_after_seconds,
            collation,
        })
    }

    /// Extracts the key tuple this index records for `doc`. Returns `None` when the document does
    /// not participate: sparse indexes skip documents missing every indexed field, and partial
    /// indexes skip documents their filter does not match.
    pub(crate) fn key_tuple(&self, doc: &Document) -> Result<Option<Vec<Bson>>> {
        if let Some(ref filter) = self.partial_filter {
            let ctx = MatchContext::new(self.collation.as_ref());
            if !matcher::matches(filter, doc, &ctx)? {
                return Ok(None);
            }
        }

        let mut tuple = Vec::with_capacity(self.keys.len());
        let mut any_present = false;
        for (path, _) in &self.keys {
            match bson_util::first_path_value(doc, path) {
                Some(value) => {
                    any_present = true;
                    tuple.push(value.clone());
                }
                None => tuple.push(Bson::Null),
            }
        }
        if self.sparse && !any_present {
            return Ok(None);
        }
        Ok(Some(tuple))
    }

    /// Whether two key tuples collide under this index's collation.
    pub(crate) fn tuples_equal(&self, a: &[Bson], b: &[Bson]) -> bool {
        a.len() == b.len()
            && a.iter()
                .zip(b.iter())
                .all(|(x, y)| bson_util::bson_eq(x, y, self.collation.as_ref()))
    }

    /// Whether `other` requests the same index: same name and same key specification.
    pub(crate) fn same_spec(&self, other: &Self) -> bool {
        self.name == other.name && self.keys == other.keys
    }

    /// Renders this descriptor in the `listIndexes` response shape.
    pub(crate) fn to_document(&self) -> Document {
        let mut key = Document::new();
        for (path, direction) in &self.keys {
            key.insert(path.clone(), *direction);
        }
        let mut spec = doc! { "v": 2, "key": key, "name": self.name.clone() };
        if self.unique {
            spec.insert("unique", true);
        }
        if self.sparse {
            spec.insert("sparse", true);
        }
        if let Some(ref filter) = self.partial_filter {
            spec.insert("partialFilterExpression", filter.clone());
        }
        if let Some(seconds) = self.expire_after_seconds {
            spec.insert("expireAfterSeconds", seconds);
        }
        if let Some(ref collation) = self.collation {
            if let Ok(collation) = crate::bson::to_document(collation) {
                spec.insert("collation", collation);
            }
        }
        spec
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::IndexDescriptor;
    use crate::bson::{bson, doc};

    #[test]
    fn from_spec_derives_name() {
        let index =
            IndexDescriptor::from_spec(&doc! { "key": { "email": 1, "age": -1 } }).unwrap();
        assert_eq!(index.name, "email_1_age_-1");
        assert_eq!(
            index.keys,
            vec![("email".to_string(), 1), ("age".to_string(), -1)]
        );
    }

    #[test]
    fn key_tuple_missing_fields_are_null() {
        let index = IndexDescriptor::from_spec(&doc! { "key": { "email": 1 } }).unwrap();
        let tuple = index.key_tuple(&doc! { "_id": 1 }).unwrap().unwrap();
        assert_eq!(tuple, vec![bson!(null)]);
    }

    #[test]
    fn sparse_index_skips_wholly_missing_documents() {
        let index = IndexDescriptor::from_spec(&doc! { "key": { "email": 1 }, "sparse": true })
            .unwrap();
        assert_eq!(index.key_tuple(&doc! { "_id": 1 }).unwrap(), None);
        assert!(index
            .key_tuple(&doc! { "_id": 1, "email": "a@x" })
            .unwrap()
            .is_some());
    }

    #[test]
    fn partial_index_applies_filter() {
        let index = IndexDescriptor::from_spec(&doc! {
            "key": { "email": 1 },
            "partialFilterExpression": { "active": true },
        })
        .unwrap();
        assert_eq!(
            index
                .key_tuple(&doc! { "email": "a@x", "active": false })
                .unwrap(),
            None
        );
        assert!(index
            .key_tuple(&doc! { "email": "a@x", "active": true })
            .unwrap()
            .is_some());
    }
}
