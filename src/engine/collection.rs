use crate::{
    bson::{oid::ObjectId, Bson, Document},
    bson_util,
    collation::Collation,
    engine::{
        aggregate,
        index::IndexDescriptor,
        matcher::{self, MatchContext},
        update::{self, UpdateContext, UpdateSpec},
    },
    error::{Error, Result},
    Namespace,
};

/// Options for a `find` against a single collection.
#[derive(Debug, Default)]
pub(crate) struct FindOptions {
    pub(crate) filter: Document,
    pub(crate) sort: Option<Document>,
    pub(crate) projection: Option<Document>,
    pub(crate) skip: u64,
    pub(crate) limit: Option<i64>,
    pub(crate) collation: Option<Collation>,
}

/// The outcome of an `update` against a single collection.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct UpdateOutcome {
    pub(crate) matched: u64,
    pub(crate) modified: u64,
    pub(crate) upserted_id: Option<Bson>,
}

/// An in-memory collection: documents in insertion (natural) order plus an index catalog. The
/// `_id` unique index is always present.
#[derive(Clone, Debug)]
pub(crate) struct Collection {
    documents: Vec<Document>,
    indexes: Vec<IndexDescriptor>,
}

impl Default for Collection {
    fn default() -> Self {
        Self {
            documents: Vec::new(),
            indexes: vec![IndexDescriptor::id_index()],
        }
    }
}

impl Collection {
    pub(crate) fn documents(&self) -> &[Document] {
        &self.documents
    }

    /// Replaces the document set wholesale. Used by transaction publish, which re-derives the
    /// merged contents of a namespace.
    pub(crate) fn set_documents(&mut self, documents: Vec<Document>) {
        self.documents = documents;
    }

    pub(crate) fn len(&self) -> usize {
        self.documents.len()
    }

    pub(crate) fn indexes(&self) -> &[IndexDescriptor] {
        &self.indexes
    }

    /// Inserts one document, autogenerating a missing `_id` and enforcing every unique index.
    /// Returns the document's `_id`.
    pub(crate) fn insert(&mut self, ns: &Namespace, doc: Document) -> Result<Bson> {
        let doc = normalize_id(doc)?;
        let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
        check_unique(&self.documents, &self.indexes, ns, &doc, None)?;
        self.documents.push(doc);
        Ok(id)
    }

    /// Finds the indices of documents matching `filter`, in natural order.
    pub(crate) fn matching_indices(
        &self,
        filter: &Document,
        collation: Option<&Collation>,
    ) -> Result<Vec<usize>> {
        let ctx = MatchContext::new(collation);
        let mut matches = Vec::new();
        for (i, doc) in self.documents.iter().enumerate() {
            if matcher::matches(filter, doc, &ctx)? {
                matches.push(i);
            }
        }
        Ok(matches)
    }

    /// Runs a query: filter, sort, skip, limit, projection. Results are materialized; cursor
    /// batching happens above the engine.
    pub(crate) fn query(&self, options: &FindOptions) -> Result<Vec<Document>> {
        let indices = self.matching_indices(&options.filter, options.collation.as_ref())?;
        let mut results: Vec<Document> = indices
            .into_iter()
            .map(|i| self.documents[i].clone())
            .collect();

        if let Some(ref sort) = options.sort {
            let spec = bson_util::parse_sort_spec(sort)?;
            results.sort_by(|a, b| {
                bson_util::cmp_by_sort_spec(a, b, &spec, options.collation.as_ref())
            });
        }

        let skip = options.skip as usize;
        let mut results: Vec<Document> = if skip >= results.len() {
            Vec::new()
        } else {
            results.split_off(skip)
        };

        if let Some(limit) = options.limit {
            let limit = limit.unsigned_abs() as usize;
            if limit > 0 {
                results.truncate(limit);
            }
        }

        if let Some(ref projection) = options.projection {
            results = results
                .iter()
                .map(|doc| aggregate::apply_projection(doc, projection))
                .collect::<Result<Vec<_>>>()?;
        }

        Ok(results)
    }

    /// Applies one update statement. All matched documents are rewritten atomically: a failure
    /// (immutable `_id`, unique violation, malformed modifier) leaves the collection untouched.
    pub(crate) fn update_docs(
        &mut self,
        ns: &Namespace,
        filter: &Document,
        spec: &UpdateSpec,
        multi: bool,
        upsert: bool,
        array_filters: &[Document],
        collation: Option<&Collation>,
    ) -> Result<UpdateOutcome> {
        let matches = self.matching_indices(filter, collation)?;

        if matches.is_empty() {
            if !upsert {
                return Ok(UpdateOutcome::default());
            }
            let seed = update::build_upsert_document(filter, spec, array_filters, collation)?;
            let id = self.insert(ns, seed)?;
            return Ok(UpdateOutcome {
                matched: 0,
                modified: 0,
                upserted_id: Some(id),
            });
        }

        let targets: &[usize] = if multi { &matches } else { &matches[..1] };
        let mut staged = self.documents.clone();
        let mut outcome = UpdateOutcome::default();

        for &i in targets {
            let ctx = UpdateContext {
                filter,
                array_filters,
                collation,
            };
            let original = staged[i].clone();
            let mut updated = original.clone();
            let changed = update::apply(&mut updated, spec, &ctx)?;

            let old_id = original.get("_id").cloned().unwrap_or(Bson::Null);
            let updated = match spec {
                // Replacement updates preserve the matched document's _id.
                UpdateSpec::Replacement(_) => {
                    let mut updated = updated;
                    match updated.get("_id") {
                        None => {}
                        Some(new_id) if bson_util::bson_eq(new_id, &old_id, None) => {}
                        Some(_) => {
                            return Err(Error::bad_value(format!(
                                "the _id field cannot be changed from {{_id: {}}}",
                                old_id
                            )))
                        }
                    }
                    updated.remove("_id");
                    let mut with_id = Document::new();
                    with_id.insert("_id", old_id);
                    with_id.extend(updated);
                    with_id
                }
                UpdateSpec::Modifiers(_) => {
                    let new_id = updated.get("_id").cloned().unwrap_or(Bson::Null);
                    if !bson_util::bson_eq(&new_id, &old_id, None) {
                        return Err(Error::bad_value(
                            "performing an update on the path '_id' would modify the immutable \
                             field '_id'",
                        ));
                    }
                    updated
                }
            };

            check_unique(&staged, &self.indexes, ns, &updated, Some(i))?;
            staged[i] = updated;
            outcome.matched += 1;
            if changed {
                outcome.modified += 1;
            }
        }

        self.documents = staged;
        Ok(outcome)
    }

    /// Deletes matching documents. With `limit_one`, only the first match in natural order is
    /// removed.
    pub(crate) fn delete_docs(
        &mut self,
        filter: &Document,
        limit_one: bool,
        collation: Option<&Collation>,
    ) -> Result<u64> {
        let mut matches = self.matching_indices(filter, collation)?;
        if limit_one {
            matches.truncate(1);
        }
        let doomed: std::collections::HashSet<usize> = matches.iter().copied().collect();
        let before = self.documents.len();
        let mut i = 0;
        self.documents.retain(|_| {
            let keep = !doomed.contains(&i);
            i += 1;
            keep
        });
        Ok((before - self.documents.len()) as u64)
    }

    /// Adds an index. Identical name+key specs are a no-op; conflicting redefinitions fail. A new
    /// unique index must already be satisfied by the collection's documents.
    pub(crate) fn create_index(
        &mut self,
        ns: &Namespace,
        descriptor: IndexDescriptor,
    ) -> Result<bool> {
        for existing in &self.indexes {
            if existing.same_spec(&descriptor) {
                return Ok(false);
            }
            if existing.name == descriptor.name {
                return Err(Error::bad_value(format!(
                    "an index named '{}' already exists with a different key specification",
                    descriptor.name
                )));
            }
            if existing.keys == descriptor.keys {
                return Err(Error::bad_value(format!(
                    "index {:?} already exists under the name '{}'",
                    descriptor.keys, existing.name
                )));
            }
        }

        if descriptor.unique {
            let mut tuples = Vec::new();
            for doc in &self.documents {
                if let Some(tuple) = descriptor.key_tuple(doc)? {
                    tuples.push(tuple);
                }
            }
            for i in 0..tuples.len() {
                for j in (i + 1)..tuples.len() {
                    if descriptor.tuples_equal(&tuples[i], &tuples[j]) {
                        return Err(duplicate_key_error(ns, &descriptor, &tuples[i]));
                    }
                }
            }
        }

        self.indexes.push(descriptor);
        Ok(true)
    }
}

/// Moves `_id` to the front, autogenerating an `ObjectId` when missing, and rejects `_id` values
/// that can never be stored.
fn normalize_id(doc: Document) -> Result<Document> {
    let id = match doc.get("_id") {
        Some(Bson::Array(_)) => return Err(Error::bad_value("the _id field cannot be an array")),
        Some(Bson::RegularExpression(_)) => {
            return Err(Error::bad_value("the _id field cannot be a regex"))
        }
        Some(Bson::Undefined) | None => Bson::ObjectId(ObjectId::new()),
        Some(id) => id.clone(),
    };

    let mut normalized = Document::new();
    normalized.insert("_id", id);
    for (key, value) in doc {
        if key != "_id" {
            normalized.insert(key, value);
        }
    }
    Ok(normalized)
}

/// Verifies that `candidate` does not collide with any live document under a unique index.
/// `exclude` is the natural-order position of the document being replaced, if any.
fn check_unique(
    documents: &[Document],
    indexes: &[IndexDescriptor],
    ns: &Namespace,
    candidate: &Document,
    exclude: Option<usize>,
) -> Result<()> {
    for index in indexes.iter().filter(|index| index.unique) {
        let tuple = match index.key_tuple(candidate)? {
            Some(tuple) => tuple,
            None => continue,
        };
        for (i, doc) in documents.iter().enumerate() {
            if Some(i) == exclude {
                continue;
            }
            if let Some(other_tuple) = index.key_tuple(doc)? {
                if index.tuples_equal(&tuple, &other_tuple) {
                    return Err(duplicate_key_error(ns, index, &tuple));
                }
            }
        }
    }
    Ok(())
}

fn duplicate_key_error(ns: &Namespace, index: &IndexDescriptor, tuple: &[Bson]) -> Error {
    let mut dup_key = Document::new();
    for ((path, _), value) in index.keys.iter().zip(tuple.iter()) {
        dup_key.insert(path.clone(), value.clone());
    }
    Error::duplicate_key(format!(
        "E11000 duplicate key error collection: {} index: {} dup key: {}",
        ns, index.name, dup_key
    ))
}
