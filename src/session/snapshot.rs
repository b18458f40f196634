//! Copy-on-write transaction snapshots and publish-on-commit.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    bson::{Bson, Document},
    bson_util,
    engine::{Collection, Engine, EngineState, StoreRead, StoreWrite},
    error::{Error, Result},
    Namespace,
};

/// A transaction-local view of the engine. Reads fall through to the global store until the
/// first write to a namespace materializes a private clone; from then on the session observes
/// the clone. Untouched namespaces are never copied or republished.
#[derive(Debug)]
pub struct TransactionSnapshot {
    engine: Engine,
    /// Working copies of every namespace the transaction wrote.
    clones: BTreeMap<Namespace, Collection>,
    /// The namespace contents as of clone time, used to diff out this transaction's changes at
    /// publish.
    bases: BTreeMap<Namespace, Collection>,
    /// Namespaces dropped inside the transaction.
    dropped: BTreeSet<Namespace>,
}

impl TransactionSnapshot {
    fn new(engine: Engine) -> Self {
        Self {
            engine,
            clones: BTreeMap::new(),
            bases: BTreeMap::new(),
            dropped: BTreeSet::new(),
        }
    }

    /// Runs `f` with read access to the transaction's view of the store.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&dyn StoreRead) -> T) -> T {
        self.engine.with_state(|global| {
            let view = SnapshotRead {
                global,
                clones: &self.clones,
                dropped: &self.dropped,
            };
            f(&view)
        })
    }

    /// Runs `f` with write access. Writes clone the affected namespace on first touch.
    pub(crate) fn write<T>(&mut self, f: impl FnOnce(&mut dyn StoreWrite) -> T) -> T {
        let engine = self.engine.clone();
        engine.with_state(|global| {
            let mut view = SnapshotWrite {
                global,
                clones: &mut self.clones,
                bases: &mut self.bases,
                dropped: &mut self.dropped,
            };
            f(&mut view)
        })
    }
}

struct SnapshotRead<'a> {
    global: &'a EngineState,
    clones: &'a BTreeMap<Namespace, Collection>,
    dropped: &'a BTreeSet<Namespace>,
}

impl StoreRead for SnapshotRead<'_> {
    fn collection(&self, ns: &Namespace) -> Option<&Collection> {
        if let Some(clone) = self.clones.get(ns) {
            return Some(clone);
        }
        if self.dropped.contains(ns) {
            return None;
        }
        self.global.collection(ns)
    }

    fn namespaces(&self, db: &str) -> Vec<Namespace> {
        let mut names: BTreeSet<Namespace> = self
            .global
            .namespaces(db)
            .into_iter()
            .filter(|ns| !self.dropped.contains(ns))
            .collect();
        names.extend(self.clones.keys().filter(|ns| ns.db == db).cloned());
        names.into_iter().collect()
    }
}

struct SnapshotWrite<'a> {
    global: &'a EngineState,
    clones: &'a mut BTreeMap<Namespace, Collection>,
    bases: &'a mut BTreeMap<Namespace, Collection>,
    dropped: &'a mut BTreeSet<Namespace>,
}

impl SnapshotWrite<'_> {
    fn materialize(&mut self, ns: &Namespace) {
        if self.clones.contains_key(ns) {
            return;
        }
        let base = if self.dropped.contains(ns) {
            Collection::default()
        } else {
            self.global.collection(ns).cloned().unwrap_or_default()
        };
        self.bases.insert(ns.clone(), base.clone());
        self.clones.insert(ns.clone(), base);
    }
}

impl StoreRead for SnapshotWrite<'_> {
    fn collection(&self, ns: &Namespace) -> Option<&Collection> {
        if let Some(clone) = self.clones.get(ns) {
            return Some(clone);
        }
        if self.dropped.contains(ns) {
            return None;
        }
        self.global.collection(ns)
    }

    fn namespaces(&self, db: &str) -> Vec<Namespace> {
        let mut names: BTreeSet<Namespace> = self
            .global
            .namespaces(db)
            .into_iter()
            .filter(|ns| !self.dropped.contains(ns))
            .collect();
        names.extend(self.clones.keys().filter(|ns| ns.db == db).cloned());
        names.into_iter().collect()
    }
}

impl StoreWrite for SnapshotWrite<'_> {
    fn collection_mut(&mut self, ns: &Namespace) -> &mut Collection {
        self.materialize(ns);
        self.clones.get_mut(ns).expect("materialized above")
    }

    fn replace_collection(&mut self, ns: &Namespace, collection: Collection) {
        if !self.bases.contains_key(ns) {
            let base = if self.dropped.contains(ns) {
                Collection::default()
            } else {
                self.global.collection(ns).cloned().unwrap_or_default()
            };
            self.bases.insert(ns.clone(), base);
        }
        self.dropped.remove(ns);
        self.clones.insert(ns.clone(), collection);
    }

    fn remove_collection(&mut self, ns: &Namespace) -> bool {
        let existed = self.collection(ns).is_some();
        if !self.bases.contains_key(ns) {
            let base = self.global.collection(ns).cloned().unwrap_or_default();
            self.bases.insert(ns.clone(), base);
        }
        self.clones.remove(ns);
        self.dropped.insert(ns.clone());
        existed
    }

    fn remove_database(&mut self, db: &str) -> usize {
        let doomed = self.namespaces(db);
        for ns in &doomed {
            self.remove_collection(ns);
        }
        doomed.len()
    }

    fn as_read(&self) -> &dyn StoreRead {
        self
    }
}

impl Engine {
    /// Creates a copy-on-write snapshot for a new transaction. Nothing is copied until the
    /// transaction's first write.
    pub fn snapshot_for_transaction(&self) -> TransactionSnapshot {
        TransactionSnapshot::new(self.clone())
    }

    /// Publishes a transaction snapshot into the global store: every touched namespace is merged
    /// at once, preserving concurrent out-of-transaction writes to untouched documents.
    /// Concurrent writes to the same `_id` as a transactional write resolve to the transactional
    /// version. A merge that would violate a unique index fails with `WriteConflict` and leaves
    /// the global store untouched.
    pub fn publish_transaction_snapshot(&self, snapshot: TransactionSnapshot) -> Result<()> {
        let TransactionSnapshot {
            clones,
            bases,
            dropped,
            ..
        } = snapshot;

        self.with_state_mut(|state| {
            // Merge every touched namespace against the current global contents first; nothing
            // is installed until all of them pass their unique-index checks.
            let mut merged: Vec<(Namespace, Collection)> = Vec::with_capacity(clones.len());
            for (ns, working) in &clones {
                let empty = Collection::default();
                let base = bases.get(ns).unwrap_or(&empty);
                let current = if dropped.contains(ns) {
                    Collection::default()
                } else {
                    state.collection(ns).cloned().unwrap_or_default()
                };
                merged.push((ns.clone(), merge_collection(ns, current, base, working)?));
            }

            for ns in &dropped {
                if !clones.contains_key(ns) {
                    state.remove_collection(ns);
                }
            }
            for (ns, collection) in merged {
                state.replace_collection(&ns, collection);
            }
            Ok(())
        })
    }
}

/// Three-way merge of one namespace: `current` (global now) receives the changes between `base`
/// (global at clone time) and `working` (the transaction's copy).
fn merge_collection(
    ns: &Namespace,
    current: Collection,
    base: &Collection,
    working: &Collection,
) -> Result<Collection> {
    let base_ids: BTreeMap<Vec<u8>, &Document> = documents_by_id(base);
    let working_ids: BTreeMap<Vec<u8>, &Document> = documents_by_id(working);

    let mut merged = if working.indexes() != base.indexes() {
        // Index catalog changed inside the transaction: take the transaction's catalog.
        let mut replacement = working.clone();
        retain_documents(&mut replacement, |_| false);
        for doc in current.documents() {
            push_document(&mut replacement, doc.clone());
        }
        replacement
    } else {
        current
    };

    // Deletions: ids present at clone time but gone from the working copy.
    for (id, _) in base_ids.iter() {
        if !working_ids.contains_key(id) {
            retain_documents(&mut merged, |doc| id_key(doc).as_ref() != Some(id));
        }
    }

    // Inserts and modifications, in the working copy's natural order. Documents the transaction
    // left untouched are skipped so concurrent global updates to them survive.
    for doc in working.documents() {
        let id = match id_key(doc) {
            Some(id) => id,
            None => continue,
        };
        let untouched = base_ids
            .get(&id)
            .map(|base_doc| {
                bson_util::bson_eq(
                    &Bson::Document((*base_doc).clone()),
                    &Bson::Document(doc.clone()),
                    None,
                )
            })
            .unwrap_or(false);
        if untouched {
            continue;
        }
        retain_documents(&mut merged, |existing| id_key(existing).as_ref() != Some(&id));
        push_document(&mut merged, doc.clone());
    }

    verify_unique_indexes(ns, &merged)?;
    Ok(merged)
}

fn documents_by_id(collection: &Collection) -> BTreeMap<Vec<u8>, &Document> {
    collection
        .documents()
        .iter()
        .filter_map(|doc| id_key(doc).map(|id| (id, doc)))
        .collect()
}

fn id_key(doc: &Document) -> Option<Vec<u8>> {
    doc.get("_id")
        .and_then(|id| crate::bson::to_vec(&crate::bson::doc! { "_id": id.clone() }).ok())
}

fn retain_documents(collection: &mut Collection, keep: impl Fn(&Document) -> bool) {
    let kept: Vec<Document> = collection
        .documents()
        .iter()
        .filter(|doc| keep(doc))
        .cloned()
        .collect();
    collection.set_documents(kept);
}

fn push_document(collection: &mut Collection, doc: Document) {
    let mut docs = collection.documents().to_vec();
    docs.push(doc);
    collection.set_documents(docs);
}

fn verify_unique_indexes(ns: &Namespace, collection: &Collection) -> Result<()> {
    for index in collection.indexes().iter().filter(|index| index.unique) {
        let mut tuples = Vec::new();
        for doc in collection.documents() {
            if let Some(tuple) = index.key_tuple(doc)? {
                tuples.push(tuple);
            }
        }
        for i in 0..tuples.len() {
            for j in (i + 1)..tuples.len() {
                if index.tuples_equal(&tuples[i], &tuples[j]) {
                    return Err(Error::write_conflict(format!(
                        "WriteConflict error: committing this transaction would violate the \
                         unique index '{}' on {}. Please retry your operation or multi-document \
                         transaction.",
                        index.name, ns
                    )));
                }
            }
        }
    }
    Ok(())
}
