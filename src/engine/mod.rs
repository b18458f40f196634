//! The in-memory document engine: collections, indexes, filter matching, updates, and the
//! aggregation pipeline.

pub(crate) mod aggregate;
mod collection;
mod index;
pub(crate) mod matcher;
pub(crate) mod update;


use std::{collections::BTreeMap, sync::Arc};

use parking_lot::RwLock;

use crate::Namespace;

pub(crate) use self::{
    collection::{Collection, FindOptions, UpdateOutcome},
    index::IndexDescriptor,
};

/// Read access to a set of collections: either the global store or a transactional snapshot.
pub(crate) trait StoreRead {
    /// Looks up a collection by namespace.
    fn collection(&self, ns: &Namespace) -> Option<&Collection>;

    /// Lists the namespaces of a database in name order.
    fn namespaces(&self, db: &str) -> Vec<Namespace>;
}

/// Write access to a set of collections. Writers retain read access so multi-collection
/// operations (aggregation with `$lookup`, `$out`) can run under a single lock acquisition.
pub(crate) trait StoreWrite: StoreRead {
    /// Returns the collection for `ns`, creating it implicitly if absent.
    fn collection_mut(&mut self, ns: &Namespace) -> &mut Collection;

    /// Replaces the entire contents of `ns` (used by `$out`).
    fn replace_collection(&mut self, ns: &Namespace, collection: Collection);

    /// Removes a collection. Returns whether it existed.
    fn remove_collection(&mut self, ns: &Namespace) -> bool;

    /// Removes every collection of `db`, returning how many were dropped.
    fn remove_database(&mut self, db: &str) -> usize;

    /// This writer viewed as a plain reader, so pipeline runs can borrow it under a write lock.
    fn as_read(&self) -> &dyn StoreRead;
}

/// The process-wide engine: the shared map of namespaces to collections, guarded by a single
/// reader-writer lock. All handler access goes through short-lived [`read`](Engine::read) /
/// [`write`](Engine::write) closures so no lock guard outlives a command.
#[derive(Clone, Debug, Default)]
pub struct Engine {
    state: Arc<RwLock<EngineState>>,
}

#[derive(Debug, Default)]
pub(crate) struct EngineState {
    collections: BTreeMap<Namespace, Collection>,
}

impl StoreRead for EngineState {
    fn collection(&self, ns: &Namespace) -> Option<&Collection> {
        self.collections.get(ns)
    }

    fn namespaces(&self, db: &str) -> Vec<Namespace> {
        self.collections
            .keys()
            .filter(|ns| ns.db == db)
            .cloned()
            .collect()
    }
}

impl StoreWrite for EngineState {
    fn collection_mut(&mut self, ns: &Namespace) -> &mut Collection {
        self.collections.entry(ns.clone()).or_default()
    }

    fn replace_collection(&mut self, ns: &Namespace, collection: Collection) {
        self.collections.insert(ns.clone(), collection);
    }

    fn remove_collection(&mut self, ns: &Namespace) -> bool {
        self.collections.remove(ns).is_some()
    }

    fn remove_database(&mut self, db: &str) -> usize {
        let doomed: Vec<Namespace> = self.namespaces(db);
        for ns in &doomed {
            self.collections.remove(ns);
        }
        doomed.len()
    }

    fn as_read(&self) -> &dyn StoreRead {
        self
    }
}

impl Engine {
    /// Creates an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with shared read access to the global store.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&dyn StoreRead) -> T) -> T {
        let state = self.state.read();
        f(&*state)
    }

    /// Runs `f` with exclusive write access to the global store.
    pub(crate) fn write<T>(&self, f: impl FnOnce(&mut dyn StoreWrite) -> T) -> T {
        let mut state = self.state.write();
        f(&mut *state)
    }

    /// Runs `f` with exclusive access to the raw engine state. Reserved for transaction commit,
    /// which needs to see the state as a whole.
    pub(crate) fn with_state_mut<T>(&self, f: impl FnOnce(&mut EngineState) -> T) -> T {
        let mut state = self.state.write();
        f(&mut state)
    }

    /// Runs `f` with shared access to the raw engine state.
    pub(crate) fn with_state<T>(&self, f: impl FnOnce(&EngineState) -> T) -> T {
        let state = self.state.read();
        f(&state)
    }
}
