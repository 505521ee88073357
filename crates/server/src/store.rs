// Authoritative in-memory document store.
//
// Collections are flat maps of doc id -> field map. The store itself is
// schema-free and lock-free; callers serialize mutations behind the server
// state lock so subscription re-evaluation always observes exactly the
// commit that triggered it.

use std::collections::{BTreeMap, HashMap};

use trellis_common::types::{ClientId, DocPath, Document, Fields};

/// One mutation that made it into the store.
#[derive(Debug, Clone, PartialEq)]
pub enum CommittedOp {
    Upserted {
        path: DocPath,
        /// Field map before the write; `None` for a fresh create.
        before: Option<Fields>,
        after: Fields,
    },
    Removed {
        path: DocPath,
        before: Fields,
    },
}

impl CommittedOp {
    pub fn path(&self) -> &DocPath {
        match self {
            Self::Upserted { path, .. } | Self::Removed { path, .. } => path,
        }
    }
}

/// An atomically applied batch, stamped with the originating client.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub origin: Option<ClientId>,
    pub ops: Vec<CommittedOp>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentStore {
    collections: HashMap<String, BTreeMap<String, Fields>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &DocPath) -> bool {
        self.collections
            .get(&path.collection)
            .is_some_and(|docs| docs.contains_key(&path.doc_id))
    }

    pub fn fields(&self, path: &DocPath) -> Option<&Fields> {
        self.collections.get(&path.collection)?.get(&path.doc_id)
    }

    pub fn get(&self, path: &DocPath) -> Option<Document> {
        self.fields(path).map(|fields| Document::new(path.doc_id.clone(), fields.clone()))
    }

    /// All documents of one collection, in id order.
    pub fn documents_in(&self, collection: &str) -> Vec<Document> {
        self.collections
            .get(collection)
            .map(|docs| {
                docs.iter().map(|(id, fields)| Document::new(id.clone(), fields.clone())).collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.collections.values().map(BTreeMap::len).sum()
    }

    /// Write the full field map for a document, returning the previous one.
    pub(crate) fn set(&mut self, path: &DocPath, fields: Fields) -> Option<Fields> {
        self.collections
            .entry(path.collection.clone())
            .or_default()
            .insert(path.doc_id.clone(), fields)
    }

    pub(crate) fn remove(&mut self, path: &DocPath) -> Option<Fields> {
        let docs = self.collections.get_mut(&path.collection)?;
        let removed = docs.remove(&path.doc_id);
        if docs.is_empty() {
            self.collections.remove(&path.collection);
        }
        removed
    }
}
