// Equality indexes over collection fields.
//
// `createIndex` registers one index per listed field. Each index is a BTree
// of field key -> doc-id set, maintained on every commit and used to seed
// the candidate set when a query carries an equality predicate on an
// indexed field.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use trellis_common::query::{FieldPredicate, PredicateOp};
use trellis_common::types::FieldKey;

use crate::store::{CommittedOp, DocumentStore};

#[derive(Debug, Default)]
pub struct IndexRegistry {
    indexes: HashMap<(String, String), BTreeMap<FieldKey, BTreeSet<String>>>,
}

impl IndexRegistry {
    /// Register indexes for `fields`, backfilling from the current store.
    ///
    /// Returns false when every listed field was already indexed.
    pub fn create(&mut self, store: &DocumentStore, collection: &str, fields: &[String]) -> bool {
        let mut created = false;
        for field in fields {
            let key = (collection.to_string(), field.clone());
            if self.indexes.contains_key(&key) {
                continue;
            }

            let mut entries: BTreeMap<FieldKey, BTreeSet<String>> = BTreeMap::new();
            for doc in store.documents_in(collection) {
                if let Some(value) = doc.fields.get(field) {
                    entries.entry(FieldKey::of(value)).or_default().insert(doc.id.clone());
                }
            }
            self.indexes.insert(key, entries);
            created = true;
        }
        created
    }

    /// Fold one committed mutation into every affected index.
    pub fn apply(&mut self, op: &CommittedOp) {
        let path = op.path();
        for ((collection, field), entries) in &mut self.indexes {
            if *collection != path.collection {
                continue;
            }
            match op {
                CommittedOp::Upserted { before, after, .. } => {
                    if let Some(old) = before.as_ref().and_then(|fields| fields.get(field)) {
                        detach(entries, &FieldKey::of(old), &path.doc_id);
                    }
                    if let Some(new) = after.get(field) {
                        entries
                            .entry(FieldKey::of(new))
                            .or_default()
                            .insert(path.doc_id.clone());
                    }
                }
                CommittedOp::Removed { before, .. } => {
                    if let Some(old) = before.get(field) {
                        detach(entries, &FieldKey::of(old), &path.doc_id);
                    }
                }
            }
        }
    }

    /// Doc ids matching the first indexed equality predicate, when any.
    ///
    /// `None` means no index applies and the caller must scan the
    /// collection; `Some` is a candidate superset still subject to the full
    /// filter.
    pub fn candidates(
        &self,
        collection: &str,
        filter: &[FieldPredicate],
    ) -> Option<BTreeSet<String>> {
        for predicate in filter {
            if predicate.op != PredicateOp::Eq {
                continue;
            }
            let key = (collection.to_string(), predicate.field.clone());
            if let Some(entries) = self.indexes.get(&key) {
                return Some(
                    entries.get(&FieldKey::of(&predicate.value)).cloned().unwrap_or_default(),
                );
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }
}

fn detach(entries: &mut BTreeMap<FieldKey, BTreeSet<String>>, key: &FieldKey, doc_id: &str) {
    if let Some(ids) = entries.get_mut(key) {
        ids.remove(doc_id);
        if ids.is_empty() {
            entries.remove(key);
        }
    }
}
