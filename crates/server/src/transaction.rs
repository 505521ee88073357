// Atomic application of transaction batches.
//
// Two phases: every operation is validated against the store plus the
// effects of the operations before it in the same batch, and only then is
// anything written. A failed batch therefore leaves the store untouched.

use std::collections::HashMap;

use thiserror::Error;
use trellis_common::protocol::message::TxOperation;
use trellis_common::types::DocPath;

use crate::store::{CommittedOp, DocumentStore};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TxError {
    #[error("document `{0}` already exists")]
    AlreadyExists(DocPath),
    #[error("document `{0}` does not exist")]
    NotFound(DocPath),
}

/// The first failing operation of a rejected batch.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("operation {index} failed: {error}")]
pub struct TxFailure {
    pub index: usize,
    pub error: TxError,
}

/// Apply `operations` as one atomic unit.
///
/// Returns the committed ops in batch order. `delete` of a missing document
/// validates fine and commits nothing.
pub fn apply(
    store: &mut DocumentStore,
    operations: &[TxOperation],
) -> Result<Vec<CommittedOp>, TxFailure> {
    // Existence overlay: later operations see the effects of earlier ones.
    let mut overlay: HashMap<&DocPath, bool> = HashMap::new();
    for (index, op) in operations.iter().enumerate() {
        let path = op.path();
        let exists = overlay.get(path).copied().unwrap_or_else(|| store.contains(path));
        match op {
            TxOperation::Create { .. } if exists => {
                return Err(TxFailure { index, error: TxError::AlreadyExists(path.clone()) });
            }
            TxOperation::Update { .. } if !exists => {
                return Err(TxFailure { index, error: TxError::NotFound(path.clone()) });
            }
            TxOperation::Create { .. } | TxOperation::Update { .. } | TxOperation::Replace { .. } => {
                overlay.insert(path, true);
            }
            TxOperation::Delete { .. } => {
                overlay.insert(path, false);
            }
        }
    }

    let mut committed = Vec::with_capacity(operations.len());
    for op in operations {
        match op {
            TxOperation::Create { path, data } => {
                let before = store.set(path, data.clone());
                committed.push(CommittedOp::Upserted {
                    path: path.clone(),
                    before,
                    after: data.clone(),
                });
            }
            TxOperation::Update { path, data } => {
                let before = store.fields(path).cloned().unwrap_or_default();
                let mut after = before.clone();
                for (field, value) in data {
                    after.insert(field.clone(), value.clone());
                }
                store.set(path, after.clone());
                committed.push(CommittedOp::Upserted {
                    path: path.clone(),
                    before: Some(before),
                    after,
                });
            }
            TxOperation::Replace { path, data } => {
                let before = store.set(path, data.clone());
                committed.push(CommittedOp::Upserted {
                    path: path.clone(),
                    before,
                    after: data.clone(),
                });
            }
            TxOperation::Delete { path } => {
                if let Some(before) = store.remove(path) {
                    committed.push(CommittedOp::Removed { path: path.clone(), before });
                }
            }
        }
    }

    Ok(committed)
}
