// SQLite snapshot of the document set.
//
// The wire protocol treats durability as opaque; this is the backing store
// the server owns. One row per document, JSON-encoded fields, loaded fully
// into memory at startup and written through on every commit.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use trellis_common::types::{DocPath, Fields};

use crate::store::CommittedOp;

#[derive(Debug)]
pub struct SnapshotDb {
    conn: Connection,
}

impl SnapshotDb {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open snapshot db at `{}`", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL on snapshot db")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                doc_id     TEXT NOT NULL,
                fields     TEXT NOT NULL,
                PRIMARY KEY (collection, doc_id)
            )",
        )
        .context("failed to create documents table")?;
        Ok(Self { conn })
    }

    /// In-memory database, for tests and `--ephemeral` runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory snapshot db")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                doc_id     TEXT NOT NULL,
                fields     TEXT NOT NULL,
                PRIMARY KEY (collection, doc_id)
            )",
        )
        .context("failed to create documents table")?;
        Ok(Self { conn })
    }

    /// Every persisted document.
    pub fn load_all(&self) -> Result<Vec<(DocPath, Fields)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT collection, doc_id, fields FROM documents")
            .context("failed to prepare snapshot load query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })
            .context("failed to query persisted documents")?;

        let mut documents = Vec::new();
        for row in rows {
            let (collection, doc_id, raw) = row.context("failed to decode document row")?;
            let fields: Fields = serde_json::from_str(&raw).with_context(|| {
                format!("invalid persisted fields for `{collection}/{doc_id}`")
            })?;
            documents.push((DocPath::new(collection, doc_id), fields));
        }
        Ok(documents)
    }

    /// Write one committed mutation through.
    pub fn apply(&self, op: &CommittedOp) -> Result<()> {
        match op {
            CommittedOp::Upserted { path, after, .. } => self.upsert(path, after),
            CommittedOp::Removed { path, .. } => self.delete(path),
        }
    }

    fn upsert(&self, path: &DocPath, fields: &Fields) -> Result<()> {
        let encoded = serde_json::to_string(fields)
            .with_context(|| format!("failed to encode fields for `{path}`"))?;
        self.conn
            .execute(
                "INSERT INTO documents (collection, doc_id, fields) VALUES (?1, ?2, ?3)
                 ON CONFLICT(collection, doc_id) DO UPDATE SET fields = excluded.fields",
                params![path.collection, path.doc_id, encoded],
            )
            .with_context(|| format!("failed to upsert `{path}` in snapshot db"))?;
        Ok(())
    }

    fn delete(&self, path: &DocPath) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM documents WHERE collection = ?1 AND doc_id = ?2",
                params![path.collection, path.doc_id],
            )
            .with_context(|| format!("failed to delete `{path}` from snapshot db"))?;
        Ok(())
    }
}
