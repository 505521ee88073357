// Message types for the trellis-sync.v1 WebSocket protocol.
//
// One JSON text frame per message. Requests carry a client-chosen integer
// `id` correlated to exactly one reply; `change` frames are unsolicited and
// keyed by `subscriptionId` instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::query::{AggregateResult, QuerySpec};
use crate::types::{ClientId, DocPath, Document, Fields, LockMode};

/// Client -> server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Initial handshake; must be the first frame on the connection.
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        /// Client-supplied identity for reconnects; the server assigns a
        /// fresh one when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<ClientId>,
    },
    Query {
        id: u64,
        collection: String,
        #[serde(default)]
        query: QuerySpec,
    },
    Get {
        id: u64,
        path: DocPath,
    },
    Subscribe {
        id: u64,
        collection: String,
        #[serde(default)]
        query: QuerySpec,
    },
    Unsubscribe {
        id: u64,
        subscription_id: Uuid,
    },
    Transaction {
        id: u64,
        operations: Vec<TxOperation>,
    },
    Lock {
        id: u64,
        path: DocPath,
        mode: LockMode,
    },
    Unlock {
        id: u64,
        path: DocPath,
    },
    CreateIndex {
        id: u64,
        collection: String,
        fields: Vec<String>,
    },
    /// Heartbeat; no side effects.
    Ping,
}

/// Server -> client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    HelloAck {
        client_id: ClientId,
        server_time: DateTime<Utc>,
    },
    QueryResult {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        documents: Option<Vec<Document>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aggregate: Option<AggregateResult>,
    },
    GetResult {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        document: Option<Document>,
    },
    SubscribeResult {
        id: u64,
        subscription_id: Uuid,
    },
    UnsubscribeResult {
        id: u64,
    },
    TransactionResult {
        id: u64,
        /// Number of operations applied (all of them, on success).
        applied: usize,
    },
    LockResult {
        id: u64,
        locked: bool,
        /// Present when the lock was denied: who holds it, and how.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        holder: Option<ClientId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<LockMode>,
    },
    UnlockResult {
        id: u64,
    },
    CreateIndexResult {
        id: u64,
        /// False when an identical index already existed.
        created: bool,
    },
    Error {
        /// Echo of the failing request id, absent for connection-level
        /// errors.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        code: i32,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    /// Unsolicited subscription update.
    Change {
        subscription_id: Uuid,
        collection: String,
        /// Client that caused the commit; absent for aggregate refreshes
        /// and server-initiated changes.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_by: Option<ClientId>,
        event: ChangeEvent,
    },
    Pong,
}

impl ServerMessage {
    /// Request id this frame answers, when it is a reply.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::QueryResult { id, .. }
            | Self::GetResult { id, .. }
            | Self::SubscribeResult { id, .. }
            | Self::UnsubscribeResult { id }
            | Self::TransactionResult { id, .. }
            | Self::LockResult { id, .. }
            | Self::UnlockResult { id }
            | Self::CreateIndexResult { id, .. } => Some(*id),
            Self::Error { id, .. } => *id,
            Self::HelloAck { .. } | Self::Change { .. } | Self::Pong => None,
        }
    }

    pub fn error(id: Option<u64>, code: i32, message: impl Into<String>) -> Self {
        Self::Error { id, code, message: message.into(), details: None }
    }
}

/// One subscription event.
///
/// `removed` intentionally carries no document payload; consumers resolve
/// deletion from the event kind, not from payload presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ChangeEvent {
    Added { doc: Document },
    Modified { doc: Document },
    Removed { doc_id: String },
    /// Recomputed result of an aggregate subscription.
    Aggregate { result: AggregateResult },
}

/// One operation inside a transaction batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TxOperation {
    /// Fails when the target id already exists.
    Create { path: DocPath, data: Fields },
    /// Merges fields into an existing document; fails when it is missing.
    Update { path: DocPath, data: Fields },
    /// Replaces the full field map, creating the document if needed.
    Replace { path: DocPath, data: Fields },
    /// Succeeds even when the target is already gone.
    Delete { path: DocPath },
}

impl TxOperation {
    pub fn path(&self) -> &DocPath {
        match self {
            Self::Create { path, .. }
            | Self::Update { path, .. }
            | Self::Replace { path, .. }
            | Self::Delete { path } => path,
        }
    }
}
