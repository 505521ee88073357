// Shared server state and per-connection message dispatch.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info};
use trellis_common::protocol::error::{
    INVALID_REQUEST, PARSE_ERROR, TRANSACTION_FAILED, UNAUTHENTICATED,
};
use trellis_common::protocol::message::{ClientMessage, ServerMessage};
use trellis_common::types::ClientId;
use uuid::Uuid;

use crate::index::IndexRegistry;
use crate::lock::{ConnId, LockManager, LockOutcome};
use crate::persist::SnapshotDb;
use crate::query::{self, QueryOutput};
use crate::store::{Commit, DocumentStore};
use crate::subscription::SubscriptionManager;
use crate::transaction;

/// Everything guarded by the single mutation lock. Subscriptions and
/// indexes sit beside the store so fan-out always observes exactly the
/// commit that triggered it.
#[derive(Default)]
pub struct ServerInner {
    pub store: DocumentStore,
    pub subscriptions: SubscriptionManager,
    pub locks: LockManager,
    pub indexes: IndexRegistry,
}

/// Shared handle passed to every connection task.
#[derive(Clone, Default)]
pub struct SyncState {
    inner: Arc<RwLock<ServerInner>>,
    snapshot_db: Option<Arc<Mutex<SnapshotDb>>>,
    token: Option<Arc<str>>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the persisted snapshot and write every later commit through.
    pub fn with_persistence(db: SnapshotDb) -> Result<Self> {
        let mut store = DocumentStore::new();
        let documents = db.load_all()?;
        let loaded = documents.len();
        for (path, fields) in documents {
            store.set(&path, fields);
        }
        info!(documents = loaded, "loaded snapshot into document store");

        Ok(Self {
            inner: Arc::new(RwLock::new(ServerInner { store, ..ServerInner::default() })),
            snapshot_db: Some(Arc::new(Mutex::new(db))),
            token: None,
        })
    }

    /// Require this shared-secret token during the hello handshake.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(Arc::from(token.into().as_str()));
        self
    }

    pub async fn document_count(&self) -> usize {
        self.inner.read().await.store.len()
    }
}

/// Per-connection state. Frames to the client flow through `outbound`;
/// change fan-out shares the same channel, so replies and changes stay in
/// dispatch order.
pub struct Session {
    pub conn_id: ConnId,
    pub client_id: Option<ClientId>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
}

impl Session {
    pub fn new(outbound: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { conn_id: Uuid::new_v4(), client_id: None, outbound }
    }

    pub fn send(&self, message: ServerMessage) {
        // A closed channel means the socket task is already gone.
        let _ = self.outbound.send(message);
    }
}

/// Parse and dispatch one raw text frame.
pub async fn handle_frame(state: &SyncState, session: &mut Session, raw: &[u8]) {
    match serde_json::from_slice::<ClientMessage>(raw) {
        Ok(message) => handle_message(state, session, message).await,
        Err(parse_error) => {
            session.send(ServerMessage::error(
                None,
                PARSE_ERROR,
                format!("unreadable frame: {parse_error}"),
            ));
        }
    }
}

pub async fn handle_message(state: &SyncState, session: &mut Session, message: ClientMessage) {
    match message {
        ClientMessage::Hello { token, client_id } => {
            if let Some(expected) = &state.token {
                if token.as_deref() != Some(expected.as_ref()) {
                    session.send(ServerMessage::error(
                        None,
                        UNAUTHENTICATED,
                        "hello token rejected",
                    ));
                    return;
                }
            }
            let client = client_id.unwrap_or_else(Uuid::new_v4);
            session.client_id = Some(client);
            info!(conn = %session.conn_id, client = %client, "client connected");
            session.send(ServerMessage::HelloAck { client_id: client, server_time: Utc::now() });
        }

        ClientMessage::Ping => session.send(ServerMessage::Pong),

        ClientMessage::Query { id, collection, query } => {
            if !require_hello(session, id) {
                return;
            }
            let inner = state.inner.read().await;
            let reply = match query::execute(&inner.store, &inner.indexes, &collection, &query) {
                QueryOutput::Documents(documents) => ServerMessage::QueryResult {
                    id,
                    documents: Some(documents),
                    aggregate: None,
                },
                QueryOutput::Aggregate(aggregate) => ServerMessage::QueryResult {
                    id,
                    documents: None,
                    aggregate: Some(aggregate),
                },
            };
            session.send(reply);
        }

        ClientMessage::Get { id, path } => {
            if !require_hello(session, id) {
                return;
            }
            let inner = state.inner.read().await;
            session.send(ServerMessage::GetResult { id, document: inner.store.get(&path) });
        }

        ClientMessage::Subscribe { id, collection, query } => {
            if !require_hello(session, id) {
                return;
            }
            let mut inner = state.inner.write().await;
            let ServerInner { store, subscriptions, indexes, .. } = &mut *inner;

            let subscription_id = Uuid::new_v4();
            // The result frame goes out before the snapshot burst; both ride
            // the same channel, so the client sees them in this order.
            session.send(ServerMessage::SubscribeResult { id, subscription_id });
            subscriptions.subscribe(
                store,
                indexes,
                session.conn_id,
                session.outbound.clone(),
                subscription_id,
                collection,
                query,
            );
            debug!(conn = %session.conn_id, subscription = %subscription_id, "subscribed");
        }

        ClientMessage::Unsubscribe { id, subscription_id } => {
            if !require_hello(session, id) {
                return;
            }
            let mut inner = state.inner.write().await;
            inner.subscriptions.unsubscribe(session.conn_id, subscription_id);
            session.send(ServerMessage::UnsubscribeResult { id });
        }

        ClientMessage::Transaction { id, operations } => {
            if !require_hello(session, id) {
                return;
            }
            let applied = operations.len();
            let mut inner = state.inner.write().await;
            let ServerInner { store, subscriptions, indexes, .. } = &mut *inner;

            match transaction::apply(store, &operations) {
                Ok(ops) => {
                    for op in &ops {
                        indexes.apply(op);
                    }
                    if let Some(db) = &state.snapshot_db {
                        let db = db.lock().expect("snapshot db mutex poisoned");
                        for op in &ops {
                            if let Err(persist_error) = db.apply(op) {
                                // The in-memory commit already happened;
                                // losing the write-through is logged, not
                                // surfaced to the client.
                                error!(%persist_error, "snapshot write-through failed");
                            }
                        }
                    }
                    let commit = Commit { origin: session.client_id, ops };
                    subscriptions.notify_commit(store, indexes, &commit);
                    session.send(ServerMessage::TransactionResult { id, applied });
                }
                Err(failure) => {
                    session.send(ServerMessage::Error {
                        id: Some(id),
                        code: TRANSACTION_FAILED,
                        message: failure.to_string(),
                        details: Some(json!({ "failedOperation": failure.index })),
                    });
                }
            }
        }

        ClientMessage::Lock { id, path, mode } => {
            let Some(client) = session.client_id else {
                require_hello(session, id);
                return;
            };
            let mut inner = state.inner.write().await;
            let reply = match inner.locks.lock(&path, session.conn_id, client, mode) {
                LockOutcome::Granted => {
                    ServerMessage::LockResult { id, locked: true, holder: None, mode: None }
                }
                LockOutcome::Denied { holder, mode } => ServerMessage::LockResult {
                    id,
                    locked: false,
                    holder: Some(holder),
                    mode: Some(mode),
                },
            };
            session.send(reply);
        }

        ClientMessage::Unlock { id, path } => {
            if !require_hello(session, id) {
                return;
            }
            let mut inner = state.inner.write().await;
            inner.locks.unlock(&path, session.conn_id);
            session.send(ServerMessage::UnlockResult { id });
        }

        ClientMessage::CreateIndex { id, collection, fields } => {
            if !require_hello(session, id) {
                return;
            }
            if fields.is_empty() {
                session.send(ServerMessage::error(
                    Some(id),
                    INVALID_REQUEST,
                    "createIndex requires at least one field",
                ));
                return;
            }
            let mut inner = state.inner.write().await;
            let ServerInner { store, indexes, .. } = &mut *inner;
            let created = indexes.create(store, &collection, &fields);
            session.send(ServerMessage::CreateIndexResult { id, created });
        }
    }
}

/// Release everything the connection owned.
pub async fn disconnect(state: &SyncState, session: &Session) {
    let mut inner = state.inner.write().await;
    inner.subscriptions.remove_connection(session.conn_id);
    inner.locks.release_connection(session.conn_id);
    debug!(conn = %session.conn_id, "connection cleaned up");
}

fn require_hello(session: &Session, id: u64) -> bool {
    if session.client_id.is_some() {
        return true;
    }
    session.send(ServerMessage::error(
        Some(id),
        UNAUTHENTICATED,
        "hello handshake required before requests",
    ));
    false
}
