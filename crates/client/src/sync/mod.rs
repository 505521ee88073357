// Optimistic sync for one collection: the pure engine plus the async
// driver that wires it to a live connection.

mod engine;
mod recent;
mod slots;

pub use engine::{EditorChange, EntityPhase, OutgoingPatch, RemoteOutcome, SyncEngine};
pub use slots::{PendingPatch, SlotArena};

use std::time::Instant;

use tracing::warn;
use trellis_common::types::{DocPath, Fields, LockMode};

use crate::api::{Client, LockStatus, SubscriptionStream};
use crate::connection::ClientError;

/// State change the UI should render.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncUpdate {
    Applied { id: String, fields: Fields },
    Removed { id: String },
}

/// Drives a [`SyncEngine`] against one collection: editor batches in,
/// reconciled remote updates out.
///
/// Write failures are logged and swallowed; the optimistic state stands
/// and the next snapshot reconciles it.
pub struct CollectionSync {
    client: Client,
    collection: String,
    engine: SyncEngine,
    stream: SubscriptionStream,
    focused: Option<DocPath>,
}

impl CollectionSync {
    /// Subscribe to the collection and start tracking it.
    pub async fn attach(
        client: Client,
        collection: impl Into<String>,
        bulk_field: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let collection = collection.into();
        let config = client.config().clone();
        let engine = SyncEngine::new(
            client.client_id(),
            bulk_field,
            config.debounce,
            config.echo_window,
        );
        let stream = client.collection(collection.clone()).subscribe().await?;
        Ok(Self { client, collection, engine, stream, focused: None })
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Feed one editor change batch; immediate patches go out right away.
    pub async fn edit(&mut self, changes: Vec<EditorChange>) {
        let patches = self.engine.apply_local(&changes, Instant::now());
        for patch in patches {
            self.send_patch(patch).await;
        }
    }

    /// Send every debounce patch whose window has elapsed.
    pub async fn flush_due(&mut self) {
        let patches = self.engine.poll_due(Instant::now());
        for patch in patches {
            self.send_patch(patch).await;
        }
    }

    /// Wait for the next renderable update, firing debounce timers as they
    /// come due. Returns `None` when the connection is gone.
    pub async fn next_update(&mut self) -> Option<SyncUpdate> {
        loop {
            let deadline = self.engine.next_deadline();
            tokio::select! {
                change = self.stream.next() => {
                    let change = change?;
                    match self.engine.apply_remote(
                        change.updated_by,
                        &change.event,
                        Instant::now(),
                    ) {
                        RemoteOutcome::Apply { id, fields } => {
                            return Some(SyncUpdate::Applied { id, fields });
                        }
                        RemoteOutcome::Remove { id } => {
                            return Some(SyncUpdate::Removed { id });
                        }
                        RemoteOutcome::SuppressedEcho
                        | RemoteOutcome::Unchanged
                        | RemoteOutcome::Ignored => continue,
                    }
                }
                _ = sleep_until(deadline) => {
                    self.flush_due().await;
                }
            }
        }
    }

    /// Move edit focus to one entity: soft-lock it, releasing the previous
    /// focus lock.
    pub async fn focus(&mut self, id: &str) -> Result<LockStatus, ClientError> {
        self.blur().await;
        let doc = self.client.collection(self.collection.clone()).doc(id);
        let status = doc.lock(LockMode::Soft).await?;
        if status.locked {
            self.focused = Some(doc.path().clone());
        }
        Ok(status)
    }

    /// Release the focus lock, if any.
    pub async fn blur(&mut self) {
        if let Some(path) = self.focused.take() {
            let doc = self.client.collection(path.collection.clone()).doc(path.doc_id.clone());
            if let Err(unlock_error) = doc.unlock().await {
                warn!(%unlock_error, "failed to release focus lock");
            }
        }
    }

    /// Unmount: release the focus lock and drop the subscription. Pending
    /// debounce timers die with the engine; in-flight writes complete or
    /// fail on their own.
    pub async fn detach(mut self) {
        self.blur().await;
        self.engine.clear();
        // Dropping self drops the stream, which unsubscribes.
    }

    async fn send_patch(&self, patch: OutgoingPatch) {
        let operation = patch.into_operation(&self.collection);
        let result = self.client.batch().push(operation).commit().await;
        if let Err(write_error) = result {
            warn!(%write_error, collection = %self.collection, "local write failed");
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
