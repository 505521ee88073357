// Handle API over one sync connection.
//
// `Client` is a cheap clone; every handle funnels into the connection
// actor. Subscriptions are streams, not callbacks: dropping the stream
// unsubscribes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use trellis_common::protocol::message::{ClientMessage, ServerMessage, TxOperation};
use trellis_common::query::{
    AggregateResult, AggregateSpec, FieldPredicate, PredicateOp, QuerySpec, SortSpec,
};
use trellis_common::types::{ClientId, DocPath, Document, FieldValue, Fields, LockMode, PathError};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::connection::{self, ChangeMessage, ClientError, Command, ConnectionActor};

/// Handle to one live sync connection.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    client_id: ClientId,
    next_request_id: Arc<AtomicU64>,
    config: ClientConfig,
}

impl Client {
    /// Dial the server, run the hello handshake, and start the connection
    /// actor.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let (socket, client_id) = connection::connect(&config).await?;
        let next_request_id = Arc::new(AtomicU64::new(1));
        let commands =
            ConnectionActor::spawn(socket, config.heartbeat, Arc::clone(&next_request_id));
        Ok(Self { commands, client_id, next_request_id, config })
    }

    /// Identity assigned during the handshake; `updatedBy` on echoes of our
    /// own writes carries this value.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn collection(&self, name: impl Into<String>) -> CollectionRef {
        CollectionRef { client: self.clone(), name: name.into() }
    }

    /// Handle from a `"collection/docId"` path.
    pub fn reference(&self, path: &str) -> Result<DocRef, PathError> {
        let path = DocPath::try_from(path.to_string())?;
        Ok(DocRef { client: self.clone(), path })
    }

    pub fn batch(&self) -> WriteBatch {
        WriteBatch { client: self.clone(), operations: Vec::new() }
    }

    fn next_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) async fn request(
        &self,
        id: u64,
        frame: ClientMessage,
    ) -> Result<ServerMessage, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Request { id, frame, reply: reply_tx })
            .map_err(|_| ClientError::ConnectionClosed)?;
        reply_rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    pub(crate) async fn subscribe(
        &self,
        collection: String,
        query: QuerySpec,
    ) -> Result<SubscriptionStream, ClientError> {
        let id = self.next_id();
        let frame = ClientMessage::Subscribe { id, collection, query };
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Subscribe { id, frame, reply: reply_tx })
            .map_err(|_| ClientError::ConnectionClosed)?;
        let handle = reply_rx.await.map_err(|_| ClientError::ConnectionClosed)??;
        Ok(SubscriptionStream {
            subscription_id: handle.subscription_id,
            receiver: handle.receiver,
            commands: self.commands.clone(),
        })
    }
}

/// One named collection.
pub struct CollectionRef {
    client: Client,
    name: String,
}

impl CollectionRef {
    pub fn doc(&self, id: impl Into<String>) -> DocRef {
        DocRef { client: self.client.clone(), path: DocPath::new(self.name.clone(), id.into()) }
    }

    pub fn query(&self) -> QueryBuilder {
        QueryBuilder {
            client: self.client.clone(),
            collection: self.name.clone(),
            spec: QuerySpec::default(),
        }
    }

    pub fn where_(
        &self,
        field: impl Into<String>,
        op: PredicateOp,
        value: impl Into<FieldValue>,
    ) -> QueryBuilder {
        self.query().where_(field, op, value)
    }

    pub fn order_by(&self, field: impl Into<String>, ascending: bool) -> QueryBuilder {
        self.query().order_by(field, ascending)
    }

    /// Live stream over the whole collection.
    pub async fn subscribe(&self) -> Result<SubscriptionStream, ClientError> {
        self.query().subscribe().await
    }
}

/// Result of a lock request. Denial is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct LockStatus {
    pub locked: bool,
    pub holder: Option<ClientId>,
    pub mode: Option<LockMode>,
}

/// One addressable document.
#[derive(Clone)]
pub struct DocRef {
    client: Client,
    path: DocPath,
}

impl DocRef {
    pub fn path(&self) -> &DocPath {
        &self.path
    }

    pub async fn get(&self) -> Result<Option<Document>, ClientError> {
        let id = self.client.next_id();
        match self.client.request(id, ClientMessage::Get { id, path: self.path.clone() }).await? {
            ServerMessage::GetResult { document, .. } => Ok(document),
            other => Err(ClientError::Protocol(format!("get answered with {other:?}"))),
        }
    }

    /// Create the document; fails when the id already exists.
    pub async fn create(&self, fields: Fields) -> Result<(), ClientError> {
        self.commit_one(TxOperation::Create { path: self.path.clone(), data: fields }).await
    }

    /// Replace the full field map, creating the document if needed.
    pub async fn set(&self, fields: Fields) -> Result<(), ClientError> {
        self.commit_one(TxOperation::Replace { path: self.path.clone(), data: fields }).await
    }

    /// Merge fields into an existing document.
    pub async fn update(&self, fields: Fields) -> Result<(), ClientError> {
        self.commit_one(TxOperation::Update { path: self.path.clone(), data: fields }).await
    }

    pub async fn delete(&self) -> Result<(), ClientError> {
        self.commit_one(TxOperation::Delete { path: self.path.clone() }).await
    }

    pub async fn lock(&self, mode: LockMode) -> Result<LockStatus, ClientError> {
        let id = self.client.next_id();
        let frame = ClientMessage::Lock { id, path: self.path.clone(), mode };
        match self.client.request(id, frame).await? {
            ServerMessage::LockResult { locked, holder, mode, .. } => {
                Ok(LockStatus { locked, holder, mode })
            }
            other => Err(ClientError::Protocol(format!("lock answered with {other:?}"))),
        }
    }

    pub async fn unlock(&self) -> Result<(), ClientError> {
        let id = self.client.next_id();
        let frame = ClientMessage::Unlock { id, path: self.path.clone() };
        match self.client.request(id, frame).await? {
            ServerMessage::UnlockResult { .. } => Ok(()),
            other => Err(ClientError::Protocol(format!("unlock answered with {other:?}"))),
        }
    }

    async fn commit_one(&self, operation: TxOperation) -> Result<(), ClientError> {
        let id = self.client.next_id();
        let frame = ClientMessage::Transaction { id, operations: vec![operation] };
        match self.client.request(id, frame).await? {
            ServerMessage::TransactionResult { .. } => Ok(()),
            other => Err(ClientError::Protocol(format!("write answered with {other:?}"))),
        }
    }
}

/// Filter/sort/limit builder terminating in a one-shot fetch or a live
/// subscription.
pub struct QueryBuilder {
    client: Client,
    collection: String,
    spec: QuerySpec,
}

impl QueryBuilder {
    pub fn where_(
        mut self,
        field: impl Into<String>,
        op: PredicateOp,
        value: impl Into<FieldValue>,
    ) -> Self {
        self.spec.filter.push(FieldPredicate::new(field, op, value));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, ascending: bool) -> Self {
        let field = field.into();
        self.spec.sort.push(if ascending {
            SortSpec::asc(field)
        } else {
            SortSpec::desc(field)
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.spec.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.spec.offset = Some(offset);
        self
    }

    pub fn aggregate(mut self, spec: AggregateSpec) -> Self {
        self.spec.aggregate = Some(spec);
        self
    }

    /// One-shot evaluation.
    pub async fn fetch(&self) -> Result<Vec<Document>, ClientError> {
        let id = self.client.next_id();
        let frame = ClientMessage::Query {
            id,
            collection: self.collection.clone(),
            query: self.spec.clone(),
        };
        match self.client.request(id, frame).await? {
            ServerMessage::QueryResult { documents: Some(documents), .. } => Ok(documents),
            other => Err(ClientError::Protocol(format!("query answered with {other:?}"))),
        }
    }

    /// One-shot aggregate evaluation; requires an aggregate spec.
    pub async fn fetch_aggregate(&self) -> Result<AggregateResult, ClientError> {
        let id = self.client.next_id();
        let frame = ClientMessage::Query {
            id,
            collection: self.collection.clone(),
            query: self.spec.clone(),
        };
        match self.client.request(id, frame).await? {
            ServerMessage::QueryResult { aggregate: Some(aggregate), .. } => Ok(aggregate),
            other => Err(ClientError::Protocol(format!("aggregate answered with {other:?}"))),
        }
    }

    /// Live stream: the full matching set as `added` events, then
    /// incremental changes until the stream is dropped.
    pub async fn subscribe(self) -> Result<SubscriptionStream, ClientError> {
        self.client.subscribe(self.collection, self.spec).await
    }
}

/// Cancellable change stream. Dropping it unsubscribes on the server.
pub struct SubscriptionStream {
    subscription_id: Uuid,
    receiver: mpsc::UnboundedReceiver<ChangeMessage>,
    commands: mpsc::UnboundedSender<Command>,
}

impl SubscriptionStream {
    pub fn id(&self) -> Uuid {
        self.subscription_id
    }

    /// Next change; `None` when the connection is gone.
    pub async fn next(&mut self) -> Option<ChangeMessage> {
        self.receiver.recv().await
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        let _ = self
            .commands
            .send(Command::Unsubscribe { subscription_id: self.subscription_id });
    }
}

/// Accumulates operations committed as one atomic transaction.
pub struct WriteBatch {
    client: Client,
    operations: Vec<TxOperation>,
}

impl WriteBatch {
    pub fn create(mut self, doc: &DocRef, fields: Fields) -> Self {
        self.operations.push(TxOperation::Create { path: doc.path().clone(), data: fields });
        self
    }

    pub fn update(mut self, doc: &DocRef, fields: Fields) -> Self {
        self.operations.push(TxOperation::Update { path: doc.path().clone(), data: fields });
        self
    }

    pub fn set(mut self, doc: &DocRef, fields: Fields) -> Self {
        self.operations.push(TxOperation::Replace { path: doc.path().clone(), data: fields });
        self
    }

    pub fn delete(mut self, doc: &DocRef) -> Self {
        self.operations.push(TxOperation::Delete { path: doc.path().clone() });
        self
    }

    pub fn push(mut self, operation: TxOperation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Commit every queued operation atomically. Returns the applied count.
    pub async fn commit(self) -> Result<usize, ClientError> {
        let id = self.client.next_id();
        let frame = ClientMessage::Transaction { id, operations: self.operations };
        match self.client.request(id, frame).await? {
            ServerMessage::TransactionResult { applied, .. } => Ok(applied),
            other => Err(ClientError::Protocol(format!("transaction answered with {other:?}"))),
        }
    }
}
