// trellis-client: connection actor, handle API, optimistic sync engine, and
// lazy tree loading for the Trellis document store.

pub mod api;
pub mod config;
pub mod connection;
pub mod sync;
pub mod tree;

pub use api::{Client, CollectionRef, DocRef, LockStatus, QueryBuilder, SubscriptionStream, WriteBatch};
pub use config::ClientConfig;
pub use connection::{ChangeMessage, ClientError};
