// Live query registrations and change fan-out.
//
// Fan-out happens synchronously under the server state lock, into each
// connection's unbounded outbound channel, so every subscription observes
// change events in commit order.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use trellis_common::protocol::message::{ChangeEvent, ServerMessage};
use trellis_common::query::{AggregateResult, QuerySpec};
use trellis_common::types::Document;
use uuid::Uuid;

use crate::index::IndexRegistry;
use crate::lock::ConnId;
use crate::query::{self, QueryOutput};
use crate::store::{Commit, CommittedOp, DocumentStore};

struct Subscription {
    owner: ConnId,
    collection: String,
    query: QuerySpec,
    sender: mpsc::UnboundedSender<ServerMessage>,
    /// Doc ids currently inside the filtered set (document subscriptions).
    matched: HashSet<String>,
    /// Last emitted result (aggregate subscriptions).
    last_aggregate: Option<AggregateResult>,
}

#[derive(Default)]
pub struct SubscriptionManager {
    subs: HashMap<Uuid, Subscription>,
    by_conn: HashMap<ConnId, HashSet<Uuid>>,
}

impl SubscriptionManager {
    /// Register a subscription and emit its initial snapshot: one synthetic
    /// `added` per matching document (sorted), or one `aggregate` event.
    ///
    /// Membership tracking ignores `limit`/`offset`; those shape one-shot
    /// queries, not live sets.
    pub fn subscribe(
        &mut self,
        store: &DocumentStore,
        indexes: &IndexRegistry,
        owner: ConnId,
        sender: mpsc::UnboundedSender<ServerMessage>,
        id: Uuid,
        collection: String,
        query: QuerySpec,
    ) {
        let mut snapshot_spec = query.clone();
        snapshot_spec.limit = None;
        snapshot_spec.offset = None;

        let mut subscription = Subscription {
            owner,
            collection: collection.clone(),
            query,
            sender,
            matched: HashSet::new(),
            last_aggregate: None,
        };

        match query::execute(store, indexes, &collection, &snapshot_spec) {
            QueryOutput::Documents(docs) => {
                for doc in docs {
                    subscription.matched.insert(doc.id.clone());
                    emit(&subscription, id, None, ChangeEvent::Added { doc });
                }
            }
            QueryOutput::Aggregate(result) => {
                emit(&subscription, id, None, ChangeEvent::Aggregate { result: result.clone() });
                subscription.last_aggregate = Some(result);
            }
        }

        self.by_conn.entry(owner).or_default().insert(id);
        self.subs.insert(id, subscription);
    }

    /// Stop a subscription. Unknown ids (or ids owned by someone else) are
    /// accepted silently.
    pub fn unsubscribe(&mut self, owner: ConnId, id: Uuid) {
        let owned = self.subs.get(&id).is_some_and(|sub| sub.owner == owner);
        if owned {
            self.subs.remove(&id);
            if let Some(ids) = self.by_conn.get_mut(&owner) {
                ids.remove(&id);
            }
        }
    }

    /// Tear down everything a connection registered.
    pub fn remove_connection(&mut self, conn: ConnId) {
        if let Some(ids) = self.by_conn.remove(&conn) {
            for id in ids {
                self.subs.remove(&id);
            }
        }
    }

    /// Re-evaluate membership for every subscription touched by a commit.
    pub fn notify_commit(
        &mut self,
        store: &DocumentStore,
        indexes: &IndexRegistry,
        commit: &Commit,
    ) {
        for (id, sub) in &mut self.subs {
            let touched = commit.ops.iter().any(|op| op.path().collection == sub.collection);
            if !touched {
                continue;
            }

            if sub.query.is_aggregate() {
                refresh_aggregate(store, indexes, *id, sub);
                continue;
            }

            for op in &commit.ops {
                if op.path().collection != sub.collection {
                    continue;
                }
                let doc_id = &op.path().doc_id;
                let was_member = sub.matched.contains(doc_id);
                match op {
                    CommittedOp::Upserted { before, after, .. } => {
                        let is_member = query::matches(after, &sub.query.filter);
                        let doc = || Document::new(doc_id.clone(), after.clone());
                        if is_member && !was_member {
                            sub.matched.insert(doc_id.clone());
                            emit(sub, *id, commit.origin, ChangeEvent::Added { doc: doc() });
                        } else if is_member && before.as_ref() != Some(after) {
                            emit(sub, *id, commit.origin, ChangeEvent::Modified { doc: doc() });
                        } else if !is_member && was_member {
                            sub.matched.remove(doc_id);
                            emit(
                                sub,
                                *id,
                                commit.origin,
                                ChangeEvent::Removed { doc_id: doc_id.clone() },
                            );
                        }
                    }
                    CommittedOp::Removed { .. } => {
                        if was_member {
                            sub.matched.remove(doc_id);
                            emit(
                                sub,
                                *id,
                                commit.origin,
                                ChangeEvent::Removed { doc_id: doc_id.clone() },
                            );
                        }
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }
}

fn refresh_aggregate(
    store: &DocumentStore,
    indexes: &IndexRegistry,
    id: Uuid,
    sub: &mut Subscription,
) {
    let QueryOutput::Aggregate(result) =
        query::execute(store, indexes, &sub.collection, &sub.query)
    else {
        return;
    };
    if sub.last_aggregate.as_ref() == Some(&result) {
        return;
    }
    emit(sub, id, None, ChangeEvent::Aggregate { result: result.clone() });
    sub.last_aggregate = Some(result);
}

fn emit(
    sub: &Subscription,
    id: Uuid,
    updated_by: Option<trellis_common::types::ClientId>,
    event: ChangeEvent,
) {
    // A closed channel means the connection is tearing down; cleanup
    // happens in remove_connection.
    let _ = sub.sender.send(ServerMessage::Change {
        subscription_id: id,
        collection: sub.collection.clone(),
        updated_by,
        event,
    });
}
