// Lazy per-level tree loading.
//
// One live subscription per EXPANDED level instead of one for the whole
// tree, so subscription and document counts stay bounded on large trees.
// Collapsing keeps the level subscription alive: re-expanding is instant,
// with no loading flicker.

use std::collections::{BTreeMap, HashMap, HashSet};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use trellis_common::order::sibling_cmp;
use trellis_common::protocol::message::ChangeEvent;
use trellis_common::query::PredicateOp;
use trellis_common::types::{Document, ROOT_SENTINEL, PARENT_FIELD};

use crate::api::Client;
use crate::connection::{ChangeMessage, ClientError};

/// One tree entry as the UI renders it.
#[derive(Debug, Clone, PartialEq)]
pub struct PageNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: Option<String>,
    pub order: f64,
    pub has_children: bool,
}

impl PageNode {
    pub fn from_document(doc: &Document) -> Self {
        Self {
            id: doc.id.clone(),
            parent_id: doc.parent_id().map(str::to_string),
            title: doc.field("title").and_then(|v| v.as_str()).map(str::to_string),
            order: doc.order().unwrap_or(0.0),
            has_children: doc.has_children(),
        }
    }
}

/// Where `navigate_to_page` landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationOutcome {
    /// Every ancestor was expanded; the target is visible in the tree.
    Navigated,
    /// The ancestor chain does not reach the root sentinel; the target is
    /// surfaced via `orphan_page` instead.
    Orphan,
}

/// Pure view state: per-level document maps plus expansion bookkeeping.
#[derive(Debug, Default)]
pub struct TreeState {
    levels: BTreeMap<String, HashMap<String, PageNode>>,
    expanded: HashSet<String>,
    loading: HashSet<String>,
    orphan: Option<PageNode>,
}

impl TreeState {
    /// Fold one subscription event into its level map.
    ///
    /// A document lives in exactly one level's filtered set at a time, and
    /// every `added`/`modified` carries its newest parent link, so landing
    /// in one level evicts the id from every other level. The old level's
    /// trailing `removed` after a move is then a no-op.
    pub fn apply_level_event(&mut self, level: &str, event: &ChangeEvent) {
        match event {
            ChangeEvent::Added { doc } | ChangeEvent::Modified { doc } => {
                for (other, nodes) in &mut self.levels {
                    if other.as_str() != level {
                        nodes.remove(&doc.id);
                    }
                }
                self.levels
                    .entry(level.to_string())
                    .or_default()
                    .insert(doc.id.clone(), PageNode::from_document(doc));
            }
            ChangeEvent::Removed { doc_id } => {
                if let Some(nodes) = self.levels.get_mut(level) {
                    nodes.remove(doc_id);
                }
            }
            ChangeEvent::Aggregate { .. } => {}
        }
    }

    /// All known pages merged into one id map.
    pub fn pages(&self) -> HashMap<String, PageNode> {
        let mut merged: HashMap<String, PageNode> = HashMap::new();
        for nodes in self.levels.values() {
            for (id, node) in nodes {
                merged.insert(id.clone(), node.clone());
            }
        }
        merged
    }

    /// Ids currently known to have children.
    pub fn pages_with_children(&self) -> HashSet<String> {
        self.pages()
            .into_values()
            .filter(|node| node.has_children)
            .map(|node| node.id)
            .collect()
    }

    /// Children of one level in sibling order.
    pub fn children_of(&self, parent: &str) -> Vec<PageNode> {
        let mut children: Vec<PageNode> = self
            .levels
            .get(parent)
            .map(|nodes| nodes.values().cloned().collect())
            .unwrap_or_default();
        children.sort_by(|a, b| sibling_cmp(a.order, &a.id, b.order, &b.id));
        children
    }

    pub fn find(&self, id: &str) -> Option<&PageNode> {
        self.levels.values().find_map(|nodes| nodes.get(id))
    }

    pub fn expanded(&self) -> &HashSet<String> {
        &self.expanded
    }

    pub fn loading_children(&self) -> &HashSet<String> {
        &self.loading
    }

    pub fn orphan_page(&self) -> Option<&PageNode> {
        self.orphan.as_ref()
    }

    fn mark_loading(&mut self, level: &str) {
        self.loading.insert(level.to_string());
    }

    fn finish_loading(&mut self, level: &str) {
        self.loading.remove(level);
        self.expanded.insert(level.to_string());
    }

    fn abort_loading(&mut self, level: &str) {
        self.loading.remove(level);
    }

    fn mark_expanded(&mut self, level: &str) {
        self.expanded.insert(level.to_string());
    }

    fn collapse(&mut self, level: &str) {
        self.expanded.remove(level);
    }

    fn set_orphan(&mut self, node: Option<PageNode>) {
        self.orphan = node;
    }
}

enum ParentLookup {
    /// No such document anywhere.
    Missing,
    /// The document exists; its parent link, when set.
    Parent(Option<String>),
}

/// Drives per-level subscriptions for one hierarchical collection.
pub struct TreeLoader {
    client: Client,
    collection: String,
    state: TreeState,
    events_tx: mpsc::UnboundedSender<(String, ChangeMessage)>,
    events_rx: mpsc::UnboundedReceiver<(String, ChangeMessage)>,
    forwarders: HashMap<String, JoinHandle<()>>,
}

impl TreeLoader {
    pub fn new(client: Client, collection: impl Into<String>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            client,
            collection: collection.into(),
            state: TreeState::default(),
            events_tx,
            events_rx,
            forwarders: HashMap::new(),
        }
    }

    /// Load the top level of the tree.
    pub async fn init(&mut self) -> Result<(), ClientError> {
        self.expand(ROOT_SENTINEL).await
    }

    pub fn state(&self) -> &TreeState {
        &self.state
    }

    /// Expand one node: `Collapsed -> Expanding -> Expanded`. A level whose
    /// subscription is already alive re-expands instantly.
    pub async fn expand(&mut self, parent: &str) -> Result<(), ClientError> {
        if self.forwarders.contains_key(parent) {
            self.state.mark_expanded(parent);
            return Ok(());
        }

        self.state.mark_loading(parent);
        let subscribed = self
            .client
            .collection(self.collection.clone())
            .where_(PARENT_FIELD, PredicateOp::Eq, parent)
            .subscribe()
            .await;
        let mut stream = match subscribed {
            Ok(stream) => stream,
            Err(subscribe_error) => {
                self.state.abort_loading(parent);
                return Err(subscribe_error);
            }
        };

        let level = parent.to_string();
        let events = self.events_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(change) = stream.next().await {
                if events.send((level.clone(), change)).is_err() {
                    break;
                }
            }
        });
        self.forwarders.insert(parent.to_string(), forwarder);
        self.state.finish_loading(parent);
        Ok(())
    }

    /// Collapse keeps the level subscription alive on purpose: a small
    /// memory/bandwidth cost buys flicker-free re-expansion.
    pub fn collapse(&mut self, parent: &str) {
        self.state.collapse(parent);
    }

    pub async fn toggle_expand(&mut self, parent: &str) -> Result<(), ClientError> {
        if self.state.expanded.contains(parent) {
            self.collapse(parent);
            Ok(())
        } else {
            self.expand(parent).await
        }
    }

    /// Fold every already-received level event into the view state.
    pub fn pump(&mut self) {
        while let Ok((level, change)) = self.events_rx.try_recv() {
            self.state.apply_level_event(&level, &change.event);
        }
    }

    /// Wait for at least one level event, then drain the rest. Returns
    /// false when the connection is gone.
    pub async fn next_change(&mut self) -> bool {
        match self.events_rx.recv().await {
            Some((level, change)) => {
                self.state.apply_level_event(&level, &change.event);
                self.pump();
                true
            }
            None => false,
        }
    }

    /// Resolve the target's ancestor chain and expand every ancestor on the
    /// path. A chain that does not terminate at the root sentinel marks the
    /// target as an orphan: surfaced separately, nothing expanded.
    pub async fn navigate_to_page(&mut self, target: &str) -> Result<NavigationOutcome, ClientError> {
        self.pump();

        let mut chain: Vec<String> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut cursor = target.to_string();

        let rooted = loop {
            if !visited.insert(cursor.clone()) {
                // Parent cycle; treat as detached.
                break false;
            }
            match self.parent_of(&cursor).await? {
                ParentLookup::Missing | ParentLookup::Parent(None) => break false,
                ParentLookup::Parent(Some(parent)) if parent == ROOT_SENTINEL => break true,
                ParentLookup::Parent(Some(parent)) => {
                    chain.push(parent.clone());
                    cursor = parent;
                }
            }
        };

        if !rooted {
            let node = self.node_or_fetch(target).await?;
            self.state.set_orphan(node);
            return Ok(NavigationOutcome::Orphan);
        }

        self.state.set_orphan(None);
        self.expand(ROOT_SENTINEL).await?;
        for ancestor in chain.iter().rev() {
            self.expand(ancestor).await?;
        }
        Ok(NavigationOutcome::Navigated)
    }

    /// Parent link of a page, from loaded levels when possible, falling
    /// back to a direct point read for unloaded ancestors.
    async fn parent_of(&mut self, id: &str) -> Result<ParentLookup, ClientError> {
        if let Some(node) = self.state.find(id) {
            return Ok(ParentLookup::Parent(node.parent_id.clone()));
        }
        let doc = self.client.collection(self.collection.clone()).doc(id).get().await?;
        Ok(match doc {
            Some(doc) => ParentLookup::Parent(doc.parent_id().map(str::to_string)),
            None => ParentLookup::Missing,
        })
    }

    async fn node_or_fetch(&mut self, id: &str) -> Result<Option<PageNode>, ClientError> {
        if let Some(node) = self.state.find(id) {
            return Ok(Some(node.clone()));
        }
        let doc = self.client.collection(self.collection.clone()).doc(id).get().await?;
        Ok(doc.as_ref().map(PageNode::from_document))
    }
}

impl Drop for TreeLoader {
    fn drop(&mut self) {
        // Forwarder tasks own the level subscriptions; aborting them drops
        // the streams, which unsubscribe.
        for (_, forwarder) in self.forwarders.drain() {
            forwarder.abort();
        }
    }
}
