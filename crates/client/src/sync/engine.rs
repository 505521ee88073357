// Optimistic write engine for one collection of entities.
//
// Tracks a shadow copy of every observed entity and turns editor change
// batches into minimal outgoing patches: content-only edits debounce
// through the slot arena, discrete-field edits go out immediately, and
// structural moves carry a freshly computed fractional order. Remote
// changes merge back in unless they are echoes of our own writes.
//
// The engine is pure and clock-injectable; the async driver in the parent
// module wires it to a live connection.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use trellis_common::order::order_between;
use trellis_common::protocol::message::{ChangeEvent, TxOperation};
use trellis_common::types::{ClientId, DocPath, FieldValue, Fields, ORDER_FIELD, PARENT_FIELD};

use super::recent::RecentWrites;
use super::slots::SlotArena;

/// One change reported by the editing surface.
#[derive(Debug, Clone, PartialEq)]
pub enum EditorChange {
    Insert { id: String, fields: Fields },
    Update { id: String, fields: Fields },
    /// Drag/drop or indent/outdent. `prev_order`/`next_order` are the order
    /// values of the siblings around the drop position.
    Move { id: String, parent_id: String, prev_order: Option<f64>, next_order: Option<f64> },
    Delete { id: String },
}

impl EditorChange {
    fn id(&self) -> &str {
        match self {
            Self::Insert { id, .. }
            | Self::Update { id, .. }
            | Self::Move { id, .. }
            | Self::Delete { id } => id,
        }
    }

    fn is_structural(&self) -> bool {
        matches!(self, Self::Move { .. } | Self::Delete { .. })
    }
}

/// A write ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingPatch {
    Create { id: String, fields: Fields },
    /// Minimal field diff; removed fields arrive as explicit nulls.
    Update { id: String, fields: Fields },
    Delete { id: String },
}

impl OutgoingPatch {
    pub fn doc_id(&self) -> &str {
        match self {
            Self::Create { id, .. } | Self::Update { id, .. } | Self::Delete { id } => id,
        }
    }

    pub fn into_operation(self, collection: &str) -> TxOperation {
        match self {
            Self::Create { id, fields } => {
                TxOperation::Create { path: DocPath::new(collection, id), data: fields }
            }
            Self::Update { id, fields } => {
                TxOperation::Update { path: DocPath::new(collection, id), data: fields }
            }
            Self::Delete { id } => TxOperation::Delete { path: DocPath::new(collection, id) },
        }
    }
}

/// What a remote change means for the rendered state.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    /// Our own write echoed back inside the suppression window; drop it.
    SuppressedEcho,
    /// Apply these fields; they differ from the rendered state.
    Apply { id: String, fields: Fields },
    /// The entity is gone.
    Remove { id: String },
    /// Values already match; no UI churn.
    Unchanged,
    /// Not an entity event (aggregate refresh).
    Ignored,
}

/// Lifecycle phase of one tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityPhase {
    Unknown,
    Tracked,
    /// A content patch is waiting on its debounce window.
    DebouncePending,
}

pub struct SyncEngine {
    client_id: ClientId,
    bulk_field: String,
    arena: SlotArena,
    recent: RecentWrites,
    shadows: HashMap<String, Fields>,
}

impl SyncEngine {
    pub fn new(
        client_id: ClientId,
        bulk_field: impl Into<String>,
        debounce: Duration,
        echo_window: Duration,
    ) -> Self {
        Self {
            client_id,
            bulk_field: bulk_field.into(),
            arena: SlotArena::new(debounce),
            recent: RecentWrites::new(echo_window),
            shadows: HashMap::new(),
        }
    }

    pub fn phase(&self, id: &str) -> EntityPhase {
        if self.arena.is_pending(id) {
            EntityPhase::DebouncePending
        } else if self.shadows.contains_key(id) {
            EntityPhase::Tracked
        } else {
            EntityPhase::Unknown
        }
    }

    /// Shadow state of one entity, when tracked.
    pub fn shadow(&self, id: &str) -> Option<&Fields> {
        self.shadows.get(id)
    }

    /// Turn one editor change batch into outgoing patches.
    ///
    /// Structural changes (move, delete) run first and claim their entity
    /// id for the whole batch: a move's explicit order wins over whatever a
    /// generic update in the same batch would have implied.
    pub fn apply_local(&mut self, changes: &[EditorChange], now: Instant) -> Vec<OutgoingPatch> {
        let mut patches = Vec::new();
        let mut handled: HashSet<String> = HashSet::new();

        for change in changes.iter().filter(|change| change.is_structural()) {
            if !handled.insert(change.id().to_string()) {
                continue;
            }
            match change {
                EditorChange::Move { id, parent_id, prev_order, next_order } => {
                    self.local_move(id, parent_id, *prev_order, *next_order, now, &mut patches);
                }
                EditorChange::Delete { id } => {
                    self.arena.cancel(id);
                    self.shadows.remove(id);
                    self.recent.record(id, now);
                    patches.push(OutgoingPatch::Delete { id: id.clone() });
                }
                EditorChange::Insert { .. } | EditorChange::Update { .. } => unreachable!(),
            }
        }

        for change in changes.iter().filter(|change| !change.is_structural()) {
            if !handled.insert(change.id().to_string()) {
                continue;
            }
            match change {
                EditorChange::Insert { id, fields } | EditorChange::Update { id, fields } => {
                    if self.shadows.contains_key(id) {
                        self.classify_update(id, fields, now, &mut patches);
                    } else {
                        // First observation of a locally born entity.
                        self.shadows.insert(id.clone(), fields.clone());
                        self.recent.record(id, now);
                        patches.push(OutgoingPatch::Create { id: id.clone(), fields: fields.clone() });
                    }
                }
                EditorChange::Move { .. } | EditorChange::Delete { .. } => unreachable!(),
            }
        }

        patches
    }

    /// Fire elapsed debounce timers into consolidated patches, each diffed
    /// against the baseline captured when its entity first went dirty.
    pub fn poll_due(&mut self, now: Instant) -> Vec<OutgoingPatch> {
        self.arena
            .drain_due(now)
            .into_iter()
            .filter_map(|pending| {
                let diff = diff_fields(&pending.baseline, &pending.latest);
                if diff.is_empty() {
                    return None;
                }
                self.shadows.insert(pending.entity.clone(), pending.latest);
                self.recent.record(&pending.entity, now);
                Some(OutgoingPatch::Update { id: pending.entity, fields: diff })
            })
            .collect()
    }

    /// Deadline of the earliest pending debounce timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.arena.next_deadline()
    }

    /// Merge one server-pushed change.
    pub fn apply_remote(
        &mut self,
        updated_by: Option<ClientId>,
        event: &ChangeEvent,
        now: Instant,
    ) -> RemoteOutcome {
        match event {
            ChangeEvent::Added { doc } | ChangeEvent::Modified { doc } => {
                if self.is_own_echo(updated_by, &doc.id, now) {
                    return RemoteOutcome::SuppressedEcho;
                }
                // Last writer wins: the remote commit supersedes any
                // still-debouncing local content.
                self.arena.cancel(&doc.id);
                let unchanged = self.shadows.get(&doc.id) == Some(&doc.fields);
                self.shadows.insert(doc.id.clone(), doc.fields.clone());
                if unchanged {
                    RemoteOutcome::Unchanged
                } else {
                    RemoteOutcome::Apply { id: doc.id.clone(), fields: doc.fields.clone() }
                }
            }
            ChangeEvent::Removed { doc_id } => {
                if self.is_own_echo(updated_by, doc_id, now) {
                    return RemoteOutcome::SuppressedEcho;
                }
                self.arena.cancel(doc_id);
                if self.shadows.remove(doc_id).is_some() {
                    RemoteOutcome::Remove { id: doc_id.clone() }
                } else {
                    RemoteOutcome::Unchanged
                }
            }
            ChangeEvent::Aggregate { .. } => RemoteOutcome::Ignored,
        }
    }

    /// Drop all per-entity state (unmount).
    pub fn clear(&mut self) {
        self.arena.clear();
        self.recent.clear();
        self.shadows.clear();
    }

    fn is_own_echo(&mut self, updated_by: Option<ClientId>, id: &str, now: Instant) -> bool {
        updated_by == Some(self.client_id) && self.recent.contains(id, now)
    }

    fn local_move(
        &mut self,
        id: &str,
        parent_id: &str,
        prev_order: Option<f64>,
        next_order: Option<f64>,
        now: Instant,
        patches: &mut Vec<OutgoingPatch>,
    ) {
        let order = order_between(prev_order, next_order);
        // Cancellation must precede patch construction so a pending content
        // patch can never outrun the structural write.
        let pending = self.arena.cancel(id);

        let mut fields = Fields::new();
        fields.insert(PARENT_FIELD.to_string(), FieldValue::from(parent_id));
        fields.insert(ORDER_FIELD.to_string(), FieldValue::Number(order));

        // Consolidate typed-but-unsent content into the structural patch.
        if let Some(pending) = pending {
            if let Some(bulk) = pending.latest.get(&self.bulk_field) {
                let shadow_bulk =
                    self.shadows.get(id).and_then(|shadow| shadow.get(&self.bulk_field));
                if shadow_bulk != Some(bulk) {
                    fields.insert(self.bulk_field.clone(), bulk.clone());
                }
            }
        }

        let shadow = self.shadows.entry(id.to_string()).or_default();
        for (field, value) in &fields {
            shadow.insert(field.clone(), value.clone());
        }
        self.recent.record(id, now);
        patches.push(OutgoingPatch::Update { id: id.to_string(), fields });
    }

    fn classify_update(
        &mut self,
        id: &str,
        current: &Fields,
        now: Instant,
        patches: &mut Vec<OutgoingPatch>,
    ) {
        let shadow = self.shadows.get(id).cloned().unwrap_or_default();
        let diff = diff_fields(&shadow, current);
        if diff.is_empty() {
            // Nothing new vs. the shadow, but a pending slot still tracks
            // the freshest snapshot.
            self.arena.touch_latest(id, current.clone());
            return;
        }

        let discrete_changed = diff.keys().any(|field| field != &self.bulk_field);
        if !discrete_changed {
            // Pure content edit: (re)start the timer. The arena keeps the
            // baseline of the FIRST edit across reschedules.
            self.arena.schedule(id, shadow, current.clone(), now);
            return;
        }

        // Discrete fields always win priority over pending content.
        self.arena.cancel(id);
        self.shadows.insert(id.to_string(), current.clone());
        self.recent.record(id, now);
        patches.push(OutgoingPatch::Update { id: id.to_string(), fields: diff });
    }
}

/// Field-level diff. Keys present in `before` but missing from `after`
/// come back as explicit nulls so last-writer-wins merging can clear them.
fn diff_fields(before: &Fields, after: &Fields) -> Fields {
    let mut diff = Fields::new();
    for (field, value) in after {
        if before.get(field) != Some(value) {
            diff.insert(field.clone(), value.clone());
        }
    }
    for field in before.keys() {
        if !after.contains_key(field) {
            diff.insert(field.clone(), FieldValue::Null);
        }
    }
    diff
}
