// Debounce slot arena for pending content patches.
//
// One slot per entity, addressed by a stable small integer id, with
// cancel-on-replace semantics: rescheduling an entity keeps its ORIGINAL
// baseline (so the eventual diff covers everything typed since the first
// edit) but replaces the latest snapshot and resets the deadline.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use trellis_common::types::Fields;

pub type SlotId = usize;

#[derive(Debug, Clone)]
struct Slot {
    entity: String,
    baseline: Fields,
    latest: Fields,
    deadline: Instant,
}

/// A fired or cancelled slot's contents.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPatch {
    pub entity: String,
    pub baseline: Fields,
    pub latest: Fields,
}

#[derive(Debug)]
pub struct SlotArena {
    window: Duration,
    slots: Vec<Option<Slot>>,
    free: Vec<SlotId>,
    by_entity: HashMap<String, SlotId>,
}

impl SlotArena {
    pub fn new(window: Duration) -> Self {
        Self { window, slots: Vec::new(), free: Vec::new(), by_entity: HashMap::new() }
    }

    /// Schedule or reschedule the entity's pending patch.
    pub fn schedule(&mut self, entity: &str, baseline: Fields, latest: Fields, now: Instant) {
        let deadline = now + self.window;
        if let Some(&slot_id) = self.by_entity.get(entity) {
            let slot = self.slots[slot_id].as_mut().expect("tracked slot must be live");
            // Original baseline survives the reschedule.
            slot.latest = latest;
            slot.deadline = deadline;
            return;
        }

        let slot = Slot { entity: entity.to_string(), baseline, latest, deadline };
        let slot_id = match self.free.pop() {
            Some(slot_id) => {
                self.slots[slot_id] = Some(slot);
                slot_id
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.by_entity.insert(entity.to_string(), slot_id);
    }

    /// Replace only the latest snapshot of an already-pending entity.
    pub fn touch_latest(&mut self, entity: &str, latest: Fields) {
        if let Some(&slot_id) = self.by_entity.get(entity) {
            let slot = self.slots[slot_id].as_mut().expect("tracked slot must be live");
            slot.latest = latest;
        }
    }

    /// Cancel the entity's pending patch, returning its contents so an
    /// immediate patch can consolidate them.
    pub fn cancel(&mut self, entity: &str) -> Option<PendingPatch> {
        let slot_id = self.by_entity.remove(entity)?;
        let slot = self.slots[slot_id].take().expect("tracked slot must be live");
        self.free.push(slot_id);
        Some(PendingPatch { entity: slot.entity, baseline: slot.baseline, latest: slot.latest })
    }

    pub fn is_pending(&self, entity: &str) -> bool {
        self.by_entity.contains_key(entity)
    }

    /// Fire every slot whose window has elapsed.
    pub fn drain_due(&mut self, now: Instant) -> Vec<PendingPatch> {
        let due: Vec<String> = self
            .by_entity
            .iter()
            .filter(|(_, &slot_id)| {
                self.slots[slot_id]
                    .as_ref()
                    .is_some_and(|slot| now >= slot.deadline)
            })
            .map(|(entity, _)| entity.clone())
            .collect();

        due.iter().filter_map(|entity| self.cancel(entity)).collect()
    }

    /// Earliest pending deadline, or None when idle.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().flatten().map(|slot| slot.deadline).min()
    }

    pub fn pending_count(&self) -> usize {
        self.by_entity.len()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.by_entity.clear();
    }
}
