//! Device state tracking.
//!
//! One tracker exists per atom id referenced by any metric's
//! `slice_by_states`. A tracker maintains `{state value, nesting count}`
//! per primary key and reports transitions to the dispatcher, which
//! forwards them to interested metric producers. Metrics observe the
//! pre-event value of the event's own atom through the change records'
//! old values.

use std::collections::HashMap;

use tracing::warn;

use crate::dimension::DimensionKey;
use crate::event::Event;

/// Sentinel for "no known state". Absent keys read as unknown.
pub const STATE_UNKNOWN: i32 = -1;

/// One observed state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub event_ns: i64,
    pub atom_id: i32,
    pub primary_key: DimensionKey,
    pub old_state: i32,
    pub new_state: i32,
}

#[derive(Debug, Clone, Copy)]
struct StateValueInfo {
    state: i32,
    count: i32,
}

/// Per-atom state machine keyed by the primary fields of the atom.
#[derive(Debug)]
pub struct StateTracker {
    atom_id: i32,
    state_map: HashMap<DimensionKey, StateValueInfo>,
}

impl StateTracker {
    pub fn new(atom_id: i32) -> Self {
        Self {
            atom_id,
            state_map: HashMap::new(),
        }
    }

    pub fn atom_id(&self) -> i32 {
        self.atom_id
    }

    /// Current state for a key; unknown when the key is untracked.
    pub fn state_value(&self, key: &DimensionKey) -> i32 {
        self.state_map
            .get(key)
            .map(|info| info.state)
            .unwrap_or(STATE_UNKNOWN)
    }

    pub fn tracked_key_count(&self) -> usize {
        self.state_map.len()
    }

    /// Applies one event of this tracker's atom, appending any transitions
    /// to `changes`.
    pub fn on_event(&mut self, event: &Event, changes: &mut Vec<StateChange>) {
        let event_ns = event.elapsed_ts_ns;
        let primary_key = primary_key(event);

        let Some(state_idx) = event.exclusive_state_index() else {
            warn!(atom_id = self.atom_id, "state atom missing exclusive state field");
            self.clear_key(event_ns, &primary_key, changes);
            return;
        };

        let state_field = &event.values[state_idx];
        let Some(new_state) = state_field.value.as_int() else {
            warn!(atom_id = self.atom_id, "exclusive state field is not an integer");
            self.clear_key(event_ns, &primary_key, changes);
            return;
        };

        if let Some(reset_state) = event.reset_state {
            self.handle_reset(event_ns, reset_state, changes);
            return;
        }

        let nested = state_field.annotations.is_nested;
        self.update_key(event_ns, primary_key, new_state, nested, changes);
    }

    fn handle_reset(&mut self, event_ns: i64, reset_state: i32, changes: &mut Vec<StateChange>) {
        // Reset overwrites every key, non-nested.
        let keys: Vec<DimensionKey> = self.state_map.keys().cloned().collect();
        for key in keys {
            self.update_key(event_ns, key, reset_state, false, changes);
        }
    }

    fn clear_key(&mut self, event_ns: i64, key: &DimensionKey, changes: &mut Vec<StateChange>) {
        // Absent keys are already unknown.
        if self.state_map.contains_key(key) {
            self.update_key(event_ns, key.clone(), STATE_UNKNOWN, false, changes);
        }
    }

    fn update_key(
        &mut self,
        event_ns: i64,
        key: DimensionKey,
        new_state: i32,
        nested: bool,
        changes: &mut Vec<StateChange>,
    ) {
        let info = self.state_map.entry(key.clone()).or_insert(StateValueInfo {
            state: STATE_UNKNOWN,
            count: 0,
        });
        let old_state = info.state;

        let mut notify = false;
        if !nested {
            // Every event overwrites.
            if new_state != old_state {
                info.state = new_state;
                info.count = 1;
                notify = true;
            }
        } else if new_state == STATE_UNKNOWN {
            notify = old_state != STATE_UNKNOWN;
        } else if old_state == STATE_UNKNOWN {
            info.state = new_state;
            info.count = 1;
            notify = true;
        } else if old_state == new_state {
            // Nested counting is only legal for binary state atoms; a repeat
            // of the current state deepens the nesting.
            info.count += 1;
        } else {
            info.count -= 1;
            if info.count == 0 {
                info.state = new_state;
                info.count = 1;
                notify = true;
            }
        }

        if new_state == STATE_UNKNOWN {
            self.state_map.remove(&key);
        }

        if notify {
            changes.push(StateChange {
                event_ns,
                atom_id: self.atom_id,
                primary_key: key,
                old_state,
                new_state,
            });
        }
    }
}

/// Extracts the primary key: the values annotated `is_primary`, in order.
pub fn primary_key(event: &Event) -> DimensionKey {
    DimensionKey::new(
        event
            .values
            .iter()
            .filter(|v| v.annotations.is_primary)
            .cloned()
            .collect(),
    )
}

/// Owns one [`StateTracker`] per registered atom, refcounted by the metrics
/// that slice on it.
#[derive(Debug, Default)]
pub struct StateManager {
    trackers: HashMap<i32, StateTracker>,
    refcounts: HashMap<i32, usize>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, atom_id: i32) {
        *self.refcounts.entry(atom_id).or_insert(0) += 1;
        self.trackers
            .entry(atom_id)
            .or_insert_with(|| StateTracker::new(atom_id));
    }

    pub fn unregister(&mut self, atom_id: i32) {
        if let Some(count) = self.refcounts.get_mut(&atom_id) {
            *count -= 1;
            if *count == 0 {
                self.refcounts.remove(&atom_id);
                self.trackers.remove(&atom_id);
            }
        }
    }

    pub fn handles(&self, atom_id: i32) -> bool {
        self.trackers.contains_key(&atom_id)
    }

    /// Routes an event to its tracker, returning the transitions it caused.
    pub fn on_event(&mut self, event: &Event) -> Vec<StateChange> {
        let mut changes = Vec::new();
        if let Some(tracker) = self.trackers.get_mut(&event.atom_id) {
            tracker.on_event(event, &mut changes);
        }
        changes
    }

    pub fn state_value(&self, atom_id: i32, key: &DimensionKey) -> i32 {
        self.trackers
            .get(&atom_id)
            .map(|t| t.state_value(key))
            .unwrap_or(STATE_UNKNOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{FieldAnnotations, Value};

    const SCREEN_ATOM: i32 = 29;
    const STATE_OFF: i32 = 1;
    const STATE_ON: i32 = 2;

    fn state_event(ts: i64, uid: i32, state: i32, nested: bool) -> Event {
        let mut e = Event::new(SCREEN_ATOM, 0, ts);
        e.push_annotated(
            &[1],
            Value::Int(uid),
            FieldAnnotations {
                is_primary: true,
                ..Default::default()
            },
        );
        e.push_annotated(
            &[2],
            Value::Int(state),
            FieldAnnotations {
                is_exclusive_state: true,
                is_nested: nested,
                ..Default::default()
            },
        );
        e
    }

    fn key_of(event: &Event) -> DimensionKey {
        primary_key(event)
    }

    #[test]
    fn test_overwrite_semantics() {
        let mut tracker = StateTracker::new(SCREEN_ATOM);
        let mut changes = Vec::new();

        let on = state_event(1, 100, STATE_ON, false);
        tracker.on_event(&on, &mut changes);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old_state, STATE_UNKNOWN);
        assert_eq!(changes[0].new_state, STATE_ON);
        assert_eq!(tracker.state_value(&key_of(&on)), STATE_ON);

        // Same state again: no notification.
        changes.clear();
        tracker.on_event(&state_event(2, 100, STATE_ON, false), &mut changes);
        assert!(changes.is_empty());

        tracker.on_event(&state_event(3, 100, STATE_OFF, false), &mut changes);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old_state, STATE_ON);
        assert_eq!(changes[0].new_state, STATE_OFF);
    }

    #[test]
    fn test_nested_counting() {
        let mut tracker = StateTracker::new(SCREEN_ATOM);
        let mut changes = Vec::new();

        tracker.on_event(&state_event(1, 100, STATE_ON, true), &mut changes);
        assert_eq!(changes.len(), 1);

        // Second ON nests; first OFF unwinds without notifying.
        tracker.on_event(&state_event(2, 100, STATE_ON, true), &mut changes);
        assert_eq!(changes.len(), 1);
        tracker.on_event(&state_event(3, 100, STATE_OFF, true), &mut changes);
        assert_eq!(changes.len(), 1);
        assert_eq!(tracker.state_value(&key_of(&state_event(0, 100, 0, true))), STATE_ON);

        // Matching OFF flips.
        tracker.on_event(&state_event(4, 100, STATE_OFF, true), &mut changes);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].new_state, STATE_OFF);
    }

    #[test]
    fn test_notification_balance_invariant() {
        // At every prefix, ON notifications minus OFF notifications is 0 or 1.
        let mut tracker = StateTracker::new(SCREEN_ATOM);
        let mut changes = Vec::new();
        let pattern = [
            STATE_ON, STATE_ON, STATE_ON, STATE_OFF, STATE_OFF, STATE_ON, STATE_OFF, STATE_OFF,
        ];
        for (ts, state) in pattern.iter().enumerate() {
            tracker.on_event(&state_event(ts as i64, 100, *state, true), &mut changes);
            let on = changes.iter().filter(|c| c.new_state == STATE_ON).count() as i64;
            let off = changes.iter().filter(|c| c.new_state == STATE_OFF).count() as i64;
            assert!((0..=1).contains(&(on - off)), "unbalanced at prefix {ts}");
        }
    }

    #[test]
    fn test_missing_state_field_clears_key() {
        let mut tracker = StateTracker::new(SCREEN_ATOM);
        let mut changes = Vec::new();
        tracker.on_event(&state_event(1, 100, STATE_ON, false), &mut changes);

        let mut broken = Event::new(SCREEN_ATOM, 0, 2);
        broken.push_annotated(
            &[1],
            Value::Int(100),
            FieldAnnotations {
                is_primary: true,
                ..Default::default()
            },
        );
        changes.clear();
        tracker.on_event(&broken, &mut changes);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].new_state, STATE_UNKNOWN);
        assert_eq!(tracker.tracked_key_count(), 0);
    }

    #[test]
    fn test_reset_applies_to_all_keys() {
        let mut tracker = StateTracker::new(SCREEN_ATOM);
        let mut changes = Vec::new();
        tracker.on_event(&state_event(1, 100, STATE_ON, false), &mut changes);
        tracker.on_event(&state_event(2, 200, STATE_ON, false), &mut changes);

        let mut reset = state_event(3, 100, STATE_OFF, false);
        reset.reset_state = Some(STATE_OFF);
        changes.clear();
        tracker.on_event(&reset, &mut changes);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.new_state == STATE_OFF));
    }

    #[test]
    fn test_manager_refcounting() {
        let mut mgr = StateManager::new();
        mgr.register(SCREEN_ATOM);
        mgr.register(SCREEN_ATOM);
        assert!(mgr.handles(SCREEN_ATOM));

        mgr.unregister(SCREEN_ATOM);
        assert!(mgr.handles(SCREEN_ATOM));
        mgr.unregister(SCREEN_ATOM);
        assert!(!mgr.handles(SCREEN_ATOM));
    }

    #[test]
    fn test_manager_routes_by_atom() {
        let mut mgr = StateManager::new();
        mgr.register(SCREEN_ATOM);

        let other = Event::new(999, 0, 1);
        assert!(mgr.on_event(&other).is_empty());

        let changes = mgr.on_event(&state_event(1, 100, STATE_ON, false));
        assert_eq!(changes.len(), 1);
        let key = key_of(&state_event(0, 100, 0, false));
        assert_eq!(mgr.state_value(SCREEN_ATOM, &key), STATE_ON);
    }
}
