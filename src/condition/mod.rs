//! Condition (predicate) layer.
//!
//! A simple condition is a per-dimension-key state machine driven by start/
//! stop/stop-all matcher firings; a combination condition folds children
//! with tri-state logic. Trackers live in an index-addressed arena and keep
//! their per-key state across live updates when preserved.

use std::collections::HashMap;

use crate::dimension::{extract_key, DimensionKey};
use crate::error::ConfigError;
use crate::event::Event;
use crate::ident::next_generation;
use crate::matchers::MatchState;
use crate::spec::{
    FieldMatcher, InitialConditionValue, LogicalOperation, PredicateDef, PredicateKind,
};

/// Tri-state condition value. `NotEvaluated` appears only in evaluation
/// caches, never as a stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionState {
    NotEvaluated,
    Unknown,
    False,
    True,
}

impl ConditionState {
    pub fn from_bool(v: bool) -> Self {
        if v {
            ConditionState::True
        } else {
            ConditionState::False
        }
    }

    pub fn negate(self) -> Self {
        match self {
            ConditionState::True => ConditionState::False,
            ConditionState::False => ConditionState::True,
            other => other,
        }
    }

    pub fn is_true(self) -> bool {
        self == ConditionState::True
    }
}

/// Folds child states under an operation, with UNKNOWN propagation: AND
/// short-circuits on FALSE, OR on TRUE, otherwise any UNKNOWN child makes
/// the result UNKNOWN.
pub fn combine(operation: LogicalOperation, children: &[ConditionState]) -> ConditionState {
    match operation {
        LogicalOperation::And => {
            if children.iter().any(|c| *c == ConditionState::False) {
                ConditionState::False
            } else if children.iter().any(|c| *c != ConditionState::True) {
                ConditionState::Unknown
            } else {
                ConditionState::True
            }
        }
        LogicalOperation::Or => {
            if children.iter().any(|c| *c == ConditionState::True) {
                ConditionState::True
            } else if children.iter().any(|c| *c != ConditionState::False) {
                ConditionState::Unknown
            } else {
                ConditionState::False
            }
        }
        LogicalOperation::Not => children
            .first()
            .copied()
            .unwrap_or(ConditionState::Unknown)
            .negate(),
        LogicalOperation::Nand => combine(LogicalOperation::And, children).negate(),
        LogicalOperation::Nor => combine(LogicalOperation::Or, children).negate(),
    }
}

/// Per-key flips produced by one event for a sliced condition.
#[derive(Debug, Clone, Default)]
pub struct SlicedChanges {
    pub changes: Vec<(DimensionKey, bool)>,
}

#[derive(Debug, Clone)]
pub struct SimpleConditionTracker {
    pub start_id: i64,
    pub stop_id: i64,
    pub stop_all_id: Option<i64>,
    pub start_index: usize,
    pub stop_index: usize,
    pub stop_all_index: Option<usize>,
    pub count_nesting: bool,
    pub initial_value: InitialConditionValue,
    pub dimensions: Option<FieldMatcher>,
    /// Start-reference counts per key; unsliced trackers use the empty key.
    /// A stopped unsliced tracker keeps a zero entry so its value reads
    /// FALSE rather than the initial value; stopped sliced keys are erased.
    state: HashMap<DimensionKey, i32>,
}

impl SimpleConditionTracker {
    fn absent_value(&self) -> ConditionState {
        match self.initial_value {
            InitialConditionValue::Unknown => ConditionState::Unknown,
            InitialConditionValue::False => ConditionState::False,
        }
    }

    pub fn is_sliced(&self) -> bool {
        self.dimensions.is_some()
    }

    fn key_value(&self, key: &DimensionKey) -> ConditionState {
        match self.state.get(key) {
            Some(count) => ConditionState::from_bool(*count > 0),
            None => self.absent_value(),
        }
    }

    fn current(&self) -> ConditionState {
        if self.is_sliced() {
            if self.state.values().any(|c| *c > 0) {
                ConditionState::True
            } else {
                self.absent_value()
            }
        } else {
            self.key_value(&DimensionKey::EMPTY)
        }
    }

    fn query(&self, key: &DimensionKey) -> ConditionState {
        self.key_value(key)
    }

    pub fn tracked_keys(&self) -> impl Iterator<Item = &DimensionKey> {
        self.state
            .iter()
            .filter(|(_, c)| **c > 0)
            .map(|(k, _)| k)
    }

    /// Applies one start/stop to `key`. Returns whether the key's observed
    /// truth changed.
    fn handle_condition_event(&mut self, key: DimensionKey, start: bool) -> bool {
        let sliced = self.is_sliced();
        let old = self.key_value(&key);
        if start {
            let count = self.state.entry(key.clone()).or_insert(0);
            if self.count_nesting {
                *count += 1;
            } else {
                *count = 1;
            }
        } else {
            match self.state.get_mut(&key) {
                Some(count) => {
                    if self.count_nesting {
                        *count = (*count - 1).max(0);
                    } else {
                        *count = 0;
                    }
                    if *count == 0 && sliced {
                        self.state.remove(&key);
                    }
                }
                // A stop without a start still pins the value to FALSE for
                // unsliced trackers.
                None => {
                    if !sliced {
                        self.state.insert(key.clone(), 0);
                    }
                }
            }
        }
        self.key_value(&key) != old
    }
}

#[derive(Debug, Clone)]
pub struct CombinationConditionTracker {
    pub operation: LogicalOperation,
    pub child_ids: Vec<i64>,
    pub children: Vec<usize>,
    pub sliced_children: Vec<usize>,
    pub unsliced_children: Vec<usize>,
}

#[derive(Debug, Clone)]
pub enum ConditionTrackerKind {
    Simple(SimpleConditionTracker),
    Combination(CombinationConditionTracker),
}

#[derive(Debug, Clone)]
pub struct ConditionTracker {
    pub id: i64,
    pub generation: u64,
    pub initialized: bool,
    pub kind: ConditionTrackerKind,
}

impl ConditionTracker {
    pub fn new(def: &PredicateDef) -> Result<Self, ConfigError> {
        let kind = match &def.kind {
            PredicateKind::Simple(simple) => ConditionTrackerKind::Simple(SimpleConditionTracker {
                start_id: simple.start,
                stop_id: simple.stop,
                stop_all_id: simple.stop_all,
                start_index: usize::MAX,
                stop_index: usize::MAX,
                stop_all_index: None,
                count_nesting: simple.count_nesting,
                initial_value: simple.initial_value,
                dimensions: simple.dimensions.clone(),
                state: HashMap::new(),
            }),
            PredicateKind::Combination(combo) => {
                if combo.children.is_empty() {
                    return Err(ConfigError::ConditionInvalidCombination(def.id));
                }
                if combo.operation == LogicalOperation::Not && combo.children.len() != 1 {
                    return Err(ConfigError::ConditionInvalidCombination(def.id));
                }
                ConditionTrackerKind::Combination(CombinationConditionTracker {
                    operation: combo.operation,
                    child_ids: combo.children.clone(),
                    children: Vec::new(),
                    sliced_children: Vec::new(),
                    unsliced_children: Vec::new(),
                })
            }
        };
        Ok(Self {
            id: def.id,
            generation: next_generation(),
            initialized: false,
            kind,
        })
    }

    pub fn is_simple(&self) -> bool {
        matches!(self.kind, ConditionTrackerKind::Simple(_))
    }

    pub fn is_sliced(&self) -> bool {
        match &self.kind {
            ConditionTrackerKind::Simple(s) => s.is_sliced(),
            ConditionTrackerKind::Combination(c) => !c.sliced_children.is_empty(),
        }
    }

    /// Matcher indices this condition consumes, for dispatch wiring.
    pub fn interested_matchers(&self) -> Vec<usize> {
        match &self.kind {
            ConditionTrackerKind::Simple(s) => {
                let mut out = vec![s.start_index, s.stop_index];
                if let Some(idx) = s.stop_all_index {
                    out.push(idx);
                }
                out
            }
            ConditionTrackerKind::Combination(_) => Vec::new(),
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Resolves matcher and child indices for every tracker, validates the
/// graph (cycles, slicing rules) and marks trackers initialized. Preserved
/// trackers keep their per-key state; only index wiring is recomputed.
pub fn init_conditions(
    trackers: &mut Vec<ConditionTracker>,
    condition_index_map: &HashMap<i64, usize>,
    matcher_index_map: &HashMap<i64, usize>,
) -> Result<(), ConfigError> {
    let mut colors = vec![Color::White; trackers.len()];
    for idx in 0..trackers.len() {
        init_one(trackers, condition_index_map, matcher_index_map, idx, &mut colors)?;
    }
    Ok(())
}

fn init_one(
    trackers: &mut Vec<ConditionTracker>,
    condition_index_map: &HashMap<i64, usize>,
    matcher_index_map: &HashMap<i64, usize>,
    idx: usize,
    colors: &mut [Color],
) -> Result<(), ConfigError> {
    match colors[idx] {
        Color::Black => return Ok(()),
        Color::Gray => return Err(ConfigError::ConditionCycle(trackers[idx].id)),
        Color::White => {}
    }
    colors[idx] = Color::Gray;

    let id = trackers[idx].id;
    if trackers[idx].is_simple() {
        let (start_id, stop_id, stop_all_id) = match &trackers[idx].kind {
            ConditionTrackerKind::Simple(s) => (s.start_id, s.stop_id, s.stop_all_id),
            ConditionTrackerKind::Combination(_) => return Ok(()),
        };
        let start_index = *matcher_index_map
            .get(&start_id)
            .ok_or(ConfigError::ConditionMissingMatcher(id))?;
        let stop_index = *matcher_index_map
            .get(&stop_id)
            .ok_or(ConfigError::ConditionMissingMatcher(id))?;
        let stop_all_index = match stop_all_id {
            Some(stop_all_id) => Some(
                *matcher_index_map
                    .get(&stop_all_id)
                    .ok_or(ConfigError::ConditionMissingMatcher(id))?,
            ),
            None => None,
        };
        if let ConditionTrackerKind::Simple(simple) = &mut trackers[idx].kind {
            simple.start_index = start_index;
            simple.stop_index = stop_index;
            simple.stop_all_index = stop_all_index;
        }
        trackers[idx].initialized = true;
        colors[idx] = Color::Black;
        return Ok(());
    }

    let child_ids = match &mut trackers[idx].kind {
        ConditionTrackerKind::Combination(combo) => {
            combo.children.clear();
            combo.sliced_children.clear();
            combo.unsliced_children.clear();
            combo.child_ids.clone()
        }
        ConditionTrackerKind::Simple(_) => return Ok(()),
    };

    let mut children = Vec::with_capacity(child_ids.len());
    for child_id in &child_ids {
        let child_idx = *condition_index_map
            .get(child_id)
            .ok_or(ConfigError::ConditionChildNotFound(id))?;
        init_one(trackers, condition_index_map, matcher_index_map, child_idx, colors)?;
        children.push(child_idx);
    }

    let mut sliced = Vec::new();
    let mut unsliced = Vec::new();
    for &child in &children {
        if trackers[child].is_sliced() {
            sliced.push(child);
        } else {
            unsliced.push(child);
        }
    }
    if sliced.len() > 1 {
        return Err(ConfigError::ConditionInvalidCombination(id));
    }

    if let ConditionTrackerKind::Combination(combo) = &mut trackers[idx].kind {
        combo.children = children;
        combo.sliced_children = sliced;
        combo.unsliced_children = unsliced;
    }
    trackers[idx].initialized = true;
    colors[idx] = Color::Black;
    Ok(())
}

/// Current (unsliced view of the) condition value, computed from live state.
/// Used to seed condition caches after compile/update.
pub fn current_state(trackers: &[ConditionTracker], idx: usize) -> ConditionState {
    match &trackers[idx].kind {
        ConditionTrackerKind::Simple(simple) => simple.current(),
        ConditionTrackerKind::Combination(combo) => {
            let child_states: Vec<ConditionState> = combo
                .children
                .iter()
                .map(|&c| current_state(trackers, c))
                .collect();
            combine(combo.operation, &child_states)
        }
    }
}

/// Sliced query: resolves the condition for one dimension key (already
/// translated into the condition's own dimension space). Unsliced children
/// contribute their current value.
pub fn query(trackers: &[ConditionTracker], idx: usize, key: &DimensionKey) -> ConditionState {
    match &trackers[idx].kind {
        ConditionTrackerKind::Simple(simple) => {
            if simple.is_sliced() {
                simple.query(key)
            } else {
                simple.current()
            }
        }
        ConditionTrackerKind::Combination(combo) => {
            let child_states: Vec<ConditionState> = combo
                .children
                .iter()
                .map(|&c| query(trackers, c, key))
                .collect();
            combine(combo.operation, &child_states)
        }
    }
}

/// Keys currently TRUE for a sliced condition, for tests and duration
/// seeding.
pub fn true_keys(trackers: &[ConditionTracker], idx: usize) -> Vec<DimensionKey> {
    match &trackers[idx].kind {
        ConditionTrackerKind::Simple(simple) => simple.tracked_keys().cloned().collect(),
        ConditionTrackerKind::Combination(combo) => combo
            .sliced_children
            .first()
            .map(|&c| true_keys(trackers, c))
            .unwrap_or_default(),
    }
}

/// Evaluates every condition against one event's matcher results.
///
/// Returns `(cache, changed, sliced_changes)` aligned with the arena.
pub fn evaluate_all(
    trackers: &mut [ConditionTracker],
    event: &Event,
    matcher_results: &[MatchState],
) -> (Vec<ConditionState>, Vec<bool>, Vec<SlicedChanges>) {
    let mut cache = vec![ConditionState::NotEvaluated; trackers.len()];
    let mut changed = vec![false; trackers.len()];
    let mut sliced_changes = vec![SlicedChanges::default(); trackers.len()];

    for idx in 0..trackers.len() {
        evaluate_one(
            trackers,
            idx,
            event,
            matcher_results,
            &mut cache,
            &mut changed,
            &mut sliced_changes,
        );
    }
    (cache, changed, sliced_changes)
}

fn evaluate_one(
    trackers: &mut [ConditionTracker],
    idx: usize,
    event: &Event,
    matcher_results: &[MatchState],
    cache: &mut [ConditionState],
    changed: &mut [bool],
    sliced_changes: &mut [SlicedChanges],
) {
    if cache[idx] != ConditionState::NotEvaluated {
        return;
    }

    if trackers[idx].is_simple() {
        let ConditionTrackerKind::Simple(simple) = &mut trackers[idx].kind else {
            return;
        };
        let fired = |index: usize| {
            matcher_results
                .get(index)
                .copied()
                .unwrap_or(MatchState::Unevaluated)
                .matched()
        };

        if simple.stop_all_index.is_some_and(fired) {
            if simple.is_sliced() {
                let cleared: Vec<(DimensionKey, i32)> = simple.state.drain().collect();
                let flipped: Vec<DimensionKey> = cleared
                    .into_iter()
                    .filter(|(_, count)| *count > 0)
                    .map(|(key, _)| key)
                    .collect();
                changed[idx] = !flipped.is_empty();
                sliced_changes[idx].changes = flipped.into_iter().map(|k| (k, false)).collect();
            } else {
                let old = simple.key_value(&DimensionKey::EMPTY);
                simple.state.insert(DimensionKey::EMPTY, 0);
                changed[idx] = old != ConditionState::False;
            }
            cache[idx] = simple.current();
            return;
        }

        let start = fired(simple.start_index);
        let stop = fired(simple.stop_index);
        if start || stop {
            let key = simple
                .dimensions
                .as_ref()
                .map(|d| extract_key(d, &event.values))
                .unwrap_or_default();
            // A matcher firing both roles acts as a start (overwrite).
            let flipped = simple.handle_condition_event(key.clone(), start);
            if flipped {
                changed[idx] = true;
                sliced_changes[idx].changes.push((key, start));
            }
        }
        cache[idx] = simple.current();
        return;
    }

    let children = match &trackers[idx].kind {
        ConditionTrackerKind::Combination(c) => c.children.clone(),
        ConditionTrackerKind::Simple(_) => return,
    };
    for &child in &children {
        evaluate_one(
            trackers,
            child,
            event,
            matcher_results,
            cache,
            changed,
            sliced_changes,
        );
    }
    let operation = match &trackers[idx].kind {
        ConditionTrackerKind::Combination(c) => c.operation,
        ConditionTrackerKind::Simple(_) => return,
    };
    let child_states: Vec<ConditionState> = children.iter().map(|&c| cache[c]).collect();
    cache[idx] = combine(operation, &child_states);
    changed[idx] = children.iter().any(|&c| changed[c]);
}
