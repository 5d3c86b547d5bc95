//! Atom matcher layer.
//!
//! Matchers are compiled into an index-addressed arena; evaluation of one
//! event produces a `Vec<MatchState>` aligned with that arena. Combination
//! matchers evaluate lazily with a per-event memo, recursing into children
//! first (the graph is validated acyclic at compile time).

use std::collections::HashMap;

use crate::error::ConfigError;
use crate::event::{Event, FieldValue};
use crate::ident::next_generation;
use crate::spec::{
    AtomMatcherDef, FieldValueMatcher, LogicalOperation, MatcherKind, Position, SimpleAtomMatcher,
    ValueMatcher,
};
use crate::uidmap::{aid_uid, UidMap};

/// Per-event evaluation state of one matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    Unevaluated,
    NotMatched,
    Matched,
}

impl MatchState {
    pub fn matched(self) -> bool {
        self == MatchState::Matched
    }
}

/// Applies a logical operation over already-evaluated children.
pub fn combination_match(
    children: &[usize],
    operation: LogicalOperation,
    results: &[MatchState],
) -> bool {
    match operation {
        LogicalOperation::And => children.iter().all(|&c| results[c] == MatchState::Matched),
        LogicalOperation::Or => children.iter().any(|&c| results[c] == MatchState::Matched),
        LogicalOperation::Not => results[children[0]] == MatchState::NotMatched,
        LogicalOperation::Nand => children.iter().any(|&c| results[c] != MatchState::Matched),
        LogicalOperation::Nor => children.iter().all(|&c| results[c] != MatchState::Matched),
    }
}

/// One compiled matcher.
#[derive(Debug, Clone)]
pub struct MatcherTracker {
    pub id: i64,
    pub generation: u64,
    pub initialized: bool,
    pub kind: MatcherTrackerKind,
}

#[derive(Debug, Clone)]
pub enum MatcherTrackerKind {
    Simple {
        matcher: SimpleAtomMatcher,
    },
    Combination {
        operation: LogicalOperation,
        child_ids: Vec<i64>,
        /// Resolved at init time against the owning arena.
        children: Vec<usize>,
    },
}

impl MatcherTracker {
    pub fn new(def: &AtomMatcherDef) -> Result<Self, ConfigError> {
        let kind = match &def.kind {
            MatcherKind::Simple(simple) => {
                validate_field_matchers(def.id, &simple.field_value_matchers)?;
                MatcherTrackerKind::Simple {
                    matcher: simple.clone(),
                }
            }
            MatcherKind::Combination(combo) => {
                if combo.children.is_empty() {
                    return Err(ConfigError::MatcherMalformed(def.id));
                }
                if combo.operation == LogicalOperation::Not && combo.children.len() != 1 {
                    return Err(ConfigError::MatcherMalformed(def.id));
                }
                MatcherTrackerKind::Combination {
                    operation: combo.operation,
                    child_ids: combo.children.clone(),
                    children: Vec::new(),
                }
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
        matches!(self.kind, MatcherTrackerKind::Simple { .. })
    }
}

fn validate_field_matchers(id: i64, matchers: &[FieldValueMatcher]) -> Result<(), ConfigError> {
    for m in matchers {
        if m.position == Some(Position::All) {
            return Err(ConfigError::MatcherMalformed(id));
        }
        if let ValueMatcher::MatchesTuple(children) = &m.value {
            validate_field_matchers(id, children)?;
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Resolves combination children and rejects cycles (white/gray/black DFS).
/// Marks every tracker initialized on success.
pub fn init_matchers(
    trackers: &mut Vec<MatcherTracker>,
    index_map: &HashMap<i64, usize>,
) -> Result<(), ConfigError> {
    let mut colors = vec![Color::White; trackers.len()];
    for idx in 0..trackers.len() {
        init_one(trackers, index_map, idx, &mut colors)?;
    }
    Ok(())
}

fn init_one(
    trackers: &mut Vec<MatcherTracker>,
    index_map: &HashMap<i64, usize>,
    idx: usize,
    colors: &mut [Color],
) -> Result<(), ConfigError> {
    match colors[idx] {
        Color::Black => return Ok(()),
        Color::Gray => return Err(ConfigError::MatcherCycle(trackers[idx].id)),
        Color::White => {}
    }
    colors[idx] = Color::Gray;

    if trackers[idx].is_simple() {
        trackers[idx].initialized = true;
        colors[idx] = Color::Black;
        return Ok(());
    }

    let id = trackers[idx].id;
    let child_ids = match &trackers[idx].kind {
        MatcherTrackerKind::Combination { child_ids, .. } => child_ids.clone(),
        MatcherTrackerKind::Simple { .. } => Vec::new(),
    };

    let mut resolved = Vec::with_capacity(child_ids.len());
    for child_id in &child_ids {
        let child_idx = *index_map
            .get(child_id)
            .ok_or(ConfigError::MatcherChildNotFound(id))?;
        init_one(trackers, index_map, child_idx, colors)?;
        resolved.push(child_idx);
    }

    if let MatcherTrackerKind::Combination { children, .. } = &mut trackers[idx].kind {
        *children = resolved;
    }
    trackers[idx].initialized = true;
    colors[idx] = Color::Black;
    Ok(())
}

/// Atom ids a matcher can fire for; combinations take the union of their
/// children. Assumes initialization succeeded.
pub fn matcher_atom_ids(trackers: &[MatcherTracker], idx: usize, out: &mut Vec<i32>) {
    match &trackers[idx].kind {
        MatcherTrackerKind::Simple { matcher } => {
            if !out.contains(&matcher.atom_id) {
                out.push(matcher.atom_id);
            }
        }
        MatcherTrackerKind::Combination { children, .. } => {
            for &child in children {
                matcher_atom_ids(trackers, child, out);
            }
        }
    }
}

/// Evaluates every matcher against one event.
pub fn evaluate_all(
    trackers: &[MatcherTracker],
    event: &Event,
    uid_map: &UidMap,
) -> Vec<MatchState> {
    let mut results = vec![MatchState::Unevaluated; trackers.len()];
    for idx in 0..trackers.len() {
        evaluate_one(trackers, idx, event, uid_map, &mut results);
    }
    results
}

fn evaluate_one(
    trackers: &[MatcherTracker],
    idx: usize,
    event: &Event,
    uid_map: &UidMap,
    results: &mut [MatchState],
) {
    if results[idx] != MatchState::Unevaluated {
        return;
    }
    match &trackers[idx].kind {
        MatcherTrackerKind::Simple { matcher } => {
            results[idx] = if matches_simple(uid_map, matcher, event) {
                MatchState::Matched
            } else {
                MatchState::NotMatched
            };
        }
        MatcherTrackerKind::Combination {
            operation,
            children,
            ..
        } => {
            for &child in children {
                evaluate_one(trackers, child, event, uid_map, results);
            }
            results[idx] = if combination_match(children, *operation, results) {
                MatchState::Matched
            } else {
                MatchState::NotMatched
            };
        }
    }
}

/// Whole-event simple matching: the atom must match and every top-level
/// field matcher must accept.
pub fn matches_simple(uid_map: &UidMap, matcher: &SimpleAtomMatcher, event: &Event) -> bool {
    if event.atom_id != matcher.atom_id {
        return false;
    }
    matcher
        .field_value_matchers
        .iter()
        .all(|m| matches_field(uid_map, m, &event.values, 0, event.values.len(), 0))
}

/// Narrows `[start, end)` to the values whose position at `depth` equals
/// `target`. Relies on DFS ordering of the values.
fn range_at_depth(
    target: i32,
    start: usize,
    end: usize,
    depth: usize,
    values: &[FieldValue],
) -> Option<(usize, usize)> {
    let mut new_start = None;
    let mut new_end = end;
    for (i, fv) in values.iter().enumerate().take(end).skip(start) {
        let pos = fv.field.pos_at_depth(depth);
        if pos == target {
            if new_start.is_none() {
                new_start = Some(i);
            }
            new_end = i + 1;
        } else if pos > target {
            break;
        }
    }
    new_start.map(|s| (s, new_end))
}

/// Sub-ranges participating in matching after applying the matcher's field
/// and position. For ANY over a tuple matcher, one range per repeated
/// element; otherwise a single range.
fn compute_ranges(
    matcher: &FieldValueMatcher,
    values: &[FieldValue],
    start: usize,
    end: usize,
    depth: &mut usize,
) -> Vec<(usize, usize)> {
    let Some((mut start, mut end)) = range_at_depth(matcher.field, start, end, *depth, values)
    else {
        return Vec::new();
    };

    let mut ranges = Vec::new();
    if let Some(position) = matcher.position {
        *depth += 1;
        if *depth > 2 {
            return ranges;
        }
        match position {
            Position::First => {
                for i in start..end {
                    if values[i].field.pos_at_depth(*depth) != 1 {
                        end = i;
                        break;
                    }
                }
                ranges.push((start, end));
            }
            Position::Last => {
                for (i, fv) in values.iter().enumerate().take(end).skip(start) {
                    if fv.field.is_last_pos(*depth) {
                        start = i;
                        break;
                    }
                }
                ranges.push((start, end));
            }
            Position::Any => {
                if matches!(matcher.value, ValueMatcher::MatchesTuple(_)) {
                    // One sub-range per repeated element so the tuple can
                    // require all of its matchers to hit the same element.
                    let mut current_pos = values[start].field.pos_at_depth(*depth);
                    let mut range_start = start;
                    for i in start..end {
                        let pos = values[i].field.pos_at_depth(*depth);
                        if pos != current_pos {
                            ranges.push((range_start, i));
                            range_start = i;
                            current_pos = pos;
                        }
                    }
                    ranges.push((range_start, end));
                } else {
                    ranges.push((start, end));
                }
            }
            Position::All => {
                // Rejected at compile time.
            }
        }
    } else {
        ranges.push((start, end));
    }

    ranges
}

fn matches_field(
    uid_map: &UidMap,
    matcher: &FieldValueMatcher,
    values: &[FieldValue],
    start: usize,
    end: usize,
    mut depth: usize,
) -> bool {
    if depth > 2 || start >= end {
        return false;
    }

    let ranges = compute_ranges(matcher, values, start, end, &mut depth);
    if ranges.is_empty() {
        return false;
    }
    let (start, end) = ranges[0];

    match &matcher.value {
        ValueMatcher::MatchesTuple(children) => {
            let depth = depth + 1;
            // A match is one sub-range where every child matcher hits.
            ranges.iter().any(|&(rs, re)| {
                children
                    .iter()
                    .all(|child| matches_field(uid_map, child, values, rs, re, depth))
            })
        }
        ValueMatcher::EqBool(want) => values[start..end]
            .iter()
            .any(|fv| fv.value.as_long().map(|v| v != 0) == Some(*want)),
        ValueMatcher::EqInt(want) => values[start..end]
            .iter()
            .any(|fv| fv.value.as_long() == Some(*want)),
        ValueMatcher::EqAnyInt(wants) => values[start..end].iter().any(|fv| {
            fv.value
                .as_long()
                .is_some_and(|v| wants.contains(&v))
        }),
        ValueMatcher::NeqAnyInt(wants) => values[start..end].iter().any(|fv| {
            fv.value
                .as_long()
                .is_some_and(|v| !wants.contains(&v))
        }),
        ValueMatcher::LtInt(bound) => values[start..end]
            .iter()
            .any(|fv| fv.value.as_long().is_some_and(|v| v < *bound)),
        ValueMatcher::GtInt(bound) => values[start..end]
            .iter()
            .any(|fv| fv.value.as_long().is_some_and(|v| v > *bound)),
        ValueMatcher::LteInt(bound) => values[start..end]
            .iter()
            .any(|fv| fv.value.as_long().is_some_and(|v| v <= *bound)),
        ValueMatcher::GteInt(bound) => values[start..end]
            .iter()
            .any(|fv| fv.value.as_long().is_some_and(|v| v >= *bound)),
        ValueMatcher::LtFloat(bound) => values[start..end].iter().any(|fv| {
            matches!(fv.value, crate::event::Value::Float(v) if v < *bound)
        }),
        ValueMatcher::GtFloat(bound) => values[start..end].iter().any(|fv| {
            matches!(fv.value, crate::event::Value::Float(v) if v > *bound)
        }),
        ValueMatcher::EqString(want) => values[start..end]
            .iter()
            .any(|fv| try_match_string(uid_map, fv, want)),
        ValueMatcher::EqAnyString(wants) => values[start..end].iter().any(|fv| {
            wants.iter().any(|want| try_match_string(uid_map, fv, want))
        }),
        ValueMatcher::NeqAnyString(wants) => values[start..end].iter().any(|fv| {
            wants.iter().all(|want| !try_match_string(uid_map, fv, want))
        }),
        ValueMatcher::EqWildcardString(pattern) => values[start..end]
            .iter()
            .any(|fv| try_match_wildcard(uid_map, fv, pattern)),
        ValueMatcher::EqAnyWildcardString(patterns) => values[start..end].iter().any(|fv| {
            patterns
                .iter()
                .any(|pattern| try_match_wildcard(uid_map, fv, pattern))
        }),
        ValueMatcher::NeqAnyWildcardString(patterns) => values[start..end].iter().any(|fv| {
            patterns
                .iter()
                .all(|pattern| !try_match_wildcard(uid_map, fv, pattern))
        }),
    }
}

/// A string matcher against a uid-annotated field accepts an AID name or
/// any (lower-cased) package name owning the uid.
fn try_match_string(uid_map: &UidMap, fv: &FieldValue, target: &str) -> bool {
    if fv.annotations.is_uid {
        let Some(uid) = fv.value.as_long() else {
            return false;
        };
        if let Some(aid) = aid_uid(target) {
            return i64::from(aid) == uid;
        }
        return uid_map
            .app_names_from_uid(uid as i32, true)
            .iter()
            .any(|name| name == target);
    }
    fv.value.as_str() == Some(target)
}

fn try_match_wildcard(uid_map: &UidMap, fv: &FieldValue, pattern: &str) -> bool {
    if fv.annotations.is_uid {
        let Some(uid) = fv.value.as_long() else {
            return false;
        };
        if (0..i64::from(crate::uidmap::FIRST_APP_UID)).contains(&uid) {
            if let Some(name) = crate::uidmap::aid_name(uid as u32) {
                return wildcard_match(pattern, name);
            }
        }
        return uid_map
            .app_names_from_uid(uid as i32, true)
            .iter()
            .any(|name| wildcard_match(pattern, name));
    }
    match fv.value.as_str() {
        Some(s) => wildcard_match(pattern, s),
        None => false,
    }
}

/// Glob matching: `*` any sequence, `?` one character, `[...]` a character
/// class with optional leading `!` negation and `-` ranges.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    glob_match(pattern.as_bytes(), text.as_bytes())
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    if pattern.is_empty() {
        return text.is_empty();
    }
    match pattern[0] {
        b'*' => {
            // Collapse consecutive stars, then try every split point.
            let rest = &pattern[1..];
            (0..=text.len()).any(|i| glob_match(rest, &text[i..]))
        }
        b'?' => !text.is_empty() && glob_match(&pattern[1..], &text[1..]),
        b'[' => match parse_class(&pattern[1..]) {
            Some((class, rest)) => {
                !text.is_empty() && class_matches(class, text[0]) && glob_match(rest, &text[1..])
            }
            // Unterminated class matches a literal '['.
            None => !text.is_empty() && text[0] == b'[' && glob_match(&pattern[1..], &text[1..]),
        },
        c => !text.is_empty() && text[0] == c && glob_match(&pattern[1..], &text[1..]),
    }
}

fn parse_class(pattern: &[u8]) -> Option<(&[u8], &[u8])> {
    // A ']' in first position (after optional '!') is a literal member.
    let mut i = if pattern.first() == Some(&b'!') { 1 } else { 0 };
    if pattern.get(i) == Some(&b']') {
        i += 1;
    }
    while i < pattern.len() {
        if pattern[i] == b']' {
            return Some((&pattern[..i], &pattern[i + 1..]));
        }
        i += 1;
    }
    None
}

fn class_matches(class: &[u8], c: u8) -> bool {
    let (negated, body) = match class.first() {
        Some(&b'!') => (true, &class[1..]),
        _ => (false, class),
    };
    let mut matched = false;
    let mut i = 0;
    while i < body.len() {
        if i + 2 < body.len() && body[i + 1] == b'-' {
            if body[i] <= c && c <= body[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if body[i] == c {
                matched = true;
            }
            i += 1;
        }
    }
    matched != negated
}
