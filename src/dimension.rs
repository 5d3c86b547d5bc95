//! Dimension keys and their extraction from events.
//!
//! A metric (or sliced condition) partitions its accumulators by the tuple
//! of field values selected by a [`FieldMatcher`]. Extracted values are
//! re-fielded onto the canonical leaf path of the selector so that keys
//! produced from different vantage points (a condition tracking its own
//! events, a metric translating through a condition link) collide exactly.

use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::event::{Event, Field, FieldValue, Value};
use crate::spec::{FieldMatcher, Position};

/// The tuple of values a metric slices by. Annotations do not participate
/// in equality or hashing.
#[derive(Debug, Clone, Default)]
pub struct DimensionKey {
    values: Vec<FieldValue>,
}

impl DimensionKey {
    pub const EMPTY: DimensionKey = DimensionKey { values: Vec::new() };

    pub fn new(values: Vec<FieldValue>) -> Self {
        Self { values }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    /// Flat rendering used in reports and logs, e.g. `1=10007,2.1.1=foo`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let path: Vec<String> = v.field.path().iter().map(|p| p.to_string()).collect();
            out.push_str(&path.join("."));
            out.push('=');
            out.push_str(&v.value.to_string());
        }
        out
    }
}

impl PartialEq for DimensionKey {
    fn eq(&self, other: &Self) -> bool {
        self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(other.values.iter())
                .all(|(a, b)| a.field == b.field && a.value == b.value)
    }
}

impl Eq for DimensionKey {}

impl Hash for DimensionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for v in &self.values {
            v.field.hash(state);
            v.value.hash(state);
        }
    }
}

impl Serialize for DimensionKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.render())
    }
}

/// Full metric partition key: the `dimensions_in_what` tuple plus the
/// group-mapped values of every state the metric slices by.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct MetricKey {
    pub dims: DimensionKey,
    pub states: Vec<i64>,
}

impl MetricKey {
    pub fn new(dims: DimensionKey, states: Vec<i64>) -> Self {
        Self { dims, states }
    }

    pub fn no_state(dims: DimensionKey) -> Self {
        Self {
            dims,
            states: Vec::new(),
        }
    }

    pub fn render(&self) -> String {
        if self.states.is_empty() {
            self.dims.render()
        } else {
            let states: Vec<String> = self.states.iter().map(|s| s.to_string()).collect();
            format!("{}|{}", self.dims.render(), states.join(","))
        }
    }
}

/// One step of a flattened selector leaf.
#[derive(Debug, Clone, Copy, PartialEq)]
enum DimStep {
    /// Match this field number at the current depth.
    FieldNum(i32),
    /// Traverse a repeated-field element, optionally pinned to an end.
    Element(Option<Position>),
}

/// A root-to-leaf path through a [`FieldMatcher`] tree.
#[derive(Debug, Clone)]
pub struct DimensionLeaf {
    steps: Vec<DimStep>,
}

impl DimensionLeaf {
    fn matches(&self, field: &Field) -> bool {
        let mut depth = 0usize;
        for step in &self.steps {
            match step {
                DimStep::FieldNum(f) => {
                    if field.pos_at_depth(depth) != *f {
                        return false;
                    }
                }
                DimStep::Element(pos) => match pos {
                    Some(Position::First) => {
                        if field.pos_at_depth(depth) != 1 {
                            return false;
                        }
                    }
                    Some(Position::Last) => {
                        if !field.is_last_pos(depth) {
                            return false;
                        }
                    }
                    // Any/All/unspecified: every element participates.
                    _ => {
                        if field.pos_at_depth(depth) == 0 {
                            return false;
                        }
                    }
                },
            }
            depth += 1;
        }
        true
    }

    /// Canonical field for values selected by this leaf: concrete field
    /// numbers, element steps collapsed to position 1.
    fn canonical_field(&self) -> Field {
        let path: Vec<i32> = self
            .steps
            .iter()
            .map(|s| match s {
                DimStep::FieldNum(f) => *f,
                DimStep::Element(_) => 1,
            })
            .collect();
        Field::new(&path)
    }
}

/// Flattens a selector into its root-to-leaf paths, in DFS order.
pub fn flatten_leaves(matcher: &FieldMatcher) -> Vec<DimensionLeaf> {
    let mut out = Vec::new();
    let mut prefix = Vec::new();
    flatten_into(matcher, &mut prefix, &mut out);
    out
}

fn flatten_into(matcher: &FieldMatcher, prefix: &mut Vec<DimStep>, out: &mut Vec<DimensionLeaf>) {
    prefix.push(DimStep::FieldNum(matcher.field));
    if matcher.position.is_some() {
        prefix.push(DimStep::Element(matcher.position));
    }
    if matcher.children.is_empty() {
        out.push(DimensionLeaf {
            steps: prefix.clone(),
        });
    } else {
        for child in &matcher.children {
            flatten_into(child, prefix, out);
        }
    }
    if matcher.position.is_some() {
        prefix.pop();
    }
    prefix.pop();
}

/// Extracts the dimension key selected by `matcher` from `values`.
///
/// Values are visited in leaf order; each value matched by a leaf is
/// re-fielded onto the leaf's canonical path.
pub fn extract_key(matcher: &FieldMatcher, values: &[FieldValue]) -> DimensionKey {
    let leaves = flatten_leaves(matcher);
    extract_key_with_leaves(&leaves, values)
}

pub fn extract_key_with_leaves(leaves: &[DimensionLeaf], values: &[FieldValue]) -> DimensionKey {
    let mut out = Vec::new();
    for leaf in leaves {
        let canonical = leaf.canonical_field();
        for fv in values {
            if leaf.matches(&fv.field) {
                out.push(FieldValue {
                    field: canonical,
                    value: fv.value.clone(),
                    annotations: fv.annotations,
                });
                // First/Last leaves select exactly one element.
                if !matches!(
                    leaf.steps.iter().find(|s| matches!(s, DimStep::Element(_))),
                    Some(DimStep::Element(Some(Position::Any | Position::All)))
                ) {
                    break;
                }
            }
        }
    }
    DimensionKey::new(out)
}

/// Translates a `what`-side key into a condition's dimension space via a
/// metric-condition link: values are selected by `fields_in_what` and
/// re-fielded onto the parallel leaves of `fields_in_condition`.
pub fn translate_link_key(
    fields_in_what: &FieldMatcher,
    fields_in_condition: &FieldMatcher,
    event: &Event,
) -> DimensionKey {
    let what_leaves = flatten_leaves(fields_in_what);
    let cond_leaves = flatten_leaves(fields_in_condition);

    let mut out = Vec::new();
    for (what_leaf, cond_leaf) in what_leaves.iter().zip(cond_leaves.iter()) {
        let canonical = cond_leaf.canonical_field();
        if let Some(fv) = event.values.iter().find(|fv| what_leaf.matches(&fv.field)) {
            out.push(FieldValue {
                field: canonical,
                value: fv.value.clone(),
                annotations: fv.annotations,
            });
        }
    }
    DimensionKey::new(out)
}

/// Extracts the first scalar selected by `matcher`, for value/sketch fields.
pub fn extract_value(matcher: &FieldMatcher, values: &[FieldValue]) -> Option<Value> {
    let leaves = flatten_leaves(matcher);
    for leaf in &leaves {
        for fv in values {
            if leaf.matches(&fv.field) {
                return Some(fv.value.clone());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::FieldAnnotations;

    fn attribution_event() -> Event {
        // Atom with an attribution chain (field 1, two nodes of {uid, tag})
        // and a scalar field 2.
        let mut e = Event::new(10, 10007, 100);
        e.push_annotated(
            &[1, 1, 1],
            Value::Int(10001),
            FieldAnnotations {
                is_uid: true,
                ..Default::default()
            },
        );
        e.push(&[1, 1, 2], Value::Str("tag1".into()));
        e.values.push(FieldValue {
            field: Field::new(&[1, 2, 1]).with_last(1),
            value: Value::Int(10002),
            annotations: FieldAnnotations::default(),
        });
        e.values.push(FieldValue {
            field: Field::new(&[1, 2, 2]).with_last(1),
            value: Value::Str("tag2".into()),
            annotations: FieldAnnotations::default(),
        });
        e.push(&[2], Value::Int(42));
        e
    }

    fn first_uid_selector() -> FieldMatcher {
        FieldMatcher {
            field: 1,
            position: Some(Position::First),
            children: vec![FieldMatcher::leaf(1)],
        }
    }

    #[test]
    fn test_extract_scalar_field() {
        let e = attribution_event();
        let key = extract_key(&FieldMatcher::leaf(2), &e.values);
        assert_eq!(key.values().len(), 1);
        assert_eq!(key.values()[0].value, Value::Int(42));
    }

    #[test]
    fn test_extract_first_attribution_uid() {
        let e = attribution_event();
        let key = extract_key(&first_uid_selector(), &e.values);
        assert_eq!(key.values().len(), 1);
        assert_eq!(key.values()[0].value, Value::Int(10001));
        // Canonical path pins the element to 1.
        assert_eq!(key.values()[0].field.path(), &[1, 1, 1]);
    }

    #[test]
    fn test_extract_last_attribution_uid() {
        let e = attribution_event();
        let sel = FieldMatcher {
            field: 1,
            position: Some(Position::Last),
            children: vec![FieldMatcher::leaf(1)],
        };
        let key = extract_key(&sel, &e.values);
        assert_eq!(key.values().len(), 1);
        assert_eq!(key.values()[0].value, Value::Int(10002));
        // Last-position values canonicalize to the same path as first,
        // keeping key spaces stable across differently-sized chains.
        assert_eq!(key.values()[0].field.path(), &[1, 1, 1]);
    }

    #[test]
    fn test_extract_all_elements() {
        let e = attribution_event();
        let sel = FieldMatcher {
            field: 1,
            position: Some(Position::All),
            children: vec![FieldMatcher::leaf(1)],
        };
        let key = extract_key(&sel, &e.values);
        assert_eq!(key.values().len(), 2);
    }

    #[test]
    fn test_keys_equal_ignoring_annotations() {
        let mut a = Event::new(1, 0, 0);
        a.push_annotated(
            &[1],
            Value::Int(7),
            FieldAnnotations {
                is_uid: true,
                ..Default::default()
            },
        );
        let mut b = Event::new(1, 0, 0);
        b.push(&[1], Value::Int(7));

        let sel = FieldMatcher::leaf(1);
        assert_eq!(extract_key(&sel, &a.values), extract_key(&sel, &b.values));
    }

    #[test]
    fn test_link_translation() {
        let e = attribution_event();
        // what side: first attribution uid; condition side: plain field 1.
        let cond_side = FieldMatcher::leaf(1);
        let key = translate_link_key(&first_uid_selector(), &cond_side, &e);
        assert_eq!(key.values().len(), 1);
        assert_eq!(key.values()[0].field.path(), &[1]);
        assert_eq!(key.values()[0].value, Value::Int(10001));

        // The translated key equals a key the condition would extract from
        // its own event carrying uid in field 1.
        let mut cond_event = Event::new(3, 0, 0);
        cond_event.push(&[1], Value::Int(10001));
        assert_eq!(key, extract_key(&cond_side, &cond_event.values));
    }

    #[test]
    fn test_extract_value_field() {
        let e = attribution_event();
        assert_eq!(
            extract_value(&FieldMatcher::leaf(2), &e.values),
            Some(Value::Int(42))
        );
        assert_eq!(extract_value(&FieldMatcher::leaf(9), &e.values), None);
    }

    #[test]
    fn test_metric_key_render() {
        let mut e = Event::new(1, 0, 0);
        e.push(&[1], Value::Int(7));
        let key = MetricKey::new(extract_key(&FieldMatcher::leaf(1), &e.values), vec![2]);
        assert_eq!(key.render(), "1=7|2");
    }
}
