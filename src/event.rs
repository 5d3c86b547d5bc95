use std::fmt;

/// Maximum nesting depth of a field path. Depth 0 is the top-level field
/// number; deeper levels index into repeated/nested fields.
pub const MAX_FIELD_DEPTH: usize = 3;

/// A depth-aware position of one value inside an atom.
///
/// Values carry the full path from the atom root, e.g. `[1, 2, 1]` is the
/// first attribution node's second field. Repeated fields store their
/// 1-based element position at the corresponding depth; the final element of
/// a repeated field is additionally flagged so LAST-position matchers can
/// find it without scanning ahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Field {
    pos: [i32; MAX_FIELD_DEPTH],
    last: [bool; MAX_FIELD_DEPTH],
    depth: u8,
}

impl Field {
    pub fn new(path: &[i32]) -> Self {
        let mut pos = [0i32; MAX_FIELD_DEPTH];
        let depth = path.len().min(MAX_FIELD_DEPTH);
        pos[..depth].copy_from_slice(&path[..depth]);
        Self {
            pos,
            last: [false; MAX_FIELD_DEPTH],
            depth: depth as u8,
        }
    }

    /// Marks the element at `depth` as the last of its repeated field.
    pub fn with_last(mut self, depth: usize) -> Self {
        if depth < MAX_FIELD_DEPTH {
            self.last[depth] = true;
        }
        self
    }

    pub fn depth(&self) -> usize {
        self.depth as usize
    }

    /// Position at the given depth, or 0 when the path is shallower.
    pub fn pos_at_depth(&self, depth: usize) -> i32 {
        if depth < self.depth as usize {
            self.pos[depth]
        } else {
            0
        }
    }

    pub fn is_last_pos(&self, depth: usize) -> bool {
        depth < self.depth as usize && self.last[depth]
    }

    /// True when `prefix` matches this field's leading path positions.
    pub fn has_prefix(&self, prefix: &[i32]) -> bool {
        if prefix.len() > self.depth as usize {
            return false;
        }
        prefix
            .iter()
            .enumerate()
            .all(|(d, p)| self.pos[d] == *p)
    }

    pub fn path(&self) -> &[i32] {
        &self.pos[..self.depth as usize]
    }
}

/// A scalar payload carried by one event field.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Widens Int to i64; used wherever integer matchers accept both widths.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            // Bit equality: dimension keys must be stable, NaN included.
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Value::Int(v) => {
                state.write_u8(0);
                v.hash(state);
            }
            Value::Long(v) => {
                state.write_u8(1);
                v.hash(state);
            }
            Value::Float(v) => {
                state.write_u8(2);
                v.to_bits().hash(state);
            }
            Value::Str(v) => {
                state.write_u8(3);
                v.hash(state);
            }
            Value::Bytes(v) => {
                state.write_u8(4);
                v.hash(state);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v}"),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// Per-field annotations stamped by the event producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldAnnotations {
    /// Field carries a uid; string matchers resolve it through the UidMap.
    pub is_uid: bool,
    /// Field participates in the state tracker's primary key.
    pub is_primary: bool,
    /// Field is the atom's exclusive state field.
    pub is_exclusive_state: bool,
    /// State transitions for this field use nested (counted) semantics.
    pub is_nested: bool,
}

/// One field of an event: path, scalar and annotations.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldValue {
    pub field: Field,
    pub value: Value,
    pub annotations: FieldAnnotations,
}

impl FieldValue {
    pub fn new(field: Field, value: Value) -> Self {
        Self {
            field,
            value,
            annotations: FieldAnnotations::default(),
        }
    }
}

/// A structured atomic log event.
///
/// `values` are stored in DFS order of their field paths; matcher and
/// dimension extraction rely on that ordering.
#[derive(Debug, Clone)]
pub struct Event {
    pub atom_id: i32,
    pub uid: i32,
    pub elapsed_ts_ns: i64,
    pub wall_ts_ns: i64,
    pub values: Vec<FieldValue>,
    /// When set, every key of the atom's state tracker resets to this value.
    pub reset_state: Option<i32>,
    pub truncate_timestamp: bool,
}

impl Event {
    pub fn new(atom_id: i32, uid: i32, elapsed_ts_ns: i64) -> Self {
        Self {
            atom_id,
            uid,
            elapsed_ts_ns,
            wall_ts_ns: elapsed_ts_ns,
            values: Vec::new(),
            reset_state: None,
            truncate_timestamp: false,
        }
    }

    pub fn push(&mut self, path: &[i32], value: Value) -> &mut Self {
        self.values.push(FieldValue::new(Field::new(path), value));
        self
    }

    pub fn push_annotated(
        &mut self,
        path: &[i32],
        value: Value,
        annotations: FieldAnnotations,
    ) -> &mut Self {
        self.values.push(FieldValue {
            field: Field::new(path),
            value,
            annotations,
        });
        self
    }

    /// Index of the exclusive state field, when the atom declares one.
    pub fn exclusive_state_index(&self) -> Option<usize> {
        self.values
            .iter()
            .position(|v| v.annotations.is_exclusive_state)
    }
}
