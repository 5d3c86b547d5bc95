//! Declarative configuration model.
//!
//! A [`TelemetryConfig`] is the unit of installation: a directed acyclic
//! graph of matchers, predicates, states, metrics, alerts and alarms,
//! identified by a [`ConfigKey`] and immutable once installed. The compiler
//! (`crate::compiler`) turns it into live trackers; equality of these
//! definition structs is what drives the preserve/replace diff on update.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hard ceilings on configuration size.
pub const MAX_MATCHERS: usize = 1024;
pub const MAX_PREDICATES: usize = 256;
pub const MAX_METRICS: usize = 256;
pub const MAX_ALERTS: usize = 100;
pub const MAX_ALARMS: usize = 100;

/// Identifies one installed configuration: the installing uid plus the
/// config's own id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigKey {
    pub uid: i32,
    pub id: i64,
}

impl ConfigKey {
    pub fn new(uid: i32, id: i64) -> Self {
        Self { uid, id }
    }
}

impl std::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.uid, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperation {
    And,
    Or,
    Not,
    Nand,
    Nor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    First,
    Last,
    Any,
    /// Present in the input grammar but unsupported by the matcher layer.
    All,
}

/// Leaf comparison applied to one field (or a tuple recursion).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueMatcher {
    EqBool(bool),
    EqInt(i64),
    EqAnyInt(Vec<i64>),
    NeqAnyInt(Vec<i64>),
    LtInt(i64),
    GtInt(i64),
    LteInt(i64),
    GteInt(i64),
    LtFloat(f32),
    GtFloat(f32),
    EqString(String),
    EqAnyString(Vec<String>),
    NeqAnyString(Vec<String>),
    EqWildcardString(String),
    EqAnyWildcardString(Vec<String>),
    NeqAnyWildcardString(Vec<String>),
    MatchesTuple(Vec<FieldValueMatcher>),
}

/// A recursive predicate over one field position of an atom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValueMatcher {
    pub field: i32,
    #[serde(default)]
    pub position: Option<Position>,
    pub value: ValueMatcher,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleAtomMatcher {
    pub atom_id: i32,
    #[serde(default)]
    pub field_value_matchers: Vec<FieldValueMatcher>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatcherCombination {
    pub operation: LogicalOperation,
    pub children: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherKind {
    Simple(SimpleAtomMatcher),
    Combination(MatcherCombination),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomMatcherDef {
    pub id: i64,
    #[serde(flatten)]
    pub kind: MatcherKind,
}

/// Dimension selector: a tree of field positions rooted at the atom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMatcher {
    pub field: i32,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub children: Vec<FieldMatcher>,
}

impl FieldMatcher {
    pub fn leaf(field: i32) -> Self {
        Self {
            field,
            position: None,
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialConditionValue {
    False,
    Unknown,
}

impl Default for InitialConditionValue {
    fn default() -> Self {
        InitialConditionValue::False
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimplePredicate {
    pub start: i64,
    pub stop: i64,
    #[serde(default)]
    pub stop_all: Option<i64>,
    /// When set, condition truth is tracked per extracted dimension key.
    #[serde(default)]
    pub dimensions: Option<FieldMatcher>,
    #[serde(default)]
    pub initial_value: InitialConditionValue,
    /// Reference-counted starts/stops; the condition flips only on 0↔≥1.
    #[serde(default)]
    pub count_nesting: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredicateCombination {
    pub operation: LogicalOperation,
    pub children: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateKind {
    Simple(SimplePredicate),
    Combination(PredicateCombination),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredicateDef {
    pub id: i64,
    #[serde(flatten)]
    pub kind: PredicateKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateGroup {
    pub group_id: i64,
    pub values: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDef {
    pub id: i64,
    pub atom_id: i32,
    /// Optional mapping of raw atom values into coarser state groups.
    #[serde(default)]
    pub groups: Vec<StateGroup>,
}

impl StateDef {
    /// Stable content hash; the compiler diffs states by this rather than by
    /// retained definitions.
    pub fn content_hash(&self) -> [u8; 32] {
        let serialized = serde_yaml::to_string(self).unwrap_or_default();
        Sha256::digest(serialized.as_bytes()).into()
    }
}

/// Binds `what` dimensions to the dimension space of a sliced condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricConditionLink {
    pub condition: i64,
    pub fields_in_what: FieldMatcher,
    pub fields_in_condition: FieldMatcher,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationAggregation {
    Sum,
    /// Largest single interval per bucket; empty buckets emit nothing.
    MaxSparse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GaugeSampling {
    RandomOneSample,
    FirstNSamples(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueAggregation {
    Sum,
    Min,
    Max,
    Avg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetricDef {
    pub id: i64,
    pub what: i64,
    #[serde(default)]
    pub condition: Option<i64>,
    #[serde(default)]
    pub links: Vec<MetricConditionLink>,
    #[serde(with = "humantime_serde")]
    pub bucket: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountMetricDef {
    pub id: i64,
    pub what: i64,
    #[serde(default)]
    pub condition: Option<i64>,
    #[serde(default)]
    pub slice_by_states: Vec<i64>,
    #[serde(default)]
    pub dimensions_in_what: Option<FieldMatcher>,
    #[serde(default)]
    pub links: Vec<MetricConditionLink>,
    #[serde(with = "humantime_serde")]
    pub bucket: Duration,
    #[serde(default)]
    pub max_dimensions_per_bucket: Option<u32>,
}

/// `what` names a simple predicate; its start/stop/stop_all matchers drive
/// the per-key duration state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationMetricDef {
    pub id: i64,
    pub what: i64,
    #[serde(default)]
    pub condition: Option<i64>,
    #[serde(default)]
    pub slice_by_states: Vec<i64>,
    #[serde(default)]
    pub dimensions_in_what: Option<FieldMatcher>,
    #[serde(default)]
    pub links: Vec<MetricConditionLink>,
    #[serde(default = "default_duration_aggregation")]
    pub aggregation: DurationAggregation,
    #[serde(with = "humantime_serde")]
    pub bucket: Duration,
    #[serde(default)]
    pub max_dimensions_per_bucket: Option<u32>,
}

fn default_duration_aggregation() -> DurationAggregation {
    DurationAggregation::Sum
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaugeMetricDef {
    pub id: i64,
    pub what: i64,
    #[serde(default)]
    pub condition: Option<i64>,
    #[serde(default)]
    pub dimensions_in_what: Option<FieldMatcher>,
    #[serde(default)]
    pub links: Vec<MetricConditionLink>,
    pub sampling: GaugeSampling,
    /// Matcher whose hits request a pull for pulled-atom gauges.
    #[serde(default)]
    pub trigger_event_matcher: Option<i64>,
    #[serde(with = "humantime_serde")]
    pub bucket: Duration,
    #[serde(default)]
    pub max_dimensions_per_bucket: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueMetricDef {
    pub id: i64,
    pub what: i64,
    #[serde(default)]
    pub condition: Option<i64>,
    #[serde(default)]
    pub slice_by_states: Vec<i64>,
    #[serde(default)]
    pub dimensions_in_what: Option<FieldMatcher>,
    #[serde(default)]
    pub links: Vec<MetricConditionLink>,
    pub value_field: FieldMatcher,
    #[serde(default)]
    pub use_diff: bool,
    #[serde(default = "default_value_aggregation")]
    pub aggregation: ValueAggregation,
    #[serde(default)]
    pub skip_zero_diff_output: bool,
    #[serde(with = "humantime_serde")]
    pub bucket: Duration,
    #[serde(default)]
    pub max_dimensions_per_bucket: Option<u32>,
}

fn default_value_aggregation() -> ValueAggregation {
    ValueAggregation::Sum
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KllMetricDef {
    pub id: i64,
    pub what: i64,
    #[serde(default)]
    pub condition: Option<i64>,
    #[serde(default)]
    pub dimensions_in_what: Option<FieldMatcher>,
    #[serde(default)]
    pub links: Vec<MetricConditionLink>,
    pub value_field: FieldMatcher,
    #[serde(with = "humantime_serde")]
    pub bucket: Duration,
    #[serde(default)]
    pub max_dimensions_per_bucket: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDef {
    pub id: i64,
    pub metric_id: i64,
    pub num_buckets: u32,
    pub trigger_if_sum_gt: i64,
    #[serde(default)]
    pub refractory_period_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmDef {
    pub id: i64,
    pub offset_millis: i64,
    pub period_millis: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationType {
    /// The activation window opens on the triggering event.
    Immediate,
    /// The activation arms now and opens at the next boot.
    OnBoot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventActivation {
    pub atom_matcher_id: i64,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(default = "default_activation_type")]
    pub activation_type: ActivationType,
    #[serde(default)]
    pub deactivation_atom_matcher_id: Option<i64>,
}

fn default_activation_type() -> ActivationType {
    ActivationType::Immediate
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricActivation {
    pub metric_id: i64,
    pub event_activations: Vec<EventActivation>,
}

/// One installable configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub id: i64,
    #[serde(default)]
    pub atom_matchers: Vec<AtomMatcherDef>,
    #[serde(default)]
    pub predicates: Vec<PredicateDef>,
    #[serde(default)]
    pub states: Vec<StateDef>,
    #[serde(default)]
    pub event_metrics: Vec<EventMetricDef>,
    #[serde(default)]
    pub count_metrics: Vec<CountMetricDef>,
    #[serde(default)]
    pub duration_metrics: Vec<DurationMetricDef>,
    #[serde(default)]
    pub gauge_metrics: Vec<GaugeMetricDef>,
    #[serde(default)]
    pub value_metrics: Vec<ValueMetricDef>,
    #[serde(default)]
    pub kll_metrics: Vec<KllMetricDef>,
    #[serde(default)]
    pub alerts: Vec<AlertDef>,
    #[serde(default)]
    pub alarms: Vec<AlarmDef>,
    #[serde(default)]
    pub metric_activations: Vec<MetricActivation>,
    /// Metrics that aggregate but are excluded from report dumps.
    #[serde(default)]
    pub no_report_metrics: Vec<i64>,
    /// Atom ids accepted from any logging uid. A state-sliced metric over
    /// one of these must not expose dimensions (cross-uid leakage).
    #[serde(default)]
    pub allowed_from_any_uid_atom_ids: Vec<i32>,
    /// Delegation to an external restricted-metrics host is unsupported.
    #[serde(default)]
    pub restricted_metrics_delegate: Option<String>,
}

impl TelemetryConfig {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn metric_count(&self) -> usize {
        self.event_metrics.len()
            + self.count_metrics.len()
            + self.duration_metrics.len()
            + self.gauge_metrics.len()
            + self.value_metrics.len()
            + self.kll_metrics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_hash_stable() {
        let s = StateDef {
            id: 5,
            atom_id: 27,
            groups: vec![],
        };
        assert_eq!(s.content_hash(), s.content_hash());
    }

    #[test]
    fn test_state_hash_differs_on_change() {
        let a = StateDef {
            id: 5,
            atom_id: 27,
            groups: vec![],
        };
        let mut b = a.clone();
        b.atom_id = 29;
        assert_ne!(a.content_hash(), b.content_hash());

        let mut c = a.clone();
        c.groups.push(StateGroup {
            group_id: 100,
            values: vec![1, 2],
        });
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn test_config_yaml_round_trip() {
        let yaml = r#"
id: 42
atom_matchers:
  - id: 1
    simple:
      atom_id: 29
      field_value_matchers:
        - field: 1
          value:
            eq_int: 2
  - id: 2
    combination:
      operation: "not"
      children: [1]
predicates:
  - id: 10
    simple:
      start: 1
      stop: 2
      initial_value: unknown
count_metrics:
  - id: 100
    what: 1
    condition: 10
    bucket: 5m
"#;
        let cfg: TelemetryConfig = serde_yaml::from_str(yaml).expect("parse config");
        assert_eq!(cfg.id, 42);
        assert_eq!(cfg.atom_matchers.len(), 2);
        assert!(matches!(cfg.atom_matchers[0].kind, MatcherKind::Simple(_)));
        assert!(matches!(
            cfg.atom_matchers[1].kind,
            MatcherKind::Combination(_)
        ));
        assert_eq!(cfg.count_metrics[0].bucket, Duration::from_secs(300));

        let back = serde_yaml::to_string(&cfg).expect("serialize");
        let again: TelemetryConfig = serde_yaml::from_str(&back).expect("reparse");
        assert_eq!(cfg, again);
    }

    #[test]
    fn test_metric_count() {
        let mut cfg = TelemetryConfig::new(1);
        cfg.count_metrics.push(CountMetricDef {
            id: 1,
            what: 1,
            condition: None,
            slice_by_states: vec![],
            dimensions_in_what: None,
            links: vec![],
            bucket: Duration::from_secs(60),
            max_dimensions_per_bucket: None,
        });
        cfg.event_metrics.push(EventMetricDef {
            id: 2,
            what: 1,
            condition: None,
            links: vec![],
            bucket: Duration::from_secs(60),
        });
        assert_eq!(cfg.metric_count(), 2);
    }
}
