//! Metric producers.
//!
//! All six variants share one pipeline: activation gate → lateness check →
//! bucket-boundary commit → dimension computation (with the per-bucket
//! guardrail) → condition gate (through metric-condition links for sliced
//! conditions) → variant handler. The shared driver lives here; variant
//! behavior is a six-case enum dispatched by tag.

pub mod activation;
pub mod count;
pub mod duration;
pub mod event;
pub mod gauge;
pub mod kll;
pub mod sketch;
pub mod value;

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use tracing::trace;

use crate::anomaly::AnomalyTracker;
use crate::condition::{self, ConditionState, ConditionTracker};
use crate::dimension::{extract_key, translate_link_key, DimensionKey, MetricKey};
use crate::event::{Event, Field, FieldValue, Value};
use crate::ident::next_generation;
use crate::puller::PullerManager;
use crate::spec::FieldMatcher;
use crate::state::{primary_key, StateChange, StateManager, STATE_UNKNOWN};
use crate::stats::GuardrailStats;

pub use activation::ActivationState;
pub use count::CountMetric;
pub use duration::DurationMetric;
pub use event::EventMetric;
pub use gauge::GaugeMetric;
pub use kll::KllMetric;
pub use value::ValueMetric;

/// Default and bounds for the per-bucket dimension guardrail. A configured
/// limit of 0 (or none) means the default; anything else is clamped into
/// `[DIM_LIMIT_MIN, DIM_LIMIT_MAX]`.
pub const DIM_LIMIT_DEFAULT: usize = 800;
pub const DIM_LIMIT_MIN: usize = 800;
pub const DIM_LIMIT_MAX: usize = 3000;

/// Open-bucket cap on raw events retained by an event metric.
pub const MAX_EVENTS_PER_BUCKET: usize = 5000;

pub fn clamp_dim_limit(configured: Option<u32>) -> usize {
    match configured {
        None | Some(0) => DIM_LIMIT_DEFAULT,
        Some(limit) => (limit as usize).clamp(DIM_LIMIT_MIN, DIM_LIMIT_MAX),
    }
}

/// Sentinel key absorbing dimensions past the guardrail.
pub fn over_limit_key() -> MetricKey {
    MetricKey::no_state(DimensionKey::new(vec![FieldValue::new(
        Field::new(&[0]),
        Value::Str("OVER_LIMIT".to_string()),
    )]))
}

/// One closed bucket for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct PastBucketEntry<T> {
    pub key: MetricKey,
    pub start_ns: i64,
    pub end_ns: i64,
    pub value: T,
}

/// Compiled metric-condition link.
#[derive(Debug, Clone)]
pub struct CompiledLink {
    pub condition_id: i64,
    pub condition_index: usize,
    pub fields_in_what: FieldMatcher,
    pub fields_in_condition: FieldMatcher,
}

/// Compiled `slice_by_states` entry.
#[derive(Debug, Clone)]
pub struct StateSlice {
    pub state_id: i64,
    pub atom_id: i32,
    /// Raw atom value → state group id. Unmapped values pass through.
    pub group_map: HashMap<i32, i64>,
}

impl StateSlice {
    pub fn map_value(&self, raw: i32) -> i64 {
        if raw == STATE_UNKNOWN {
            return i64::from(STATE_UNKNOWN);
        }
        self.group_map
            .get(&raw)
            .copied()
            .unwrap_or(i64::from(raw))
    }
}

/// Read-only view of the evaluation layers handed to producers during
/// dispatch. The condition slice doubles as the condition wizard; the state
/// manager plus this event's transition list give pre-event state
/// visibility.
pub struct EvalContext<'a> {
    pub conditions: &'a [ConditionTracker],
    pub state_mgr: &'a StateManager,
    /// Transitions caused by the current event, applied before metrics run.
    pub state_changes: &'a [StateChange],
    pub pullers: &'a PullerManager,
    pub stats: &'a GuardrailStats,
}

impl EvalContext<'_> {
    /// State value as of the instant of the current event: transitions the
    /// event itself caused are unwound to their old values.
    pub fn state_value(&self, atom_id: i32, key: &DimensionKey) -> i32 {
        if let Some(change) = self
            .state_changes
            .iter()
            .find(|c| c.atom_id == atom_id && c.primary_key == *key)
        {
            return change.old_state;
        }
        self.state_mgr.state_value(atom_id, key)
    }
}

/// Fields common to every variant.
#[derive(Debug, Clone)]
pub struct MetricCommon {
    pub id: i64,
    pub generation: u64,
    pub condition_id: Option<i64>,
    pub condition_index: Option<usize>,
    /// Cached unsliced condition value, updated by change notifications.
    pub condition: ConditionState,
    pub condition_sliced: bool,
    pub links: Vec<CompiledLink>,
    pub state_slices: Vec<StateSlice>,
    pub dimensions_in_what: Option<FieldMatcher>,
    pub bucket_size_ns: i64,
    pub bucket_start_ns: i64,
    pub dim_limit: usize,
    pub alert_indices: Vec<usize>,
    pub activation: ActivationState,
}

impl MetricCommon {
    /// Bucket number of the open bucket relative to the time base.
    pub fn bucket_num(&self) -> i64 {
        self.bucket_start_ns / self.bucket_size_ns.max(1)
    }

    pub fn dims_of(&self, event: &Event) -> DimensionKey {
        self.dimensions_in_what
            .as_ref()
            .map(|d| extract_key(d, &event.values))
            .unwrap_or_default()
    }

    /// Group-mapped state tuple at the instant of the event.
    pub fn state_tuple(&self, event: &Event, ctx: &EvalContext<'_>) -> Vec<i64> {
        if self.state_slices.is_empty() {
            return Vec::new();
        }
        let event_primary = primary_key(event);
        self.state_slices
            .iter()
            .map(|slice| {
                let mut raw = ctx.state_value(slice.atom_id, &event_primary);
                if raw == STATE_UNKNOWN && !event_primary.is_empty() {
                    // Global (unkeyed) states track under the empty key.
                    raw = ctx.state_value(slice.atom_id, &DimensionKey::EMPTY);
                }
                slice.map_value(raw)
            })
            .collect()
    }

    /// Effective condition for one event: links translate the event into
    /// the condition's dimension space when it is sliced.
    pub fn effective_condition(&self, event: &Event, ctx: &EvalContext<'_>) -> ConditionState {
        let Some(condition_index) = self.condition_index else {
            return ConditionState::True;
        };
        if !self.condition_sliced {
            return self.condition;
        }
        if self.links.is_empty() {
            // Sliced condition without links: any key TRUE counts.
            return condition::current_state(ctx.conditions, condition_index);
        }
        let mut states = Vec::with_capacity(self.links.len());
        for link in &self.links {
            let key = translate_link_key(&link.fields_in_what, &link.fields_in_condition, event);
            states.push(condition::query(ctx.conditions, link.condition_index, &key));
        }
        condition::combine(crate::spec::LogicalOperation::And, &states)
    }

    /// Applies the per-bucket dimension guardrail.
    pub fn guard_key(
        &self,
        key: MetricKey,
        tracked: usize,
        already_tracked: bool,
        stats: &GuardrailStats,
    ) -> MetricKey {
        if already_tracked || tracked < self.dim_limit {
            key
        } else {
            stats.over_dimension_limit.fetch_add(1, Ordering::Relaxed);
            over_limit_key()
        }
    }
}

/// Variant-specific behavior and storage.
#[derive(Debug, Clone)]
pub enum MetricVariant {
    Count(CountMetric),
    Duration(DurationMetric),
    Gauge(GaugeMetric),
    Value(ValueMetric),
    Kll(KllMetric),
    Event(EventMetric),
}

impl MetricVariant {
    pub fn kind_name(&self) -> &'static str {
        match self {
            MetricVariant::Count(_) => "count",
            MetricVariant::Duration(_) => "duration",
            MetricVariant::Gauge(_) => "gauge",
            MetricVariant::Value(_) => "value",
            MetricVariant::Kll(_) => "kll",
            MetricVariant::Event(_) => "event",
        }
    }
}

/// One live metric.
#[derive(Debug, Clone)]
pub struct MetricProducer {
    pub common: MetricCommon,
    pub variant: MetricVariant,
}

impl MetricProducer {
    pub fn new(common: MetricCommon, variant: MetricVariant) -> Self {
        Self { common, variant }
    }

    pub fn id(&self) -> i64 {
        self.common.id
    }

    pub fn generation(&self) -> u64 {
        self.common.generation
    }

    /// Entry point for a fired matcher. `matcher_index` disambiguates the
    /// roles a duration metric wires (start/stop/stop-all) and a gauge's
    /// trigger matcher.
    pub fn on_matched_event(
        &mut self,
        matcher_index: usize,
        event: &Event,
        ctx: &EvalContext<'_>,
        alerts: &mut [AnomalyTracker],
    ) {
        let now = event.elapsed_ts_ns;
        if !self.common.activation.active(now) {
            trace!(metric_id = self.common.id, "metric inactive, dropping event");
            return;
        }

        if now < self.common.bucket_start_ns {
            ctx.stats.late_events.fetch_add(1, Ordering::Relaxed);
            trace!(
                metric_id = self.common.id,
                event_ns = now,
                bucket_start_ns = self.common.bucket_start_ns,
                "late event dropped"
            );
            return;
        }

        self.flush_if_needed(now, alerts);

        let MetricProducer { common, variant } = self;
        match variant {
            MetricVariant::Count(m) => m.on_matched_event(common, event, ctx),
            MetricVariant::Duration(m) => {
                m.on_matched_event(common, matcher_index, event, ctx, alerts)
            }
            MetricVariant::Gauge(m) => m.on_matched_event(common, matcher_index, event, ctx),
            MetricVariant::Value(m) => m.on_matched_event(common, event, ctx),
            MetricVariant::Kll(m) => m.on_matched_event(common, event, ctx),
            MetricVariant::Event(m) => m.on_matched_event(common, event, ctx),
        }
    }

    /// Unsliced condition change, delivered in ascending metric order.
    pub fn on_condition_changed(
        &mut self,
        new_state: ConditionState,
        ts_ns: i64,
        alerts: &mut [AnomalyTracker],
    ) {
        let old = self.common.condition;
        self.common.condition = new_state;
        if let MetricVariant::Duration(m) = &mut self.variant {
            m.on_condition_changed(&self.common, old, new_state, ts_ns, alerts);
        }
    }

    /// A sliced condition this metric subscribes to changed for some keys.
    pub fn on_sliced_condition_may_change(
        &mut self,
        ts_ns: i64,
        ctx: &EvalContext<'_>,
        alerts: &mut [AnomalyTracker],
    ) {
        if let MetricVariant::Duration(m) = &mut self.variant {
            m.on_sliced_condition_may_change(&self.common, ts_ns, ctx, alerts);
        }
    }

    /// A state this metric slices by transitioned.
    pub fn on_state_changed(&mut self, change: &StateChange) {
        let slice_positions: Vec<usize> = self
            .common
            .state_slices
            .iter()
            .enumerate()
            .filter(|(_, s)| s.atom_id == change.atom_id)
            .map(|(i, _)| i)
            .collect();
        if slice_positions.is_empty() {
            return;
        }
        if let MetricVariant::Duration(m) = &mut self.variant {
            m.on_state_changed(&self.common, change, &slice_positions);
        }
    }

    /// Closes buckets the event time has passed. Multiple buckets close at
    /// once after a quiet gap; alerts observe each closed bucket number so
    /// their rolling windows age correctly.
    pub fn flush_if_needed(&mut self, now_ns: i64, alerts: &mut [AnomalyTracker]) {
        let size = self.common.bucket_size_ns.max(1);
        if now_ns < self.common.bucket_start_ns + size {
            return;
        }
        let boundary = self.common.bucket_start_ns + size;
        self.close_bucket(boundary, alerts);
        // Skip forward over empty buckets.
        let n = (now_ns - self.common.bucket_start_ns) / size;
        self.common.bucket_start_ns += n * size;
    }

    fn close_bucket(&mut self, boundary_ns: i64, alerts: &mut [AnomalyTracker]) {
        let MetricProducer { common, variant } = self;
        let closed_bucket_num = common.bucket_num();
        let sums: HashMap<MetricKey, i64> = match variant {
            MetricVariant::Count(m) => m.flush_bucket(common, boundary_ns),
            MetricVariant::Duration(m) => m.flush_bucket(common, boundary_ns),
            MetricVariant::Gauge(m) => m.flush_bucket(common, boundary_ns),
            MetricVariant::Value(m) => m.flush_bucket(common, boundary_ns),
            MetricVariant::Kll(m) => m.flush_bucket(common, boundary_ns),
            MetricVariant::Event(m) => m.flush_bucket(common, boundary_ns),
        };
        for &alert_index in &common.alert_indices {
            if let Some(alert) = alerts.get_mut(alert_index) {
                alert.on_bucket_closed(closed_bucket_num, boundary_ns, &sums);
            }
        }
    }

    /// Closes the open bucket at `dump_ts` (partial) and hands out all past
    /// buckets, clearing them. In-flight tracker state survives.
    pub fn drain_report(&mut self, dump_ts_ns: i64, alerts: &mut [AnomalyTracker]) -> VariantReport {
        if dump_ts_ns > self.common.bucket_start_ns {
            self.close_bucket(dump_ts_ns, alerts);
            let size = self.common.bucket_size_ns.max(1);
            let n = (dump_ts_ns - self.common.bucket_start_ns) / size;
            self.common.bucket_start_ns += n * size;
        }
        let MetricProducer { common, variant } = self;
        match variant {
            MetricVariant::Count(m) => VariantReport::Count(m.take_past()),
            MetricVariant::Duration(m) => VariantReport::Duration(m.take_past()),
            MetricVariant::Gauge(m) => VariantReport::Gauge(m.take_past()),
            MetricVariant::Value(m) => VariantReport::Value(m.take_past()),
            MetricVariant::Kll(m) => VariantReport::Kll(m.take_past()),
            MetricVariant::Event(m) => VariantReport::Event(m.take_past()),
        }
        .tap_log(common.id)
    }

    /// Read-only view of closed buckets for non-clearing dumps.
    pub fn peek_report(&self) -> VariantReport {
        match &self.variant {
            MetricVariant::Count(m) => VariantReport::Count(m.past().to_vec()),
            MetricVariant::Duration(m) => VariantReport::Duration(m.past().to_vec()),
            MetricVariant::Gauge(m) => VariantReport::Gauge(m.past().to_vec()),
            MetricVariant::Value(m) => VariantReport::Value(m.past().to_vec()),
            MetricVariant::Kll(m) => VariantReport::Kll(m.past().to_vec()),
            MetricVariant::Event(m) => VariantReport::Event(m.past().to_vec()),
        }
    }
}

/// Closed-bucket payloads per variant, consumed by report assembly.
#[derive(Debug, Clone)]
pub enum VariantReport {
    Count(Vec<PastBucketEntry<i64>>),
    Duration(Vec<PastBucketEntry<i64>>),
    Gauge(Vec<PastBucketEntry<Vec<gauge::GaugeSample>>>),
    Value(Vec<PastBucketEntry<value::ValueSnapshot>>),
    Kll(Vec<PastBucketEntry<Vec<u8>>>),
    Event(Vec<event::LoggedEvent>),
}

impl VariantReport {
    fn tap_log(self, metric_id: i64) -> Self {
        trace!(metric_id, kind = self.kind_name(), "metric report drained");
        self
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            VariantReport::Count(_) => "count",
            VariantReport::Duration(_) => "duration",
            VariantReport::Gauge(_) => "gauge",
            VariantReport::Value(_) => "value",
            VariantReport::Kll(_) => "kll",
            VariantReport::Event(_) => "event",
        }
    }
}

/// Builds the common block for a new producer.
#[allow(clippy::too_many_arguments)]
pub fn new_common(
    id: i64,
    condition_id: Option<i64>,
    condition_index: Option<usize>,
    initial_condition: ConditionState,
    condition_sliced: bool,
    links: Vec<CompiledLink>,
    state_slices: Vec<StateSlice>,
    dimensions_in_what: Option<FieldMatcher>,
    bucket_size_ns: i64,
    time_base_ns: i64,
    dim_limit: Option<u32>,
    activation: ActivationState,
) -> MetricCommon {
    MetricCommon {
        id,
        generation: next_generation(),
        condition_id,
        condition_index,
        condition: if condition_index.is_none() {
            ConditionState::True
        } else {
            initial_condition
        },
        condition_sliced,
        links,
        state_slices,
        dimensions_in_what,
        bucket_size_ns,
        bucket_start_ns: time_base_ns,
        dim_limit: clamp_dim_limit(dim_limit),
        alert_indices: Vec::new(),
        activation,
    }
}
