use std::collections::HashMap;

use serde::Serialize;
use tracing::trace;

use crate::dimension::{extract_value, MetricKey};
use crate::event::Event;
use crate::spec::{FieldMatcher, ValueAggregation};

use super::{EvalContext, MetricCommon, PastBucketEntry};

/// Running accumulator for one key.
#[derive(Debug, Clone, Copy)]
struct ValueAccum {
    sum: i64,
    min: i64,
    max: i64,
    count: u64,
}

impl ValueAccum {
    fn new(v: i64) -> Self {
        Self {
            sum: v,
            min: v,
            max: v,
            count: 1,
        }
    }

    fn add(&mut self, v: i64) {
        self.sum += v;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        self.count += 1;
    }
}

/// Reported aggregate for one key and bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ValueSnapshot {
    pub sum: i64,
    pub min: i64,
    pub max: i64,
    pub count: u64,
    pub avg: f64,
}

/// Numeric-value accumulator with absolute or diff semantics.
#[derive(Debug, Clone)]
pub struct ValueMetric {
    value_field: FieldMatcher,
    use_diff: bool,
    aggregation: ValueAggregation,
    skip_zero_diff_output: bool,
    current: HashMap<MetricKey, ValueAccum>,
    /// Previous raw values for diffing; survives bucket boundaries.
    diff_bases: HashMap<MetricKey, i64>,
    past: Vec<PastBucketEntry<ValueSnapshot>>,
}

impl ValueMetric {
    pub fn new(
        value_field: FieldMatcher,
        use_diff: bool,
        aggregation: ValueAggregation,
        skip_zero_diff_output: bool,
    ) -> Self {
        Self {
            value_field,
            use_diff,
            aggregation,
            skip_zero_diff_output,
            current: HashMap::new(),
            diff_bases: HashMap::new(),
            past: Vec::new(),
        }
    }

    pub fn aggregation(&self) -> ValueAggregation {
        self.aggregation
    }

    pub fn on_matched_event(&mut self, common: &MetricCommon, event: &Event, ctx: &EvalContext<'_>) {
        if !common.effective_condition(event, ctx).is_true() {
            return;
        }
        let Some(raw) = extract_value(&self.value_field, &event.values).and_then(|v| v.as_long())
        else {
            trace!(metric_id = common.id, "value field missing, event skipped");
            return;
        };

        let key = MetricKey::new(common.dims_of(event), common.state_tuple(event, ctx));
        let key = common.guard_key(
            key.clone(),
            self.current.len(),
            self.current.contains_key(&key),
            ctx.stats,
        );

        let value = if self.use_diff {
            let prev = self.diff_bases.insert(key.clone(), raw);
            let Some(prev) = prev else {
                // First observation only establishes the base.
                return;
            };
            let diff = raw - prev;
            if diff == 0 && self.skip_zero_diff_output {
                return;
            }
            diff
        } else {
            raw
        };

        self.current
            .entry(key)
            .and_modify(|acc| acc.add(value))
            .or_insert_with(|| ValueAccum::new(value));
    }

    pub fn flush_bucket(
        &mut self,
        common: &MetricCommon,
        boundary_ns: i64,
    ) -> HashMap<MetricKey, i64> {
        let mut sums = HashMap::with_capacity(self.current.len());
        for (key, acc) in std::mem::take(&mut self.current) {
            // Alerts window the same scalar the aggregation reports.
            let alert_value = match self.aggregation {
                ValueAggregation::Sum | ValueAggregation::Avg => acc.sum,
                ValueAggregation::Min => acc.min,
                ValueAggregation::Max => acc.max,
            };
            sums.insert(key.clone(), alert_value);
            self.past.push(PastBucketEntry {
                key,
                start_ns: common.bucket_start_ns,
                end_ns: boundary_ns,
                value: ValueSnapshot {
                    sum: acc.sum,
                    min: acc.min,
                    max: acc.max,
                    count: acc.count,
                    avg: acc.sum as f64 / acc.count.max(1) as f64,
                },
            });
        }
        sums
    }

    pub fn past(&self) -> &[PastBucketEntry<ValueSnapshot>] {
        &self.past
    }

    pub fn take_past(&mut self) -> Vec<PastBucketEntry<ValueSnapshot>> {
        std::mem::take(&mut self.past)
    }
}
