use std::collections::HashMap;

use tracing::trace;

use crate::dimension::{extract_value, MetricKey};
use crate::event::Event;
use crate::spec::FieldMatcher;

use super::sketch::QuantileSketch;
use super::{EvalContext, MetricCommon, PastBucketEntry};

/// Per-key quantile sketch over a value field.
#[derive(Debug, Clone)]
pub struct KllMetric {
    value_field: FieldMatcher,
    current: HashMap<MetricKey, QuantileSketch>,
    past: Vec<PastBucketEntry<Vec<u8>>>,
}

impl KllMetric {
    pub fn new(value_field: FieldMatcher) -> Self {
        Self {
            value_field,
            current: HashMap::new(),
            past: Vec::new(),
        }
    }

    pub fn on_matched_event(&mut self, common: &MetricCommon, event: &Event, ctx: &EvalContext<'_>) {
        if !common.effective_condition(event, ctx).is_true() {
            return;
        }
        let Some(value) = extract_value(&self.value_field, &event.values).and_then(|v| v.as_long())
        else {
            trace!(metric_id = common.id, "sketch value field missing, event skipped");
            return;
        };

        let key = MetricKey::no_state(common.dims_of(event));
        let key = common.guard_key(
            key.clone(),
            self.current.len(),
            self.current.contains_key(&key),
            ctx.stats,
        );
        self.current.entry(key).or_default().insert(value);
    }

    pub fn flush_bucket(
        &mut self,
        common: &MetricCommon,
        boundary_ns: i64,
    ) -> HashMap<MetricKey, i64> {
        let mut sums = HashMap::with_capacity(self.current.len());
        for (key, sketch) in std::mem::take(&mut self.current) {
            sums.insert(key.clone(), sketch.count() as i64);
            self.past.push(PastBucketEntry {
                key,
                start_ns: common.bucket_start_ns,
                end_ns: boundary_ns,
                value: sketch.snapshot(),
            });
        }
        sums
    }

    pub fn past(&self) -> &[PastBucketEntry<Vec<u8>>] {
        &self.past
    }

    pub fn take_past(&mut self) -> Vec<PastBucketEntry<Vec<u8>>> {
        std::mem::take(&mut self.past)
    }
}
