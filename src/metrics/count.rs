use std::collections::HashMap;

use crate::dimension::MetricKey;
use crate::event::Event;

use super::{EvalContext, MetricCommon, PastBucketEntry};

/// Per-key counter over the open bucket.
#[derive(Debug, Clone, Default)]
pub struct CountMetric {
    current: HashMap<MetricKey, i64>,
    past: Vec<PastBucketEntry<i64>>,
}

impl CountMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_matched_event(&mut self, common: &MetricCommon, event: &Event, ctx: &EvalContext<'_>) {
        if !common.effective_condition(event, ctx).is_true() {
            return;
        }
        let key = MetricKey::new(common.dims_of(event), common.state_tuple(event, ctx));
        let key = common.guard_key(
            key.clone(),
            self.current.len(),
            self.current.contains_key(&key),
            ctx.stats,
        );
        *self.current.entry(key).or_insert(0) += 1;
    }

    pub fn flush_bucket(
        &mut self,
        common: &MetricCommon,
        boundary_ns: i64,
    ) -> HashMap<MetricKey, i64> {
        let sums = std::mem::take(&mut self.current);
        for (key, count) in &sums {
            self.past.push(PastBucketEntry {
                key: key.clone(),
                start_ns: common.bucket_start_ns,
                end_ns: boundary_ns,
                value: *count,
            });
        }
        sums
    }

    pub fn past(&self) -> &[PastBucketEntry<i64>] {
        &self.past
    }

    pub fn take_past(&mut self) -> Vec<PastBucketEntry<i64>> {
        std::mem::take(&mut self.past)
    }

    /// Open-bucket count for one key.
    pub fn current_count(&self, key: &MetricKey) -> i64 {
        self.current.get(key).copied().unwrap_or(0)
    }

    /// Distinct keys tracked in the open bucket.
    pub fn tracked_keys(&self) -> usize {
        self.current.len()
    }
}
