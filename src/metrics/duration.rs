//! Duration metric.
//!
//! Driven by the start/stop/stop-all matchers of the simple predicate named
//! as its `what`. Each dimension key runs a Stopped → Started ⇄ Paused →
//! Stopped machine: the accumulator advances only while started, the
//! (possibly sliced) condition toggles started/paused, and stop events
//! close the interval. Nesting counts starts and stops symmetrically.
//! State slicing partitions accumulated time at state-transition instants.

use std::collections::HashMap;

use tracing::trace;

use crate::anomaly::AnomalyTracker;
use crate::condition::{self, ConditionState};
use crate::dimension::{translate_link_key, DimensionKey, MetricKey};
use crate::event::Event;
use crate::spec::{DurationAggregation, LogicalOperation};
use crate::state::StateChange;

use super::{EvalContext, MetricCommon, PastBucketEntry};

#[derive(Debug, Clone)]
pub struct DurationTracker {
    running: bool,
    nesting: i32,
    /// Start of the currently running span.
    anchor_ns: i64,
    /// Accumulated span length of the current start-to-stop interval,
    /// excluding paused time. Only MaxSparse reads it.
    interval_total_ns: i64,
    /// Group-mapped state tuple the running span accrues under.
    states: Vec<i64>,
    /// Link-translated condition keys captured at start.
    link_keys: Vec<DimensionKey>,
}

impl DurationTracker {
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn nesting(&self) -> i32 {
        self.nesting
    }
}

#[derive(Debug, Clone)]
pub struct DurationMetric {
    /// Simple predicate this metric is driven by.
    pub what_id: i64,
    pub start_index: usize,
    pub stop_index: usize,
    pub stop_all_index: Option<usize>,
    pub nested: bool,
    pub aggregation: DurationAggregation,
    trackers: HashMap<DimensionKey, DurationTracker>,
    current: HashMap<MetricKey, i64>,
    past: Vec<PastBucketEntry<i64>>,
}

impl DurationMetric {
    pub fn new(
        what_id: i64,
        start_index: usize,
        stop_index: usize,
        stop_all_index: Option<usize>,
        nested: bool,
        aggregation: DurationAggregation,
    ) -> Self {
        Self {
            what_id,
            start_index,
            stop_index,
            stop_all_index,
            nested,
            aggregation,
            trackers: HashMap::new(),
            current: HashMap::new(),
            past: Vec::new(),
        }
    }

    pub fn live_trackers(&self) -> &HashMap<DimensionKey, DurationTracker> {
        &self.trackers
    }

    pub fn on_matched_event(
        &mut self,
        common: &MetricCommon,
        matcher_index: usize,
        event: &Event,
        ctx: &EvalContext<'_>,
        alerts: &mut [AnomalyTracker],
    ) {
        let now = event.elapsed_ts_ns;
        if self.stop_all_index == Some(matcher_index) {
            self.stop_all(common, now, alerts);
            return;
        }
        if matcher_index == self.stop_index {
            self.stop(common, event, now, alerts);
            return;
        }
        if matcher_index == self.start_index {
            self.start(common, event, now, ctx, alerts);
        }
    }

    fn start(
        &mut self,
        common: &MetricCommon,
        event: &Event,
        now: i64,
        ctx: &EvalContext<'_>,
        alerts: &mut [AnomalyTracker],
    ) {
        let dims = common.dims_of(event);
        let cond = common.effective_condition(event, ctx);
        let states = common.state_tuple(event, ctx);
        let link_keys: Vec<DimensionKey> = common
            .links
            .iter()
            .map(|l| translate_link_key(&l.fields_in_what, &l.fields_in_condition, event))
            .collect();

        let tracker = self.trackers.entry(dims.clone()).or_insert(DurationTracker {
            running: false,
            nesting: 0,
            anchor_ns: now,
            interval_total_ns: 0,
            states: states.clone(),
            link_keys: link_keys.clone(),
        });

        if self.nested {
            tracker.nesting += 1;
        } else {
            tracker.nesting = 1;
        }
        tracker.link_keys = link_keys;

        if !tracker.running && cond.is_true() {
            tracker.running = true;
            tracker.anchor_ns = now;
            tracker.states = states;
            let key = MetricKey::new(dims, tracker.states.clone());
            let open = self.current.get(&key).copied().unwrap_or(0);
            for &alert_index in &common.alert_indices {
                if let Some(alert) = alerts.get_mut(alert_index) {
                    alert.arm_duration_prediction(&key, open, now);
                }
            }
        }
    }

    fn stop(
        &mut self,
        common: &MetricCommon,
        event: &Event,
        now: i64,
        alerts: &mut [AnomalyTracker],
    ) {
        let dims = common.dims_of(event);
        let Some(tracker) = self.trackers.get_mut(&dims) else {
            trace!(metric_id = common.id, "stop without start ignored");
            return;
        };
        if self.nested {
            tracker.nesting -= 1;
        } else {
            tracker.nesting = 0;
        }
        if tracker.nesting <= 0 {
            let tracker = self
                .trackers
                .remove(&dims)
                .expect("tracker present by construction");
            self.finish_interval(common, dims, tracker, now, alerts);
        }
    }

    fn stop_all(&mut self, common: &MetricCommon, now: i64, alerts: &mut [AnomalyTracker]) {
        let keys: Vec<DimensionKey> = self.trackers.keys().cloned().collect();
        for dims in keys {
            if let Some(tracker) = self.trackers.remove(&dims) {
                self.finish_interval(common, dims, tracker, now, alerts);
            }
        }
    }

    fn finish_interval(
        &mut self,
        common: &MetricCommon,
        dims: DimensionKey,
        mut tracker: DurationTracker,
        now: i64,
        alerts: &mut [AnomalyTracker],
    ) {
        let key = MetricKey::new(dims, tracker.states.clone());
        if tracker.running {
            let span = (now - tracker.anchor_ns).max(0);
            tracker.interval_total_ns += span;
            if self.aggregation == DurationAggregation::Sum {
                *self.current.entry(key.clone()).or_insert(0) += span;
            }
        }
        if self.aggregation == DurationAggregation::MaxSparse && tracker.interval_total_ns > 0 {
            let entry = self.current.entry(key.clone()).or_insert(0);
            *entry = (*entry).max(tracker.interval_total_ns);
        }
        for &alert_index in &common.alert_indices {
            if let Some(alert) = alerts.get_mut(alert_index) {
                alert.cancel_prediction(&key);
            }
        }
    }

    fn pause_tracker(
        aggregation: DurationAggregation,
        current: &mut HashMap<MetricKey, i64>,
        dims: &DimensionKey,
        tracker: &mut DurationTracker,
        ts_ns: i64,
    ) {
        if !tracker.running {
            return;
        }
        let span = (ts_ns - tracker.anchor_ns).max(0);
        match aggregation {
            DurationAggregation::Sum => {
                let key = MetricKey::new(dims.clone(), tracker.states.clone());
                *current.entry(key).or_insert(0) += span;
            }
            DurationAggregation::MaxSparse => {
                tracker.interval_total_ns += span;
            }
        }
        tracker.running = false;
    }

    fn resume_tracker(
        common: &MetricCommon,
        current: &HashMap<MetricKey, i64>,
        dims: &DimensionKey,
        tracker: &mut DurationTracker,
        ts_ns: i64,
        alerts: &mut [AnomalyTracker],
    ) {
        if tracker.running || tracker.nesting <= 0 {
            return;
        }
        tracker.running = true;
        tracker.anchor_ns = ts_ns;
        let key = MetricKey::new(dims.clone(), tracker.states.clone());
        let open = current.get(&key).copied().unwrap_or(0);
        for &alert_index in &common.alert_indices {
            if let Some(alert) = alerts.get_mut(alert_index) {
                alert.arm_duration_prediction(&key, open, ts_ns);
            }
        }
    }

    pub fn on_condition_changed(
        &mut self,
        common: &MetricCommon,
        old: ConditionState,
        new: ConditionState,
        ts_ns: i64,
        alerts: &mut [AnomalyTracker],
    ) {
        if common.condition_sliced || old == new {
            return;
        }
        for (dims, tracker) in &mut self.trackers {
            if new.is_true() {
                Self::resume_tracker(common, &self.current, dims, tracker, ts_ns, alerts);
            } else {
                Self::pause_tracker(self.aggregation, &mut self.current, dims, tracker, ts_ns);
                let key = MetricKey::new(dims.clone(), tracker.states.clone());
                for &alert_index in &common.alert_indices {
                    if let Some(alert) = alerts.get_mut(alert_index) {
                        alert.cancel_prediction(&key);
                    }
                }
            }
        }
    }

    pub fn on_sliced_condition_may_change(
        &mut self,
        common: &MetricCommon,
        ts_ns: i64,
        ctx: &EvalContext<'_>,
        alerts: &mut [AnomalyTracker],
    ) {
        let Some(condition_index) = common.condition_index else {
            return;
        };
        for (dims, tracker) in &mut self.trackers {
            let effective = if common.links.is_empty() {
                condition::current_state(ctx.conditions, condition_index)
            } else {
                let states: Vec<ConditionState> = common
                    .links
                    .iter()
                    .zip(tracker.link_keys.iter())
                    .map(|(link, key)| condition::query(ctx.conditions, link.condition_index, key))
                    .collect();
                condition::combine(LogicalOperation::And, &states)
            };

            if effective.is_true() {
                Self::resume_tracker(common, &self.current, dims, tracker, ts_ns, alerts);
            } else {
                Self::pause_tracker(self.aggregation, &mut self.current, dims, tracker, ts_ns);
                let key = MetricKey::new(dims.clone(), tracker.states.clone());
                for &alert_index in &common.alert_indices {
                    if let Some(alert) = alerts.get_mut(alert_index) {
                        alert.cancel_prediction(&key);
                    }
                }
            }
        }
    }

    /// A sliced-by state transitioned: close the running span under the old
    /// tuple and continue under the new one.
    pub fn on_state_changed(
        &mut self,
        common: &MetricCommon,
        change: &StateChange,
        slice_positions: &[usize],
    ) {
        let aggregation = self.aggregation;
        for (dims, tracker) in self.trackers.iter_mut() {
            if tracker.running && change.event_ns > tracker.anchor_ns {
                let span = change.event_ns - tracker.anchor_ns;
                let old_key = MetricKey::new(dims.clone(), tracker.states.clone());
                match aggregation {
                    DurationAggregation::Sum => {
                        *self.current.entry(old_key).or_insert(0) += span;
                    }
                    DurationAggregation::MaxSparse => {
                        // Transitions partition the time axis: the interval
                        // so far completes under the old tuple.
                        tracker.interval_total_ns += span;
                        let entry = self.current.entry(old_key).or_insert(0);
                        *entry = (*entry).max(tracker.interval_total_ns);
                        tracker.interval_total_ns = 0;
                    }
                }
                tracker.anchor_ns = change.event_ns;
            }
            for &pos in slice_positions {
                if let Some(slot) = tracker.states.get_mut(pos) {
                    *slot = common.state_slices[pos].map_value(change.new_state);
                }
            }
        }
    }

    pub fn flush_bucket(
        &mut self,
        common: &MetricCommon,
        boundary_ns: i64,
    ) -> HashMap<MetricKey, i64> {
        if self.aggregation == DurationAggregation::Sum {
            for (dims, tracker) in &mut self.trackers {
                if tracker.running && boundary_ns > tracker.anchor_ns {
                    let span = boundary_ns - tracker.anchor_ns;
                    let key = MetricKey::new(dims.clone(), tracker.states.clone());
                    *self.current.entry(key).or_insert(0) += span;
                    tracker.anchor_ns = boundary_ns;
                }
            }
        }
        // MaxSparse: running intervals emit in the bucket where they end.
        let sums = std::mem::take(&mut self.current);
        for (key, duration) in &sums {
            self.past.push(PastBucketEntry {
                key: key.clone(),
                start_ns: common.bucket_start_ns,
                end_ns: boundary_ns,
                value: *duration,
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
}
