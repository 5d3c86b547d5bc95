//! Alert (anomaly) tracking and the monotonic alarm monitor.
//!
//! An alert watches one metric: every closed bucket feeds a rolling window
//! of per-key sums covering the most recent `num_buckets` buckets; a window
//! sum above the trigger fires the alert for that key, subject to a per-key
//! refractory period. Duration metrics additionally report in-progress
//! growth so a crossing can fire before the bucket closes, via a one-shot
//! registered with the alarm monitor.

pub mod alarm;

use std::collections::{HashMap, VecDeque};

use tracing::warn;

use crate::dimension::MetricKey;
use crate::ident::next_generation;
use crate::spec::AlertDef;

pub use alarm::{AlarmMonitor, AlarmTracker};

/// Retained firing records per alert.
const MAX_FIRING_LOG: usize = 100;

/// One alert firing, kept for reports.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AnomalyFiring {
    pub timestamp_ns: i64,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct AnomalyTracker {
    pub id: i64,
    pub metric_id: i64,
    pub generation: u64,
    num_buckets: usize,
    trigger_if_sum_gt: i64,
    refractory_period_ns: i64,
    /// `(bucket_num, per-key sums)` of the window's closed buckets.
    window: VecDeque<(i64, HashMap<MetricKey, i64>)>,
    sum_over_window: HashMap<MetricKey, i64>,
    last_fired_ns: HashMap<MetricKey, i64>,
    /// Predicted in-progress crossings awaiting the alarm monitor.
    pending_alarms: HashMap<MetricKey, i64>,
    firings: Vec<AnomalyFiring>,
    total_fired: u64,
}

impl AnomalyTracker {
    pub fn new(def: &AlertDef) -> Self {
        Self {
            id: def.id,
            metric_id: def.metric_id,
            generation: next_generation(),
            num_buckets: (def.num_buckets as usize).max(1),
            trigger_if_sum_gt: def.trigger_if_sum_gt,
            refractory_period_ns: i64::from(def.refractory_period_secs) * 1_000_000_000,
            window: VecDeque::new(),
            sum_over_window: HashMap::new(),
            last_fired_ns: HashMap::new(),
            pending_alarms: HashMap::new(),
            firings: Vec::new(),
            total_fired: 0,
        }
    }

    pub fn total_fired(&self) -> u64 {
        self.total_fired
    }

    pub fn firings(&self) -> &[AnomalyFiring] {
        &self.firings
    }

    pub fn window_sum(&self, key: &MetricKey) -> i64 {
        self.sum_over_window.get(key).copied().unwrap_or(0)
    }

    /// Feeds one closed bucket into the rolling window, then checks every
    /// key the bucket touched.
    pub fn on_bucket_closed(
        &mut self,
        bucket_num: i64,
        boundary_ns: i64,
        sums: &HashMap<MetricKey, i64>,
    ) {
        for (key, sum) in sums {
            *self.sum_over_window.entry(key.clone()).or_insert(0) += sum;
        }
        self.window.push_back((bucket_num, sums.clone()));

        // Age out buckets that left the window; bucket numbers may skip
        // after quiet gaps.
        let oldest_allowed = bucket_num - self.num_buckets as i64 + 1;
        while self
            .window
            .front()
            .is_some_and(|(num, _)| *num < oldest_allowed)
        {
            let (_, old) = self.window.pop_front().expect("front checked");
            for (key, sum) in old {
                if let Some(total) = self.sum_over_window.get_mut(&key) {
                    *total -= sum;
                    if *total <= 0 {
                        self.sum_over_window.remove(&key);
                    }
                }
            }
        }

        let keys: Vec<MetricKey> = sums.keys().cloned().collect();
        for key in keys {
            if self.window_sum(&key) > self.trigger_if_sum_gt {
                self.maybe_fire(&key, boundary_ns);
            }
        }
    }

    /// A duration tracker (re)started for `key` with `open_sum_ns` already
    /// accumulated in the open bucket: predict when the window sum crosses
    /// the trigger and arm a one-shot for that instant.
    pub fn arm_duration_prediction(&mut self, key: &MetricKey, open_sum_ns: i64, anchor_ns: i64) {
        let sum_so_far = self.window_sum(key) + open_sum_ns;
        let remaining = self.trigger_if_sum_gt - sum_so_far + 1;
        if remaining <= 0 {
            self.maybe_fire(key, anchor_ns);
        } else {
            self.pending_alarms.insert(key.clone(), anchor_ns + remaining);
        }
    }

    pub fn cancel_prediction(&mut self, key: &MetricKey) {
        self.pending_alarms.remove(key);
    }

    pub fn earliest_pending_ns(&self) -> Option<i64> {
        self.pending_alarms.values().copied().min()
    }

    /// Fires every pending predicted crossing at or before `now_ns`.
    pub fn fire_pending(&mut self, now_ns: i64) {
        let due: Vec<MetricKey> = self
            .pending_alarms
            .iter()
            .filter(|(_, ts)| **ts <= now_ns)
            .map(|(k, _)| k.clone())
            .collect();
        for key in due {
            let fire_ts = self.pending_alarms.remove(&key).unwrap_or(now_ns);
            self.maybe_fire(&key, fire_ts);
        }
    }

    fn maybe_fire(&mut self, key: &MetricKey, ts_ns: i64) {
        if let Some(last) = self.last_fired_ns.get(key) {
            if ts_ns - last < self.refractory_period_ns {
                return;
            }
        }
        self.last_fired_ns.insert(key.clone(), ts_ns);
        self.total_fired += 1;
        if self.firings.len() < MAX_FIRING_LOG {
            self.firings.push(AnomalyFiring {
                timestamp_ns: ts_ns,
                key: key.render(),
            });
        }
        warn!(
            alert_id = self.id,
            metric_id = self.metric_id,
            key = %key.render(),
            ts_ns,
            "anomaly declared"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::DimensionKey;

    fn alert(num_buckets: u32, trigger: i64, refractory_secs: u32) -> AnomalyTracker {
        AnomalyTracker::new(&AlertDef {
            id: 1,
            metric_id: 100,
            num_buckets,
            trigger_if_sum_gt: trigger,
            refractory_period_secs: refractory_secs,
        })
    }

    fn key(n: i64) -> MetricKey {
        MetricKey::new(DimensionKey::default(), vec![n])
    }

    fn sums(entries: &[(i64, i64)]) -> HashMap<MetricKey, i64> {
        entries.iter().map(|(k, v)| (key(*k), *v)).collect()
    }

    #[test]
    fn test_single_bucket_trigger() {
        let mut a = alert(1, 10, 0);
        a.on_bucket_closed(0, 1_000, &sums(&[(1, 10)]));
        assert_eq!(a.total_fired(), 0);
        a.on_bucket_closed(1, 2_000, &sums(&[(1, 11)]));
        assert_eq!(a.total_fired(), 1);
        assert_eq!(a.firings()[0].timestamp_ns, 2_000);
    }

    #[test]
    fn test_rolling_window_sums() {
        let mut a = alert(3, 10, 0);
        a.on_bucket_closed(0, 1_000, &sums(&[(1, 4)]));
        a.on_bucket_closed(1, 2_000, &sums(&[(1, 4)]));
        assert_eq!(a.total_fired(), 0);
        // 4 + 4 + 4 = 12 > 10 within 3 buckets.
        a.on_bucket_closed(2, 3_000, &sums(&[(1, 4)]));
        assert_eq!(a.total_fired(), 1);
    }

    #[test]
    fn test_window_ages_out() {
        let mut a = alert(2, 10, 0);
        a.on_bucket_closed(0, 1_000, &sums(&[(1, 6)]));
        // Bucket 0 left the 2-bucket window by bucket 2.
        a.on_bucket_closed(2, 3_000, &sums(&[(1, 6)]));
        assert_eq!(a.total_fired(), 0);
        assert_eq!(a.window_sum(&key(1)), 6);
    }

    #[test]
    fn test_refractory_period() {
        let s = 1_000_000_000;
        let mut a = alert(1, 5, 10);
        a.on_bucket_closed(0, s, &sums(&[(1, 6)]));
        assert_eq!(a.total_fired(), 1);
        // 5 seconds later: still refractory.
        a.on_bucket_closed(5, 6 * s, &sums(&[(1, 6)]));
        assert_eq!(a.total_fired(), 1);
        // 11 seconds after the firing: allowed again.
        a.on_bucket_closed(12, 12 * s, &sums(&[(1, 6)]));
        assert_eq!(a.total_fired(), 2);
    }

    #[test]
    fn test_keys_independent() {
        let mut a = alert(1, 5, 0);
        a.on_bucket_closed(0, 1_000, &sums(&[(1, 6), (2, 3)]));
        assert_eq!(a.total_fired(), 1);
        assert_eq!(a.firings()[0].key, key(1).render());
    }

    #[test]
    fn test_duration_prediction_arms_and_fires() {
        let mut a = alert(1, 1_000, 0);
        a.arm_duration_prediction(&key(1), 200, 10_000);
        // Crossing predicted at 10_000 + (1000 - 200 + 1).
        assert_eq!(a.earliest_pending_ns(), Some(10_801));

        a.fire_pending(10_800);
        assert_eq!(a.total_fired(), 0);
        a.fire_pending(10_801);
        assert_eq!(a.total_fired(), 1);
        assert_eq!(a.earliest_pending_ns(), None);
    }

    #[test]
    fn test_duration_prediction_cancel() {
        let mut a = alert(1, 1_000, 0);
        a.arm_duration_prediction(&key(1), 0, 10_000);
        a.cancel_prediction(&key(1));
        a.fire_pending(i64::MAX);
        assert_eq!(a.total_fired(), 0);
    }

    #[test]
    fn test_duration_prediction_already_crossed_fires_now() {
        let mut a = alert(1, 100, 0);
        a.arm_duration_prediction(&key(1), 200, 10_000);
        assert_eq!(a.total_fired(), 1);
    }
}
