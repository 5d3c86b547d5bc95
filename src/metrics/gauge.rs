use std::collections::HashMap;

use serde::Serialize;
use tracing::trace;

use crate::dimension::MetricKey;
use crate::event::Event;
use crate::spec::GaugeSampling;

use super::{EvalContext, MetricCommon, PastBucketEntry};

/// One retained gauge sample.
#[derive(Debug, Clone, Serialize)]
pub struct GaugeSample {
    pub elapsed_ts_ns: i64,
    /// Flat `path=value` rendering of the sampled fields.
    pub fields: Vec<String>,
}

impl GaugeSample {
    fn from_event(event: &Event) -> Self {
        Self {
            elapsed_ts_ns: event.elapsed_ts_ns,
            fields: event
                .values
                .iter()
                .map(|fv| {
                    let path: Vec<String> =
                        fv.field.path().iter().map(|p| p.to_string()).collect();
                    format!("{}={}", path.join("."), fv.value)
                })
                .collect(),
        }
    }
}

/// Latest-sample or first-N gauge. A configured trigger matcher requests a
/// pull from the puller layer; pulled events run through the same sampling
/// path as pushed ones.
#[derive(Debug, Clone)]
pub struct GaugeMetric {
    sampling: GaugeSampling,
    pub trigger_id: Option<i64>,
    pub trigger_index: Option<usize>,
    /// Atom to pull when the trigger fires.
    pub pull_atom_id: Option<i32>,
    current: HashMap<MetricKey, Vec<GaugeSample>>,
    /// Events seen per key this bucket, for the size-1 reservoir.
    seen: HashMap<MetricKey, u64>,
    rng_state: u64,
    past: Vec<PastBucketEntry<Vec<GaugeSample>>>,
}

impl GaugeMetric {
    pub fn new(
        sampling: GaugeSampling,
        trigger_id: Option<i64>,
        trigger_index: Option<usize>,
        pull_atom_id: Option<i32>,
    ) -> Self {
        Self {
            sampling,
            trigger_id,
            trigger_index,
            pull_atom_id,
            current: HashMap::new(),
            seen: HashMap::new(),
            rng_state: 0x9E37_79B9_7F4A_7C15,
            past: Vec::new(),
        }
    }

    pub fn on_matched_event(
        &mut self,
        common: &MetricCommon,
        matcher_index: usize,
        event: &Event,
        ctx: &EvalContext<'_>,
    ) {
        if self.trigger_index == Some(matcher_index) {
            let Some(atom_id) = self.pull_atom_id else {
                return;
            };
            trace!(metric_id = common.id, atom_id, "gauge trigger fired, pulling");
            if let Some(pulled) = ctx.pullers.pull(atom_id, ctx.stats) {
                for pulled_event in &pulled {
                    self.sample(common, pulled_event, ctx);
                }
            }
            return;
        }
        self.sample(common, event, ctx);
    }

    fn sample(&mut self, common: &MetricCommon, event: &Event, ctx: &EvalContext<'_>) {
        if !common.effective_condition(event, ctx).is_true() {
            return;
        }
        let key = MetricKey::no_state(common.dims_of(event));
        let key = common.guard_key(
            key.clone(),
            self.current.len(),
            self.current.contains_key(&key),
            ctx.stats,
        );

        match self.sampling {
            GaugeSampling::FirstNSamples(n) => {
                let samples = self.current.entry(key).or_default();
                if samples.len() < n as usize {
                    samples.push(GaugeSample::from_event(event));
                }
            }
            GaugeSampling::RandomOneSample => {
                let seen = self.seen.entry(key.clone()).or_insert(0);
                *seen += 1;
                let n = *seen;
                // Size-1 reservoir: replace with probability 1/n.
                if n == 1 || self.next_random(event.elapsed_ts_ns) % n == 0 {
                    self.current
                        .insert(key, vec![GaugeSample::from_event(event)]);
                }
            }
        }
    }

    fn next_random(&mut self, salt: i64) -> u64 {
        // xorshift64*, salted with the event time.
        let mut x = self.rng_state ^ (salt as u64).wrapping_mul(0x2545_F491_4F6C_DD1D);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state = x;
        x
    }

    pub fn flush_bucket(
        &mut self,
        common: &MetricCommon,
        boundary_ns: i64,
    ) -> HashMap<MetricKey, i64> {
        self.seen.clear();
        let mut sums = HashMap::with_capacity(self.current.len());
        for (key, samples) in std::mem::take(&mut self.current) {
            sums.insert(key.clone(), samples.len() as i64);
            self.past.push(PastBucketEntry {
                key,
                start_ns: common.bucket_start_ns,
                end_ns: boundary_ns,
                value: samples,
            });
        }
        sums
    }

    pub fn past(&self) -> &[PastBucketEntry<Vec<GaugeSample>>] {
        &self.past
    }

    pub fn take_past(&mut self) -> Vec<PastBucketEntry<Vec<GaugeSample>>> {
        std::mem::take(&mut self.past)
    }

    /// Samples held for one key in the open bucket.
    pub fn current_samples(&self, key: &MetricKey) -> usize {
        self.current.get(key).map(|s| s.len()).unwrap_or(0)
    }
}
