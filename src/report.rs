//! Report output structures.
//!
//! The wire encoding of reports is an external concern; the engine emits
//! serializable structures: per metric, the ordered closed buckets with
//! their dimension keys and variant payloads, plus the uid-map snapshot and
//! change log and the runtime guardrail counters.

use serde::Serialize;

use crate::anomaly::AnomalyFiring;
use crate::metrics::gauge::GaugeSample;
use crate::metrics::event::LoggedEvent;
use crate::metrics::value::ValueSnapshot;
use crate::metrics::{PastBucketEntry, VariantReport};
use crate::spec::ConfigKey;
use crate::stats::GuardrailSnapshot;
use crate::uidmap::UidMapReport;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketValue {
    Count(i64),
    DurationNs(i64),
    Value(ValueSnapshot),
    Gauge(Vec<GaugeSample>),
    Sketch(Vec<u8>),
}

/// One closed bucket of one dimension key.
#[derive(Debug, Clone, Serialize)]
pub struct ReportBucket {
    pub start_ns: i64,
    pub end_ns: i64,
    pub key: String,
    pub value: BucketValue,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricReport {
    pub metric_id: i64,
    pub kind: &'static str,
    pub buckets: Vec<ReportBucket>,
    /// Raw event log; only event metrics populate it.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub events: Vec<LoggedEvent>,
}

impl MetricReport {
    pub fn from_variant(metric_id: i64, report: VariantReport) -> Self {
        let kind = report.kind_name();
        let mut out = Self {
            metric_id,
            kind,
            buckets: Vec::new(),
            events: Vec::new(),
        };
        match report {
            VariantReport::Count(entries) => {
                out.buckets = render(entries, BucketValue::Count);
            }
            VariantReport::Duration(entries) => {
                out.buckets = render(entries, BucketValue::DurationNs);
            }
            VariantReport::Value(entries) => {
                out.buckets = render(entries, BucketValue::Value);
            }
            VariantReport::Gauge(entries) => {
                out.buckets = render(entries, BucketValue::Gauge);
            }
            VariantReport::Kll(entries) => {
                out.buckets = render(entries, BucketValue::Sketch);
            }
            VariantReport::Event(events) => {
                out.events = events;
            }
        }
        out
    }
}

fn render<T>(
    entries: Vec<PastBucketEntry<T>>,
    wrap: impl Fn(T) -> BucketValue,
) -> Vec<ReportBucket> {
    let mut buckets: Vec<ReportBucket> = entries
        .into_iter()
        .map(|e| ReportBucket {
            start_ns: e.start_ns,
            end_ns: e.end_ns,
            key: e.key.render(),
            value: wrap(e.value),
        })
        .collect();
    buckets.sort_by(|a, b| (a.start_ns, &a.key).cmp(&(b.start_ns, &b.key)));
    buckets
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertReport {
    pub alert_id: i64,
    pub metric_id: i64,
    pub total_fired: u64,
    pub firings: Vec<AnomalyFiring>,
}

/// Everything one dump emits for one configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigReport {
    pub key: ConfigKey,
    pub timestamp_ns: i64,
    pub metrics: Vec<MetricReport>,
    pub alerts: Vec<AlertReport>,
    pub uid_map: UidMapReport,
    pub runtime: GuardrailSnapshot,
}
