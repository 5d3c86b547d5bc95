use std::collections::HashMap;
use std::sync::atomic::Ordering;

use serde::Serialize;

use crate::dimension::MetricKey;
use crate::event::Event;

use super::{EvalContext, MetricCommon, MAX_EVENTS_PER_BUCKET};

/// One raw event retained by an event metric.
#[derive(Debug, Clone, Serialize)]
pub struct LoggedEvent {
    pub elapsed_ts_ns: i64,
    pub atom_id: i32,
    /// Flat `path=value` rendering of the field values.
    pub fields: Vec<String>,
}

impl LoggedEvent {
    fn from_event(event: &Event) -> Self {
        Self {
            elapsed_ts_ns: event.elapsed_ts_ns,
            atom_id: event.atom_id,
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

/// Append-only log of matched events, bounded per open bucket.
#[derive(Debug, Clone, Default)]
pub struct EventMetric {
    current: Vec<LoggedEvent>,
    past: Vec<LoggedEvent>,
}

impl EventMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_matched_event(&mut self, common: &MetricCommon, event: &Event, ctx: &EvalContext<'_>) {
        if !common.effective_condition(event, ctx).is_true() {
            return;
        }
        if self.current.len() >= MAX_EVENTS_PER_BUCKET {
            ctx.stats.over_dimension_limit.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.current.push(LoggedEvent::from_event(event));
    }

    pub fn flush_bucket(
        &mut self,
        _common: &MetricCommon,
        _boundary_ns: i64,
    ) -> HashMap<MetricKey, i64> {
        let logged = self.current.len() as i64;
        self.past.append(&mut self.current);
        if logged > 0 {
            HashMap::from([(MetricKey::default(), logged)])
        } else {
            HashMap::new()
        }
    }

    pub fn past(&self) -> &[LoggedEvent] {
        &self.past
    }

    pub fn take_past(&mut self) -> Vec<LoggedEvent> {
        std::mem::take(&mut self.past)
    }
}
