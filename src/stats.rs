use std::sync::atomic::{AtomicU64, Ordering};

/// Runtime guardrail counters.
///
/// Runtime faults never abort the engine; each increments one of these and
/// the affected event is absorbed by the metric it targeted. The block is
/// reported alongside every dump and mirrored into the Prometheus registry
/// by the health module.
#[derive(Debug, Default)]
pub struct GuardrailStats {
    pub events_dispatched: AtomicU64,
    pub events_skipped: AtomicU64,
    pub late_events: AtomicU64,
    pub over_dimension_limit: AtomicU64,
    pub map_memory_exceeded: AtomicU64,
    pub map_changes_dropped: AtomicU64,
    pub pull_timeouts: AtomicU64,
    pub pull_failures: AtomicU64,
    pub anomalies_declared: AtomicU64,
    pub app_upgrades: AtomicU64,
}

impl GuardrailStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> GuardrailSnapshot {
        GuardrailSnapshot {
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            events_skipped: self.events_skipped.load(Ordering::Relaxed),
            late_events: self.late_events.load(Ordering::Relaxed),
            over_dimension_limit: self.over_dimension_limit.load(Ordering::Relaxed),
            map_memory_exceeded: self.map_memory_exceeded.load(Ordering::Relaxed),
            map_changes_dropped: self.map_changes_dropped.load(Ordering::Relaxed),
            pull_timeouts: self.pull_timeouts.load(Ordering::Relaxed),
            pull_failures: self.pull_failures.load(Ordering::Relaxed),
            anomalies_declared: self.anomalies_declared.load(Ordering::Relaxed),
            app_upgrades: self.app_upgrades.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the guardrail counters.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct GuardrailSnapshot {
    pub events_dispatched: u64,
    pub events_skipped: u64,
    pub late_events: u64,
    pub over_dimension_limit: u64,
    pub map_memory_exceeded: u64,
    pub map_changes_dropped: u64,
    pub pull_timeouts: u64,
    pub pull_failures: u64,
    pub anomalies_declared: u64,
    pub app_upgrades: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let stats = GuardrailStats::new();
        stats.events_dispatched.fetch_add(3, Ordering::Relaxed);
        stats.late_events.fetch_add(1, Ordering::Relaxed);

        let snap = stats.snapshot();
        assert_eq!(snap.events_dispatched, 3);
        assert_eq!(snap.late_events, 1);
        assert_eq!(snap.over_dimension_limit, 0);
    }
}
