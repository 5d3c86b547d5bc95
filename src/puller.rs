//! Pull layer handle.
//!
//! Pullers that synchronously harvest system metrics are external
//! collaborators; the engine only holds a registry of them. Gauge metrics
//! with a trigger matcher pull through this handle, and the service layer
//! can inject pulled batches as ordinary events. The handle is replaced
//! atomically on configuration updates.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use tracing::warn;

use crate::event::Event;
use crate::stats::GuardrailStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PullError {
    #[error("pull timed out")]
    Timeout,
    #[error("pull failed")]
    Failed,
}

/// A source of pulled atoms.
pub trait Puller: Send + Sync {
    fn pull(&self, atom_id: i32) -> Result<Vec<Event>, PullError>;
}

/// Registry of pullers by atom id.
#[derive(Default)]
pub struct PullerManager {
    pullers: HashMap<i32, Box<dyn Puller>>,
}

impl std::fmt::Debug for PullerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullerManager")
            .field("atoms", &self.pullers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PullerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, atom_id: i32, puller: Box<dyn Puller>) {
        self.pullers.insert(atom_id, puller);
    }

    pub fn supports(&self, atom_id: i32) -> bool {
        self.pullers.contains_key(&atom_id)
    }

    /// Pulls one atom, absorbing failures into the guardrail counters.
    pub fn pull(&self, atom_id: i32, stats: &GuardrailStats) -> Option<Vec<Event>> {
        let puller = self.pullers.get(&atom_id)?;
        match puller.pull(atom_id) {
            Ok(events) => Some(events),
            Err(PullError::Timeout) => {
                stats.pull_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(atom_id, "pull timed out");
                None
            }
            Err(PullError::Failed) => {
                stats.pull_failures.fetch_add(1, Ordering::Relaxed);
                warn!(atom_id, "pull failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedPuller(Vec<Event>);

    impl Puller for FixedPuller {
        fn pull(&self, _atom_id: i32) -> Result<Vec<Event>, PullError> {
            Ok(self.0.clone())
        }
    }

    struct FailingPuller(PullError);

    impl Puller for FailingPuller {
        fn pull(&self, _atom_id: i32) -> Result<Vec<Event>, PullError> {
            Err(self.0)
        }
    }

    #[test]
    fn test_pull_routes_by_atom() {
        let stats = GuardrailStats::new();
        let mut mgr = PullerManager::new();
        mgr.register(42, Box::new(FixedPuller(vec![Event::new(42, 0, 1)])));

        assert!(mgr.supports(42));
        assert!(!mgr.supports(43));
        assert_eq!(mgr.pull(42, &stats).map(|v| v.len()), Some(1));
        assert!(mgr.pull(43, &stats).is_none());
    }

    #[test]
    fn test_pull_failures_counted() {
        let stats = GuardrailStats::new();
        let mut mgr = PullerManager::new();
        mgr.register(1, Box::new(FailingPuller(PullError::Timeout)));
        mgr.register(2, Box::new(FailingPuller(PullError::Failed)));

        assert!(mgr.pull(1, &stats).is_none());
        assert!(mgr.pull(2, &stats).is_none());
        let snap = stats.snapshot();
        assert_eq!(snap.pull_timeouts, 1);
        assert_eq!(snap.pull_failures, 1);
    }
}
