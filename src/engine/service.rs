//! Tokio service wrapper around the engine.
//!
//! Events arrive on an mpsc channel and drain in batches under a single
//! `select!` loop alongside the alarm timer and the cancellation token.
//! Pull completions and package callbacks use the engine directly; only
//! the hot event path goes through the channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::clock::monotonic_ns;
use crate::event::Event;

use super::Engine;

/// Events drained per wakeup before yielding back to the select loop.
const BATCH_SIZE: usize = 256;

/// Upper bound on the alarm sleep so config changes are picked up even
/// when nothing is scheduled.
const MAX_IDLE_TICK: Duration = Duration::from_secs(1);

pub struct Service {
    engine: Arc<Engine>,
    event_tx: mpsc::Sender<Event>,
    /// Receiver side, taken by `start`.
    event_rx: Option<mpsc::Receiver<Event>>,
    run_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Service {
    pub fn new(engine: Arc<Engine>, channel_capacity: usize) -> Self {
        let (event_tx, event_rx) = mpsc::channel(channel_capacity.max(1));
        Self {
            engine,
            event_tx,
            event_rx: Some(event_rx),
            run_task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Non-blocking event submission; a full channel drops the event.
    pub fn submit(&self, event: Event) {
        if self.event_tx.try_send(event).is_err() {
            warn!("event channel full, dropping event");
        }
    }

    /// Sender handle for producers on other tasks.
    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.event_tx.clone()
    }

    pub async fn start(&mut self, ctx: tokio_util::sync::CancellationToken) -> Result<()> {
        let mut event_rx = self
            .event_rx
            .take()
            .expect("start called more than once");
        let engine = Arc::clone(&self.engine);

        let run_task = tokio::spawn(async move {
            loop {
                let sleep_for = alarm_sleep(&engine);
                tokio::select! {
                    _ = ctx.cancelled() => {
                        // Drain whatever is still queued before stopping.
                        while let Ok(event) = event_rx.try_recv() {
                            engine.on_event(event);
                        }
                        info!("engine service stopped");
                        return;
                    }

                    maybe_event = event_rx.recv() => {
                        let Some(event) = maybe_event else {
                            info!("event channel closed, stopping service");
                            return;
                        };
                        engine.on_event(event);
                        for _ in 0..BATCH_SIZE - 1 {
                            match event_rx.try_recv() {
                                Ok(event) => engine.on_event(event),
                                Err(_) => break,
                            }
                        }
                    }

                    _ = tokio::time::sleep(sleep_for) => {
                        engine.on_alarm_tick(monotonic_ns());
                    }
                }
            }
        });
        *self.run_task.lock().await = Some(run_task);

        info!("engine service started");
        Ok(())
    }

    pub async fn wait_for_shutdown(&self) {
        let run_task = { self.run_task.lock().await.take() };
        if let Some(run_task) = run_task {
            if let Err(e) = run_task.await {
                warn!(error = %e, "engine service task join failed");
            }
        }
    }
}

fn alarm_sleep(engine: &Engine) -> Duration {
    let now_sec = monotonic_ns() / 1_000_000_000;
    match engine.next_wakeup_sec() {
        Some(sec) if sec <= now_sec => Duration::from_millis(0),
        Some(sec) => MAX_IDLE_TICK.min(Duration::from_secs((sec - now_sec) as u64)),
        None => MAX_IDLE_TICK,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{
        AtomMatcherDef, ConfigKey, CountMetricDef, MatcherKind, SimpleAtomMatcher, TelemetryConfig,
    };

    fn count_config() -> TelemetryConfig {
        let mut config = TelemetryConfig::new(1);
        config.atom_matchers = vec![AtomMatcherDef {
            id: 1,
            kind: MatcherKind::Simple(SimpleAtomMatcher {
                atom_id: 10,
                field_value_matchers: vec![],
            }),
        }];
        config.count_metrics = vec![CountMetricDef {
            id: 100,
            what: 1,
            condition: None,
            slice_by_states: vec![],
            dimensions_in_what: None,
            links: vec![],
            bucket: Duration::from_secs(60),
            max_dimensions_per_bucket: None,
        }];
        config
    }

    #[tokio::test]
    async fn test_service_dispatches_submitted_events() {
        let engine = Arc::new(Engine::new(0));
        let key = ConfigKey::new(0, 1);
        engine.set_config(key, count_config(), 0).expect("install");

        let mut service = Service::new(Arc::clone(&engine), 1024);
        let ctx = tokio_util::sync::CancellationToken::new();
        service.start(ctx.clone()).await.expect("start");

        for ts in 0..10 {
            service.submit(Event::new(10, 0, ts));
        }

        // Cancellation drains the queue before the task exits.
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.cancel();
        service.wait_for_shutdown().await;

        let report = engine
            .flush_and_clear(key, 1_000_000)
            .expect("report present");
        let total: i64 = report.metrics[0]
            .buckets
            .iter()
            .map(|b| match b.value {
                crate::report::BucketValue::Count(c) => c,
                _ => 0,
            })
            .sum();
        assert_eq!(total, 10);
    }
}
