use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::stats::GuardrailSnapshot;

/// Prometheus metrics for engine health and observability.
///
/// All metrics use the "telemetryd" namespace and mirror the engine's
/// guardrail counters, refreshed by the service loop.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    /// Token of the running server task, for idempotent shutdown wiring.
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total events dispatched through the engine.
    pub events_dispatched: IntCounter,
    /// Events no installed config was interested in.
    pub events_skipped: IntGauge,
    /// Events dropped for predating the open bucket.
    pub late_events: IntGauge,
    /// Dimension keys collapsed into the over-limit sentinel.
    pub over_dimension_limit: IntGauge,
    /// Times the uid map shed change records over its byte budget.
    pub map_memory_exceeded: IntGauge,
    /// Pull failures and timeouts.
    pub pull_failures: IntGauge,
    /// Anomalies declared across all alerts.
    pub anomalies_declared: IntGauge,
    /// Installed configurations.
    pub configs_active: IntGauge,
    /// Uid map change-log bytes in use.
    pub uidmap_bytes: Gauge,
}

impl HealthMetrics {
    pub fn new(addr: String) -> Result<Arc<Self>> {
        let registry = Registry::new();

        let events_dispatched = IntCounter::with_opts(opts(
            "events_dispatched_total",
            "Total events dispatched through the engine",
        ))?;
        let events_skipped = IntGauge::with_opts(opts(
            "events_skipped",
            "Events no installed config was interested in",
        ))?;
        let late_events = IntGauge::with_opts(opts(
            "late_events",
            "Events dropped for predating the open bucket",
        ))?;
        let over_dimension_limit = IntGauge::with_opts(opts(
            "over_dimension_limit",
            "Dimension keys collapsed into the over-limit sentinel",
        ))?;
        let map_memory_exceeded = IntGauge::with_opts(opts(
            "uidmap_memory_exceeded",
            "Times the uid map shed change records over its byte budget",
        ))?;
        let pull_failures = IntGauge::with_opts(opts(
            "pull_failures",
            "Pull failures and timeouts combined",
        ))?;
        let anomalies_declared = IntGauge::with_opts(opts(
            "anomalies_declared",
            "Anomalies declared across all alerts",
        ))?;
        let configs_active =
            IntGauge::with_opts(opts("configs_active", "Installed configurations"))?;
        let uidmap_bytes =
            Gauge::with_opts(opts("uidmap_bytes", "Uid map change-log bytes in use"))?;

        registry.register(Box::new(events_dispatched.clone()))?;
        registry.register(Box::new(events_skipped.clone()))?;
        registry.register(Box::new(late_events.clone()))?;
        registry.register(Box::new(over_dimension_limit.clone()))?;
        registry.register(Box::new(map_memory_exceeded.clone()))?;
        registry.register(Box::new(pull_failures.clone()))?;
        registry.register(Box::new(anomalies_declared.clone()))?;
        registry.register(Box::new(configs_active.clone()))?;
        registry.register(Box::new(uidmap_bytes.clone()))?;

        Ok(Arc::new(Self {
            registry,
            addr,
            shutdown: parking_lot::Mutex::new(None),
            events_dispatched,
            events_skipped,
            late_events,
            over_dimension_limit,
            map_memory_exceeded,
            pull_failures,
            anomalies_declared,
            configs_active,
            uidmap_bytes,
        }))
    }

    /// Refreshes the registry from a guardrail snapshot.
    pub fn update_from(&self, snap: &GuardrailSnapshot, configs_active: usize, uidmap_bytes: usize) {
        let already = self.events_dispatched.get();
        if snap.events_dispatched > already {
            self.events_dispatched.inc_by(snap.events_dispatched - already);
        }
        self.events_skipped.set(snap.events_skipped as i64);
        self.late_events.set(snap.late_events as i64);
        self.over_dimension_limit
            .set(snap.over_dimension_limit as i64);
        self.map_memory_exceeded.set(snap.map_memory_exceeded as i64);
        self.pull_failures
            .set((snap.pull_timeouts + snap.pull_failures) as i64);
        self.anomalies_declared.set(snap.anomalies_declared as i64);
        self.configs_active.set(configs_active as i64);
        self.uidmap_bytes.set(uidmap_bytes as f64);
    }

    /// Starts the HTTP server with `/healthz` and `/metrics`.
    pub async fn serve(self: &Arc<Self>, ctx: CancellationToken) -> Result<()> {
        let addr: SocketAddr = self
            .addr
            .parse()
            .with_context(|| format!("invalid health listen address: {}", self.addr))?;

        let app = Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics))
            .with_state(Arc::clone(self));

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding health server on {addr}"))?;
        tracing::info!(%addr, "health server listening");

        *self.shutdown.lock() = Some(ctx.clone());
        tokio::spawn(async move {
            let shutdown = async move { ctx.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(error = %e, "health server failed");
            }
        });

        Ok(())
    }

    /// Stops the server independently of the service-wide token.
    pub fn stop(&self) {
        if let Some(ctx) = self.shutdown.lock().take() {
            ctx.cancel();
        }
    }
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace("telemetryd")
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics(State(health): State<Arc<HealthMetrics>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = health.registry.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (StatusCode::OK, String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_construction() {
        let health = HealthMetrics::new("127.0.0.1:0".to_string()).expect("registry");
        let snap = GuardrailSnapshot {
            events_dispatched: 5,
            late_events: 2,
            ..Default::default()
        };
        health.update_from(&snap, 3, 1024);
        assert_eq!(health.events_dispatched.get(), 5);
        assert_eq!(health.late_events.get(), 2);
        assert_eq!(health.configs_active.get(), 3);

        // Counter only moves forward.
        health.update_from(&snap, 3, 1024);
        assert_eq!(health.events_dispatched.get(), 5);
    }
}
