//! telemetryd: an on-device telemetry aggregation engine.
//!
//! The engine ingests structured atomic log events and, under declarative
//! metric configurations, produces aggregated reports (counts, durations,
//! gauges, numeric values, sketches, raw events) sliced by conditions and
//! device states. Configurations can be replaced live: unchanged parts of
//! the evaluation graph keep their in-flight aggregation state.

pub mod anomaly;
pub mod clock;
pub mod compiler;
pub mod condition;
pub mod config;
pub mod dimension;
pub mod engine;
pub mod error;
pub mod event;
pub mod export;
pub mod ident;
pub mod matchers;
pub mod metrics;
pub mod puller;
pub mod report;
pub mod spec;
pub mod state;
pub mod stats;
pub mod uidmap;

pub use engine::service::Service;
pub use engine::Engine;
pub use error::ConfigError;
pub use event::Event;
pub use spec::{ConfigKey, TelemetryConfig};
