use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the telemetryd service.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Engine tuning.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Metric configurations (YAML `TelemetryConfig` files) installed at
    /// startup.
    #[serde(default)]
    pub metric_configs: Vec<MetricConfigEntry>,
}

/// Engine tuning knobs.
#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// Event channel capacity between producers and the dispatcher.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// How often guardrail counters refresh into the health registry.
    #[serde(default = "default_stats_refresh_interval", with = "humantime_serde")]
    pub stats_refresh_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: default_event_channel_capacity(),
            stats_refresh_interval: default_stats_refresh_interval(),
        }
    }
}

/// One metric configuration to install at startup.
#[derive(Debug, Deserialize)]
pub struct MetricConfigEntry {
    /// Uid half of the config key. Default: 1000 (system).
    #[serde(default = "default_config_uid")]
    pub uid: i32,

    /// Path to the YAML `TelemetryConfig`.
    pub path: PathBuf,
}

/// Health endpoint configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Enable the HTTP health/metrics server. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: "127.0.0.1:9464".
    #[serde(default = "default_health_addr")]
    pub listen_addr: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: default_health_addr(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_event_channel_capacity() -> usize {
    65536
}

fn default_stats_refresh_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_config_uid() -> i32 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    "127.0.0.1:9464".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.event_channel_capacity == 0 {
            bail!("engine.event_channel_capacity must be > 0");
        }
        if self.health.enabled && self.health.listen_addr.parse::<std::net::SocketAddr>().is_err()
        {
            bail!(
                "health.listen_addr is not a valid socket address: {}",
                self.health.listen_addr
            );
        }
        for entry in &self.metric_configs {
            if entry.path.as_os_str().is_empty() {
                bail!("metric_configs entry with empty path");
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            engine: EngineConfig::default(),
            health: HealthConfig::default(),
            metric_configs: Vec::new(),
        }
    }
}
