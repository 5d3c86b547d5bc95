use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use telemetryd::clock::monotonic_ns;
use telemetryd::config::Config;
use telemetryd::export::health::HealthMetrics;
use telemetryd::{ConfigKey, Engine, Service, TelemetryConfig};

/// On-device telemetry aggregation engine.
#[derive(Parser)]
#[command(name = "telemetryd", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("telemetryd {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting telemetryd",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let engine = Arc::new(Engine::new(monotonic_ns()));
    engine.attach_uid_map_listener();

    // Install the startup metric configurations.
    for entry in &cfg.metric_configs {
        let data = std::fs::read_to_string(&entry.path)
            .with_context(|| format!("reading metric config {}", entry.path.display()))?;
        let metric_config: TelemetryConfig = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing metric config {}", entry.path.display()))?;
        let key = ConfigKey::new(entry.uid, metric_config.id);
        engine
            .set_config(key, metric_config, monotonic_ns())
            .with_context(|| format!("installing metric config {key}"))?;
    }

    let ctx = tokio_util::sync::CancellationToken::new();
    let mut service = Service::new(Arc::clone(&engine), cfg.engine.event_channel_capacity);
    service.start(ctx.clone()).await?;

    // Health server plus a periodic stats mirror.
    if cfg.health.enabled {
        let health = HealthMetrics::new(cfg.health.listen_addr.clone())?;
        health.serve(ctx.clone()).await?;

        let refresh_engine = Arc::clone(&engine);
        let refresh_health = Arc::clone(&health);
        let refresh_ctx = ctx.clone();
        let interval = cfg.engine.stats_refresh_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = refresh_ctx.cancelled() => return,
                    _ = ticker.tick() => {
                        refresh_health.update_from(
                            &refresh_engine.stats_snapshot(),
                            refresh_engine.config_count(),
                            refresh_engine.uid_map().bytes_used(),
                        );
                    }
                }
            }
        });
    }

    let _ = shutdown_rx.await;
    ctx.cancel();
    service.wait_for_shutdown().await;

    tracing::info!("telemetryd stopped");
    Ok(())
}
