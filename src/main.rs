use anyhow::{Context, Result};
use std::time::Duration;
use stratus::config::{load_config, StratusConfig};
use stratus::pipeline::Pipeline;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stratus=info".into()),
        )
        .init();

    info!("Stratus starting...");

    // Config path: first argument, then STRATUS_CONFIG, else built-in defaults
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("STRATUS_CONFIG").ok());

    let mut config = match config_path {
        Some(path) => {
            info!(path = %path, "Loading configuration");
            load_config(&path)?
        }
        None => {
            info!("No config file given, using defaults");
            StratusConfig::default()
        }
    };
    config.apply_env_overrides();

    info!(
        window_seconds = config.window.size_seconds,
        grace_seconds = config.window.grace_seconds,
        retention_minutes = config.window.retention_minutes,
        destinations = config.distribution.destinations.len(),
        "Configuration loaded"
    );

    let pipeline = Pipeline::new(config).context("Failed to build pipeline")?;
    pipeline.start()?;
    pipeline.start_scheduler()?;

    info!("Stratus running, press Ctrl+C to stop");

    let mut status_interval = tokio::time::interval(Duration::from_secs(60));
    status_interval.tick().await;

    loop {
        tokio::select! {
            _ = status_interval.tick() => {
                let status = pipeline.status();
                info!(
                    accepted = status.ingest.accepted,
                    late = status.ingest.late,
                    windows_flushed = status.ingest.windows_flushed,
                    open_buckets = status.open_buckets,
                    writes_failed = status.delivery.writes_failed,
                    "Pipeline status"
                );
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for shutdown signal")?;
                info!("Shutdown signal received");
                break;
            }
        }
    }

    pipeline.shutdown().await?;
    info!("Stratus stopped");
    Ok(())
}
