mod config;

use clap::Parser;
use config::{Config, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use optimizer::Shutdown;
use optimizer::publish::NoopPublisher;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(about = "Builds relay cost and route matrices from relay measurements")]
struct Cli {
    #[arg(long, short, default_value = "relay-optimizer.yaml")]
    config: PathBuf,
}

fn init_logging(logging: &LoggingConfig) -> Option<sentry::ClientInitGuard> {
    let guard = logging.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(metrics: &MetricsConfig) -> Result<(), Box<dyn std::error::Error>> {
    let recorder = StatsdBuilder::from(metrics.statsd_host.as_str(), metrics.statsd_port)
        .build(Some(&metrics.prefix))?;
    metrics::set_global_recorder(recorder).map_err(|_| "metrics recorder already installed")?;
    shared::metrics_defs::describe_all(optimizer::metrics_defs::ALL_METRICS);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config {}: {e}", cli.config.display());
            process::exit(1);
        }
    };

    let _sentry = init_logging(&config.common.logging);

    if let Some(metrics) = &config.common.metrics {
        if let Err(e) = init_metrics(metrics) {
            tracing::error!(error = %e, "failed to initialize statsd metrics");
            process::exit(1);
        }
    }

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal.trigger();
        }
    });

    let result = optimizer::run(
        config.optimizer,
        Arc::new(NoopPublisher),
        Arc::new(NoopPublisher),
        shutdown,
    )
    .await;

    if let Err(e) = result {
        tracing::error!(error = %e, "relay optimizer failed");
        process::exit(1);
    }
    tracing::info!("relay optimizer stopped");
}
