//! # Conveyor Server
//!
//! Worker process entry point: loads configuration, installs logging and
//! the Prometheus exporter, connects the job store and drains every enabled
//! queue until Ctrl+C or SIGTERM.

use anyhow::Context;
use conveyor_config::{AppConfig, ConfigLoader};
use conveyor_core::{init_tracing, ConveyorResult};
use conveyor_jobs::register_metrics;
use conveyor_server::app::App;
use conveyor_server::startup::print_banner;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config = match load_config().await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_tracing(&config.logging) {
        eprintln!("{}", e);
    }

    print_banner();
    info!("Starting Conveyor Server...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(config).await {
        error!("Application error: {}", e);
        std::process::exit(1);
    }
}

async fn load_config() -> ConveyorResult<AppConfig> {
    let loader = ConfigLoader::from_default_location()?;
    Ok(loader.get().await)
}

async fn run(config: AppConfig) -> ConveyorResult<()> {
    if config.metrics.enabled {
        install_exporter(&config.metrics.listen_addr)?;
    } else {
        warn!("Prometheus exporter disabled");
    }
    register_metrics();

    let app = App::build(config).await?;
    app.run(shutdown_signal()).await
}

fn install_exporter(listen_addr: &str) -> ConveyorResult<()> {
    let addr: SocketAddr = listen_addr
        .parse()
        .with_context(|| format!("invalid metrics listen address '{}'", listen_addr))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;

    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
