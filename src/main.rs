//! # Edge Gateway - Entry Point
//!
//! Thin boot wrapper: load configuration, build the gateway core, run it
//! until a termination signal arrives.

use tokio::signal;
use tracing::{error, info};

use edge_gateway::observability::telemetry;
use edge_gateway::{Gateway, GatewayConfig, RouteTable};

const ROUTES_FILE: &str = "config/routes.yaml";

#[tokio::main]
async fn main() {
    let config = GatewayConfig::from_env();
    telemetry::init(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "starting edge gateway");

    let table = match RouteTable::load(ROUTES_FILE) {
        Ok(table) => table,
        Err(err) => {
            error!(error = %err, "failed to load routes");
            std::process::exit(1);
        }
    };

    let gateway = match Gateway::new(config, table).await {
        Ok(gateway) => gateway,
        Err(err) => {
            error!(error = %err, "failed to build gateway");
            std::process::exit(1);
        }
    };

    if let Err(err) = gateway.serve(shutdown_signal()).await {
        error!(error = %err, "gateway exited with error");
        std::process::exit(1);
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("termination signal received");
}
