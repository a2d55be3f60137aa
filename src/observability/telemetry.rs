//! # Telemetry Bootstrap
//!
//! Installs the global `tracing` subscriber according to the logging
//! configuration. `RUST_LOG` takes precedence over the configured level so
//! operators can raise verbosity without touching the config.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::core::config::LoggingConfig;

/// Initialize logging. Safe to call more than once; only the first call
/// installs the subscriber.
pub fn init(cfg: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("edge_gateway={}", cfg.level)));

    if cfg.format == "json" {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init();
    }
}
