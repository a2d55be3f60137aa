//! # Prometheus Recorder
//!
//! The metrics recorder is a process-wide singleton: stages record through
//! the `metrics` macros and the `/metrics` endpoint renders from the handle.
//! Installation happens once; later gateway instances (tests build several
//! per process) reuse the same recorder.

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::warn;

static PROMETHEUS: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the Prometheus recorder, returning the render handle.
pub fn init_recorder() -> Option<PrometheusHandle> {
    PROMETHEUS
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(error = %err, "failed to install metrics recorder");
                None
            }
        })
        .clone()
}

/// Read-only access to the installed handle, if any.
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS.get().cloned().flatten()
}
