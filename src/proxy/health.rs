//! # Health Prober
//!
//! One background task per upstream service issues `GET base_url +
//! health_path` on a fixed interval and writes the verdict into the
//! registry. Probes run independently so a slow upstream cannot delay the
//! others, and each probe carries its own deadline. A probe that errors is
//! itself an unhealthy verdict.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::proxy::registry::{ServiceRegistry, UpstreamService};

/// Default probe cadence.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);
/// Per-probe deadline, independent of request activity.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle over the background probe tasks.
#[derive(Debug)]
pub struct HealthProber {
    handles: Vec<JoinHandle<()>>,
}

impl HealthProber {
    /// Spawn one probe loop per registered service.
    pub fn start(registry: Arc<ServiceRegistry>, interval: Duration) -> Self {
        let mut handles = Vec::new();
        for name in registry.names() {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The immediate first tick is skipped; services keep their
                // startup liveness until the first real probe.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(service) = registry.get(&name) else {
                        return;
                    };
                    let healthy = probe(&service).await;
                    registry.set_health(&name, healthy);
                }
            }));
        }
        Self { handles }
    }

    /// Stop all probe loops.
    pub fn shutdown(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for HealthProber {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A service is healthy iff the probe completes with a 2xx status.
async fn probe(service: &Arc<UpstreamService>) -> bool {
    let url = format!("{}{}", service.base_url, service.health_path);
    match service
        .client
        .get(&url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
    {
        Ok(resp) => {
            let healthy = resp.status().is_success();
            debug!(service = %service.name, status = %resp.status(), healthy, "health probe");
            healthy
        }
        Err(err) => {
            warn!(service = %service.name, error = %err, "health probe failed");
            false
        }
    }
}
