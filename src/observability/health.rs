//! # Gateway Endpoints
//!
//! The reserved endpoints the gateway answers itself: liveness, readiness,
//! per-service health, Prometheus exposition and breaker states. Readiness
//! is the only one that gates: it returns 503 while any upstream is marked
//! unhealthy by the prober.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use chrono::{SecondsFormat, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;

use crate::core::circuit_breaker::BreakerManager;
use crate::core::error::json_response;
use crate::proxy::registry::ServiceRegistry;

/// State shared by the reserved endpoint handlers.
pub struct GatewayEndpoints {
    registry: Arc<ServiceRegistry>,
    breakers: Arc<BreakerManager>,
    prometheus: Option<PrometheusHandle>,
    started_at: Instant,
}

impl GatewayEndpoints {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        breakers: Arc<BreakerManager>,
        prometheus: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            registry,
            breakers,
            prometheus,
            started_at: Instant::now(),
        }
    }

    /// `GET /health` - overall gateway health.
    pub fn health(&self) -> Response {
        let uptime = Duration::from_secs(self.started_at.elapsed().as_secs());
        json_response(
            StatusCode::OK,
            &json!({
                "status": "healthy",
                "timestamp": timestamp(),
                "uptime": humantime::format_duration(uptime).to_string(),
                "version": env!("CARGO_PKG_VERSION"),
            }),
        )
    }

    /// `GET /ready` - 503 iff any upstream is unhealthy.
    pub fn ready(&self) -> Response {
        let services = self.registry.health_snapshot();
        let all_healthy = services.values().all(|healthy| *healthy);
        let (status, ready) = if all_healthy {
            (StatusCode::OK, "ready")
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
        };
        json_response(
            status,
            &json!({
                "status": ready,
                "timestamp": timestamp(),
                "services": services,
            }),
        )
    }

    /// `GET /live` - liveness probe.
    pub fn live(&self) -> Response {
        json_response(
            StatusCode::OK,
            &json!({
                "status": "alive",
                "timestamp": timestamp(),
            }),
        )
    }

    /// `GET /health/services` - per-service detail plus process memory.
    pub fn services_health(&self) -> Response {
        let services: serde_json::Map<String, serde_json::Value> = self
            .registry
            .health_snapshot()
            .into_iter()
            .map(|(name, healthy)| {
                let status = if healthy { "healthy" } else { "unhealthy" };
                (name, json!({ "status": status, "healthy": healthy }))
            })
            .collect();

        json_response(
            StatusCode::OK,
            &json!({
                "timestamp": timestamp(),
                "services": services,
                "memory": memory_stats(),
            }),
        )
    }

    /// `GET /metrics` - Prometheus text exposition.
    pub fn metrics(&self) -> Response {
        let body = self
            .prometheus
            .as_ref()
            .map(|handle| handle.render())
            .unwrap_or_default();
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(Body::from(body))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }

    /// `GET /circuit-breakers` - state name per known breaker.
    pub fn circuit_breakers(&self) -> Response {
        json_response(
            StatusCode::OK,
            &json!({ "states": self.breakers.all_states() }),
        )
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Process memory from `/proc/self/status`; zeros where unavailable.
fn memory_stats() -> serde_json::Value {
    let (rss_mb, vm_mb) = read_proc_status().unwrap_or((0, 0));
    json!({ "rss_mb": rss_mb, "vm_mb": vm_mb })
}

#[cfg(target_os = "linux")]
fn read_proc_status() -> Option<(u64, u64)> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let mut rss_kb = 0;
    let mut vm_kb = 0;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            rss_kb = parse_kb(rest);
        } else if let Some(rest) = line.strip_prefix("VmSize:") {
            vm_kb = parse_kb(rest);
        }
    }
    Some((rss_kb / 1024, vm_kb / 1024))
}

#[cfg(not(target_os = "linux"))]
fn read_proc_status() -> Option<(u64, u64)> {
    None
}

#[cfg(target_os = "linux")]
fn parse_kb(value: &str) -> u64 {
    value
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{CircuitConfig, GatewayConfig};

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn endpoints() -> (GatewayEndpoints, Arc<ServiceRegistry>) {
        let registry = Arc::new(ServiceRegistry::new(&GatewayConfig::from_env().services));
        let breakers = Arc::new(BreakerManager::new(CircuitConfig {
            enabled: true,
            max_requests: 5,
            interval: std::time::Duration::from_secs(60),
            timeout: std::time::Duration::from_secs(30),
            failure_threshold: 5,
        }));
        (
            GatewayEndpoints::new(Arc::clone(&registry), breakers, None),
            registry,
        )
    }

    #[tokio::test]
    async fn ready_gates_on_service_health() {
        let (endpoints, registry) = endpoints();

        let resp = endpoints.ready();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ready");
        assert_eq!(body["services"]["auth"], true);

        registry.set_health("auth", false);
        let resp = endpoints.ready();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "not_ready");
        assert_eq!(body["services"]["auth"], false);
        assert_eq!(body["services"]["notifier"], true);
    }

    #[tokio::test]
    async fn health_reports_uptime_and_version() {
        let (endpoints, _) = endpoints();
        let resp = endpoints.health();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert!(body["uptime"].is_string());
    }

    #[tokio::test]
    async fn services_health_carries_memory_block() {
        let (endpoints, registry) = endpoints();
        registry.set_health("notifier", false);

        let body = body_json(endpoints.services_health()).await;
        assert_eq!(body["services"]["notifier"]["status"], "unhealthy");
        assert_eq!(body["services"]["notifier"]["healthy"], false);
        assert!(body["memory"]["rss_mb"].is_u64());
    }

    #[tokio::test]
    async fn circuit_breakers_lists_known_states() {
        let (endpoints, _) = endpoints();
        let body = body_json(endpoints.circuit_breakers()).await;
        assert!(body["states"].is_object());
    }
}
