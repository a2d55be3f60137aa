//! # HTTP Server
//!
//! Wires the gateway together: service registry, health prober, breaker
//! manager, rate limiter and the stage pipeline, exposed through a single
//! axum catch-all handler. Shutdown is graceful with a bounded drain.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Router as AxumRouter;
use redis::aio::ConnectionManager;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::circuit_breaker::BreakerManager;
use crate::core::config::{GatewayConfig, RedisConfig};
use crate::core::error::{json_response, GatewayError, GatewayResult};
use crate::core::types::GatewayRequest;
use crate::middleware::auth::AuthStage;
use crate::middleware::builtin::{
    ContentTypeStage, CorsStage, RequestIdStage, SecurityHeadersStage, TenantStage,
};
use crate::middleware::circuit_breaker::CircuitBreakerStage;
use crate::middleware::metrics::MetricsStage;
use crate::middleware::pipeline::{Pipeline, Stage};
use crate::middleware::rate_limiting::{RateLimitStage, RateLimiter};
use crate::middleware::request_logging::RequestLoggingStage;
use crate::middleware::tracing::TracingStage;
use crate::observability::health::GatewayEndpoints;
use crate::observability::metrics::init_recorder;
use crate::proxy::forwarder::Forwarder;
use crate::proxy::health::{HealthProber, PROBE_INTERVAL};
use crate::proxy::registry::ServiceRegistry;
use crate::routing::router::RouteTable;

/// Upper bound on buffered request bodies.
const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// The assembled gateway.
pub struct Gateway {
    app: AxumRouter,
    registry: Arc<ServiceRegistry>,
    prober: HealthProber,
    sweeper: JoinHandle<()>,
    config: GatewayConfig,
}

impl Gateway {
    /// Build the gateway core from configuration and a loaded route table.
    pub async fn new(config: GatewayConfig, table: RouteTable) -> GatewayResult<Self> {
        let prometheus = init_recorder();

        let registry = Arc::new(ServiceRegistry::new(&config.services));
        table.validate_services(&registry.names());
        let table = Arc::new(table);

        let breakers = Arc::new(BreakerManager::new(config.circuit.clone()));
        let redis = connect_redis(&config.redis).await;
        let limiter = Arc::new(RateLimiter::new(redis));
        let sweeper = limiter.spawn_sweeper(config.rate_limit.cleanup_interval);
        let prober = HealthProber::start(Arc::clone(&registry), PROBE_INTERVAL);

        let endpoints =
            GatewayEndpoints::new(Arc::clone(&registry), Arc::clone(&breakers), prometheus);

        let mut stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(RequestIdStage),
            Arc::new(SecurityHeadersStage),
            Arc::new(CorsStage::new(vec!["*".to_string()])),
        ];
        if config.tracing.enabled {
            stages.push(Arc::new(TracingStage));
        }
        stages.push(Arc::new(MetricsStage));
        stages.push(Arc::new(RequestLoggingStage));
        stages.push(Arc::new(ContentTypeStage));
        stages.push(Arc::new(TenantStage));
        stages.push(Arc::new(AuthStage::new(config.jwt.secret.clone())));
        stages.push(Arc::new(RateLimitStage::new(
            Arc::clone(&limiter),
            config.rate_limit.clone(),
        )));
        stages.push(Arc::new(CircuitBreakerStage::new(
            Arc::clone(&breakers),
            config.circuit.enabled,
        )));

        let pipeline = Arc::new(Pipeline::new(
            stages,
            table,
            config.server.trusted_proxies.clone(),
            endpoints,
            Forwarder::new(Arc::clone(&registry)),
        ));

        let app = AxumRouter::new()
            .fallback(handle_request)
            .with_state(pipeline);

        Ok(Self {
            app,
            registry,
            prober,
            sweeper,
            config,
        })
    }

    /// Handle to the router, for in-process testing.
    pub fn app(&self) -> AxumRouter {
        self.app.clone()
    }

    /// Handle to the service registry.
    pub fn registry(&self) -> Arc<ServiceRegistry> {
        Arc::clone(&self.registry)
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests for at
    /// most the configured grace period.
    pub async fn serve<F>(mut self, shutdown: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::internal(format!("failed to bind {addr}: {e}")))?;
        info!(address = %addr, "gateway listening");

        let (tx, mut drain_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            shutdown.await;
            let _ = tx.send(true);
        });
        let mut stop_rx = drain_rx.clone();

        let server = axum::serve(
            listener,
            self.app
                .clone()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = stop_rx.changed().await;
            info!("shutting down, draining in-flight requests");
        });

        let grace = self.config.server.shutdown_timeout;
        tokio::select! {
            result = server => {
                result.map_err(|e| GatewayError::internal(format!("server error: {e}")))?;
            }
            _ = async {
                let _ = drain_rx.changed().await;
                tokio::time::sleep(grace).await;
            } => {
                warn!("shutdown grace period elapsed, aborting in-flight requests");
            }
        }

        self.prober.shutdown();
        self.sweeper.abort();
        info!("gateway stopped");
        Ok(())
    }
}

/// Catch-all handler: buffer the body and hand the request to the pipeline.
async fn handle_request(State(pipeline): State<Arc<Pipeline>>, request: Request) -> Response {
    // ConnectInfo is absent for in-process test calls.
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)));

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_SIZE).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                &json!({
                    "error": "bad_request",
                    "message": format!("failed to read request body: {err}"),
                }),
            )
        }
    };

    let gateway_request = GatewayRequest {
        method: parts.method,
        uri: parts.uri,
        version: parts.version,
        headers: parts.headers,
        body,
        remote_addr,
    };

    pipeline.handle(gateway_request).await
}

/// Connect to the shared store; failure means the rate limiter runs on the
/// in-process backend alone.
async fn connect_redis(cfg: &RedisConfig) -> Option<ConnectionManager> {
    let url = cfg.url()?;
    let client = match redis::Client::open(url) {
        Ok(client) => client,
        Err(err) => {
            warn!(error = %err, "invalid redis configuration, using in-process rate limiter");
            return None;
        }
    };

    match tokio::time::timeout(Duration::from_secs(5), ConnectionManager::new(client)).await {
        Ok(Ok(conn)) => {
            info!("connected to redis");
            Some(conn)
        }
        Ok(Err(err)) => {
            warn!(error = %err, "redis connection failed, using in-process rate limiter");
            None
        }
        Err(_) => {
            warn!("redis connection timed out, using in-process rate limiter");
            None
        }
    }
}
