//! # Reverse Proxy Forwarder
//!
//! Builds the upstream request (prefix stripping, hop-by-hop filtering,
//! forwarding headers), executes it on the service's pooled client and
//! copies the response back verbatim. A route may attach a retry policy for
//! upstream 5xx responses.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Response as HttpResponse, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{debug, warn};

use crate::core::error::json_response;
use crate::core::types::{GatewayRequest, RequestContext};
use crate::proxy::registry::{ServiceRegistry, UpstreamService};
use crate::routing::router::{RetryPolicy, Route};

/// Headers scoped to a single hop; never forwarded in either direction.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Backoff cap for the retry policy.
const MAX_RETRY_WAIT: Duration = Duration::from_secs(30);

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Forwards requests to registered upstream services.
#[derive(Debug)]
pub struct Forwarder {
    registry: Arc<ServiceRegistry>,
}

impl Forwarder {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }

    /// Proxy a request along its resolved route, applying the route's retry
    /// policy when one is declared.
    pub async fn forward(
        &self,
        req: &GatewayRequest,
        ctx: &RequestContext,
        route: &Route,
    ) -> Response {
        let service = match self.registry.get(&route.service) {
            Some(service) => service,
            None => {
                return error(
                    StatusCode::BAD_GATEWAY,
                    "bad_gateway",
                    &format!("service {} not found", route.service),
                    ctx,
                )
            }
        };

        if !self.registry.is_healthy(&route.service) {
            return error(
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                &format!("service {} is unavailable", route.service),
                ctx,
            );
        }

        match &route.retry {
            None => self.dispatch(req, ctx, route, &service).await,
            Some(policy) => self.dispatch_with_retry(req, ctx, route, &service, policy).await,
        }
    }

    /// Retry on upstream status >= 500 with exponential backoff; client
    /// errors are returned immediately.
    async fn dispatch_with_retry(
        &self,
        req: &GatewayRequest,
        ctx: &RequestContext,
        route: &Route,
        service: &Arc<UpstreamService>,
        policy: &RetryPolicy,
    ) -> Response {
        let mut response = self.dispatch(req, ctx, route, service).await;
        for attempt in 0..policy.max_attempts {
            if response.status().as_u16() < 500 {
                return response;
            }
            let wait = policy
                .wait_time
                .saturating_mul(1 << attempt.min(31))
                .min(MAX_RETRY_WAIT);
            debug!(
                service = %service.name,
                attempt,
                wait_ms = wait.as_millis() as u64,
                "retrying upstream request"
            );
            tokio::time::sleep(wait).await;
            response = self.dispatch(req, ctx, route, service).await;
        }
        response
    }

    /// Execute one upstream exchange.
    async fn dispatch(
        &self,
        req: &GatewayRequest,
        ctx: &RequestContext,
        route: &Route,
        service: &Arc<UpstreamService>,
    ) -> Response {
        let target = target_url(req, route, service);

        let mut headers = HeaderMap::new();
        for (name, value) in &req.headers {
            let key = name.as_str();
            // Hop-by-hop headers stay on this hop; host and content-length
            // are derived from the upstream request itself.
            if is_hop_by_hop(key) || key == "host" || key == "content-length" {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        insert(&mut headers, "x-forwarded-for", &ctx.client_ip);
        insert(&mut headers, "x-forwarded-host", &ctx.host);
        insert(&mut headers, "x-forwarded-proto", "http");
        insert(&mut headers, "x-real-ip", &ctx.client_ip);
        insert(&mut headers, "x-request-id", &ctx.request_id);

        let timeout = route
            .timeout
            .map(|t| t.min(service.timeout))
            .unwrap_or(service.timeout);

        let result = service
            .client
            .request(req.method.clone(), &target)
            .headers(headers)
            .body(req.body.clone())
            .timeout(timeout)
            .send()
            .await;

        let upstream = match result {
            Ok(resp) => resp,
            Err(err) => {
                warn!(service = %service.name, error = %err, "upstream request failed");
                return transport_error(&err, ctx);
            }
        };

        let status = upstream.status();
        let mut builder = HttpResponse::builder().status(status);
        if let Some(response_headers) = builder.headers_mut() {
            for (name, value) in upstream.headers() {
                if is_hop_by_hop(name.as_str()) {
                    continue;
                }
                response_headers.append(name.clone(), value.clone());
            }
        }

        let body = match upstream.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(service = %service.name, error = %err, "failed reading upstream body");
                return transport_error(&err, ctx);
            }
        };

        builder
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
    }
}

/// `base_url + path (optionally stripped) + query`.
fn target_url(req: &GatewayRequest, route: &Route, service: &Arc<UpstreamService>) -> String {
    let mut path = req.path().to_string();
    if route.strip_prefix {
        if let Some(rest) = req.path().strip_prefix(&route.path) {
            path = rest.to_string();
        }
        if path.is_empty() {
            path = "/".to_string();
        }
    }

    match req.query() {
        Some(query) if !query.is_empty() => {
            format!("{}{}?{}", service.base_url, path, query)
        }
        _ => format!("{}{}", service.base_url, path),
    }
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = value.parse() {
        headers.insert(name, value);
    }
}

fn error(status: StatusCode, kind: &str, message: &str, ctx: &RequestContext) -> Response {
    let mut body = json!({ "error": kind, "message": message });
    if !ctx.request_id.is_empty() {
        body["request_id"] = json!(ctx.request_id);
    }
    json_response(status, &body)
}

fn transport_error(err: &reqwest::Error, ctx: &RequestContext) -> Response {
    let mut body = json!({
        "error": "bad_gateway",
        "message": "upstream request failed",
        "details": err.to_string(),
    });
    if !ctx.request_id.is_empty() {
        body["request_id"] = json!(ctx.request_id);
    }
    json_response(StatusCode::BAD_GATEWAY, &body)
}
