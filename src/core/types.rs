//! # Core Request Types
//!
//! The buffered request handed to the pipeline and the per-request context
//! record. The context is a typed bag owned by the request task: stages read
//! and write named fields, there is no open-ended key/value map.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderMap, Method, Uri, Version};
use bytes::Bytes;
use tracing::Span;

use crate::core::circuit_breaker::BreakerPass;
use crate::routing::router::{Route, RouteTable};

/// An incoming request with its body fully buffered.
///
/// Buffering lets the retry wrapper re-issue the request and keeps header
/// mutation (forwarding and identity headers) trivially cheap.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: SocketAddr,
}

impl GatewayRequest {
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Header value as a string, `None` when absent or not valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Request host, preferring the `Host` header over the URI authority.
    pub fn host(&self) -> String {
        self.header("host")
            .map(str::to_string)
            .or_else(|| self.uri.authority().map(|a| a.to_string()))
            .unwrap_or_default()
    }
}

/// Outcome of a rate-limit decision, kept for the response headers.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitOutcome {
    pub limit: u32,
    pub remaining: u32,
    /// Epoch seconds at which one more token becomes available.
    pub reset: i64,
}

/// Per-request context carrier.
///
/// Created by the pipeline runtime at entry, resolved against the route
/// table immediately, and dropped when the response completes. Identity
/// fields are filled in by the auth and tenant stages.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub client_ip: String,
    pub method: Method,
    pub path: String,
    pub host: String,
    pub user_agent: String,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub email: Option<String>,
    pub roles: Vec<String>,
    pub route: Option<Arc<Route>>,
    /// Name of the upstream the request is destined for; `gateway` for
    /// reserved endpoints and unmatched paths.
    pub service: String,
    pub is_public: bool,
    pub span: Span,
    pub started_at: Instant,

    pub(crate) cors_origin: Option<String>,
    pub(crate) rate_limit: Option<RateLimitOutcome>,
    pub(crate) breaker_pass: Option<BreakerPass>,
}

impl RequestContext {
    /// Build the context for a request, resolving the route up front so the
    /// policy stages can consult `route`, `service` and `is_public`.
    pub fn new(req: &GatewayRequest, table: &RouteTable, trusted_proxies: &[String]) -> Self {
        let route = table.resolve(req.path(), req.method.as_str());
        let (service, is_public) = match &route {
            Some(r) => (r.service.clone(), r.public),
            None => ("gateway".to_string(), false),
        };

        Self {
            request_id: String::new(),
            client_ip: client_ip(req, trusted_proxies),
            method: req.method.clone(),
            path: req.path().to_string(),
            host: req.host(),
            user_agent: req.header("user-agent").unwrap_or_default().to_string(),
            user_id: None,
            tenant_id: None,
            email: None,
            roles: Vec::new(),
            route,
            service,
            is_public,
            span: Span::none(),
            started_at: Instant::now(),
            cors_origin: None,
            rate_limit: None,
            breaker_pass: None,
        }
    }
}

/// Client IP, honouring `X-Forwarded-For` only when the peer is a trusted
/// proxy.
fn client_ip(req: &GatewayRequest, trusted_proxies: &[String]) -> String {
    let peer = req.remote_addr.ip().to_string();
    if trusted_proxies.iter().any(|p| *p == peer) {
        if let Some(forwarded) = req.header("x-forwarded-for") {
            if let Some(first) = forwarded.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
    }
    peer
}
