//! # Route Table
//!
//! Declarative routing loaded from YAML. Resolution is a linear scan in
//! declared order: a route matches when its path is an exact match or a
//! prefix (followed by `/`) of the request path and the method is listed.
//! Route counts are small enough that a scan beats maintaining a trie, and
//! declared order doubles as the tie-break.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::core::error::GatewayResult;

/// The reserved service name for endpoints served by the gateway itself.
pub const GATEWAY_SERVICE: &str = "gateway";

/// Per-route rate-limit override.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteLimit {
    pub requests_per_sec: u32,
    pub burst_size: u32,
}

/// Per-route retry policy for upstream 5xx responses.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub wait_time: Duration,
}

/// A single route mapping a path prefix to an upstream service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub path: String,
    pub service: String,
    #[serde(default)]
    pub strip_prefix: bool,
    pub methods: Vec<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub circuit_breaker: bool,
    #[serde(default)]
    pub rate_limit: Option<RouteLimit>,
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl Route {
    fn matches(&self, path: &str, method: &str) -> bool {
        self.matches_path(path) && self.matches_method(method)
    }

    fn matches_path(&self, path: &str) -> bool {
        if path == self.path {
            return true;
        }
        match path.strip_prefix(&self.path) {
            Some(rest) => rest.starts_with('/'),
            None => false,
        }
    }

    fn matches_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

#[derive(Debug, Deserialize)]
struct RoutesDocument {
    routes: Vec<Route>,
}

/// Immutable route table, first match wins.
#[derive(Debug)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        let table = Self {
            routes: routes.into_iter().map(Arc::new).collect(),
        };
        table.report_duplicates();
        table
    }

    /// Load the table from a YAML document. A missing file falls back to the
    /// built-in default table; a malformed file is an error.
    pub fn load(path: &str) -> GatewayResult<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(_) => {
                warn!(path, "routes file not found, using default routes");
                return Ok(Self::default_routes());
            }
        };
        Self::from_yaml(&data)
    }

    /// Parse a YAML routes document.
    pub fn from_yaml(data: &str) -> GatewayResult<Self> {
        let document: RoutesDocument = serde_yaml::from_str(data)?;
        Ok(Self::new(document.routes))
    }

    /// Resolve a request to a route: first declared route whose path prefix
    /// and method both match. `None` means the caller answers 404.
    pub fn resolve(&self, path: &str, method: &str) -> Option<Arc<Route>> {
        self.routes
            .iter()
            .find(|r| r.matches(path, method))
            .cloned()
    }

    pub fn is_public(route: &Route) -> bool {
        route.public
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    /// Report routes whose service is neither a configured upstream nor the
    /// reserved `gateway` name. The routes stay in the table; the proxy
    /// answers 502 for them at request time.
    pub fn validate_services(&self, known: &[String]) {
        for route in &self.routes {
            if route.service != GATEWAY_SERVICE && !known.contains(&route.service) {
                warn!(
                    path = %route.path,
                    service = %route.service,
                    "route references unknown service"
                );
            }
        }
    }

    /// Duplicate `(path, method)` pairs are reported; the first declared
    /// route wins.
    fn report_duplicates(&self) {
        for (i, route) in self.routes.iter().enumerate() {
            for earlier in &self.routes[..i] {
                if earlier.path != route.path {
                    continue;
                }
                let overlap: Vec<&String> = route
                    .methods
                    .iter()
                    .filter(|m| earlier.matches_method(m))
                    .collect();
                if !overlap.is_empty() {
                    warn!(
                        path = %route.path,
                        methods = ?overlap,
                        "duplicate route declaration, first wins"
                    );
                }
            }
        }
    }

    /// Built-in table mirroring the deployed auth/notifier topology.
    pub fn default_routes() -> Self {
        let all = ["GET", "POST", "PUT", "DELETE", "PATCH"];
        let crud = ["GET", "POST", "PUT", "DELETE"];

        let mut routes = vec![
            route("/api/v1/auth/login", "auth", &["POST"], true, limit(10, 20)),
            route("/api/v1/auth/register", "auth", &["POST"], true, limit(5, 10)),
            route("/api/v1/auth/refresh", "auth", &["POST"], true, None),
            route("/api/v1/auth/verify-email", "auth", &["POST", "GET"], true, None),
            route(
                "/api/v1/auth/forgot-password",
                "auth",
                &["POST"],
                true,
                limit(3, 5),
            ),
            route("/api/v1/auth/reset-password", "auth", &["POST"], true, None),
            route("/api/v1/auth", "auth", &all, false, None),
            route("/api/v1/users", "auth", &all, false, None),
            route("/api/v1/roles", "auth", &crud, false, None),
            route("/api/v1/permissions", "auth", &crud, false, None),
            route("/api/v1/admin", "auth", &all, false, None),
            route("/api/v1/notifications", "notifier", &crud, false, None),
            route("/api/v1/templates", "notifier", &crud, false, None),
            route("/api/v1/preferences", "notifier", &crud, false, None),
        ];

        for path in ["/health", "/ready", "/metrics"] {
            routes.push(Route {
                path: path.to_string(),
                service: GATEWAY_SERVICE.to_string(),
                strip_prefix: false,
                methods: vec!["GET".to_string()],
                public: true,
                circuit_breaker: false,
                rate_limit: None,
                timeout: None,
                retry: None,
            });
        }

        Self::new(routes)
    }
}

fn limit(requests_per_sec: u32, burst_size: u32) -> Option<RouteLimit> {
    Some(RouteLimit {
        requests_per_sec,
        burst_size,
    })
}

fn route(
    path: &str,
    service: &str,
    methods: &[&str],
    public: bool,
    rate_limit: Option<RouteLimit>,
) -> Route {
    Route {
        path: path.to_string(),
        service: service.to_string(),
        strip_prefix: false,
        methods: methods.iter().map(|m| m.to_string()).collect(),
        public,
        circuit_breaker: true,
        rate_limit,
        timeout: None,
        retry: None,
    }
}
