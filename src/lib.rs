//! # Edge Gateway Library
//!
//! A small API gateway: one HTTP endpoint, a fixed middleware pipeline, and a
//! reverse proxy in front of a configured set of upstream services. The
//! pipeline applies request identification, security headers, CORS, tracing,
//! metrics, logging, content-type validation, tenant extraction, JWT
//! authentication, token-bucket rate limiting and per-service circuit
//! breaking before a request reaches an upstream.

// Core modules - order matters for dependency resolution
pub mod core;
pub mod routing;
pub mod proxy;
pub mod middleware;
pub mod observability;
pub mod gateway;

// Re-export commonly used types
pub use crate::core::config::GatewayConfig;
pub use crate::core::error::{GatewayError, GatewayResult};
pub use crate::gateway::server::Gateway;
pub use crate::routing::router::RouteTable;
