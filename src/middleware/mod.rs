pub mod auth;
pub mod builtin;
pub mod circuit_breaker;
pub mod metrics;
pub mod pipeline;
pub mod rate_limiting;
pub mod request_logging;
pub mod tracing;

pub use pipeline::{Pipeline, Stage, StageFlow};
