//! # Error Handling Module
//!
//! Defines the error types surfaced by the gateway and their mapping onto
//! HTTP responses. Every error that reaches the client is rendered as a JSON
//! body of the shape `{error, message, request_id?}` where `error` is a
//! stable machine-readable kind.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors produced by the gateway core.
///
/// Each variant corresponds to one of the error kinds surfaced to clients;
/// the `#[from]` variants cover configuration-load failures that never reach
/// a client directly.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing, malformed, invalid or expired credentials
    #[error("{message}")]
    Unauthorized { message: String },

    /// Authenticated but lacking a required role
    #[error("{message}")]
    Forbidden { message: String },

    /// Request carries a body but no Content-Type header
    #[error("Content-Type header is required for request body")]
    UnsupportedMediaType,

    /// No route matched the request
    #[error("The requested resource was not found")]
    NotFound,

    /// Upstream unhealthy or circuit open
    #[error("{message}")]
    ServiceUnavailable { service: String, message: String },

    /// Half-open circuit admission exceeded
    #[error("Service is recovering, please try again")]
    TooManyRequests { service: String },

    /// Unknown upstream or transport failure while proxying
    #[error("{message}")]
    BadGateway { message: String },

    /// Unexpected internal failure
    #[error("{message}")]
    Internal { message: String },

    /// Configuration problems detected at startup
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl GatewayError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::BadGateway {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// HTTP status code this error maps to at the boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::TooManyRequests { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            Self::Internal { .. }
            | Self::Configuration { .. }
            | Self::Io(_)
            | Self::Yaml(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable kind used in the `error` field of responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "unauthorized",
            Self::Forbidden { .. } => "forbidden",
            Self::UnsupportedMediaType => "unsupported_media_type",
            Self::NotFound => "not_found",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::TooManyRequests { .. } => "too_many_requests",
            Self::BadGateway { .. } => "bad_gateway",
            Self::Internal { .. }
            | Self::Configuration { .. }
            | Self::Io(_)
            | Self::Yaml(_) => "internal_server_error",
        }
    }

    /// Extra domain-specific fields carried in the error body.
    fn extra_fields(&self) -> Map<String, Value> {
        let mut extra = Map::new();
        match self {
            Self::ServiceUnavailable { service, .. } | Self::TooManyRequests { service } => {
                extra.insert("service".into(), Value::String(service.clone()));
            }
            _ => {}
        }
        extra
    }

    /// Render this error as a response, stamping the request id when known.
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        let status = self.status_code();
        let mut body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        let map = body.as_object_mut().expect("error body is an object");
        for (k, v) in self.extra_fields() {
            map.insert(k, v);
        }
        if !request_id.is_empty() {
            map.insert("request_id".into(), Value::String(request_id.to_string()));
        }
        json_response(status, &body)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.into_response_with_id("")
    }
}

/// Build a JSON response without going through axum's `Json` extractor.
///
/// Serialization of `serde_json::Value` cannot fail, which keeps the error
/// path itself infallible.
pub fn json_response(status: StatusCode, body: &Value) -> Response {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
