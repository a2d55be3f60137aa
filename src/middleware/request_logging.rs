//! # Request Logging Stage
//!
//! Emits one structured event per request once the response is known.
//! Severity follows the status class: error for 5xx, warn for 4xx, info
//! otherwise.

use async_trait::async_trait;
use axum::response::Response;
use tracing::{error, info, warn};

use crate::core::types::RequestContext;
use crate::middleware::pipeline::Stage;

pub struct RequestLoggingStage;

#[async_trait]
impl Stage for RequestLoggingStage {
    fn name(&self) -> &'static str {
        "request_logging"
    }

    async fn after(&self, resp: Response, ctx: &mut RequestContext) -> Response {
        let status = resp.status().as_u16();
        let duration_ms = ctx.started_at.elapsed().as_millis() as u64;
        let method = ctx.method.as_str();
        let user_id = ctx.user_id.as_deref().unwrap_or("");
        let tenant_id = ctx.tenant_id.as_deref().unwrap_or("");

        ctx.span.in_scope(|| {
            if status >= 500 {
                error!(
                    method,
                    path = %ctx.path,
                    status,
                    duration_ms,
                    ip = %ctx.client_ip,
                    request_id = %ctx.request_id,
                    user_id,
                    tenant_id,
                    service = %ctx.service,
                    user_agent = %ctx.user_agent,
                    "request completed"
                );
            } else if status >= 400 {
                warn!(
                    method,
                    path = %ctx.path,
                    status,
                    duration_ms,
                    ip = %ctx.client_ip,
                    request_id = %ctx.request_id,
                    user_id,
                    tenant_id,
                    service = %ctx.service,
                    user_agent = %ctx.user_agent,
                    "request completed"
                );
            } else {
                info!(
                    method,
                    path = %ctx.path,
                    status,
                    duration_ms,
                    ip = %ctx.client_ip,
                    request_id = %ctx.request_id,
                    user_id,
                    tenant_id,
                    service = %ctx.service,
                    user_agent = %ctx.user_agent,
                    "request completed"
                );
            }
        });

        resp
    }
}
