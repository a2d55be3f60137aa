//! # Tracing Stage
//!
//! Opens one span per request and parks its handle on the context so later
//! stages (and the logging event) attach to it. Identity fields are recorded
//! as they become known; status and duration land when the response unwinds.

use async_trait::async_trait;
use axum::response::Response;
use tracing::field::Empty;
use tracing::info_span;

use crate::core::error::GatewayResult;
use crate::core::types::{GatewayRequest, RequestContext};
use crate::middleware::pipeline::{Stage, StageFlow};

pub struct TracingStage;

#[async_trait]
impl Stage for TracingStage {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn before(
        &self,
        _req: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> GatewayResult<StageFlow> {
        let span = info_span!(
            "http_request",
            method = %ctx.method,
            path = %ctx.path,
            request_id = %ctx.request_id,
            upstream_service = %ctx.service,
            client_ip = %ctx.client_ip,
            user_id = Empty,
            tenant_id = Empty,
            status = Empty,
            duration_ms = Empty,
        );
        ctx.span = span;
        Ok(StageFlow::Continue)
    }

    async fn after(&self, resp: Response, ctx: &mut RequestContext) -> Response {
        let span = &ctx.span;
        if let Some(user_id) = &ctx.user_id {
            span.record("user_id", user_id.as_str());
        }
        if let Some(tenant_id) = &ctx.tenant_id {
            span.record("tenant_id", tenant_id.as_str());
        }
        span.record("status", resp.status().as_u16() as u64);
        span.record("duration_ms", ctx.started_at.elapsed().as_millis() as u64);
        resp
    }
}
