//! # Metrics Stage
//!
//! Records request counters and latency histograms against the installed
//! recorder. The path label uses the matched route's pattern rather than the
//! raw request path to keep cardinality bounded.

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::Response;
use metrics::{counter, histogram};

use crate::core::types::RequestContext;
use crate::middleware::pipeline::Stage;

pub struct MetricsStage;

#[async_trait]
impl Stage for MetricsStage {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn after(&self, resp: Response, ctx: &mut RequestContext) -> Response {
        let status = resp.status();
        let method = ctx.method.to_string();
        let path = ctx
            .route
            .as_ref()
            .map(|r| r.path.clone())
            .unwrap_or_else(|| ctx.path.clone());
        let service = ctx.service.clone();

        counter!(
            "gateway_http_requests_total",
            "method" => method.clone(),
            "path" => path.clone(),
            "service" => service.clone(),
            "status" => status.as_u16().to_string()
        )
        .increment(1);

        histogram!(
            "gateway_http_request_duration_seconds",
            "method" => method,
            "path" => path.clone(),
            "service" => service.clone()
        )
        .record(ctx.started_at.elapsed().as_secs_f64());

        if status == StatusCode::TOO_MANY_REQUESTS {
            counter!("gateway_rate_limit_exceeded_total", "path" => path).increment(1);
        }

        if status.as_u16() >= 500 {
            counter!(
                "gateway_upstream_errors_total",
                "service" => service,
                "error_type" => "5xx"
            )
            .increment(1);
        }

        resp
    }
}
