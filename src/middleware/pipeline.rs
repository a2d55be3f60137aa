//! # Middleware Pipeline
//!
//! The ordered chain of policy stages every request passes through before it
//! is dispatched to a gateway endpoint or proxied upstream.
//!
//! A stage sees the request on the way in (`before`) and the response on the
//! way out (`after`). `before` hooks run in declared order; whichever
//! response results - a short-circuit, a structured error, or the dispatch
//! result - then unwinds through the `after` hooks of the stages that ran,
//! in reverse order. The runtime itself is the outermost recovery layer: a
//! panic anywhere downstream becomes a 500 carrying the request id.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::Method;
use axum::response::Response;
use futures::FutureExt;
use tracing::{debug, error};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayRequest, RequestContext};
use crate::observability::health::GatewayEndpoints;
use crate::proxy::forwarder::Forwarder;
use crate::routing::router::{RouteTable, GATEWAY_SERVICE};

/// Control flow returned by a stage's `before` hook.
#[derive(Debug)]
pub enum StageFlow {
    /// Hand the request to the next stage.
    Continue,
    /// Stop here and answer with this response.
    Respond(Response),
}

/// One policy stage in the pipeline.
///
/// Both hooks default to pass-through so response-only stages (security
/// headers, logging) and request-only stages (content-type) implement just
/// one side.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn before(
        &self,
        _req: &mut GatewayRequest,
        _ctx: &mut RequestContext,
    ) -> GatewayResult<StageFlow> {
        Ok(StageFlow::Continue)
    }

    async fn after(&self, resp: Response, _ctx: &mut RequestContext) -> Response {
        resp
    }
}

/// The pipeline runtime: fixed stage order plus the terminal dispatch.
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    table: Arc<RouteTable>,
    trusted_proxies: Vec<String>,
    endpoints: GatewayEndpoints,
    forwarder: Forwarder,
}

impl Pipeline {
    pub fn new(
        stages: Vec<Arc<dyn Stage>>,
        table: Arc<RouteTable>,
        trusted_proxies: Vec<String>,
        endpoints: GatewayEndpoints,
        forwarder: Forwarder,
    ) -> Self {
        Self {
            stages,
            table,
            trusted_proxies,
            endpoints,
            forwarder,
        }
    }

    /// Run one request through the pipeline. Never panics outward.
    pub async fn handle(&self, mut req: GatewayRequest) -> Response {
        let mut ctx = RequestContext::new(&req, &self.table, &self.trusted_proxies);

        let outcome = AssertUnwindSafe(self.run(&mut req, &mut ctx))
            .catch_unwind()
            .await;

        match outcome {
            Ok(response) => response,
            Err(_) => {
                error!(
                    request_id = %ctx.request_id,
                    path = %ctx.path,
                    "panic while handling request"
                );
                GatewayError::internal("An unexpected error occurred")
                    .into_response_with_id(&ctx.request_id)
            }
        }
    }

    async fn run(&self, req: &mut GatewayRequest, ctx: &mut RequestContext) -> Response {
        let mut short_circuit = None;
        let mut ran = 0;

        for stage in &self.stages {
            match stage.before(req, ctx).await {
                Ok(StageFlow::Continue) => ran += 1,
                Ok(StageFlow::Respond(response)) => {
                    debug!(stage = stage.name(), "stage answered the request");
                    short_circuit = Some(response);
                    break;
                }
                Err(err) => {
                    debug!(stage = stage.name(), error = %err, "stage rejected the request");
                    short_circuit = Some(err.into_response_with_id(&ctx.request_id));
                    break;
                }
            }
        }

        let mut response = match short_circuit {
            Some(response) => response,
            None => self.dispatch(req, ctx).await,
        };

        for stage in self.stages[..ran].iter().rev() {
            response = stage.after(response, ctx).await;
        }
        response
    }

    /// Terminal handler: reserved gateway endpoints first, then the resolved
    /// route, otherwise 404.
    async fn dispatch(&self, req: &GatewayRequest, ctx: &mut RequestContext) -> Response {
        if req.method == Method::GET {
            match req.path() {
                "/health" => return self.endpoints.health(),
                "/ready" => return self.endpoints.ready(),
                "/live" => return self.endpoints.live(),
                "/health/services" => return self.endpoints.services_health(),
                "/metrics" => return self.endpoints.metrics(),
                "/circuit-breakers" => return self.endpoints.circuit_breakers(),
                _ => {}
            }
        }

        match ctx.route.clone() {
            Some(route) if route.service != GATEWAY_SERVICE => {
                self.forwarder.forward(req, ctx, &route).await
            }
            // Gateway-service routes are the reserved endpoints above; any
            // other path claiming the gateway is a miss.
            _ => GatewayError::NotFound.into_response_with_id(&ctx.request_id),
        }
    }
}
