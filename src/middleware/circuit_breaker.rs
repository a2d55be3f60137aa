//! # Circuit Breaker Stage
//!
//! Applies the per-service breaker to routes that opted in. Admission is
//! checked on the way in; the outcome is recorded on the way out, where a
//! response status of 500 or above (including the 502 produced for a
//! transport error) counts as a failure.

use std::sync::Arc;

use async_trait::async_trait;
use axum::response::Response;

use crate::core::circuit_breaker::{BreakerError, BreakerManager, BreakerPass};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayRequest, RequestContext};
use crate::middleware::pipeline::{Stage, StageFlow};
use crate::routing::router::GATEWAY_SERVICE;

pub struct CircuitBreakerStage {
    manager: Arc<BreakerManager>,
    enabled: bool,
}

impl CircuitBreakerStage {
    pub fn new(manager: Arc<BreakerManager>, enabled: bool) -> Self {
        Self { manager, enabled }
    }
}

#[async_trait]
impl Stage for CircuitBreakerStage {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    async fn before(
        &self,
        _req: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> GatewayResult<StageFlow> {
        if !self.enabled {
            return Ok(StageFlow::Continue);
        }
        let Some(route) = ctx.route.as_ref() else {
            return Ok(StageFlow::Continue);
        };
        if !route.circuit_breaker || route.service == GATEWAY_SERVICE {
            return Ok(StageFlow::Continue);
        }

        let breaker = self.manager.get(&route.service);
        match breaker.acquire() {
            Ok(generation) => {
                ctx.breaker_pass = Some(BreakerPass {
                    breaker,
                    generation,
                });
                Ok(StageFlow::Continue)
            }
            Err(BreakerError::Open) => Err(GatewayError::ServiceUnavailable {
                service: route.service.clone(),
                message: "Service temporarily unavailable, please try again later".into(),
            }),
            Err(BreakerError::TooManyRequests) => Err(GatewayError::TooManyRequests {
                service: route.service.clone(),
            }),
        }
    }

    async fn after(&self, resp: Response, ctx: &mut RequestContext) -> Response {
        if let Some(pass) = ctx.breaker_pass.take() {
            let success = resp.status().as_u16() < 500;
            pass.breaker.record(pass.generation, success);
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::circuit_breaker::BreakerState;
    use crate::core::config::CircuitConfig;
    use crate::routing::router::RouteTable;
    use axum::body::Body;
    use axum::http::{HeaderMap, Method, StatusCode, Version};
    use bytes::Bytes;
    use std::time::Duration;

    fn request(path: &str, method: Method) -> GatewayRequest {
        GatewayRequest {
            method,
            uri: path.parse().unwrap(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: "127.0.0.1:4000".parse().unwrap(),
        }
    }

    fn stage(threshold: u32) -> (CircuitBreakerStage, Arc<BreakerManager>) {
        let manager = Arc::new(BreakerManager::new(CircuitConfig {
            enabled: true,
            max_requests: 2,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            failure_threshold: threshold,
        }));
        (CircuitBreakerStage::new(Arc::clone(&manager), true), manager)
    }

    fn response(status: StatusCode) -> Response {
        let mut resp = Response::new(Body::empty());
        *resp.status_mut() = status;
        resp
    }

    #[tokio::test]
    async fn upstream_5xx_trips_then_rejects() {
        let (stage, manager) = stage(3);
        let table = RouteTable::default_routes();

        for _ in 0..3 {
            let mut req = request("/api/v1/notifications", Method::POST);
            let mut ctx = RequestContext::new(&req, &table, &[]);
            assert!(matches!(
                stage.before(&mut req, &mut ctx).await.unwrap(),
                StageFlow::Continue
            ));
            stage
                .after(response(StatusCode::INTERNAL_SERVER_ERROR), &mut ctx)
                .await;
        }
        assert_eq!(manager.get("notifier").state(), BreakerState::Open);

        let mut req = request("/api/v1/notifications", Method::POST);
        let mut ctx = RequestContext::new(&req, &table, &[]);
        let err = stage.before(&mut req, &mut ctx).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.kind(), "service_unavailable");
    }

    #[tokio::test]
    async fn routes_without_breaker_flag_bypass() {
        let (stage, manager) = stage(1);
        // /health resolves to the gateway service.
        let mut req = request("/health", Method::GET);
        let table = RouteTable::default_routes();
        let mut ctx = RequestContext::new(&req, &table, &[]);

        assert!(matches!(
            stage.before(&mut req, &mut ctx).await.unwrap(),
            StageFlow::Continue
        ));
        assert!(ctx.breaker_pass.is_none());
        assert!(manager.all_states().is_empty());
    }

    #[tokio::test]
    async fn success_responses_keep_breaker_closed() {
        let (stage, manager) = stage(2);
        let table = RouteTable::default_routes();

        for _ in 0..5 {
            let mut req = request("/api/v1/users", Method::GET);
            let mut ctx = RequestContext::new(&req, &table, &[]);
            stage.before(&mut req, &mut ctx).await.unwrap();
            stage.after(response(StatusCode::OK), &mut ctx).await;
        }
        assert_eq!(manager.get("auth").state(), BreakerState::Closed);
    }
}
