//! # Built-in Stages
//!
//! The request-shaping stages that carry no external state: request id,
//! security headers, CORS, content-type validation and tenant extraction.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::Response;
use uuid::Uuid;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayRequest, RequestContext};
use crate::middleware::pipeline::{Stage, StageFlow};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const TENANT_HEADER: &str = "x-tenant-id";

fn set_header(resp: &mut Response, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        resp.headers_mut().insert(name, value);
    }
}

/// Reuses the client-supplied `X-Request-ID` when present, otherwise mints a
/// v4 UUID. The id lands on the context (for logs and upstream propagation)
/// and on the response.
pub struct RequestIdStage;

#[async_trait]
impl Stage for RequestIdStage {
    fn name(&self) -> &'static str {
        "request_id"
    }

    async fn before(
        &self,
        req: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> GatewayResult<StageFlow> {
        let id = match req.header(REQUEST_ID_HEADER) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        // Propagated upstream by the forwarder via the context.
        ctx.request_id = id;
        Ok(StageFlow::Continue)
    }

    async fn after(&self, mut resp: Response, ctx: &mut RequestContext) -> Response {
        set_header(&mut resp, REQUEST_ID_HEADER, &ctx.request_id);
        resp
    }
}

/// Unconditional security headers on every response; also clears the
/// `Server` header so the gateway stays anonymous.
pub struct SecurityHeadersStage;

#[async_trait]
impl Stage for SecurityHeadersStage {
    fn name(&self) -> &'static str {
        "security_headers"
    }

    async fn after(&self, mut resp: Response, _ctx: &mut RequestContext) -> Response {
        set_header(&mut resp, "x-content-type-options", "nosniff");
        set_header(&mut resp, "x-frame-options", "DENY");
        set_header(&mut resp, "x-xss-protection", "1; mode=block");
        set_header(&mut resp, "referrer-policy", "strict-origin-when-cross-origin");
        set_header(&mut resp, "content-security-policy", "default-src 'self'");
        set_header(
            &mut resp,
            "permissions-policy",
            "geolocation=(), microphone=(), camera=()",
        );
        resp.headers_mut().remove("server");
        resp
    }
}

const CORS_ALLOW_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";
const CORS_ALLOW_HEADERS: &str =
    "Origin, Content-Type, Accept, Authorization, X-Request-ID, X-Tenant-ID";
const CORS_MAX_AGE: &str = "86400";

/// Origin-echoing CORS with credential support. `OPTIONS` preflights are
/// answered directly with 204.
pub struct CorsStage {
    allowed_origins: Vec<String>,
}

impl CorsStage {
    pub fn new(allowed_origins: Vec<String>) -> Self {
        Self { allowed_origins }
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.is_empty()
            || self
                .allowed_origins
                .iter()
                .any(|o| o == origin || o == "*")
    }
}

#[async_trait]
impl Stage for CorsStage {
    fn name(&self) -> &'static str {
        "cors"
    }

    async fn before(
        &self,
        req: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> GatewayResult<StageFlow> {
        if let Some(origin) = req.header("origin") {
            if !origin.is_empty() && self.origin_allowed(origin) {
                ctx.cors_origin = Some(origin.to_string());
            }
        }

        if req.method == Method::OPTIONS {
            let mut resp = Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(Body::empty())
                .expect("static response");
            if let Some(origin) = &ctx.cors_origin {
                set_header(&mut resp, "access-control-allow-origin", origin);
                set_header(&mut resp, "access-control-allow-credentials", "true");
            }
            set_header(&mut resp, "access-control-allow-methods", CORS_ALLOW_METHODS);
            set_header(&mut resp, "access-control-allow-headers", CORS_ALLOW_HEADERS);
            set_header(&mut resp, "access-control-max-age", CORS_MAX_AGE);
            return Ok(StageFlow::Respond(resp));
        }

        Ok(StageFlow::Continue)
    }

    async fn after(&self, mut resp: Response, ctx: &mut RequestContext) -> Response {
        if let Some(origin) = &ctx.cors_origin {
            set_header(&mut resp, "access-control-allow-origin", origin);
            set_header(&mut resp, "access-control-allow-credentials", "true");
        }
        resp
    }
}

/// Mutating requests that carry a body must declare a content type.
pub struct ContentTypeStage;

#[async_trait]
impl Stage for ContentTypeStage {
    fn name(&self) -> &'static str {
        "content_type"
    }

    async fn before(
        &self,
        req: &mut GatewayRequest,
        _ctx: &mut RequestContext,
    ) -> GatewayResult<StageFlow> {
        let mutating = matches!(req.method, Method::POST | Method::PUT | Method::PATCH);
        if mutating && !req.body.is_empty() && req.header("content-type").is_none() {
            return Err(GatewayError::UnsupportedMediaType);
        }
        Ok(StageFlow::Continue)
    }
}

/// Fills `tenant_id` from the `X-Tenant-ID` header or the leftmost host
/// label. Claims take priority: the auth stage, which runs later, overwrites
/// the value when the token carries one.
pub struct TenantStage;

#[async_trait]
impl Stage for TenantStage {
    fn name(&self) -> &'static str {
        "tenant"
    }

    async fn before(
        &self,
        req: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> GatewayResult<StageFlow> {
        let mut tenant = req
            .header(TENANT_HEADER)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        if tenant.is_none() {
            let host = ctx.host.clone();
            let hostname = host.split(':').next().unwrap_or_default();
            let labels: Vec<&str> = hostname.split('.').collect();
            if labels.len() >= 3 && !labels[0].is_empty() {
                tenant = Some(labels[0].to_string());
            }
        }

        if let Some(tenant) = tenant {
            if let Ok(value) = HeaderValue::from_str(&tenant) {
                req.headers.insert(TENANT_HEADER, value);
            }
            ctx.tenant_id = Some(tenant);
        }
        Ok(StageFlow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::router::RouteTable;
    use axum::http::{HeaderMap, Version};
    use bytes::Bytes;

    fn request(method: Method, path: &str) -> GatewayRequest {
        GatewayRequest {
            method,
            uri: path.parse().unwrap(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: "127.0.0.1:4000".parse().unwrap(),
        }
    }

    fn context(req: &GatewayRequest) -> RequestContext {
        RequestContext::new(req, &RouteTable::default_routes(), &[])
    }

    #[tokio::test]
    async fn request_id_is_reused_when_supplied() {
        let stage = RequestIdStage;
        let mut req = request(Method::GET, "/api/v1/users");
        req.headers
            .insert(REQUEST_ID_HEADER, "client-id-1".parse().unwrap());
        let mut ctx = context(&req);

        stage.before(&mut req, &mut ctx).await.unwrap();
        assert_eq!(ctx.request_id, "client-id-1");
    }

    #[tokio::test]
    async fn request_id_is_generated_when_missing() {
        let stage = RequestIdStage;
        let mut req = request(Method::GET, "/api/v1/users");
        let mut ctx = context(&req);

        stage.before(&mut req, &mut ctx).await.unwrap();
        assert_eq!(Uuid::parse_str(&ctx.request_id).unwrap().get_version_num(), 4);

        let resp = Response::new(Body::empty());
        let resp = stage.after(resp, &mut ctx).await;
        assert_eq!(
            resp.headers().get(REQUEST_ID_HEADER).unwrap(),
            ctx.request_id.as_str()
        );
    }

    #[tokio::test]
    async fn security_headers_are_applied_and_server_cleared() {
        let stage = SecurityHeadersStage;
        let mut req = request(Method::GET, "/api/v1/users");
        let mut ctx = context(&req);
        stage.before(&mut req, &mut ctx).await.unwrap();

        let mut resp = Response::new(Body::empty());
        resp.headers_mut().insert("server", "leaky/1.0".parse().unwrap());
        let resp = stage.after(resp, &mut ctx).await;

        assert_eq!(resp.headers().get("x-frame-options").unwrap(), "DENY");
        assert_eq!(
            resp.headers().get("content-security-policy").unwrap(),
            "default-src 'self'"
        );
        assert!(resp.headers().get("server").is_none());
    }

    #[tokio::test]
    async fn preflight_short_circuits_with_204() {
        let stage = CorsStage::new(vec!["*".to_string()]);
        let mut req = request(Method::OPTIONS, "/api/v1/users");
        req.headers
            .insert("origin", "https://app.example.com".parse().unwrap());
        let mut ctx = context(&req);

        match stage.before(&mut req, &mut ctx).await.unwrap() {
            StageFlow::Respond(resp) => {
                assert_eq!(resp.status(), StatusCode::NO_CONTENT);
                assert_eq!(
                    resp.headers().get("access-control-allow-origin").unwrap(),
                    "https://app.example.com"
                );
                assert_eq!(
                    resp.headers()
                        .get("access-control-allow-credentials")
                        .unwrap(),
                    "true"
                );
                assert_eq!(resp.headers().get("access-control-max-age").unwrap(), "86400");
            }
            StageFlow::Continue => panic!("preflight must short-circuit"),
        }
    }

    #[tokio::test]
    async fn disallowed_origin_gets_no_cors_headers() {
        let stage = CorsStage::new(vec!["https://trusted.example.com".to_string()]);
        let mut req = request(Method::GET, "/api/v1/users");
        req.headers
            .insert("origin", "https://evil.example.com".parse().unwrap());
        let mut ctx = context(&req);

        stage.before(&mut req, &mut ctx).await.unwrap();
        assert!(ctx.cors_origin.is_none());

        let resp = stage.after(Response::new(Body::empty()), &mut ctx).await;
        assert!(resp.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn body_without_content_type_is_rejected() {
        let stage = ContentTypeStage;
        let mut req = request(Method::POST, "/api/v1/users");
        req.body = Bytes::from_static(b"{}");
        let mut ctx = context(&req);

        let err = stage.before(&mut req, &mut ctx).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        // Empty bodies and GET requests pass.
        req.body = Bytes::new();
        assert!(matches!(
            stage.before(&mut req, &mut ctx).await.unwrap(),
            StageFlow::Continue
        ));
    }

    #[tokio::test]
    async fn tenant_from_header_then_subdomain() {
        let stage = TenantStage;

        let mut req = request(Method::GET, "/api/v1/users");
        req.headers.insert(TENANT_HEADER, "acme".parse().unwrap());
        let mut ctx = context(&req);
        stage.before(&mut req, &mut ctx).await.unwrap();
        assert_eq!(ctx.tenant_id.as_deref(), Some("acme"));

        let mut req = request(Method::GET, "/api/v1/users");
        req.headers
            .insert("host", "tenant1.example.com:8080".parse().unwrap());
        let mut ctx = context(&req);
        stage.before(&mut req, &mut ctx).await.unwrap();
        assert_eq!(ctx.tenant_id.as_deref(), Some("tenant1"));
        assert_eq!(req.headers.get(TENANT_HEADER).unwrap(), "tenant1");

        // Two-label hosts carry no tenant.
        let mut req = request(Method::GET, "/api/v1/users");
        req.headers.insert("host", "example.com".parse().unwrap());
        let mut ctx = context(&req);
        stage.before(&mut req, &mut ctx).await.unwrap();
        assert!(ctx.tenant_id.is_none());
    }
}
