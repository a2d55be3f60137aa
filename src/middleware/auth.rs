//! # Authentication Stage
//!
//! Bearer-token validation with HMAC-signed JWTs. Verified claims are placed
//! on the request context and forwarded to upstreams as `X-User-*` headers.
//! Health and metrics prefixes skip authentication entirely, as do routes
//! marked public.

use async_trait::async_trait;
use axum::http::HeaderValue;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayRequest, RequestContext};
use crate::middleware::builtin::TENANT_HEADER;
use crate::middleware::pipeline::{Stage, StageFlow};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_EMAIL_HEADER: &str = "x-user-email";
pub const USER_ROLES_HEADER: &str = "x-user-roles";

/// Identity payload carried in the bearer token. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: u64,
}

/// Validate an HS256 token and return its claims.
///
/// Any other signing algorithm is rejected, as is an expired or otherwise
/// malformed token.
pub fn validate_token(token: &str, secret: &str) -> GatewayResult<Claims> {
    let validation = Validation::new(Algorithm::HS256);
    let key = DecodingKey::from_secret(secret.as_bytes());
    match decode::<Claims>(token, &key, &validation) {
        Ok(data) => Ok(data.claims),
        Err(err) => match err.kind() {
            ErrorKind::ExpiredSignature => Err(GatewayError::unauthorized("Token expired")),
            ErrorKind::InvalidAlgorithm => {
                Err(GatewayError::unauthorized("Invalid signing method"))
            }
            _ => Err(GatewayError::unauthorized("Invalid token")),
        },
    }
}

/// The authentication stage.
pub struct AuthStage {
    secret: String,
    skip_prefixes: Vec<String>,
}

impl AuthStage {
    pub fn new(secret: String) -> Self {
        Self {
            secret,
            skip_prefixes: ["/health", "/ready", "/live", "/metrics"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }

    fn skipped(&self, path: &str) -> bool {
        self.skip_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }
}

#[async_trait]
impl Stage for AuthStage {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn before(
        &self,
        req: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> GatewayResult<StageFlow> {
        if self.skipped(&ctx.path) || ctx.is_public {
            return Ok(StageFlow::Continue);
        }

        let header = req
            .header("authorization")
            .ok_or_else(|| GatewayError::unauthorized("Missing authorization header"))?
            .to_string();
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| GatewayError::unauthorized("Invalid authorization format"))?;

        let claims = validate_token(token, &self.secret)?;

        ctx.user_id = Some(claims.user_id.clone());
        if !claims.tenant_id.is_empty() {
            // Claims win over whatever the tenant stage extracted.
            ctx.tenant_id = Some(claims.tenant_id.clone());
        }
        if !claims.email.is_empty() {
            ctx.email = Some(claims.email.clone());
        }
        ctx.roles = claims.roles.clone();

        set_header(req, USER_ID_HEADER, &claims.user_id);
        if !claims.tenant_id.is_empty() {
            set_header(req, TENANT_HEADER, &claims.tenant_id);
        }
        if !claims.email.is_empty() {
            set_header(req, USER_EMAIL_HEADER, &claims.email);
        }
        if !claims.roles.is_empty() {
            set_header(req, USER_ROLES_HEADER, &claims.roles.join(","));
        }

        Ok(StageFlow::Continue)
    }
}

fn set_header(req: &mut GatewayRequest, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        req.headers.insert(name, value);
    }
}

/// Role-gate policy: passes only when the authenticated identity carries at
/// least one of the required roles (case-insensitive).
pub struct RequireRoles {
    roles: Vec<String>,
}

impl RequireRoles {
    pub fn new(roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Stage for RequireRoles {
    fn name(&self) -> &'static str {
        "require_roles"
    }

    async fn before(
        &self,
        _req: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> GatewayResult<StageFlow> {
        if ctx.user_id.is_none() {
            return Err(GatewayError::unauthorized("No user context found"));
        }
        let allowed = self.roles.iter().any(|required| {
            ctx.roles
                .iter()
                .any(|role| role.eq_ignore_ascii_case(required))
        });
        if allowed {
            Ok(StageFlow::Continue)
        } else {
            Err(GatewayError::forbidden("Insufficient permissions"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::router::RouteTable;
    use axum::http::{HeaderMap, Method, StatusCode, Version};
    use bytes::Bytes;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "test-secret";

    fn token(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims(exp_offset_secs: i64) -> Claims {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        Claims {
            user_id: "user-1".into(),
            tenant_id: "acme".into(),
            email: "user@example.com".into(),
            roles: vec!["Admin".into(), "editor".into()],
            exp: (now + exp_offset_secs).max(0) as u64,
        }
    }

    fn request(path: &str, auth: Option<&str>) -> GatewayRequest {
        let mut headers = HeaderMap::new();
        if let Some(value) = auth {
            headers.insert("authorization", value.parse().unwrap());
        }
        GatewayRequest {
            method: Method::GET,
            uri: path.parse().unwrap(),
            version: Version::HTTP_11,
            headers,
            body: Bytes::new(),
            remote_addr: "127.0.0.1:4000".parse().unwrap(),
        }
    }

    fn context(req: &GatewayRequest) -> RequestContext {
        RequestContext::new(req, &RouteTable::default_routes(), &[])
    }

    #[test]
    fn valid_token_round_trips() {
        let claims = claims(300);
        let parsed = validate_token(&token(&claims, SECRET), SECRET).unwrap();
        assert_eq!(parsed.user_id, "user-1");
        assert_eq!(parsed.roles, vec!["Admin", "editor"]);
    }

    #[test]
    fn expired_and_forged_tokens_are_rejected() {
        let expired = validate_token(&token(&claims(-300), SECRET), SECRET).unwrap_err();
        assert_eq!(expired.to_string(), "Token expired");

        let forged = validate_token(&token(&claims(300), "other-secret"), SECRET).unwrap_err();
        assert_eq!(forged.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_header_is_unauthorized() {
        let stage = AuthStage::new(SECRET.into());
        let mut req = request("/api/v1/users", None);
        let mut ctx = context(&req);
        let err = stage.before(&mut req, &mut ctx).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.to_string(), "Missing authorization header");
    }

    #[tokio::test]
    async fn malformed_scheme_is_unauthorized() {
        let stage = AuthStage::new(SECRET.into());
        let mut req = request("/api/v1/users", Some("Basic dXNlcjpwYXNz"));
        let mut ctx = context(&req);
        let err = stage.before(&mut req, &mut ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid authorization format");
    }

    #[tokio::test]
    async fn public_routes_and_skip_prefixes_pass_without_token() {
        let stage = AuthStage::new(SECRET.into());

        let mut req = request("/api/v1/auth/login", None);
        let mut ctx = context(&req);
        ctx.is_public = true;
        assert!(matches!(
            stage.before(&mut req, &mut ctx).await.unwrap(),
            StageFlow::Continue
        ));

        let mut req = request("/health", None);
        let mut ctx = context(&req);
        assert!(matches!(
            stage.before(&mut req, &mut ctx).await.unwrap(),
            StageFlow::Continue
        ));
    }

    #[tokio::test]
    async fn claims_land_on_context_and_upstream_headers() {
        let stage = AuthStage::new(SECRET.into());
        let bearer = format!("Bearer {}", token(&claims(300), SECRET));
        let mut req = request("/api/v1/users", Some(&bearer));
        let mut ctx = context(&req);

        stage.before(&mut req, &mut ctx).await.unwrap();

        assert_eq!(ctx.user_id.as_deref(), Some("user-1"));
        assert_eq!(ctx.tenant_id.as_deref(), Some("acme"));
        assert_eq!(req.headers.get(USER_ID_HEADER).unwrap(), "user-1");
        assert_eq!(req.headers.get(TENANT_HEADER).unwrap(), "acme");
        assert_eq!(req.headers.get(USER_EMAIL_HEADER).unwrap(), "user@example.com");
        assert_eq!(req.headers.get(USER_ROLES_HEADER).unwrap(), "Admin,editor");
    }

    #[tokio::test]
    async fn role_gate_matches_case_insensitively() {
        let gate = RequireRoles::new(["admin"]);
        let mut req = request("/api/v1/admin", None);

        let mut ctx = context(&req);
        ctx.user_id = Some("user-1".into());
        ctx.roles = vec!["Admin".into()];
        assert!(matches!(
            gate.before(&mut req, &mut ctx).await.unwrap(),
            StageFlow::Continue
        ));

        ctx.roles = vec!["viewer".into()];
        let err = gate.before(&mut req, &mut ctx).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);

        ctx.user_id = None;
        let err = gate.before(&mut req, &mut ctx).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }
}
