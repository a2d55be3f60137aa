//! # Rate Limiting
//!
//! Token-bucket rate limiting keyed by authenticated user (or client IP)
//! and path. Two interchangeable backends sit behind one contract: the
//! Redis backend executes the bucket atomically as a server-side script,
//! and a mutex-guarded in-process map serves as the transparent fallback
//! whenever Redis is unavailable or errors mid-flight.
//!
//! Every response carries `X-RateLimit-Limit`, `X-RateLimit-Remaining` and
//! `X-RateLimit-Reset`; a denial is a 429 with a `retry_after` hint.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::http::{HeaderValue, StatusCode};
use axum::response::Response;
use redis::aio::ConnectionManager;
use redis::Script;
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::config::RateLimitConfig;
use crate::core::error::{json_response, GatewayResult};
use crate::core::types::{GatewayRequest, RateLimitOutcome, RequestContext};
use crate::middleware::pipeline::{Stage, StageFlow};

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("unexpected backend reply: {0}")]
    Backend(String),
}

/// Outcome of one bucket consumption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Epoch seconds at which one more token becomes available.
    pub reset: i64,
}

/// One token-bucket backend.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    async fn try_consume(
        &self,
        key: &str,
        rps: u32,
        burst: u32,
    ) -> Result<RateDecision, RateLimitError>;
}

#[derive(Debug)]
struct RateBucket {
    tokens: f64,
    last_check: Instant,
}

/// In-process fallback backend.
///
/// A single mutex over the map is enough: per-bucket work is O(1) and the
/// backend only carries traffic while the shared store is down.
#[derive(Debug, Default)]
pub struct LocalBackend {
    buckets: Mutex<HashMap<String, RateBucket>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn allow(&self, key: &str, rps: u32, burst: u32) -> RateDecision {
        let mut buckets = self.buckets.lock().expect("bucket map lock poisoned");
        let now = Instant::now();
        let epoch = epoch_secs_f64();

        match buckets.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(RateBucket {
                    tokens: burst.saturating_sub(1) as f64,
                    last_check: now,
                });
                RateDecision {
                    allowed: true,
                    remaining: burst.saturating_sub(1),
                    reset: (epoch + 1.0 / rps.max(1) as f64) as i64,
                }
            }
            Entry::Occupied(mut slot) => {
                let bucket = slot.get_mut();
                let elapsed = now.duration_since(bucket.last_check).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * rps as f64).min(burst as f64);
                bucket.last_check = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    RateDecision {
                        allowed: true,
                        remaining: bucket.tokens as u32,
                        reset: (epoch + 1.0 / rps.max(1) as f64) as i64,
                    }
                } else {
                    RateDecision {
                        allowed: false,
                        remaining: 0,
                        reset: (epoch + 1.0 / rps.max(1) as f64) as i64,
                    }
                }
            }
        }
    }

    /// Evict buckets idle longer than `idle`.
    pub fn sweep(&self, idle: Duration) {
        let mut buckets = self.buckets.lock().expect("bucket map lock poisoned");
        let now = Instant::now();
        buckets.retain(|_, bucket| now.duration_since(bucket.last_check) < idle);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

#[async_trait]
impl RateLimitBackend for LocalBackend {
    async fn try_consume(
        &self,
        key: &str,
        rps: u32,
        burst: u32,
    ) -> Result<RateDecision, RateLimitError> {
        Ok(self.allow(key, rps, burst))
    }
}

/// Token bucket as an atomic server-side script: refill from elapsed time,
/// consume one token when available, expire the key after two windows.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local rate = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local window = 1

local data = redis.call('HMGET', key, 'tokens', 'last')
local tokens = tonumber(data[1]) or burst
local last = tonumber(data[2]) or now

local elapsed = now - last
tokens = math.min(burst, tokens + (elapsed * rate))

local allowed = 0
if tokens >= 1 then
    tokens = tokens - 1
    allowed = 1
end

redis.call('HMSET', key, 'tokens', tokens, 'last', now)
redis.call('EXPIRE', key, window * 2)

return {allowed, math.floor(tokens), now + (1 / rate)}
"#;

/// Shared-store backend.
pub struct RedisBackend {
    conn: ConnectionManager,
    script: Script,
}

impl RedisBackend {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
        }
    }
}

#[async_trait]
impl RateLimitBackend for RedisBackend {
    async fn try_consume(
        &self,
        key: &str,
        rps: u32,
        burst: u32,
    ) -> Result<RateDecision, RateLimitError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .script
            .key(key)
            .arg(rps)
            .arg(burst)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;

        match reply.as_slice() {
            [allowed, remaining, reset] => Ok(RateDecision {
                allowed: *allowed == 1,
                remaining: (*remaining).max(0) as u32,
                reset: *reset,
            }),
            other => Err(RateLimitError::Backend(format!(
                "expected 3 values, got {}",
                other.len()
            ))),
        }
    }
}

/// Facade over the two backends: shared store first, local on any error.
pub struct RateLimiter {
    primary: Option<RedisBackend>,
    local: Arc<LocalBackend>,
}

impl RateLimiter {
    pub fn new(redis: Option<ConnectionManager>) -> Self {
        Self {
            primary: redis.map(RedisBackend::new),
            local: Arc::new(LocalBackend::new()),
        }
    }

    /// Consume one token for `key`. Infallible: a shared-store failure
    /// silently degrades to the in-process bucket for this call.
    pub async fn check(&self, key: &str, rps: u32, burst: u32) -> RateDecision {
        if let Some(primary) = &self.primary {
            match primary.try_consume(key, rps, burst).await {
                Ok(decision) => return decision,
                Err(err) => {
                    debug!(error = %err, "shared-store rate limit failed, using local bucket");
                }
            }
        }
        self.local
            .try_consume(key, rps, burst)
            .await
            .unwrap_or(RateDecision {
                allowed: true,
                remaining: 0,
                reset: 0,
            })
    }

    /// Background eviction of idle local buckets.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let local = Arc::clone(&self.local);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                local.sweep(interval);
            }
        })
    }
}

/// The rate-limit stage.
pub struct RateLimitStage {
    limiter: Arc<RateLimiter>,
    config: RateLimitConfig,
}

impl RateLimitStage {
    pub fn new(limiter: Arc<RateLimiter>, config: RateLimitConfig) -> Self {
        Self { limiter, config }
    }

    fn key(ctx: &RequestContext) -> String {
        match &ctx.user_id {
            Some(user_id) => format!("ratelimit:{}:{}", user_id, ctx.path),
            None => format!("ratelimit:ip:{}:{}", ctx.client_ip, ctx.path),
        }
    }
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn before(
        &self,
        _req: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> GatewayResult<StageFlow> {
        if !self.config.enabled {
            return Ok(StageFlow::Continue);
        }

        let (rps, burst) = match ctx.route.as_ref().and_then(|r| r.rate_limit.as_ref()) {
            Some(limit) => (limit.requests_per_sec, limit.burst_size),
            None => (self.config.requests_per_sec, self.config.burst_size),
        };

        let key = Self::key(ctx);
        let decision = self.limiter.check(&key, rps, burst).await;
        ctx.rate_limit = Some(RateLimitOutcome {
            limit: rps,
            remaining: decision.remaining,
            reset: decision.reset,
        });

        if decision.allowed {
            return Ok(StageFlow::Continue);
        }

        let retry_after = (decision.reset - epoch_secs_f64() as i64).max(0);
        let mut resp = json_response(
            StatusCode::TOO_MANY_REQUESTS,
            &json!({
                "error": "rate_limit_exceeded",
                "message": "Too many requests, please try again later",
                "retry_after": retry_after,
            }),
        );
        apply_headers(&mut resp, rps, decision.remaining, decision.reset);
        Ok(StageFlow::Respond(resp))
    }

    async fn after(&self, mut resp: Response, ctx: &mut RequestContext) -> Response {
        if let Some(outcome) = ctx.rate_limit {
            apply_headers(&mut resp, outcome.limit, outcome.remaining, outcome.reset);
        }
        resp
    }
}

fn apply_headers(resp: &mut Response, limit: u32, remaining: u32, reset: i64) {
    let headers = resp.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert(LIMIT_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert(REMAINING_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&reset.to_string()) {
        headers.insert(RESET_HEADER, value);
    }
}

fn epoch_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn burst_then_deny_then_refill() {
        let backend = LocalBackend::new();

        // Burst of 3 at 1 rps: three allowed, fourth denied.
        for expected_remaining in [2, 1, 0] {
            let d = backend.allow("k", 1, 3);
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
        }
        let denied = backend.allow("k", 1, 3);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);

        // After a second a token is back.
        thread::sleep(Duration::from_millis(1100));
        let d = backend.allow("k", 1, 3);
        assert!(d.allowed);
    }

    #[test]
    fn reset_reflects_refill_rate_when_allowed() {
        let backend = LocalBackend::new();

        // At 4 rps the next token is 250ms out, not a full second; the reset
        // horizon must say so on allowed decisions too, for a fresh bucket
        // and for an existing one alike.
        let before = epoch_secs_f64();
        let first = backend.allow("k", 4, 10);
        let after = epoch_secs_f64();
        assert!(first.allowed);
        assert!(first.reset >= (before + 0.25) as i64);
        assert!(first.reset <= (after + 0.25) as i64);

        let before = epoch_secs_f64();
        let second = backend.allow("k", 4, 10);
        let after = epoch_secs_f64();
        assert!(second.allowed);
        assert!(second.reset >= (before + 0.25) as i64);
        assert!(second.reset <= (after + 0.25) as i64);
    }

    #[test]
    fn tokens_never_exceed_burst() {
        let backend = LocalBackend::new();
        backend.allow("k", 100, 5);
        thread::sleep(Duration::from_millis(200));
        // 100 rps for 200ms would add 20 tokens; the bucket caps at burst.
        let d = backend.allow("k", 100, 5);
        assert!(d.allowed);
        assert!(d.remaining < 5);
    }

    #[test]
    fn keys_are_isolated() {
        let backend = LocalBackend::new();
        let a = backend.allow("a", 1, 1);
        assert!(a.allowed);
        let a = backend.allow("a", 1, 1);
        assert!(!a.allowed);
        let b = backend.allow("b", 1, 1);
        assert!(b.allowed);
    }

    #[test]
    fn sweeper_evicts_idle_buckets() {
        let backend = LocalBackend::new();
        backend.allow("stale", 1, 1);
        assert_eq!(backend.len(), 1);

        thread::sleep(Duration::from_millis(30));
        backend.sweep(Duration::from_millis(10));
        assert_eq!(backend.len(), 0);
    }

    #[tokio::test]
    async fn facade_without_redis_uses_local() {
        let limiter = RateLimiter::new(None);
        let d = limiter.check("ratelimit:ip:1.2.3.4:/x", 1, 2).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 1);
    }

    #[test]
    fn key_shape_prefers_user_id() {
        use crate::core::types::GatewayRequest;
        use crate::routing::router::RouteTable;
        use axum::http::{HeaderMap, Method, Version};
        use bytes::Bytes;

        let req = GatewayRequest {
            method: Method::GET,
            uri: "/api/v1/users".parse().unwrap(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: "10.0.0.9:555".parse().unwrap(),
        };
        let mut ctx = RequestContext::new(&req, &RouteTable::default_routes(), &[]);
        assert_eq!(
            RateLimitStage::key(&ctx),
            "ratelimit:ip:10.0.0.9:/api/v1/users"
        );

        ctx.user_id = Some("user-1".into());
        assert_eq!(RateLimitStage::key(&ctx), "ratelimit:user-1:/api/v1/users");
    }
}
