//! # Gateway Configuration
//!
//! Environment-driven configuration with sensible defaults. Every knob can
//! be overridden through an environment variable; durations accept humantime
//! strings such as `30s` or `2m`.

use std::env;
use std::time::Duration;

/// Top-level gateway configuration, assembled from the environment.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub services: ServicesConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit: CircuitConfig,
    pub tracing: TracingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub trusted_proxies: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ServicesConfig {
    pub auth: ServiceConfig,
    pub notifier: ServiceConfig,
}

/// Per-upstream connection settings.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub url: String,
    pub timeout: Duration,
    pub max_idle_conns: usize,
    pub max_conns_per_host: usize,
    pub health_path: String,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub db: i64,
}

impl RedisConfig {
    /// Connection URL, or `None` when no host is configured.
    pub fn url(&self) -> Option<String> {
        if self.host.is_empty() {
            return None;
        }
        if self.password.is_empty() {
            Some(format!("redis://{}:{}/{}", self.host, self.port, self.db))
        } else {
            Some(format!(
                "redis://:{}@{}:{}/{}",
                self.password, self.host, self.port, self.db
            ))
        }
    }
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub access_expires: Duration,
    pub refresh_expires: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_sec: u32,
    pub burst_size: u32,
    pub cleanup_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub enabled: bool,
    pub max_requests: u32,
    pub interval: Duration,
    pub timeout: Duration,
    pub failure_threshold: u32,
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub enabled: bool,
    pub service_name: String,
    pub endpoint: String,
    pub sample_rate: f64,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl GatewayConfig {
    /// Load the configuration from the process environment.
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                host: get_env("SERVER_HOST", "0.0.0.0"),
                port: get_parsed("SERVER_PORT", 8080),
                read_timeout: get_duration("SERVER_READ_TIMEOUT", Duration::from_secs(30)),
                write_timeout: get_duration("SERVER_WRITE_TIMEOUT", Duration::from_secs(30)),
                idle_timeout: get_duration("SERVER_IDLE_TIMEOUT", Duration::from_secs(120)),
                shutdown_timeout: get_duration("SERVER_SHUTDOWN_TIMEOUT", Duration::from_secs(30)),
                trusted_proxies: get_list("TRUSTED_PROXIES", &["127.0.0.1"]),
            },
            services: ServicesConfig {
                auth: ServiceConfig {
                    url: get_env("AUTH_SERVICE_URL", "http://localhost:5000"),
                    timeout: get_duration("AUTH_SERVICE_TIMEOUT", Duration::from_secs(30)),
                    max_idle_conns: get_parsed("AUTH_MAX_IDLE_CONNS", 100),
                    max_conns_per_host: get_parsed("AUTH_MAX_CONNS_PER_HOST", 100),
                    health_path: get_env("AUTH_HEALTH_PATH", "/api/health"),
                },
                notifier: ServiceConfig {
                    url: get_env("NOTIFIER_SERVICE_URL", "http://localhost:5001"),
                    timeout: get_duration("NOTIFIER_SERVICE_TIMEOUT", Duration::from_secs(30)),
                    max_idle_conns: get_parsed("NOTIFIER_MAX_IDLE_CONNS", 100),
                    max_conns_per_host: get_parsed("NOTIFIER_MAX_CONNS_PER_HOST", 100),
                    health_path: get_env("NOTIFIER_HEALTH_PATH", "/api/health"),
                },
            },
            redis: RedisConfig {
                host: get_env("REDIS_HOST", "localhost"),
                port: get_parsed("REDIS_PORT", 6379),
                password: get_env("REDIS_PASSWORD", ""),
                db: get_parsed("REDIS_DB", 0),
            },
            jwt: JwtConfig {
                secret: get_env("JWT_SECRET", "your-secret-key"),
                access_expires: get_duration("JWT_ACCESS_EXPIRES", Duration::from_secs(15 * 60)),
                refresh_expires: get_duration(
                    "JWT_REFRESH_EXPIRES",
                    Duration::from_secs(7 * 24 * 3600),
                ),
            },
            rate_limit: RateLimitConfig {
                enabled: get_bool("RATE_LIMIT_ENABLED", true),
                requests_per_sec: get_parsed("RATE_LIMIT_RPS", 100),
                burst_size: get_parsed("RATE_LIMIT_BURST", 200),
                cleanup_interval: get_duration("RATE_LIMIT_CLEANUP", Duration::from_secs(60)),
            },
            circuit: CircuitConfig {
                enabled: get_bool("CIRCUIT_ENABLED", true),
                max_requests: get_parsed("CIRCUIT_MAX_REQUESTS", 5),
                interval: get_duration("CIRCUIT_INTERVAL", Duration::from_secs(60)),
                timeout: get_duration("CIRCUIT_TIMEOUT", Duration::from_secs(30)),
                failure_threshold: get_parsed("CIRCUIT_FAILURE_THRESHOLD", 5),
            },
            tracing: TracingConfig {
                enabled: get_bool("TRACING_ENABLED", true),
                service_name: get_env("SERVICE_NAME", "edge-gateway"),
                endpoint: get_env("OTEL_EXPORTER_OTLP_ENDPOINT", "http://localhost:4318"),
                sample_rate: get_parsed("TRACING_SAMPLE_RATE", 1.0),
            },
            logging: LoggingConfig {
                level: get_env("LOG_LEVEL", "info"),
                format: get_env("LOG_FORMAT", "json"),
            },
        }
    }

    /// Listen address for the HTTP server.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn get_env(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn get_parsed<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_duration(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| humantime::parse_duration(&v).ok())
        .unwrap_or(default)
}

fn get_list(key: &str, default: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v.split(',').map(|s| s.trim().to_string()).collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}
