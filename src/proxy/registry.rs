//! # Service Registry
//!
//! The fixed set of upstream services the gateway fronts. Each service owns
//! a connection-pooled HTTP client shared by every concurrent request to
//! that service. The registry reports liveness but never blocks routing;
//! the forwarder and the readiness probe decide what to do with an
//! unhealthy service.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::core::config::{ServiceConfig, ServicesConfig};

/// A single upstream service and its pooled client.
#[derive(Debug)]
pub struct UpstreamService {
    pub name: String,
    pub base_url: String,
    pub health_path: String,
    pub timeout: Duration,
    pub client: reqwest::Client,
}

impl UpstreamService {
    fn new(name: &str, cfg: &ServiceConfig) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(cfg.max_conns_per_host.max(cfg.max_idle_conns))
            .pool_idle_timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .timeout(cfg.timeout)
            .build()
            .unwrap_or_default();

        Self {
            name: name.to_string(),
            base_url: cfg.url.trim_end_matches('/').to_string(),
            health_path: cfg.health_path.clone(),
            timeout: cfg.timeout,
            client,
        }
    }
}

#[derive(Debug)]
struct Slot {
    service: Arc<UpstreamService>,
    healthy: bool,
    last_check: Option<Instant>,
}

/// Registry of upstream services keyed by name.
///
/// Readers dominate (one lookup per proxied request); the only writer is the
/// health prober flipping liveness.
#[derive(Debug)]
pub struct ServiceRegistry {
    slots: RwLock<HashMap<String, Slot>>,
}

impl ServiceRegistry {
    pub fn new(cfg: &ServicesConfig) -> Self {
        let mut slots = HashMap::new();
        for (name, service_cfg) in [("auth", &cfg.auth), ("notifier", &cfg.notifier)] {
            slots.insert(
                name.to_string(),
                Slot {
                    service: Arc::new(UpstreamService::new(name, service_cfg)),
                    healthy: true,
                    last_check: None,
                },
            );
        }
        Self {
            slots: RwLock::new(slots),
        }
    }

    /// Shared handle to a service, `None` for unknown names.
    pub fn get(&self, name: &str) -> Option<Arc<UpstreamService>> {
        let slots = self.slots.read().expect("registry lock poisoned");
        slots.get(name).map(|s| Arc::clone(&s.service))
    }

    /// Liveness as last written by the prober; unknown services are
    /// unhealthy.
    pub fn is_healthy(&self, name: &str) -> bool {
        let slots = self.slots.read().expect("registry lock poisoned");
        slots.get(name).map(|s| s.healthy).unwrap_or(false)
    }

    /// Prober-only: record a probe verdict.
    pub fn set_health(&self, name: &str, healthy: bool) {
        let mut slots = self.slots.write().expect("registry lock poisoned");
        if let Some(slot) = slots.get_mut(name) {
            slot.healthy = healthy;
            slot.last_check = Some(Instant::now());
        }
    }

    /// When the service was last probed, `None` before the first probe.
    pub fn last_check(&self, name: &str) -> Option<Instant> {
        let slots = self.slots.read().expect("registry lock poisoned");
        slots.get(name).and_then(|s| s.last_check)
    }

    /// `name -> healthy` snapshot for the readiness endpoints.
    pub fn health_snapshot(&self) -> BTreeMap<String, bool> {
        let slots = self.slots.read().expect("registry lock poisoned");
        slots
            .iter()
            .map(|(name, slot)| (name.clone(), slot.healthy))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        let slots = self.slots.read().expect("registry lock poisoned");
        slots.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::GatewayConfig;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(&GatewayConfig::from_env().services)
    }

    #[test]
    fn services_start_healthy() {
        let registry = registry();
        assert!(registry.is_healthy("auth"));
        assert!(registry.is_healthy("notifier"));
        assert!(!registry.is_healthy("unknown"));
        assert!(registry.get("auth").is_some());
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn health_flips_are_visible_in_snapshot() {
        let registry = registry();
        assert!(registry.last_check("auth").is_none());

        registry.set_health("auth", false);
        assert!(!registry.is_healthy("auth"));
        assert!(registry.last_check("auth").is_some());

        let snapshot = registry.health_snapshot();
        assert_eq!(snapshot.get("auth"), Some(&false));
        assert_eq!(snapshot.get("notifier"), Some(&true));
    }

    #[test]
    fn base_url_is_normalized() {
        let mut cfg = GatewayConfig::from_env().services;
        cfg.auth.url = "http://auth.internal:5000/".to_string();
        let registry = ServiceRegistry::new(&cfg);
        assert_eq!(
            registry.get("auth").unwrap().base_url,
            "http://auth.internal:5000"
        );
    }
}
