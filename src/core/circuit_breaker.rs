//! # Circuit Breaker
//!
//! Per-service circuit breaker with the classic three-state machine:
//!
//! - **Closed**: requests flow; counts are kept over a rolling interval. A
//!   recorded failure trips the breaker once `requests >= failure_threshold`
//!   and at least half of them failed.
//! - **Open**: requests are rejected until `timeout` has elapsed since the
//!   breaker opened, then the next caller moves it to half-open.
//! - **HalfOpen**: at most `max_requests` probe calls are admitted
//!   concurrently. `max_requests` consecutive successes close the breaker;
//!   any failure reopens it.
//!
//! Counts are tied to a generation number that changes on every state
//! transition and interval rollover; results reported against a stale
//! generation are discarded, so a slow response from before the breaker
//! opened cannot corrupt the probe accounting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use metrics::gauge;
use thiserror::Error;

use crate::core::config::CircuitConfig;

/// Rejection reasons surfaced by [`Breaker::acquire`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BreakerError {
    #[error("circuit breaker is open")]
    Open,
    #[error("too many requests in half-open state")]
    TooManyRequests,
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Boundary representation, used by the admin endpoint and log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }

    /// Gauge encoding: 0=closed, 1=half-open, 2=open.
    fn as_gauge(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

/// Rolling request counts for the current generation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counts {
    pub requests: u32,
    pub successes: u32,
    pub failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }

    fn clear(&mut self) {
        *self = Counts::default();
    }
}

#[derive(Debug)]
struct BreakerCore {
    state: BreakerState,
    counts: Counts,
    generation: u64,
    opened_at: Option<Instant>,
    /// End of the current rolling interval while closed.
    expiry: Option<Instant>,
}

/// A ticket returned by [`Breaker::acquire`], consumed when the call result
/// is recorded.
#[derive(Debug)]
pub struct BreakerPass {
    pub breaker: Arc<Breaker>,
    pub generation: u64,
}

/// Per-service circuit breaker.
#[derive(Debug)]
pub struct Breaker {
    name: String,
    config: CircuitConfig,
    core: Mutex<BreakerCore>,
}

impl Breaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let name = name.into();
        gauge!("gateway_circuit_breaker_state", "service" => name.clone())
            .set(BreakerState::Closed.as_gauge());
        Self {
            name,
            config,
            core: Mutex::new(BreakerCore {
                state: BreakerState::Closed,
                counts: Counts::default(),
                generation: 0,
                opened_at: None,
                expiry: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask for admission. On success the returned generation must be passed
    /// back to [`record`](Self::record) with the call outcome.
    pub fn acquire(&self) -> Result<u64, BreakerError> {
        let mut core = self.core.lock().expect("breaker lock poisoned");
        let now = Instant::now();
        self.roll(&mut core, now);

        match core.state {
            BreakerState::Closed => {
                core.counts.on_request();
                Ok(core.generation)
            }
            BreakerState::Open => Err(BreakerError::Open),
            BreakerState::HalfOpen => {
                if core.counts.requests >= self.config.max_requests {
                    Err(BreakerError::TooManyRequests)
                } else {
                    core.counts.on_request();
                    Ok(core.generation)
                }
            }
        }
    }

    /// Record the outcome of an admitted call. Outcomes from a superseded
    /// generation are ignored.
    pub fn record(&self, generation: u64, success: bool) {
        let mut core = self.core.lock().expect("breaker lock poisoned");
        let now = Instant::now();
        self.roll(&mut core, now);
        if core.generation != generation {
            return;
        }

        if success {
            core.counts.on_success();
            if core.state == BreakerState::HalfOpen
                && core.counts.consecutive_successes >= self.config.max_requests
            {
                self.transition(&mut core, BreakerState::Closed, now);
            }
        } else {
            core.counts.on_failure();
            match core.state {
                BreakerState::Closed => {
                    if core.counts.requests >= self.config.failure_threshold
                        && core.counts.failures as f64 / core.counts.requests as f64 >= 0.5
                    {
                        self.transition(&mut core, BreakerState::Open, now);
                    }
                }
                BreakerState::HalfOpen => {
                    self.transition(&mut core, BreakerState::Open, now);
                }
                BreakerState::Open => {}
            }
        }
    }

    /// Current state, evaluating pending open→half-open and interval
    /// transitions.
    pub fn state(&self) -> BreakerState {
        let mut core = self.core.lock().expect("breaker lock poisoned");
        self.roll(&mut core, Instant::now());
        core.state
    }

    /// Snapshot of the rolling counts.
    pub fn counts(&self) -> Counts {
        let core = self.core.lock().expect("breaker lock poisoned");
        core.counts
    }

    /// Apply time-driven transitions: interval rollover while closed and the
    /// open→half-open move after `timeout`.
    fn roll(&self, core: &mut BreakerCore, now: Instant) {
        match core.state {
            BreakerState::Closed => {
                if let Some(expiry) = core.expiry {
                    if now >= expiry {
                        self.new_generation(core, now);
                    }
                }
            }
            BreakerState::Open => {
                if let Some(opened_at) = core.opened_at {
                    if now.duration_since(opened_at) >= self.config.timeout {
                        self.transition(core, BreakerState::HalfOpen, now);
                    }
                }
            }
            BreakerState::HalfOpen => {}
        }
    }

    fn transition(&self, core: &mut BreakerCore, to: BreakerState, now: Instant) {
        if core.state == to {
            return;
        }
        tracing::info!(
            service = %self.name,
            from = core.state.as_str(),
            to = to.as_str(),
            "circuit breaker state change"
        );
        core.state = to;
        core.opened_at = if to == BreakerState::Open {
            Some(now)
        } else {
            None
        };
        self.new_generation(core, now);
        gauge!("gateway_circuit_breaker_state", "service" => self.name.clone())
            .set(to.as_gauge());
    }

    fn new_generation(&self, core: &mut BreakerCore, now: Instant) {
        core.generation += 1;
        core.counts.clear();
        core.expiry = match core.state {
            BreakerState::Closed if !self.config.interval.is_zero() => {
                Some(now + self.config.interval)
            }
            _ => None,
        };
    }
}

/// Lazily-created breakers, one per upstream service.
///
/// Lookups take the read lock; creation is serialized behind the write lock
/// with a double check so two racing requests end up with the same breaker.
#[derive(Debug)]
pub struct BreakerManager {
    config: CircuitConfig,
    breakers: RwLock<HashMap<String, Arc<Breaker>>>,
}

impl BreakerManager {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Breaker for the named service, created on first use.
    pub fn get(&self, service: &str) -> Arc<Breaker> {
        {
            let breakers = self.breakers.read().expect("breaker map lock poisoned");
            if let Some(breaker) = breakers.get(service) {
                return Arc::clone(breaker);
            }
        }

        let mut breakers = self.breakers.write().expect("breaker map lock poisoned");
        if let Some(breaker) = breakers.get(service) {
            return Arc::clone(breaker);
        }
        let breaker = Arc::new(Breaker::new(service, self.config.clone()));
        breakers.insert(service.to_string(), Arc::clone(&breaker));
        breaker
    }

    /// State names of every known breaker, for the admin endpoint.
    pub fn all_states(&self) -> HashMap<String, &'static str> {
        let breakers = self.breakers.read().expect("breaker map lock poisoned");
        breakers
            .iter()
            .map(|(name, b)| (name.clone(), b.state().as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn config(threshold: u32, timeout: Duration, max_requests: u32) -> CircuitConfig {
        CircuitConfig {
            enabled: true,
            max_requests,
            interval: Duration::from_secs(60),
            timeout,
            failure_threshold: threshold,
        }
    }

    fn fail_times(breaker: &Breaker, n: usize) {
        for _ in 0..n {
            let generation = breaker.acquire().unwrap();
            breaker.record(generation, false);
        }
    }

    #[test]
    fn starts_closed_and_admits() {
        let breaker = Breaker::new("auth", config(5, Duration::from_secs(30), 5));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.acquire().is_ok());
    }

    #[test]
    fn opens_at_threshold_with_majority_failures() {
        let breaker = Breaker::new("auth", config(5, Duration::from_secs(30), 5));

        fail_times(&breaker, 4);
        assert_eq!(breaker.state(), BreakerState::Closed);

        fail_times(&breaker, 1);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.acquire(), Err(BreakerError::Open));
    }

    #[test]
    fn does_not_open_below_failure_ratio() {
        let breaker = Breaker::new("auth", config(4, Duration::from_secs(30), 5));

        // 3 successes then 2 failures: requests=5 >= 4 but ratio 0.4 < 0.5.
        for _ in 0..3 {
            let generation = breaker.acquire().unwrap();
            breaker.record(generation, true);
        }
        fail_times(&breaker, 2);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_after_timeout_then_closes_on_successes() {
        let breaker = Breaker::new("auth", config(2, Duration::from_millis(50), 2));
        fail_times(&breaker, 2);
        assert_eq!(breaker.state(), BreakerState::Open);

        thread::sleep(Duration::from_millis(80));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let g1 = breaker.acquire().unwrap();
        breaker.record(g1, true);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let g2 = breaker.acquire().unwrap();
        breaker.record(g2, true);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = Breaker::new("auth", config(2, Duration::from_millis(50), 2));
        fail_times(&breaker, 2);
        thread::sleep(Duration::from_millis(80));

        let generation = breaker.acquire().unwrap();
        breaker.record(generation, false);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn half_open_caps_concurrent_probes() {
        let breaker = Breaker::new("auth", config(2, Duration::from_millis(50), 2));
        fail_times(&breaker, 2);
        thread::sleep(Duration::from_millis(80));

        let _g1 = breaker.acquire().unwrap();
        let _g2 = breaker.acquire().unwrap();
        assert_eq!(breaker.acquire(), Err(BreakerError::TooManyRequests));
    }

    #[test]
    fn stale_generation_is_ignored() {
        let breaker = Breaker::new("auth", config(2, Duration::from_millis(50), 2));
        let stale = breaker.acquire().unwrap();
        fail_times(&breaker, 2);
        assert_eq!(breaker.state(), BreakerState::Open);

        thread::sleep(Duration::from_millis(80));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // A success from before the breaker opened must not count as a probe.
        breaker.record(stale, true);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert_eq!(breaker.counts().consecutive_successes, 0);
    }

    #[test]
    fn closing_resets_counts_so_one_failure_does_not_reopen() {
        let breaker = Breaker::new("auth", config(2, Duration::from_millis(50), 1));
        fail_times(&breaker, 2);
        thread::sleep(Duration::from_millis(80));

        let generation = breaker.acquire().unwrap();
        breaker.record(generation, true);
        assert_eq!(breaker.state(), BreakerState::Closed);

        // Fresh generation: a single failure is below the threshold ratio
        // window and leaves the breaker closed.
        fail_times(&breaker, 1);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn manager_returns_same_instance_per_service() {
        let manager = BreakerManager::new(config(5, Duration::from_secs(30), 5));
        let a = manager.get("auth");
        let b = manager.get("auth");
        let c = manager.get("notifier");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        let states = manager.all_states();
        assert_eq!(states.get("auth"), Some(&"closed"));
        assert_eq!(states.len(), 2);
    }
}
