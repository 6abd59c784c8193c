//! Circuit breakers for external services.
//!
//! Each external engine (per-language analyzer, each model endpoint) gets a
//! breaker with the classic closed → open → half-open lifecycle: trip after
//! N consecutive failures, short-circuit while open, admit a single probe
//! after the cooldown.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::warn;

/// Breaker lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_probes: u32,
}

/// A single service breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: impl Into<String>, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
                half_open_probes: 0,
            }),
        }
    }

    /// Record a successful call. A half-open probe success closes the
    /// breaker; a closed success resets the failure streak.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.failure_count = 0;
                inner.half_open_probes = 0;
            }
            BreakerState::Closed => inner.failure_count = 0,
            BreakerState::Open => {}
        }
    }

    /// Record a failed call; trips the breaker when the streak reaches the
    /// threshold or a half-open probe fails.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        let tripping = inner.state == BreakerState::HalfOpen
            || inner.failure_count >= self.failure_threshold;
        if tripping && inner.state != BreakerState::Open {
            warn!(breaker = %self.name, failures = inner.failure_count, "circuit breaker tripped");
            inner.state = BreakerState::Open;
        }
    }

    /// Whether a request may go through right now. An open breaker admits a
    /// single half-open probe once the cooldown has elapsed.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => {
                // One probe at a time.
                if inner.half_open_probes == 0 {
                    inner.half_open_probes = 1;
                    true
                } else {
                    false
                }
            }
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_probes = 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Current state, for health reporting.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // A poisoned breaker lock means a panic mid-update; the inner data
        // is a few scalars, safe to keep using.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Registry of breakers keyed by engine/endpoint name.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    failure_threshold: u32,
    reset_timeout: Duration,
    breakers: Mutex<FxHashMap<String, std::sync::Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Registry producing breakers with shared thresholds.
    #[must_use]
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
            breakers: Mutex::new(FxHashMap::default()),
        }
    }

    /// Fetch or create the breaker for `name`.
    pub fn breaker(&self, name: &str) -> std::sync::Arc<CircuitBreaker> {
        let mut map = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(name.to_string())
            .or_insert_with(|| {
                std::sync::Arc::new(CircuitBreaker::new(
                    name,
                    self.failure_threshold,
                    self.reset_timeout,
                ))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_threshold() {
        let b = CircuitBreaker::new("lsp:python", 3, Duration::from_secs(30));
        assert!(b.allow_request());
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow_request());
    }

    #[test]
    fn half_open_admits_single_probe() {
        let b = CircuitBreaker::new("model", 1, Duration::from_millis(0));
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        // Cooldown of zero: next request transitions to half-open.
        assert!(b.allow_request());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(!b.allow_request());
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let b = CircuitBreaker::new("model", 1, Duration::from_millis(0));
        b.record_failure();
        assert!(b.allow_request());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn registry_reuses_breakers() {
        let reg = BreakerRegistry::new(3, Duration::from_secs(30));
        let a = reg.breaker("lsp:go");
        let b = reg.breaker("lsp:go");
        a.record_failure();
        a.record_failure();
        a.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
    }
}
