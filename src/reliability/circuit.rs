//! Per-dependency circuit breaker.
//!
//! One breaker guards one logical dependency (an agent, the planner). The
//! caller pairs every successful [`CircuitBreaker::try_acquire`] with exactly
//! one of [`CircuitBreaker::on_success`] or [`CircuitBreaker::on_failure`].

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::CircuitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Result of asking the breaker for permission to call through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitOutcome {
    Proceed,
    /// The circuit is open (or half-open with all probes taken); the call
    /// must not be made.
    OpenCircuit,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    /// Failure timestamps within the rolling window.
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    window: Duration,
    cooldown: Duration,
    half_open_probes: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            window: Duration::from_millis(config.window_ms),
            cooldown: Duration::from_millis(config.cooldown_ms),
            half_open_probes: config.half_open_probes.max(1),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probes_in_flight: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, advancing `Open -> HalfOpen` once the cooldown has
    /// elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.advance(&mut inner, Instant::now());
        inner.state
    }

    /// Ask for permission to make one call.
    pub fn try_acquire(&self) -> CircuitOutcome {
        let now = Instant::now();
        let mut inner = self.lock();
        self.advance(&mut inner, now);
        match inner.state {
            CircuitState::Closed => CircuitOutcome::Proceed,
            CircuitState::Open => CircuitOutcome::OpenCircuit,
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.half_open_probes {
                    inner.probes_in_flight += 1;
                    CircuitOutcome::Proceed
                } else {
                    CircuitOutcome::OpenCircuit
                }
            }
        }
    }

    /// Record a successful call. A half-open probe success closes the
    /// circuit and clears the failure window.
    pub fn on_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                debug!(breaker = %self.name, "half-open probe succeeded, closing circuit");
                inner.state = CircuitState::Closed;
                inner.failures.clear();
                inner.opened_at = None;
                inner.probes_in_flight = 0;
            }
            CircuitState::Closed => {
                self.trim_window(&mut inner, Instant::now());
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call. Enough failures within the window open the
    /// circuit; a half-open probe failure re-opens it with a fresh cooldown.
    pub fn on_failure(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                self.trim_window(&mut inner, now);
                if inner.failures.len() as u32 >= self.failure_threshold {
                    warn!(breaker = %self.name, failures = inner.failures.len(), "failure threshold reached, opening circuit");
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.failures.clear();
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "half-open probe failed, re-opening circuit");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.probes_in_flight = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Release a permit whose call never produced an observable outcome
    /// (cancelled or abandoned mid-flight). Returns a half-open probe slot
    /// without deciding the circuit's fate.
    pub fn abandon(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }

    fn advance(&self, inner: &mut Inner, now: Instant) {
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| now.duration_since(at))
                .unwrap_or(self.cooldown);
            if elapsed >= self.cooldown {
                debug!(breaker = %self.name, "cooldown elapsed, half-opening circuit");
                inner.state = CircuitState::HalfOpen;
                inner.probes_in_flight = 0;
            }
        }
    }

    fn trim_window(&self, inner: &mut Inner, now: Instant) {
        while let Some(front) = inner.failures.front() {
            if now.duration_since(*front) > self.window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned breaker lock means a panic mid-update; recovering the
        // guard keeps the breaker usable rather than wedging every caller.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, cooldown_ms: u64, probes: u32) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: threshold,
            window_ms: 60_000,
            cooldown_ms,
            half_open_probes: probes,
        }
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new("dep", &config(3, 10_000, 1));
        for _ in 0..3 {
            assert_eq!(breaker.try_acquire(), CircuitOutcome::Proceed);
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.try_acquire(), CircuitOutcome::OpenCircuit);
    }

    #[test]
    fn success_resets_failure_streak() {
        let breaker = CircuitBreaker::new("dep", &config(3, 10_000, 1));
        breaker.on_failure();
        breaker.on_failure();
        breaker.on_success();
        breaker.on_failure();
        // Window still holds three failures; the success did not clear it
        // in the closed state, so one more opens the circuit.
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_success_closes() {
        let breaker = CircuitBreaker::new("dep", &config(1, 10, 1));
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(breaker.try_acquire(), CircuitOutcome::Proceed);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.on_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new("dep", &config(1, 10, 1));
        breaker.on_failure();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(breaker.try_acquire(), CircuitOutcome::Proceed);
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.try_acquire(), CircuitOutcome::OpenCircuit);
    }

    #[tokio::test]
    async fn half_open_bounds_concurrent_probes() {
        let breaker = CircuitBreaker::new("dep", &config(1, 10, 2));
        breaker.on_failure();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(breaker.try_acquire(), CircuitOutcome::Proceed);
        assert_eq!(breaker.try_acquire(), CircuitOutcome::Proceed);
        assert_eq!(breaker.try_acquire(), CircuitOutcome::OpenCircuit);
    }
}
