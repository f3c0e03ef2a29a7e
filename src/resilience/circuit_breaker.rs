//! Per-source circuit breaker (C2, §4.2). Grounded directly on
//! `route_quality::mitigation::CircuitBreaker`/`CircuitState` (already closed/open/half-open
//! with `failures`/`successes`/`opened_at`), generalized from per-endpoint network mitigation
//! to per-source price-feed admission, plus `EndpointRotator`'s circuit-open-until bookkeeping.
//!
//! Every method takes an explicit `now_ms` rather than reading the wall clock, so transition
//! boundaries (§8 "circuit opens precisely when `consecutiveFailures == failureThreshold`")
//! are deterministically testable without sleeping.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::CircuitBreakerSettings;
use crate::error::ErrorKind;
use crate::models::{CircuitStateKind, CircuitStateSnapshot};

#[derive(Debug, Clone)]
struct SourceCircuit {
    state: CircuitStateKind,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<i64>,
    /// One probe admitted per half-open window; cleared on the next outcome.
    probe_in_flight: bool,
    /// Independent of circuit state (§4.2): a rate-limited source is cooled down without
    /// counting toward `consecutiveFailures` or tripping the breaker.
    rate_limit_cooldown_until: Option<i64>,
    rate_limit_cooldown: std::time::Duration,
}

impl SourceCircuit {
    fn new() -> Self {
        Self {
            state: CircuitStateKind::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            probe_in_flight: false,
            rate_limit_cooldown_until: None,
            rate_limit_cooldown: std::time::Duration::ZERO,
        }
    }

    fn snapshot(&self, source: &str) -> CircuitStateSnapshot {
        CircuitStateSnapshot {
            source: source.to_string(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            opened_at: self.opened_at,
        }
    }
}

/// A state transition, published for C4/C9 to consume (§4.2 "publishes state transitions as
/// events").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitTransition {
    pub source: String,
    pub from: CircuitStateKind,
    pub to: CircuitStateKind,
    pub at_ms: i64,
}

/// Per-source closed/open/half-open admission gate (§4.2). One instance covers every source
/// registered with the data manager (C4); state is keyed by source id and protected by a
/// single mutex held only for the transition computation itself (§5 "no I/O under the lock").
pub struct CircuitBreaker {
    settings: CircuitBreakerSettings,
    sources: Mutex<HashMap<String, SourceCircuit>>,
    transitions: broadcast::Sender<CircuitTransition>,
}

impl CircuitBreaker {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        let (transitions, _) = broadcast::channel(256);
        Self {
            settings,
            sources: Mutex::new(HashMap::new()),
            transitions,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CircuitTransition> {
        self.transitions.subscribe()
    }

    /// Does this source currently admit work (§4.2 "Admits work?")? Closed always does; open
    /// never does until `recoveryTimeout` elapses, at which point it transitions to half-open
    /// and admits exactly one probe; half-open admits nothing further until that probe
    /// resolves via `record_success`/`record_failure`.
    pub fn admits(&self, source: &str, now_ms: i64) -> bool {
        let mut sources = self.sources.lock();
        let circuit = sources.entry(source.to_string()).or_insert_with(SourceCircuit::new);

        if let Some(until) = circuit.rate_limit_cooldown_until {
            if now_ms < until {
                return false;
            }
        }

        match circuit.state {
            CircuitStateKind::Closed => true,
            CircuitStateKind::HalfOpen => !circuit.probe_in_flight && {
                circuit.probe_in_flight = true;
                true
            },
            CircuitStateKind::Open => {
                let opened_at = circuit.opened_at.unwrap_or(now_ms);
                if now_ms - opened_at >= self.settings.recovery_timeout.as_millis() as i64 {
                    self.transition(source, circuit, CircuitStateKind::HalfOpen, now_ms);
                    circuit.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Accept a `PriceUpdate` as a liveness signal (§4.2 "Work" definition).
    pub fn record_success(&self, source: &str, now_ms: i64) {
        let mut sources = self.sources.lock();
        let circuit = sources.entry(source.to_string()).or_insert_with(SourceCircuit::new);
        circuit.probe_in_flight = false;
        circuit.consecutive_failures = 0;
        circuit.consecutive_successes += 1;

        match circuit.state {
            CircuitStateKind::Closed => {}
            CircuitStateKind::HalfOpen => {
                if circuit.consecutive_successes >= self.settings.success_threshold {
                    self.transition(source, circuit, CircuitStateKind::Closed, now_ms);
                    circuit.consecutive_failures = 0;
                }
            }
            CircuitStateKind::Open => {}
        }
    }

    /// Record a classified failure. Only kinds in `{ConnectionError, TimeoutError, ParseError,
    /// ExchangeError}` count toward `consecutiveFailures` (§4.2); `RateLimitError` instead
    /// applies the cooldown track via `record_rate_limited`.
    pub fn record_failure(&self, source: &str, kind: ErrorKind, now_ms: i64) {
        if kind == ErrorKind::RateLimitError {
            self.record_rate_limited(source, now_ms);
            return;
        }

        let mut sources = self.sources.lock();
        let circuit = sources.entry(source.to_string()).or_insert_with(SourceCircuit::new);
        circuit.probe_in_flight = false;
        circuit.consecutive_successes = 0;
        circuit.consecutive_failures += 1;

        match circuit.state {
            CircuitStateKind::Closed => {
                if circuit.consecutive_failures >= self.settings.failure_threshold {
                    self.transition(source, circuit, CircuitStateKind::Open, now_ms);
                    circuit.opened_at = Some(now_ms);
                }
            }
            CircuitStateKind::HalfOpen => {
                self.transition(source, circuit, CircuitStateKind::Open, now_ms);
                circuit.opened_at = Some(now_ms);
                circuit.consecutive_failures = 0;
            }
            CircuitStateKind::Open => {}
        }
    }

    /// `RateLimitError` applies a per-source cooldown with multiplicative backoff (x3, capped
    /// at 5 min) independent of the breaker's failure counter (§4.2).
    fn record_rate_limited(&self, source: &str, now_ms: i64) {
        let mut sources = self.sources.lock();
        let circuit = sources.entry(source.to_string()).or_insert_with(SourceCircuit::new);

        let base = self.settings.rate_limit_cooldown;
        let next = if circuit.rate_limit_cooldown.is_zero() {
            base
        } else {
            let scaled = circuit
                .rate_limit_cooldown
                .mul_f64(self.settings.rate_limit_backoff_multiplier);
            scaled.min(self.settings.rate_limit_cooldown_max)
        };
        circuit.rate_limit_cooldown = next;
        circuit.rate_limit_cooldown_until = Some(now_ms + next.as_millis() as i64);
        warn!(source, cooldown_ms = next.as_millis() as u64, "source rate limited, cooling down");
    }

    fn transition(
        &self,
        source: &str,
        circuit: &mut SourceCircuit,
        to: CircuitStateKind,
        at_ms: i64,
    ) {
        let from = circuit.state;
        if from == to {
            return;
        }
        circuit.state = to;
        info!(source, ?from, ?to, "circuit breaker transition");
        let _ = self.transitions.send(CircuitTransition {
            source: source.to_string(),
            from,
            to,
            at_ms,
        });
    }

    pub fn snapshot(&self, source: &str) -> CircuitStateSnapshot {
        let mut sources = self.sources.lock();
        sources.entry(source.to_string()).or_insert_with(SourceCircuit::new).snapshot(source)
    }

    pub fn snapshot_all(&self) -> Vec<CircuitStateSnapshot> {
        self.sources
            .lock()
            .iter()
            .map(|(source, circuit)| circuit.snapshot(source))
            .collect()
    }

    pub fn state_of(&self, source: &str) -> CircuitStateKind {
        self.sources
            .lock()
            .get(source)
            .map(|c| c.state)
            .unwrap_or(CircuitStateKind::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings() -> CircuitBreakerSettings {
        CircuitBreakerSettings {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 1,
            rate_limit_cooldown: Duration::from_secs(5),
            rate_limit_backoff_multiplier: 3.0,
            rate_limit_cooldown_max: Duration::from_secs(300),
        }
    }

    #[test]
    fn opens_exactly_at_failure_threshold() {
        let cb = CircuitBreaker::new(settings());
        cb.record_failure("binance", ErrorKind::ConnectionError, 0);
        cb.record_failure("binance", ErrorKind::ConnectionError, 1);
        assert_eq!(cb.state_of("binance"), CircuitStateKind::Closed);
        cb.record_failure("binance", ErrorKind::ConnectionError, 2);
        assert_eq!(cb.state_of("binance"), CircuitStateKind::Open);
    }

    #[test]
    fn open_denies_work_until_recovery_timeout() {
        let cb = CircuitBreaker::new(settings());
        for t in 0..3 {
            cb.record_failure("binance", ErrorKind::ConnectionError, t);
        }
        assert!(!cb.admits("binance", 10_000));
        assert!(cb.admits("binance", 30_000));
        assert_eq!(cb.state_of("binance"), CircuitStateKind::HalfOpen);
    }

    #[test]
    fn half_open_closes_on_probe_success() {
        let cb = CircuitBreaker::new(settings());
        for t in 0..3 {
            cb.record_failure("binance", ErrorKind::ConnectionError, t);
        }
        assert!(cb.admits("binance", 30_000));
        cb.record_success("binance", 30_100);
        assert_eq!(cb.state_of("binance"), CircuitStateKind::Closed);
    }

    #[test]
    fn half_open_reopens_on_probe_failure_and_restarts_timer() {
        let cb = CircuitBreaker::new(settings());
        for t in 0..3 {
            cb.record_failure("binance", ErrorKind::ConnectionError, t);
        }
        assert!(cb.admits("binance", 30_000));
        cb.record_failure("binance", ErrorKind::ConnectionError, 30_050);
        assert_eq!(cb.state_of("binance"), CircuitStateKind::Open);
        assert!(!cb.admits("binance", 30_060));
        assert!(cb.admits("binance", 60_050));
    }

    #[test]
    fn rate_limit_errors_do_not_count_toward_failure_threshold() {
        let cb = CircuitBreaker::new(settings());
        for t in 0..10 {
            cb.record_failure("binance", ErrorKind::RateLimitError, t);
        }
        assert_eq!(cb.state_of("binance"), CircuitStateKind::Closed);
    }

    #[test]
    fn rate_limit_cooldown_backs_off_multiplicatively_and_caps() {
        let cb = CircuitBreaker::new(settings());
        cb.record_failure("binance", ErrorKind::RateLimitError, 0);
        assert!(!cb.admits("binance", 1_000));
        assert!(cb.admits("binance", 5_001));

        cb.record_failure("binance", ErrorKind::RateLimitError, 5_001);
        assert!(!cb.admits("binance", 5_002));
        assert!(cb.admits("binance", 5_001 + 15_001));
    }

    #[test]
    fn closed_circuit_always_admits() {
        let cb = CircuitBreaker::new(settings());
        assert!(cb.admits("kraken", 0));
        cb.record_success("kraken", 0);
        assert!(cb.admits("kraken", 1));
    }
}
