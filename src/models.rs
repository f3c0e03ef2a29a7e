//! Core data model shared across the pipeline (§3): `PriceUpdate`, `AggregatedPrice`,
//! `SourceHealth`. The live circuit state machine lives in `resilience::circuit_breaker`; this
//! module only carries the plain-data snapshot shape used for reporting it (§3 `CircuitState`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A single observation from one source (§3). Immutable once produced - every field is set at
/// construction and never mutated; the validator returns an *adjusted copy* rather than
/// mutating the original (§4.5 `adjustedUpdate`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub symbol: String,
    pub price: f64,
    /// Exchange-emitted epoch ms, normalized to ms by the adapter.
    pub timestamp: i64,
    pub source: String,
    pub volume: Option<f64>,
    /// In `[0, 1]`, assigned by the adapter from spread/volume/latency (§4.1).
    pub confidence: f64,
}

impl PriceUpdate {
    pub fn new(
        symbol: impl Into<String>,
        price: f64,
        timestamp: i64,
        source: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            timestamp,
            source: source.into(),
            volume: None,
            confidence: 1.0,
        }
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// An adjusted copy carrying a new confidence value, used by the validator (§4.5) instead
    /// of mutating the original update in place.
    pub fn with_adjusted_confidence(&self, confidence: f64) -> Self {
        let mut copy = self.clone();
        copy.confidence = confidence.clamp(0.0, 1.0);
        copy
    }
}

/// The output of the aggregator (C6) for one feed at one instant (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedPrice {
    pub symbol: String,
    pub price: f64,
    /// Equal to the max timestamp among contributing updates (§4.6 Output).
    pub timestamp: i64,
    pub sources: BTreeSet<String>,
    pub confidence: f64,
    /// `1 - normalized interquartile deviation across sources` (§3), clamped to `[0, 1]`.
    pub consensus_score: f64,
}

impl AggregatedPrice {
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.timestamp).max(0)
    }
}

/// `status` transitions for a source (§3). Monotonic except on reset at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Recovered,
}

/// Per-source health snapshot (§3). Produced by the registry (C4), consumed by `GetSystemHealth`
/// and the health bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceHealth {
    pub source: String,
    pub status: HealthStatus,
    pub error_count: u64,
    pub recovery_count: u64,
    pub last_update: Option<i64>,
}

impl SourceHealth {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            status: HealthStatus::Healthy,
            error_count: 0,
            recovery_count: 0,
            last_update: None,
        }
    }

    pub fn record_error(&mut self) {
        self.error_count += 1;
        self.status = HealthStatus::Unhealthy;
    }

    pub fn record_success(&mut self, now_ms: i64) {
        if self.status == HealthStatus::Unhealthy {
            self.recovery_count += 1;
            self.status = HealthStatus::Recovered;
        } else {
            self.status = HealthStatus::Healthy;
        }
        self.last_update = Some(now_ms);
    }
}

/// Plain-data snapshot of a source's circuit state (§3), as reported by
/// `resilience::circuit_breaker::CircuitBreaker::snapshot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitStateSnapshot {
    pub source: String,
    pub state: CircuitStateKind,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Epoch ms the circuit last opened, if it ever has.
    pub opened_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_update_adjustment_does_not_mutate_original() {
        let original = PriceUpdate::new("BTC/USD", 30_000.0, 1_000, "binance").with_confidence(0.9);
        let adjusted = original.with_adjusted_confidence(0.5);
        assert_eq!(original.confidence, 0.9);
        assert_eq!(adjusted.confidence, 0.5);
        assert_eq!(adjusted.symbol, original.symbol);
    }

    #[test]
    fn source_health_recovery_counts_once_per_unhealthy_streak() {
        let mut h = SourceHealth::new("binance");
        h.record_error();
        assert_eq!(h.status, HealthStatus::Unhealthy);
        h.record_success(1_000);
        assert_eq!(h.status, HealthStatus::Recovered);
        assert_eq!(h.recovery_count, 1);
        h.record_success(2_000);
        assert_eq!(h.status, HealthStatus::Healthy);
        assert_eq!(h.recovery_count, 1);
    }

    #[test]
    fn aggregated_price_age_never_negative() {
        let p = AggregatedPrice {
            symbol: "BTC/USD".into(),
            price: 1.0,
            timestamp: 5_000,
            sources: BTreeSet::new(),
            confidence: 1.0,
            consensus_score: 1.0,
        };
        assert_eq!(p.age_ms(4_000), 0);
        assert_eq!(p.age_ms(6_000), 1_000);
    }
}
