//! Multi-tier validator (C5, §4.5). Runs the six tiers in order, accumulating errors tagged
//! with severity, and produces a `ValidationResult` the registry (C4) uses to decide whether
//! to drop, down-weight, or pass an update through unchanged.
//!
//! Grounded on `signals::quality::SignalQualityGate`'s rolling-statistics-driven outlier
//! filter (Welford online mean/variance, z-score threshold) for the statistical-outlier tier,
//! and `scrapers::oracle_comparison`'s divergence-bps computation for the cross-source and
//! consensus tiers, generalized to the spec's one `ValidationResult` shape.

mod tiers;

use crate::config::ValidatorSettings;
use crate::error::Severity;
use crate::models::PriceUpdate;

pub use tiers::RollingStats;

/// One finding from a single tier (§4.5).
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub tier: &'static str,
    pub severity: Severity,
    pub message: String,
}

impl ValidationError {
    fn new(tier: &'static str, severity: Severity, message: impl Into<String>) -> Self {
        Self { tier, severity, message: message.into() }
    }
}

/// The per-feed context the validator needs that only the aggregator (C6) can supply: the
/// rolling historical buffer, other sources' latest prices, and the last published consensus
/// (§4.4 "`ValidationContext` composed of the feed's historical buffer, cross-source buffer,
/// and current consensus median").
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    /// Historical prices for this feed, oldest first, most recent last (from the rolling
    /// buffer). Used by the statistical-outlier tier.
    pub historical_prices: Vec<f64>,
    /// Other sources' latest `(source, price, timestamp_ms)` for the same symbol, used by the
    /// cross-source tier. Already pre-filtered to the 10s window by the caller.
    pub cross_source_latest: Vec<(String, f64, i64)>,
    /// The last published `AggregatedPrice.price` for this feed, if any.
    pub last_consensus_price: Option<f64>,
}

/// Outcome of running all six tiers against one update (§4.5).
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    pub adjusted_confidence: f64,
}

/// Stateless tier pipeline driver; all mutable history lives in the caller-supplied
/// `ValidationContext`; only the settings are held here.
pub struct Validator {
    settings: ValidatorSettings,
}

impl Validator {
    pub fn new(settings: ValidatorSettings) -> Self {
        Self { settings }
    }

    /// Run the six tiers in order (§4.5) and compute the final validity + adjusted confidence.
    pub fn validate(&self, update: &PriceUpdate, ctx: &ValidationContext, now_ms: i64) -> ValidationResult {
        let mut errors = Vec::new();

        tiers::format_tier(update, &mut errors);
        tiers::range_tier(update, &self.settings, &mut errors);
        tiers::staleness_tier(update, &self.settings, now_ms, &mut errors);
        tiers::outlier_tier(update, ctx, &self.settings, &mut errors);
        tiers::cross_source_tier(update, ctx, &self.settings, &mut errors);
        tiers::consensus_tier(update, ctx, &self.settings, &mut errors);

        let critical_count = errors.iter().filter(|e| e.severity == Severity::Critical).count();
        let high_count = errors.iter().filter(|e| e.severity == Severity::High).count();
        let is_valid = critical_count == 0 && high_count <= self.settings.max_high_errors;

        let mut confidence = update.confidence;
        for error in &errors {
            confidence *= match error.severity {
                Severity::Critical => 0.1,
                Severity::High => 0.3,
                Severity::Medium => 0.6,
                Severity::Low => 0.95,
            };
        }

        ValidationResult {
            is_valid,
            errors,
            adjusted_confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings() -> ValidatorSettings {
        ValidatorSettings {
            price_min: 0.01,
            price_max: 1e6,
            max_age: Duration::from_secs(5),
            max_high_errors: 1,
            z_score_threshold: 2.5,
            outlier_threshold: 0.05,
            cross_source_threshold: 0.02,
            cross_source_window: Duration::from_secs(10),
            consensus_threshold: 0.005,
        }
    }

    #[test]
    fn well_formed_fresh_update_with_no_history_is_valid() {
        let v = Validator::new(settings());
        let update = PriceUpdate::new("BTC/USD", 30_000.0, 10_000, "binance").with_confidence(0.9);
        let result = v.validate(&update, &ValidationContext::default(), 10_000);
        assert!(result.is_valid);
        assert!(result.errors.is_empty());
        assert_eq!(result.adjusted_confidence, 0.9);
    }

    #[test]
    fn stale_beyond_max_age_is_critical_and_invalid() {
        let v = Validator::new(settings());
        let update = PriceUpdate::new("BTC/USD", 30_000.0, 0, "binance").with_confidence(0.9);
        let now_ms = settings().max_age.as_millis() as i64 + 1;
        let result = v.validate(&update, &ValidationContext::default(), now_ms);
        assert!(!result.is_valid);
        assert!(result.errors.iter().any(|e| e.tier == "staleness" && e.severity == Severity::Critical));
    }

    #[test]
    fn confidence_adjustment_matches_spec_example() {
        // One MEDIUM (cross-source) and one LOW (staleness warning) -> 0.9 * 0.6 * 0.95.
        let settings = settings();
        let v = Validator::new(settings);
        let max_age_ms = v.settings.max_age.as_millis() as i64;
        let warn_at = (max_age_ms as f64 * 0.85) as i64;
        let update = PriceUpdate::new("BTC/USD", 100.0, 0, "binance").with_confidence(0.9);
        let ctx = ValidationContext {
            cross_source_latest: vec![("kraken".into(), 97.0, warn_at)],
            ..Default::default()
        };
        let result = v.validate(&update, &ctx, warn_at);
        let expected = 0.9 * 0.6 * 0.95;
        assert!((result.adjusted_confidence - expected).abs() < 1e-9, "{}", result.adjusted_confidence);
        assert!(result.is_valid);
    }

    #[test]
    fn out_of_range_price_is_high_but_not_automatically_invalid() {
        let v = Validator::new(settings());
        let update = PriceUpdate::new("BTC/USD", 2_000_000.0, 0, "binance").with_confidence(0.9);
        let result = v.validate(&update, &ValidationContext::default(), 0);
        assert!(result.errors.iter().any(|e| e.tier == "range" && e.severity == Severity::High));
        assert!(result.is_valid); // exactly maxHighErrors(1) HIGH still valid
    }
}
