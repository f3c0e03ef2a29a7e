//! The six validation tiers (§4.5), applied in order. Each tier pushes zero or more
//! `ValidationError`s into the caller's accumulator; later tiers are skipped when the
//! `ValidationContext` doesn't carry enough history yet, never treated as a failure.

use super::{ValidationContext, ValidationError};
use crate::config::ValidatorSettings;
use crate::error::Severity;
use crate::models::PriceUpdate;

/// Welford's online algorithm for numerically stable mean/variance, grounded on
/// `signals::quality::RollingStats`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RollingStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RollingStats {
    pub fn from_samples(samples: &[f64]) -> Self {
        let mut stats = Self::default();
        for &s in samples {
            stats.update(s);
        }
        stats
    }

    pub fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn std_dev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).sqrt()
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Tier 1 (§4.5): reject non-finite/non-positive price (CRITICAL); confidence outside `[0,1]`
/// is MEDIUM and does not by itself fail validity. Symbol/timestamp presence is enforced by
/// the type system upstream (`PriceUpdate`'s fields are non-optional), so this tier only
/// checks what a typed struct cannot already guarantee.
pub fn format_tier(update: &PriceUpdate, errors: &mut Vec<ValidationError>) {
    if !update.price.is_finite() || update.price <= 0.0 {
        errors.push(ValidationError::new(
            "format",
            Severity::Critical,
            format!("non-finite or non-positive price: {}", update.price),
        ));
    }
    if !(0.0..=1.0).contains(&update.confidence) {
        errors.push(ValidationError::new(
            "format",
            Severity::Medium,
            format!("confidence {} outside [0,1]", update.confidence),
        ));
    }
}

/// Tier 2 (§4.5): `price` must fall within `[priceRange.min, priceRange.max]`.
pub fn range_tier(update: &PriceUpdate, settings: &ValidatorSettings, errors: &mut Vec<ValidationError>) {
    if update.price < settings.price_min || update.price > settings.price_max {
        errors.push(ValidationError::new(
            "range",
            Severity::High,
            format!("price {} outside [{}, {}]", update.price, settings.price_min, settings.price_max),
        ));
    }
}

/// Tier 3 (§4.5): `now - timestamp > maxAge` is CRITICAL; `> maxAge * 0.8` is a LOW warning.
pub fn staleness_tier(
    update: &PriceUpdate,
    settings: &ValidatorSettings,
    now_ms: i64,
    errors: &mut Vec<ValidationError>,
) {
    let age_ms = now_ms - update.timestamp;
    let max_age_ms = settings.max_age.as_millis() as i64;
    if age_ms > max_age_ms {
        errors.push(ValidationError::new(
            "staleness",
            Severity::Critical,
            format!("age {age_ms}ms exceeds maxAge {max_age_ms}ms"),
        ));
    } else if (age_ms as f64) > (max_age_ms as f64 * 0.8) {
        errors.push(ValidationError::new(
            "staleness",
            Severity::Low,
            format!("age {age_ms}ms exceeds 80% of maxAge {max_age_ms}ms"),
        ));
    }
}

/// Tier 4 (§4.5): requires >= 3 historical points. Flags deviation from the rolling mean in
/// standard deviations, and separately from the last-5-prices mean as a relative fraction.
pub fn outlier_tier(
    update: &PriceUpdate,
    ctx: &ValidationContext,
    settings: &ValidatorSettings,
    errors: &mut Vec<ValidationError>,
) {
    if ctx.historical_prices.len() < 3 {
        return;
    }

    let stats = RollingStats::from_samples(&ctx.historical_prices);
    let std_dev = stats.std_dev();
    if std_dev > 0.0 {
        let z = (update.price - stats.mean()).abs() / std_dev;
        if z > settings.z_score_threshold {
            errors.push(ValidationError::new(
                "outlier",
                Severity::Medium,
                format!("z-score {z:.2} exceeds threshold {:.2}", settings.z_score_threshold),
            ));
        }
    }

    let last5 = &ctx.historical_prices[ctx.historical_prices.len().saturating_sub(5)..];
    let mean5 = last5.iter().sum::<f64>() / last5.len() as f64;
    if mean5 > 0.0 {
        let rel_dev = (update.price - mean5).abs() / mean5;
        if rel_dev > settings.outlier_threshold * 2.0 {
            errors.push(ValidationError::new(
                "outlier",
                Severity::High,
                format!("relative deviation {rel_dev:.4} from last-5 mean exceeds 2x threshold"),
            ));
        } else if rel_dev > settings.outlier_threshold {
            errors.push(ValidationError::new(
                "outlier",
                Severity::Medium,
                format!("relative deviation {rel_dev:.4} from last-5 mean exceeds threshold"),
            ));
        }
    }
}

/// Tier 5 (§4.5): compare against the median of other sources' latest prices within the
/// cross-source window (already filtered by the caller into `ctx.cross_source_latest`).
pub fn cross_source_tier(
    update: &PriceUpdate,
    ctx: &ValidationContext,
    settings: &ValidatorSettings,
    errors: &mut Vec<ValidationError>,
) {
    if ctx.cross_source_latest.is_empty() {
        return;
    }
    let median = median_of(ctx.cross_source_latest.iter().map(|(_, p, _)| *p));
    if median <= 0.0 {
        return;
    }
    let rel_dev = (update.price - median).abs() / median;
    if rel_dev > settings.cross_source_threshold * 2.0 {
        errors.push(ValidationError::new(
            "cross_source",
            Severity::High,
            format!("relative deviation {rel_dev:.4} from cross-source median exceeds 2x threshold"),
        ));
    } else if rel_dev > settings.cross_source_threshold {
        errors.push(ValidationError::new(
            "cross_source",
            Severity::Medium,
            format!("relative deviation {rel_dev:.4} from cross-source median exceeds threshold"),
        ));
    }
}

/// Tier 6 (§4.5): compare against the last published `AggregatedPrice.price` for the feed.
pub fn consensus_tier(
    update: &PriceUpdate,
    ctx: &ValidationContext,
    settings: &ValidatorSettings,
    errors: &mut Vec<ValidationError>,
) {
    let Some(consensus) = ctx.last_consensus_price else { return };
    if consensus <= 0.0 {
        return;
    }
    let rel_dev = (update.price - consensus).abs() / consensus;
    if rel_dev > settings.consensus_threshold * 2.0 {
        errors.push(ValidationError::new(
            "consensus",
            Severity::High,
            format!("relative deviation {rel_dev:.4} from consensus exceeds 2x threshold"),
        ));
    } else if rel_dev > settings.consensus_threshold {
        errors.push(ValidationError::new(
            "consensus",
            Severity::Medium,
            format!("relative deviation {rel_dev:.4} from consensus exceeds threshold"),
        ));
    }
}

fn median_of(values: impl Iterator<Item = f64>) -> f64 {
    let mut sorted: Vec<f64> = values.collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if sorted.is_empty() {
        return 0.0;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_stats_matches_known_mean_and_stddev() {
        let stats = RollingStats::from_samples(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((stats.mean() - 5.0).abs() < 1e-9);
        assert!((stats.std_dev() - 2.138_089_935).abs() < 1e-6);
    }

    #[test]
    fn median_of_even_count_averages_middle_two() {
        assert_eq!(median_of([1.0, 2.0, 3.0, 4.0].into_iter()), 2.5);
    }

    #[test]
    fn median_of_odd_count_picks_middle() {
        assert_eq!(median_of([1.0, 5.0, 3.0].into_iter()), 3.0);
    }

    #[test]
    fn outlier_tier_skipped_with_fewer_than_three_history_points() {
        let settings = crate::config::Settings::default().validator;
        let update = PriceUpdate::new("BTC/USD", 45_000.0, 0, "okx").with_confidence(1.0);
        let ctx = ValidationContext { historical_prices: vec![30_000.0, 30_010.0], ..Default::default() };
        let mut errors = Vec::new();
        outlier_tier(&update, &ctx, &settings, &mut errors);
        assert!(errors.is_empty());
    }

    #[test]
    fn outlier_tier_flags_large_deviation_from_history() {
        let settings = crate::config::Settings::default().validator;
        let history = vec![30_000.0; 10];
        let update = PriceUpdate::new("BTC/USD", 45_000.0, 0, "okx").with_confidence(1.0);
        let ctx = ValidationContext { historical_prices: history, ..Default::default() };
        let mut errors = Vec::new();
        outlier_tier(&update, &ctx, &settings, &mut errors);
        assert!(!errors.is_empty());
    }
}
