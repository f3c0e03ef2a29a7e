//! Process-wide tunables (§3-§9 defaults), built once at startup and handed to every
//! component by reference. Grounded on `binance_session::SessionConfig::from_env` - parse an
//! env var if present, fall back to the spec default otherwise.
//!
//! Hot-reload (§1A, §9 "global config" migration) is modeled as producing a new `Settings` and
//! swapping it atomically via [`SettingsHandle`]; no module ever mutates a `Settings` in place,
//! and every reader goes through `load()` so a reload is visible to the next read without
//! coordinating with in-flight tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

/// All the numeric/duration knobs named throughout the spec, grouped by the component that
/// owns them. Every field has the spec's literal default.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub circuit_breaker: CircuitBreakerSettings,
    pub failover: FailoverSettings,
    pub validator: ValidatorSettings,
    pub aggregator: AggregatorSettings,
    pub cache: CacheSettings,
    pub health: HealthSettings,
    pub adapter: AdapterSettings,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
    pub rate_limit_cooldown: Duration,
    pub rate_limit_backoff_multiplier: f64,
    pub rate_limit_cooldown_max: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailoverSettings {
    pub graceful_degradation_threshold: usize,
    pub recovery_threshold: u32,
    pub max_reconnect_attempts: u32,
    pub max_failover_time: Duration,
    pub max_concurrent_reconnects: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidatorSettings {
    pub price_min: f64,
    pub price_max: f64,
    pub max_age: Duration,
    pub max_high_errors: usize,
    pub z_score_threshold: f64,
    pub outlier_threshold: f64,
    pub cross_source_threshold: f64,
    pub cross_source_window: Duration,
    pub consensus_threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorSettings {
    pub trades_history_size: usize,
    pub max_staleness: Duration,
    /// `medianDecay`, the one decay constant actually read (§9 open question).
    pub median_decay_per_ms: f64,
    pub min_emission_interval: Duration,
    /// Per-exchange reliability constant in `[0.5, 1.0]` (§4.6 weight formula). Unlisted
    /// sources (CCXT-bridged venues, by construction) fall back to `default_reliability`.
    pub source_reliability: HashMap<String, f64>,
    pub default_reliability: f64,
}

impl AggregatorSettings {
    pub fn reliability_of(&self, source: &str) -> f64 {
        self.source_reliability.get(source).copied().unwrap_or(self.default_reliability)
    }
}

impl AggregatorSettings {
    /// `AGGREGATION_LAMBDA_DECAY` from the original source (§9): kept only as a documented
    /// alias, never read by the aggregator.
    #[deprecated(note = "ambiguous alias for median_decay_per_ms; not used at runtime")]
    pub const LAMBDA_DECAY_ALIAS_PER_MS: f64 = 4e-5;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub fresh_data_threshold: Duration,
    pub max_data_age: Duration,
    pub max_entries: usize,
    pub eviction_fraction: f64,
    pub warm_aggressive_interval: Duration,
    pub warm_predictive_interval: Duration,
    pub warm_maintenance_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthSettings {
    pub alert_cooldown: Duration,
    pub alerts_per_hour_cap: u32,
    pub error_window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdapterSettings {
    pub reconnect_backoff_base: Duration,
    pub reconnect_backoff_max: Duration,
    pub max_reconnect_attempts: u32,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub http_timeout: Duration,
    pub ws_connect_timeout: Duration,
    pub health_check_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerSettings {
                failure_threshold: 20,
                recovery_timeout: Duration::from_secs(30),
                success_threshold: 1,
                rate_limit_cooldown: Duration::from_secs(5),
                rate_limit_backoff_multiplier: 3.0,
                rate_limit_cooldown_max: Duration::from_secs(5 * 60),
            },
            failover: FailoverSettings {
                graceful_degradation_threshold: 2,
                recovery_threshold: 5,
                max_reconnect_attempts: 10,
                max_failover_time: Duration::from_millis(100),
                max_concurrent_reconnects: 3,
            },
            validator: ValidatorSettings {
                price_min: 0.01,
                price_max: 1e6,
                max_age: Duration::from_secs(5),
                max_high_errors: 1,
                z_score_threshold: 2.5,
                outlier_threshold: 0.05,
                cross_source_threshold: 0.02,
                cross_source_window: Duration::from_secs(10),
                consensus_threshold: 0.005,
            },
            aggregator: AggregatorSettings {
                trades_history_size: 1000,
                max_staleness: Duration::from_secs(30),
                median_decay_per_ms: 5e-5,
                min_emission_interval: Duration::from_millis(100),
                source_reliability: default_source_reliability(),
                default_reliability: 0.6,
            },
            cache: CacheSettings {
                ttl: Duration::from_secs(1),
                fresh_data_threshold: Duration::from_secs(2),
                max_data_age: Duration::from_secs(2),
                max_entries: 25_000,
                eviction_fraction: 0.15,
                warm_aggressive_interval: Duration::from_secs(3),
                warm_predictive_interval: Duration::from_secs(7),
                warm_maintenance_interval: Duration::from_secs(15),
            },
            health: HealthSettings {
                alert_cooldown: Duration::from_secs(5 * 60),
                alerts_per_hour_cap: 20,
                error_window: Duration::from_secs(5 * 60),
            },
            adapter: AdapterSettings {
                reconnect_backoff_base: Duration::from_secs(5),
                reconnect_backoff_max: Duration::from_secs(5 * 60),
                max_reconnect_attempts: 10,
                ping_interval: Duration::from_secs(30),
                pong_timeout: Duration::from_secs(10),
                http_timeout: Duration::from_secs(10),
                ws_connect_timeout: Duration::from_secs(30),
                health_check_timeout: Duration::from_secs(3),
            },
        }
    }
}

impl Settings {
    /// Load from environment with spec defaults, mirroring
    /// `binance_session::SessionConfig::from_env`'s parse-or-keep-default shape.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Some(v) = env_u32("ORACLEFEED_CB_FAILURE_THRESHOLD") {
            settings.circuit_breaker.failure_threshold = v;
        }
        if let Some(v) = env_secs("ORACLEFEED_CB_RECOVERY_TIMEOUT_SECS") {
            settings.circuit_breaker.recovery_timeout = v;
        }
        if let Some(v) = env_usize("ORACLEFEED_FAILOVER_GRACEFUL_THRESHOLD") {
            settings.failover.graceful_degradation_threshold = v;
        }
        if let Some(v) = env_f64("ORACLEFEED_VALIDATOR_Z_SCORE_THRESHOLD") {
            settings.validator.z_score_threshold = v;
        }
        if let Some(v) = env_f64("ORACLEFEED_AGGREGATOR_MEDIAN_DECAY") {
            settings.aggregator.median_decay_per_ms = v;
        }
        if let Some(v) = env_secs("ORACLEFEED_CACHE_FRESH_DATA_THRESHOLD_SECS") {
            settings.cache.fresh_data_threshold = v;
            settings.cache.max_data_age = v;
        }
        if let Some(v) = env_u32("ORACLEFEED_HEALTH_ALERTS_PER_HOUR_CAP") {
            settings.health.alerts_per_hour_cap = v;
        }

        settings
    }
}

/// Defaults for the five native-adapter exchanges (§4.6 "reliability is a configured
/// per-exchange constant in `[0.5, 1.0]`"); unlisted (CCXT-bridged) sources use
/// `default_reliability` instead.
fn default_source_reliability() -> HashMap<String, f64> {
    [
        ("binance", 1.0),
        ("coinbase", 0.95),
        ("kraken", 0.9),
        ("okx", 0.85),
        ("crypto_com", 0.8),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Atomically-swappable handle to the live `Settings`, grounded on
/// `binance_session::SessionConfig`'s own `ArcSwap`-backed hot-reload (§1A "configuration may be
/// reloaded without restarting the process"). Cloning is cheap (an `Arc` bump); every clone
/// observes the same underlying value.
#[derive(Clone)]
pub struct SettingsHandle(Arc<ArcSwap<Settings>>);

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self(Arc::new(ArcSwap::from_pointee(settings)))
    }

    /// Current snapshot. Cheap: `ArcSwap::load_full` is a lock-free pointer bump.
    pub fn load(&self) -> Arc<Settings> {
        self.0.load_full()
    }

    /// Re-read environment variables and swap in the result (§1A hot-reload). Any field not
    /// named by an env var keeps its spec-literal default rather than the previous snapshot's
    /// value, matching `Settings::from_env`'s own parse-or-default behavior.
    pub fn reload_from_env(&self) {
        self.0.store(Arc::new(Settings::from_env()));
    }
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_literals() {
        let s = Settings::default();
        assert_eq!(s.circuit_breaker.failure_threshold, 20);
        assert_eq!(s.circuit_breaker.recovery_timeout, Duration::from_secs(30));
        assert_eq!(s.failover.graceful_degradation_threshold, 2);
        assert_eq!(s.failover.recovery_threshold, 5);
        assert_eq!(s.cache.fresh_data_threshold, Duration::from_secs(2));
        assert_eq!(s.aggregator.median_decay_per_ms, 5e-5);
        assert_eq!(s.health.alerts_per_hour_cap, 20);
    }

    #[test]
    fn from_env_falls_back_to_defaults_when_unset() {
        std::env::remove_var("ORACLEFEED_CB_FAILURE_THRESHOLD");
        let s = Settings::from_env();
        assert_eq!(s.circuit_breaker.failure_threshold, 20);
    }

    #[test]
    fn from_env_overrides_when_set() {
        std::env::set_var("ORACLEFEED_CB_FAILURE_THRESHOLD", "7");
        let s = Settings::from_env();
        assert_eq!(s.circuit_breaker.failure_threshold, 7);
        std::env::remove_var("ORACLEFEED_CB_FAILURE_THRESHOLD");
    }

    #[test]
    fn settings_handle_reload_is_visible_to_existing_clones() {
        let handle = SettingsHandle::new(Settings::default());
        let cloned = handle.clone();
        assert_eq!(cloned.load().health.alerts_per_hour_cap, 20);

        std::env::set_var("ORACLEFEED_HEALTH_ALERTS_PER_HOUR_CAP", "5");
        handle.reload_from_env();
        std::env::remove_var("ORACLEFEED_HEALTH_ALERTS_PER_HOUR_CAP");

        assert_eq!(cloned.load().health.alerts_per_hour_cap, 5);
    }
}
