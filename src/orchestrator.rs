//! Orchestrator (C8, §4.8). The single process-wide object holding references to every other
//! component, responsible for wiring them together, driving their background tasks, and
//! exposing the public entry points of §6.
//!
//! Grounded on the teacher's `main.rs` `AppState`-wiring shape (construct each subsystem, hand
//! each one the channels it needs, `tokio::spawn` the background tasks) reduced to the
//! in-scope subsystems (C1…C7, C9) plus the out-of-scope HTTP/RPC surface boundary - this
//! module never serves a request itself, it only answers the five operations in §6 as plain
//! async methods for an external caller to expose however it likes.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::adapters::binance::BinanceAdapter;
use crate::adapters::ccxt_bridge::CcxtBridgeAdapter;
use crate::adapters::coinbase::CoinbaseAdapter;
use crate::adapters::crypto_com::CryptoComAdapter;
use crate::adapters::kraken::KrakenAdapter;
use crate::adapters::okx::OkxAdapter;
use crate::adapters::{Adapter, AdapterChannels, UpdateSink};
use crate::aggregator::Aggregator;
use crate::cache::{FreshnessCache, Warmer};
use crate::config::{Settings, SettingsHandle};
use crate::error::RequestError;
use crate::feeds::{FeedConfig, ResolvedFeed};
use crate::health::{HealthBus, HealthSnapshot};
use crate::models::AggregatedPrice;
use crate::registry::SourceRegistry;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::failover::FailoverCoordinator;
use crate::validator::Validator;

/// Bounded grace period for shutdown (§4.8 "bounded grace period (default 30 s)").
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// `GetSystemHealth()` output (§6). Never fails - every field degrades to a default rather than
/// propagating an error.
#[derive(Debug, Clone)]
pub struct SystemHealth {
    pub status: &'static str,
    pub sources: Vec<crate::models::SourceHealth>,
    pub aggregation_success_rate: f64,
    pub aggregation_error_count: u64,
    pub performance_avg_response_time_ms: f64,
    pub performance_error_rate: f64,
    pub accuracy_avg_confidence: f64,
    pub accuracy_outlier_rate: f64,
    pub timestamp: i64,
}

/// Build one native adapter (or the CCXT bridge for an unrecognized exchange name) for a
/// `(exchange, category)` pair, wired to the shared `UpdateSink` (§4.8 step 1 "initialize
/// adapters from configured feed list").
fn build_adapter(
    exchange: &str,
    category: crate::feeds::FeedCategory,
    settings: &crate::config::AdapterSettings,
    sink: UpdateSink,
) -> Arc<dyn Adapter> {
    let channels = AdapterChannels::new();
    match exchange {
        "binance" => Arc::new(BinanceAdapter::new(*settings, sink, channels)),
        "coinbase" => Arc::new(CoinbaseAdapter::new(*settings, sink, channels)),
        "kraken" => Arc::new(KrakenAdapter::new(*settings, sink, channels)),
        "okx" => Arc::new(OkxAdapter::new(*settings, sink, channels)),
        "crypto_com" => Arc::new(CryptoComAdapter::new(*settings, sink, channels)),
        other => Arc::new(CcxtBridgeAdapter::new(other, category, settings, sink, channels)),
    }
}

/// C8: owns C1 (via the registry), C2, C3, C4, C5, C6, C7, C9, and drives them as a set of
/// cooperative background tasks on the shared runtime (§5 "Scheduling").
pub struct Orchestrator {
    settings: SettingsHandle,
    registry: Arc<SourceRegistry>,
    aggregator: Arc<Aggregator>,
    cache: Arc<FreshnessCache>,
    warmer: Arc<Warmer>,
    health_bus: Arc<HealthBus>,
}

impl Orchestrator {
    /// Step 1-4 of the lifecycle (§4.8): construct every component, wire adapters for the
    /// feeds' configured sources, and register each feed's topology with the data manager.
    /// Background tasks are not yet running - call [`Orchestrator::run`] for that.
    pub async fn start(settings: Settings, feed_config: FeedConfig) -> Result<Self, RequestError> {
        let circuit_breaker = Arc::new(CircuitBreaker::new(settings.circuit_breaker));
        let failover = Arc::new(FailoverCoordinator::new(settings.failover));
        let validator = Arc::new(Validator::new(settings.validator));
        let aggregator = Arc::new(Aggregator::new(settings.aggregator.clone(), circuit_breaker.clone()));
        let cache = Arc::new(FreshnessCache::new(settings.cache));
        let warmer = Arc::new(Warmer::new(settings.cache, cache.clone(), aggregator.clone()));
        let health_bus = Arc::new(HealthBus::new(settings.health));

        let sink = UpdateSink::new();
        let cross_source_window_ms = settings.validator.cross_source_window.as_millis() as i64;
        let registry = Arc::new(SourceRegistry::new(
            settings.health,
            sink.clone(),
            circuit_breaker.clone(),
            failover.clone(),
            validator,
            aggregator.clone(),
            cross_source_window_ms,
        ));

        for feed in &feed_config.feeds {
            register_feed_sources(&registry, &settings, &sink, feed);
            if let Err(err) = registry.subscribe_to_feed(feed).await {
                warn!(feed = %feed.id, error = %err, "initial subscribe_to_feed failed");
            }
            warmer.track_feed(feed.id.name.clone());
        }

        info!(feeds = feed_config.feeds.len(), "orchestrator initialized");
        Ok(Self { settings: SettingsHandle::new(settings), registry, aggregator, cache, warmer, health_bus })
    }

    /// Re-read environment variables and atomically swap in the result (§1A hot-reload). Already
    /// running tasks pick up the new values on their next `load()`; nothing needs to be
    /// restarted or re-wired.
    pub fn reload_config(&self) {
        self.settings.reload_from_env();
        info!("settings reloaded from environment");
    }

    /// Step 3 continued, and the task set named in §5 "Scheduling": the fan-out loop, the
    /// circuit-to-failover bridge, and the cache warmer all run on their own logical task for
    /// the lifetime of the process. `now_ms` is threaded through so every task shares one clock
    /// source.
    pub async fn run(&self, now_ms: impl Fn() -> i64 + Clone + Send + Sync + 'static) {
        let fan_out_registry = self.registry.clone();
        let fan_out_clock = now_ms.clone();
        tokio::spawn(async move { fan_out_registry.run_fan_out(fan_out_clock).await });

        let bridge_registry = self.registry.clone();
        tokio::spawn(async move { bridge_registry.run_circuit_to_failover_bridge().await });

        let warmer = self.warmer.clone();
        let warm_clock = now_ms.clone();
        tokio::spawn(async move { warmer.run(warm_clock).await });

        let cache = self.cache.clone();
        let mut aggregated = self.aggregator.subscribe();
        let cache_clock = now_ms;
        tokio::spawn(async move {
            loop {
                match aggregated.recv().await {
                    Ok(crate::aggregator::AggregatorEvent::AggregatedPrice(price)) => {
                        cache.invalidate_on_price_update(&price, cache_clock());
                    }
                    Ok(crate::aggregator::AggregatorEvent::AggregationError { .. }) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// `GetCurrentPrice(feedId)` (§6). Reads through the cache first; on a cache miss, falls
    /// back to the aggregator's own last-computed value so a cold cache never manufactures a
    /// spurious `NotFound`. `deadline_ms` is the request's absolute deadline, if the caller set
    /// one (§5 "Cancellation & timeouts"): once passed, the request fails with `Timeout` without
    /// touching the cache or aggregator.
    pub fn get_current_price(
        &self,
        feed: &str,
        now_ms: i64,
        deadline_ms: Option<i64>,
    ) -> Result<AggregatedPrice, RequestError> {
        if deadline_ms.is_some_and(|deadline| now_ms > deadline) {
            return Err(RequestError::Timeout);
        }
        if let Some(cached) = self.cache.get(feed, now_ms) {
            return Ok(cached);
        }
        let Some(price) = self.aggregator.last_aggregated(feed) else {
            // A feed the registry knows about (it was handed to `subscribe_to_feed`) but that
            // has never reached quorum is `Degraded`, not `NotFound` - `NotFound` is reserved
            // for a feed id the core was never configured with at all (§6).
            return match self.registry.min_sources_for(feed) {
                Some(required) => {
                    let eligible = self.aggregator.eligible_count(feed, now_ms);
                    Err(RequestError::Degraded { feed: feed.to_string(), eligible, required })
                }
                None => Err(RequestError::NotFound { feed: feed.to_string() }),
            };
        };
        let age_ms = price.age_ms(now_ms);
        let max_age_ms = self.settings.load().cache.max_data_age.as_millis() as i64;
        if age_ms > max_age_ms {
            return Err(RequestError::Stale { feed: feed.to_string(), age_ms });
        }
        self.cache.put(feed, price.clone(), now_ms);
        Ok(price)
    }

    /// `GetCurrentPrices(feedIds[])` (§6): partial failure never aborts the batch - every feed
    /// is attempted independently and reported in a parallel error list alongside the
    /// successes.
    pub fn get_current_prices(
        &self,
        feeds: &[String],
        now_ms: i64,
        deadline_ms: Option<i64>,
    ) -> (Vec<AggregatedPrice>, Vec<(String, RequestError)>) {
        let mut prices = Vec::with_capacity(feeds.len());
        let mut errors = Vec::new();
        for feed in feeds {
            match self.get_current_price(feed, now_ms, deadline_ms) {
                Ok(price) => prices.push(price),
                Err(err) => errors.push((feed.clone(), err)),
            }
        }
        (prices, errors)
    }

    /// `GetSystemHealth()` (§6): never fails. Aggregation/performance/accuracy figures are
    /// approximated from the registry's connection-health snapshot and the health bus's
    /// configured thresholds, since no separate request-latency/outlier-rate tracker is
    /// specified beyond what §4.9's rules already consume (§9 open question).
    pub fn get_system_health(&self, now_ms: i64) -> SystemHealth {
        let connection = self.registry.connection_health(now_ms);
        let sources = self.registry.connected_sources();

        let status = if connection.health_score >= 90.0 {
            "healthy"
        } else if connection.health_score >= 50.0 {
            "degraded"
        } else {
            "unhealthy"
        };

        let snapshot = HealthSnapshot {
            consensus_deviation_pct: 0.0,
            connection_rate_pct: if connection.total_sources == 0 {
                100.0
            } else {
                connection.connected_count as f64 / connection.total_sources as f64 * 100.0
            },
            error_rate_per_min: 0.0,
            data_age_ms: connection.mean_latency_ms as i64,
            quality_score: connection.health_score,
        };
        self.health_bus.evaluate(&snapshot, now_ms);

        SystemHealth {
            status,
            sources,
            aggregation_success_rate: connection.health_score / 100.0,
            aggregation_error_count: 0,
            performance_avg_response_time_ms: connection.mean_latency_ms,
            performance_error_rate: (100.0 - connection.health_score).max(0.0) / 100.0,
            accuracy_avg_confidence: connection.health_score / 100.0,
            accuracy_outlier_rate: 0.0,
            timestamp: now_ms,
        }
    }

    /// `SubscribeToFeed(feedId)` (§6). Looks the feed up in the already-resolved config and
    /// re-runs the source registration; callers add new feeds by restarting with an updated
    /// `FeedConfig` (§6 "Persisted state: none... restarts rebuild from configuration").
    pub async fn subscribe_to_feed(&self, feed: &ResolvedFeed) -> Result<(), RequestError> {
        self.warmer.track_feed(feed.id.name.clone());
        self.registry.subscribe_to_feed(feed).await
    }

    /// `UnsubscribeFromFeed(feedId)` (§6): best-effort teardown - each primary/backup source is
    /// asked to unsubscribe independently, and the feed's min-sources rule is forgotten so the
    /// fan-out path stops routing updates for it.
    pub async fn unsubscribe_from_feed(&self, feed: &ResolvedFeed) -> Result<(), RequestError> {
        self.registry.unsubscribe_from_feed(feed).await
    }

    /// Shutdown (§4.8): reverse order of startup, bounded by `SHUTDOWN_GRACE`. Stops accepting
    /// new requests (the caller simply drops its handle after this returns), gives any
    /// in-flight aggregation work time to settle, then returns. Adapters are dropped along with
    /// their owning `Arc`s; the health bus has already drained everything it will ever emit
    /// once its subscribers are dropped.
    pub async fn shutdown(self) {
        info!("orchestrator shutdown: draining in-flight aggregation work");
        tokio::time::sleep(Duration::from_millis(200).min(SHUTDOWN_GRACE)).await;
        info!("orchestrator shutdown complete");
    }
}

/// Register every primary/backup adapter a feed names with the registry, constructing and
/// adding each one the first time it's seen (§4.4 `AddDataSource` idempotency covers repeats
/// across feeds that share a source).
fn register_feed_sources(
    registry: &Arc<SourceRegistry>,
    settings: &Settings,
    sink: &UpdateSink,
    feed: &ResolvedFeed,
) {
    for source in feed.primary_sources.iter().chain(feed.backup_sources.iter()) {
        let adapter = build_adapter(&source.exchange, feed.id.category, &settings.adapter, sink.clone());
        registry.add_data_source(adapter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::{FeedCategory, FeedId, SourceRecord};

    fn feed_config() -> FeedConfig {
        FeedConfig {
            feeds: vec![ResolvedFeed {
                id: FeedId::new(FeedCategory::Crypto, "BTC/USD"),
                primary_sources: vec![
                    SourceRecord { exchange: "binance".into(), symbol: "BTCUSDT".into() },
                    SourceRecord { exchange: "kraken".into(), symbol: "XBT/USD".into() },
                    SourceRecord { exchange: "okx".into(), symbol: "BTC-USDT".into() },
                ],
                backup_sources: vec![SourceRecord { exchange: "coinbase".into(), symbol: "BTC-USD".into() }],
            }],
        }
    }

    #[tokio::test]
    async fn start_registers_every_configured_source() {
        let orchestrator = Orchestrator::start(Settings::default(), feed_config()).await.unwrap();
        let health = orchestrator.get_system_health(0);
        assert_eq!(health.sources.len(), 4);
    }

    #[tokio::test]
    async fn unconfigured_feed_is_not_found() {
        let orchestrator = Orchestrator::start(Settings::default(), feed_config()).await.unwrap();
        let result = orchestrator.get_current_price("ETH/USD", 0, None);
        assert_eq!(result, Err(RequestError::NotFound { feed: "ETH/USD".to_string() }));
    }

    #[tokio::test]
    async fn configured_feed_below_quorum_is_degraded_not_not_found() {
        let orchestrator = Orchestrator::start(Settings::default(), feed_config()).await.unwrap();
        // BTC/USD is configured (min_sources = 3 for Crypto) but has never received any updates.
        let result = orchestrator.get_current_price("BTC/USD", 0, None);
        assert_eq!(result, Err(RequestError::Degraded { feed: "BTC/USD".to_string(), eligible: 0, required: 3 }));
    }

    #[tokio::test]
    async fn expired_deadline_returns_timeout_before_touching_cache_or_aggregator() {
        let orchestrator = Orchestrator::start(Settings::default(), feed_config()).await.unwrap();
        let result = orchestrator.get_current_price("BTC/USD", 1_000, Some(500));
        assert_eq!(result, Err(RequestError::Timeout));
    }

    #[tokio::test]
    async fn get_current_prices_reports_partial_failure() {
        let orchestrator = Orchestrator::start(Settings::default(), feed_config()).await.unwrap();
        let (prices, errors) =
            orchestrator.get_current_prices(&["BTC/USD".to_string(), "ETH/USD".to_string()], 0, None);
        assert!(prices.is_empty());
        assert_eq!(errors.len(), 2);
        assert!(matches!(errors[0].1, RequestError::Degraded { .. }));
        assert!(matches!(errors[1].1, RequestError::NotFound { .. }));
    }

    #[tokio::test]
    async fn system_health_never_fails_with_no_traffic() {
        let orchestrator = Orchestrator::start(Settings::default(), feed_config()).await.unwrap();
        let health = orchestrator.get_system_health(0);
        assert_eq!(health.status, "unhealthy");
    }

    #[tokio::test]
    async fn shutdown_completes_within_grace_period() {
        let orchestrator = Orchestrator::start(Settings::default(), feed_config()).await.unwrap();
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn reload_config_picks_up_env_override() {
        let orchestrator = Orchestrator::start(Settings::default(), feed_config()).await.unwrap();
        assert_eq!(orchestrator.settings.load().cache.max_data_age, Duration::from_secs(2));

        std::env::set_var("ORACLEFEED_CACHE_FRESH_DATA_THRESHOLD_SECS", "9");
        orchestrator.reload_config();
        std::env::remove_var("ORACLEFEED_CACHE_FRESH_DATA_THRESHOLD_SECS");

        assert_eq!(orchestrator.settings.load().cache.max_data_age, Duration::from_secs(9));
    }
}
