//! Data manager / source registry (C4, §4.4). Owns the set of registered adapters, fans every
//! `PriceUpdate` out through health bookkeeping, the validator, and into the aggregator, and
//! answers the connection-health queries the orchestrator (C8) exposes publicly.
//!
//! Grounded on the teacher's `scrapers` module registry shape (a `HashMap<String, Arc<dyn
//! ...>>` keyed by exchange id, guarded by a single lock, with add/remove being plain map
//! operations) generalized to the spec's `Adapter` trait, and on
//! `route_quality::mitigation::MitigationController`'s pattern of subscribing to a breaker's
//! transition stream from a dedicated task rather than inlining failover decisions into the
//! hot path.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::adapters::{Adapter, UpdateSink};
use crate::aggregator::Aggregator;
use crate::config::HealthSettings;
use crate::error::AdapterError;
use crate::models::{CircuitStateKind, HealthStatus, SourceHealth};
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::failover::FailoverCoordinator;
use crate::validator::Validator;

/// Emitted for C9 (§4.4 "emits a `sourceError` event carrying the validation error").
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    SourceError { source: String, feed: String, message: String },
    AdapterError { source: String, error: AdapterError },
}

/// Aggregate connection snapshot (§4.4 `GetConnectionHealth`).
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    pub total_sources: usize,
    pub connected_count: usize,
    /// Approximated from update recency rather than measured round-trip time, since no adapter
    /// in this pipeline reports RTT directly (§9 open question).
    pub mean_latency_ms: f64,
    pub unhealthy: Vec<String>,
    pub health_score: f64,
}

struct FeedMeta {
    min_sources: usize,
}

/// Registered source bookkeeping plus the feed topology needed to route a `PriceUpdate` to the
/// right min-sources rule and cross-source window.
pub struct SourceRegistry {
    health_settings: HealthSettings,
    adapters: RwLock<HashMap<String, Arc<dyn Adapter>>>,
    source_health: Mutex<HashMap<String, SourceHealth>>,
    error_log: Mutex<HashMap<String, VecDeque<i64>>>,
    feeds_by_symbol: RwLock<HashMap<String, FeedMeta>>,
    sink: UpdateSink,
    circuit_breaker: Arc<CircuitBreaker>,
    failover: Arc<FailoverCoordinator>,
    validator: Arc<Validator>,
    aggregator: Arc<Aggregator>,
    events: broadcast::Sender<RegistryEvent>,
    cross_source_window_ms: i64,
}

impl SourceRegistry {
    pub fn new(
        health_settings: HealthSettings,
        sink: UpdateSink,
        circuit_breaker: Arc<CircuitBreaker>,
        failover: Arc<FailoverCoordinator>,
        validator: Arc<Validator>,
        aggregator: Arc<Aggregator>,
        cross_source_window_ms: i64,
    ) -> Self {
        let (events, _) = broadcast::channel(512);
        Self {
            health_settings,
            adapters: RwLock::new(HashMap::new()),
            source_health: Mutex::new(HashMap::new()),
            error_log: Mutex::new(HashMap::new()),
            feeds_by_symbol: RwLock::new(HashMap::new()),
            sink,
            circuit_breaker,
            failover,
            validator,
            aggregator,
            events,
            cross_source_window_ms,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// `AddDataSource(source)` (§4.4): idempotent, keyed by `exchange_name()`.
    pub fn add_data_source(&self, adapter: Arc<dyn Adapter>) {
        let id = adapter.exchange_name().to_string();
        let mut adapters = self.adapters.write();
        if adapters.contains_key(&id) {
            return;
        }
        self.source_health.lock().entry(id.clone()).or_insert_with(|| SourceHealth::new(id.clone()));
        info!(source = id, "data source registered");
        adapters.insert(id, adapter);
    }

    /// `RemoveDataSource(id)` (§4.4): idempotent.
    pub fn remove_data_source(&self, id: &str) {
        if self.adapters.write().remove(id).is_some() {
            info!(source = id, "data source removed");
        }
    }

    /// `SubscribeToFeed(feedId)` (§4.4): resolves the feed's `(exchange, symbol)` list and asks
    /// each selected adapter to subscribe. Also registers the feed with the failover
    /// coordinator and records its `minSources` rule for the fan-out path.
    pub async fn subscribe_to_feed(&self, feed: &crate::feeds::ResolvedFeed) -> Result<(), crate::error::RequestError> {
        let min_sources = feed.id.category.default_min_sources();
        self.feeds_by_symbol.write().insert(feed.id.name.clone(), FeedMeta { min_sources });

        let primaries: Vec<String> = feed.primary_sources.iter().map(|s| s.exchange.clone()).collect();
        let backups: Vec<String> = feed.backup_sources.iter().map(|s| s.exchange.clone()).collect();
        self.failover.register_feed(feed.id.name.clone(), primaries, backups);

        let adapters = self.adapters.read();
        for source in feed.primary_sources.iter().chain(feed.backup_sources.iter()) {
            let Some(adapter) = adapters.get(&source.exchange) else {
                warn!(exchange = source.exchange, feed = %feed.id, "subscribe requested for unregistered source");
                continue;
            };
            if let Err(err) = adapter.subscribe(std::slice::from_ref(&source.symbol)).await {
                warn!(exchange = source.exchange, feed = %feed.id, error = %err, "subscribe failed");
                let _ = self.events.send(RegistryEvent::AdapterError { source: source.exchange.clone(), error: err });
            }
        }
        Ok(())
    }

    /// `UnsubscribeFromFeed(feedId)` (§6): asks every primary/backup source adapter to drop the
    /// feed's symbol. Unlike `subscribe_to_feed`, an unregistered source is silently skipped
    /// rather than logged - by the time a feed is torn down its sources may already be gone.
    pub async fn unsubscribe_from_feed(&self, feed: &crate::feeds::ResolvedFeed) -> Result<(), crate::error::RequestError> {
        self.feeds_by_symbol.write().remove(&feed.id.name);
        let adapters = self.adapters.read();
        for source in feed.primary_sources.iter().chain(feed.backup_sources.iter()) {
            let Some(adapter) = adapters.get(&source.exchange) else { continue };
            if let Err(err) = adapter.unsubscribe(std::slice::from_ref(&source.symbol)).await {
                warn!(exchange = source.exchange, feed = %feed.id, error = %err, "unsubscribe failed");
                let _ = self.events.send(RegistryEvent::AdapterError { source: source.exchange.clone(), error: err });
            }
        }
        Ok(())
    }

    /// The `minSources` rule for a feed registered via `subscribe_to_feed`, if any. Used by the
    /// public API to tell a degraded-but-known feed apart from an unknown one (§6).
    pub fn min_sources_for(&self, feed: &str) -> Option<usize> {
        self.feeds_by_symbol.read().get(feed).map(|m| m.min_sources)
    }

    /// `GetConnectionHealth()` (§4.4): `connectedCount / totalSources * 100` minus a penalty for
    /// sources with a recent burst of errors (within `errorWindow`, reusing the health bus's
    /// window constant rather than introducing a second one - §9 open question).
    pub fn connection_health(&self, now_ms: i64) -> ConnectionHealth {
        let health = self.source_health.lock();
        let total_sources = health.len();
        let connected_count = health.values().filter(|h| h.status != HealthStatus::Unhealthy).count();
        let unhealthy: Vec<String> =
            health.values().filter(|h| h.status == HealthStatus::Unhealthy).map(|h| h.source.clone()).collect();

        let mean_latency_ms = {
            let latencies: Vec<f64> = health
                .values()
                .filter_map(|h| h.last_update)
                .map(|last| (now_ms - last).max(0) as f64)
                .collect();
            if latencies.is_empty() { 0.0 } else { latencies.iter().sum::<f64>() / latencies.len() as f64 }
        };

        let base_score = if total_sources == 0 { 0.0 } else { connected_count as f64 / total_sources as f64 * 100.0 };
        let penalty: f64 = {
            let error_log = self.error_log.lock();
            let window_start = now_ms - self.health_settings.error_window.as_millis() as i64;
            error_log
                .values()
                .map(|bursts| bursts.iter().filter(|&&t| t >= window_start).count() as f64 * 2.0)
                .sum::<f64>()
                .min(50.0)
        };

        ConnectionHealth {
            total_sources,
            connected_count,
            mean_latency_ms,
            unhealthy,
            health_score: (base_score - penalty).clamp(0.0, 100.0),
        }
    }

    /// `GetConnectedSources()` (§4.4): snapshot.
    pub fn connected_sources(&self) -> Vec<SourceHealth> {
        self.source_health.lock().values().cloned().collect()
    }

    /// The fan-out task (§4.4): drains the shared `UpdateSink` forever, routing every update
    /// through health bookkeeping, the validator, and into the aggregator.
    pub async fn run_fan_out(self: Arc<Self>, now_ms: impl Fn() -> i64) {
        loop {
            let updates = self.sink.drain().await;
            let now = now_ms();
            for update in updates {
                self.handle_update(update, now);
            }
        }
    }

    fn handle_update(&self, update: crate::models::PriceUpdate, now_ms: i64) {
        // Step 2 (§4.4): bump source health and the breaker's liveness signal unconditionally -
        // receiving *any* update, valid or not, proves the connection is alive.
        self.circuit_breaker.record_success(&update.source, now_ms);
        self.source_health
            .lock()
            .entry(update.source.clone())
            .or_insert_with(|| SourceHealth::new(update.source.clone()))
            .record_success(now_ms);

        let Some(min_sources) = self.feeds_by_symbol.read().get(&update.symbol).map(|m| m.min_sources) else {
            return;
        };

        // Step 1 (§4.4): validate with context from the aggregator's rolling buffer.
        let ctx = self.aggregator.validation_context(&update.symbol, &update.source, now_ms, self.cross_source_window_ms);
        let result = self.validator.validate(&update, &ctx, now_ms);

        if !result.is_valid {
            self.record_error(&update.source, now_ms);
            let message = result
                .errors
                .iter()
                .map(|e| format!("{}:{}", e.tier, e.severity))
                .collect::<Vec<_>>()
                .join(",");
            let _ = self.events.send(RegistryEvent::SourceError {
                source: update.source.clone(),
                feed: update.symbol.clone(),
                message,
            });
            return;
        }

        // Step 3 (§4.4): non-critical issues only down-weight confidence; still forwarded.
        let adjusted = update.with_adjusted_confidence(result.adjusted_confidence);
        self.aggregator.accept(&adjusted.symbol, adjusted, now_ms, min_sources);
    }

    fn record_error(&self, source: &str, now_ms: i64) {
        let mut log = self.error_log.lock();
        let window_start = now_ms - self.health_settings.error_window.as_millis() as i64;
        let entry = log.entry(source.to_string()).or_default();
        entry.push_back(now_ms);
        while entry.front().is_some_and(|&t| t < window_start) {
            entry.pop_front();
        }
    }

    /// Drive circuit-breaker transitions into failover decisions (§4.2 "consumers (C4, C9) use
    /// them for alerting and failover"). Runs as its own task, subscribed to the breaker's
    /// transition broadcast, so the hot update path never blocks on failover bookkeeping.
    pub async fn run_circuit_to_failover_bridge(self: Arc<Self>) {
        let mut transitions = self.circuit_breaker.subscribe();
        loop {
            match transitions.recv().await {
                Ok(transition) => {
                    let feeds = self.feeds_by_symbol.read();
                    for feed in feeds.keys() {
                        match transition.to {
                            CircuitStateKind::Open => self.failover.source_unhealthy(feed, &transition.source),
                            CircuitStateKind::Closed => self.failover.source_recovered(feed, &transition.source),
                            CircuitStateKind::HalfOpen => {}
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::feeds::{FeedCategory, FeedId, ResolvedFeed, SourceRecord};
    use crate::models::PriceUpdate;
    use async_trait::async_trait;

    struct StubAdapter {
        name: &'static str,
    }

    #[async_trait]
    impl Adapter for StubAdapter {
        fn exchange_name(&self) -> &'static str {
            self.name
        }
        fn category(&self) -> crate::feeds::FeedCategory {
            FeedCategory::Crypto
        }
        fn capabilities(&self) -> crate::adapters::Capabilities {
            crate::adapters::Capabilities { supports_stream: true, supports_rest: true, supports_volume: true }
        }
        fn tier(&self) -> crate::adapters::Tier {
            crate::adapters::Tier::Native
        }
        async fn connect(&self) -> Result<(), AdapterError> {
            Ok(())
        }
        async fn subscribe(&self, _symbols: &[String]) -> Result<(), AdapterError> {
            Ok(())
        }
        async fn unsubscribe(&self, _symbols: &[String]) -> Result<(), AdapterError> {
            Ok(())
        }
        async fn fetch_ticker_rest(&self, symbol: &str) -> Result<PriceUpdate, AdapterError> {
            Ok(PriceUpdate::new(symbol, 1.0, 0, self.name))
        }
        async fn health_check(&self) -> bool {
            true
        }
        fn to_exchange_symbol(&self, canonical: &str) -> String {
            canonical.to_string()
        }
        fn normalize_symbol(&self, exchange_symbol: &str) -> String {
            exchange_symbol.to_string()
        }
    }

    fn registry() -> (Arc<SourceRegistry>, Arc<Aggregator>) {
        let settings = Settings::default();
        let cb = Arc::new(CircuitBreaker::new(settings.circuit_breaker));
        let failover = Arc::new(FailoverCoordinator::new(settings.failover));
        let validator = Arc::new(Validator::new(settings.validator));
        let aggregator = Arc::new(Aggregator::new(settings.aggregator, cb.clone()));
        let sink = UpdateSink::new();
        let registry = Arc::new(SourceRegistry::new(
            settings.health,
            sink,
            cb,
            failover,
            validator,
            aggregator.clone(),
            settings.validator.cross_source_window.as_millis() as i64,
        ));
        (registry, aggregator)
    }

    #[test]
    fn add_data_source_is_idempotent() {
        let (registry, _agg) = registry();
        registry.add_data_source(Arc::new(StubAdapter { name: "binance" }));
        registry.add_data_source(Arc::new(StubAdapter { name: "binance" }));
        assert_eq!(registry.connected_sources().len(), 1);
    }

    #[test]
    fn remove_data_source_is_a_no_op_when_absent() {
        let (registry, _agg) = registry();
        registry.remove_data_source("ghost");
    }

    #[tokio::test]
    async fn subscribe_to_feed_registers_failover_topology() {
        let (registry, _agg) = registry();
        registry.add_data_source(Arc::new(StubAdapter { name: "binance" }));
        registry.add_data_source(Arc::new(StubAdapter { name: "kraken" }));
        let feed = ResolvedFeed {
            id: FeedId::new(FeedCategory::Crypto, "BTC/USD"),
            primary_sources: vec![
                SourceRecord { exchange: "binance".into(), symbol: "BTCUSDT".into() },
                SourceRecord { exchange: "kraken".into(), symbol: "XBT/USD".into() },
            ],
            backup_sources: vec![],
        };
        registry.subscribe_to_feed(&feed).await.unwrap();
        assert!(registry.feeds_by_symbol.read().contains_key("BTC/USD"));
    }

    #[test]
    fn connection_health_is_zero_with_no_sources() {
        let (registry, _agg) = registry();
        let health = registry.connection_health(0);
        assert_eq!(health.total_sources, 0);
        assert_eq!(health.health_score, 0.0);
    }

    #[test]
    fn valid_update_is_forwarded_to_aggregator() {
        let (registry, aggregator) = registry();
        registry.feeds_by_symbol.write().insert("BTC/USD".into(), FeedMeta { min_sources: 1 });
        registry.handle_update(PriceUpdate::new("BTC/USD", 30_000.0, 1_000, "binance").with_confidence(1.0), 1_000);
        assert!(aggregator.last_aggregated("BTC/USD").is_some());
    }

    #[test]
    fn invalid_update_is_not_forwarded_and_emits_source_error() {
        let (registry, aggregator) = registry();
        registry.feeds_by_symbol.write().insert("BTC/USD".into(), FeedMeta { min_sources: 1 });
        let mut rx = registry.subscribe();
        // stale beyond max_age is a CRITICAL validation error
        registry.handle_update(PriceUpdate::new("BTC/USD", 30_000.0, 0, "binance").with_confidence(1.0), 100_000);
        assert!(aggregator.last_aggregated("BTC/USD").is_none());
        assert!(rx.try_recv().is_ok());
    }
}
