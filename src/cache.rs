//! Freshness cache and warmer (C7, §4.7). A short-TTL read-through cache sitting in front of
//! the aggregator, with strict staleness rejection on the read path and a cooperative
//! interval-tiered warmer that refills entries before readers ever see a miss.
//!
//! Grounded on `scrapers::binance_price_feed`'s nearest-timestamp `mid_near` lookup for the
//! strict-freshness read gate, and `route_quality::prober::RouteQualityProber::run`'s
//! multi-`tokio::time::interval` `select!` loop for the warmer's aggressive/predictive/
//! maintenance tiers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::aggregator::Aggregator;
use crate::config::CacheSettings;
use crate::models::AggregatedPrice;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: AggregatedPrice,
    /// Epoch ms this entry was written into the cache (distinct from `value.timestamp`, the
    /// source-observed time; eviction and the warmer rank by access, the read gate checks
    /// `value.timestamp`).
    last_access: i64,
    access_count: u64,
}

/// Read-through cache (§4.7 1-3). A miss is either "never populated" or "stale beyond
/// `freshDataThreshold`"; both are reported identically to the caller, who falls back to the
/// aggregator directly (C8's `get_current_price`).
pub struct FreshnessCache {
    settings: CacheSettings,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl FreshnessCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self { settings, entries: RwLock::new(HashMap::new()) }
    }

    /// `Get(feedId)` (§4.7 step 1-2): returns the entry iff `now - entry.timestamp <=
    /// freshDataThreshold`, else reports a miss. Every read - hit or miss - records an access
    /// for the warmer's ranking (§4.7 step 2 "on every read, record access").
    pub fn get(&self, feed: &str, now_ms: i64) -> Option<AggregatedPrice> {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(feed) else { return None };
        entry.last_access = now_ms;
        entry.access_count += 1;

        if now_ms - entry.value.timestamp > self.settings.fresh_data_threshold.as_millis() as i64 {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Write-through from the aggregator (§4.6 "keep the downstream cache warm") or the warmer.
    /// Triggers LRU eviction if this insert pushes the cache past `maxEntries` (§4.7
    /// "Eviction").
    pub fn put(&self, feed: &str, value: AggregatedPrice, now_ms: i64) {
        let mut entries = self.entries.write();
        entries
            .entry(feed.to_string())
            .and_modify(|e| {
                e.value = value.clone();
                e.last_access = now_ms;
            })
            .or_insert_with(|| CacheEntry { value, last_access: now_ms, access_count: 0 });

        if entries.len() > self.settings.max_entries {
            self.evict_locked(&mut entries, now_ms);
        }
    }

    /// Invalidation hook (§4.6 emission -> §4.7 invalidation): called whenever the aggregator
    /// emits a new `AggregatedPrice`, so the cache never serves an entry the aggregator has
    /// already superseded.
    pub fn invalidate_on_price_update(&self, update: &AggregatedPrice, now_ms: i64) {
        self.put(&update.symbol, update.clone(), now_ms);
    }

    /// Evict the oldest-accessed 15% of entries (§4.7 "On eviction of 15% of entries when
    /// full"), never touching an entry still below `freshDataThreshold` (§4.7 "never evict an
    /// entry whose age is below freshDataThreshold").
    fn evict_locked(&self, entries: &mut HashMap<String, CacheEntry>, now_ms: i64) {
        let evictable_count = ((entries.len() as f64) * self.settings.eviction_fraction).ceil() as usize;
        let fresh_cutoff = self.settings.fresh_data_threshold.as_millis() as i64;

        let mut candidates: Vec<(String, i64)> = entries
            .iter()
            .filter(|(_, e)| now_ms - e.value.timestamp >= fresh_cutoff)
            .map(|(k, e)| (k.clone(), e.last_access))
            .collect();
        candidates.sort_by_key(|(_, last_access)| *last_access);

        let evicted = candidates.len().min(evictable_count);
        for (feed, _) in candidates.into_iter().take(evicted) {
            entries.remove(&feed);
        }
        debug!(evicted, total = entries.len(), "cache eviction pass");
    }

    /// Ranking input for the warmer (§4.7 "Ranking weights recency, frequency, and configured
    /// priority"): feeds whose entry is absent or already stale, ordered by a recency+frequency
    /// score so the warmer refreshes the ones that matter most first.
    fn stale_or_missing_ranked(&self, feeds: &[String], now_ms: i64) -> Vec<String> {
        let entries = self.entries.read();
        let fresh_cutoff = self.settings.fresh_data_threshold.as_millis() as i64;

        let mut scored: Vec<(String, f64)> = feeds
            .iter()
            .filter_map(|feed| {
                let stale_or_missing = match entries.get(feed) {
                    None => true,
                    Some(e) => now_ms - e.value.timestamp > fresh_cutoff,
                };
                if !stale_or_missing {
                    return None;
                }
                let recency_ms = entries.get(feed).map(|e| now_ms - e.last_access).unwrap_or(i64::MAX);
                let frequency = entries.get(feed).map(|e| e.access_count).unwrap_or(0);
                // higher frequency and lower recency (accessed more recently) rank first
                let score = frequency as f64 - (recency_ms as f64 / 1_000.0);
                Some((feed.clone(), score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(feed, _)| feed).collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// Upper bound on feeds refreshed per warming pass, so a large feed universe doesn't turn one
/// warming tick into an unbounded burst against the aggregator.
const WARM_BATCH_SIZE: usize = 50;

/// Cooperative warmer (§4.7 "Warmer"). Owns no state of its own beyond the feed universe it was
/// told to track; every refresh reads straight from the aggregator's already-computed
/// `last_aggregated`, so warming never blocks a reader and never performs I/O.
pub struct Warmer {
    settings: CacheSettings,
    cache: Arc<FreshnessCache>,
    aggregator: Arc<Aggregator>,
    tracked_feeds: RwLock<Vec<String>>,
}

impl Warmer {
    pub fn new(settings: CacheSettings, cache: Arc<FreshnessCache>, aggregator: Arc<Aggregator>) -> Self {
        Self { settings, cache, aggregator, tracked_feeds: RwLock::new(Vec::new()) }
    }

    pub fn track_feed(&self, feed: impl Into<String>) {
        self.tracked_feeds.write().push(feed.into());
    }

    /// Run the three warming tiers forever on their own `tokio::time::interval`s (§4.7
    /// "aggressive 3s, predictive 7s, maintenance 15s"), grounded on
    /// `RouteQualityProber::run`'s `select!`-over-several-intervals loop.
    pub async fn run(&self, now_ms: impl Fn() -> i64) {
        let mut aggressive = interval(self.settings.warm_aggressive_interval);
        let mut predictive = interval(self.settings.warm_predictive_interval);
        let mut maintenance = interval(self.settings.warm_maintenance_interval);

        loop {
            tokio::select! {
                _ = aggressive.tick() => self.warm_pass("aggressive", WARM_BATCH_SIZE, now_ms()),
                _ = predictive.tick() => self.warm_pass("predictive", WARM_BATCH_SIZE / 2, now_ms()),
                _ = maintenance.tick() => self.warm_pass("maintenance", WARM_BATCH_SIZE / 5, now_ms()),
            }
        }
    }

    /// One warming pass: pick the top-N stale-or-missing tracked feeds and pull their current
    /// `AggregatedPrice` from the aggregator, if it has one. Never blocks (`last_aggregated` is
    /// a plain lock read); if the aggregator has nothing fresher than what's already cached,
    /// this is a no-op for that feed (§4.7 "if C6 is saturated, the warmer backs off").
    fn warm_pass(&self, tier: &str, batch_size: usize, now_ms: i64) {
        let feeds = self.tracked_feeds.read().clone();
        let ranked = self.cache.stale_or_missing_ranked(&feeds, now_ms);

        let mut warmed = 0;
        for feed in ranked.into_iter().take(batch_size) {
            match self.aggregator.last_aggregated(&feed) {
                Some(price) => {
                    self.cache.put(&feed, price, now_ms);
                    warmed += 1;
                }
                None => {
                    warn!(feed, tier, "warmer found no aggregated price to refresh with");
                }
            }
        }
        if warmed > 0 {
            debug!(tier, warmed, "cache warming pass complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn settings() -> CacheSettings {
        CacheSettings {
            ttl: Duration::from_secs(1),
            fresh_data_threshold: Duration::from_secs(2),
            max_data_age: Duration::from_secs(2),
            max_entries: 4,
            eviction_fraction: 0.5,
            warm_aggressive_interval: Duration::from_secs(3),
            warm_predictive_interval: Duration::from_secs(7),
            warm_maintenance_interval: Duration::from_secs(15),
        }
    }

    fn price(symbol: &str, ts: i64) -> AggregatedPrice {
        AggregatedPrice {
            symbol: symbol.to_string(),
            price: 30_000.0,
            timestamp: ts,
            sources: BTreeSet::from(["binance".to_string()]),
            confidence: 1.0,
            consensus_score: 1.0,
        }
    }

    #[test]
    fn fresh_entry_is_served() {
        let cache = FreshnessCache::new(settings());
        cache.put("BTC/USD", price("BTC/USD", 1_000), 1_000);
        assert_eq!(cache.get("BTC/USD", 1_500).unwrap().price, 30_000.0);
    }

    #[test]
    fn entry_older_than_fresh_threshold_is_a_miss() {
        let cache = FreshnessCache::new(settings());
        cache.put("BTC/USD", price("BTC/USD", 1_000), 1_000);
        assert!(cache.get("BTC/USD", 1_000 + 2_001).is_none());
    }

    #[test]
    fn missing_feed_is_a_miss() {
        let cache = FreshnessCache::new(settings());
        assert!(cache.get("ETH/USD", 0).is_none());
    }

    #[test]
    fn eviction_never_removes_fresh_entries() {
        let cache = FreshnessCache::new(settings());
        for i in 0..5 {
            cache.put(&format!("F{i}"), price(&format!("F{i}"), 1_000), 1_000);
        }
        // all entries are fresh at the same timestamp the insert happened; none is evictable
        assert_eq!(cache.len(), 5);
    }

    #[test]
    fn eviction_removes_stale_entries_first_when_over_capacity() {
        let cache = FreshnessCache::new(settings());
        cache.put("STALE1", price("STALE1", 0), 0);
        cache.put("STALE2", price("STALE2", 0), 0);
        cache.put("STALE3", price("STALE3", 0), 0);
        cache.put("STALE4", price("STALE4", 0), 0);
        // now well past fresh_data_threshold (2s) for the first four; this insert is the one
        // that pushes the cache past max_entries and triggers eviction
        cache.put("FRESH", price("FRESH", 10_000), 10_000);
        assert!(cache.len() <= 4);
        assert!(cache.get("FRESH", 10_000).is_some());
    }

    #[test]
    fn invalidate_on_price_update_overwrites_existing_entry() {
        let cache = FreshnessCache::new(settings());
        cache.put("BTC/USD", price("BTC/USD", 1_000), 1_000);
        let mut updated = price("BTC/USD", 2_000);
        updated.price = 31_000.0;
        cache.invalidate_on_price_update(&updated, 2_000);
        assert_eq!(cache.get("BTC/USD", 2_000).unwrap().price, 31_000.0);
    }

    #[test]
    fn stale_or_missing_ranked_skips_fresh_entries() {
        let cache = FreshnessCache::new(settings());
        cache.put("BTC/USD", price("BTC/USD", 1_000), 1_000);
        let ranked = cache.stale_or_missing_ranked(&["BTC/USD".to_string(), "ETH/USD".to_string()], 1_500);
        assert_eq!(ranked, vec!["ETH/USD".to_string()]);
    }
}
