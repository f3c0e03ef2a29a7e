//! Feed identity and the `feeds.json` configuration shape (§3, §6).
//!
//! Loading and hot-reloading the file itself is an external collaborator's job; this module
//! only defines the record shapes the core accepts and the normalization rules it must
//! preserve once it has them.

use serde::{Deserialize, Serialize};

/// `FeedId.category` (§3). Drives the per-category minimum-sources constraint (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedCategory {
    Crypto,
    Forex,
    Commodity,
    Stock,
}

impl FeedCategory {
    /// Category-configurable `minSources` default (§3 invariants, §6).
    pub fn default_min_sources(self) -> usize {
        match self {
            Self::Crypto => 3,
            Self::Forex | Self::Commodity | Self::Stock => 2,
        }
    }
}

/// `{category, name}` (§3). Equality is structural, so `FeedId` can key a `HashMap` directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedId {
    pub category: FeedCategory,
    pub name: String,
}

impl FeedId {
    pub fn new(category: FeedCategory, name: impl Into<String>) -> Self {
        Self {
            category,
            name: normalize_feed_name(&name.into()),
        }
    }
}

impl std::fmt::Display for FeedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:{}", self.category, self.name)
    }
}

/// USDT <-> USD normalization at match time (§6): `BASE/USDT` and `BASE/USD` are the same feed.
/// Canonical form keeps `USD` so lookups are stable regardless of which spelling a config used.
pub fn normalize_feed_name(name: &str) -> String {
    if let Some(base) = name.strip_suffix("/USDT") {
        return format!("{base}/USD");
    }
    name.to_string()
}

/// One `(exchange, exchange-symbol)` entry in a feed's source list (§3, §6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub exchange: String,
    pub symbol: String,
}

/// One record of the `feeds.json` sequence (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedRecord {
    pub feed: FeedRef,
    pub sources: Vec<SourceRecord>,
}

/// The raw `{category, name}` pair as it appears in a `feeds.json` record, before the
/// symbol-filter/normalization pass turns it into a resolved [`FeedId`] + source list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedRef {
    pub category: FeedCategory,
    pub name: String,
}

/// Is `symbol` a perpetual-swap tag the core must filter (§6)? Symbols ending in `:USDT` are
/// filtered; symbols containing `:` that don't match that simple pattern are also filtered.
pub fn is_filtered_perpetual_symbol(symbol: &str) -> bool {
    symbol.contains(':')
}

/// The resolved, in-memory feed topology handed to the orchestrator (§1A: "the core accepts a
/// freshly parsed `FeedConfig` value from its caller"). Built once from a sequence of
/// [`FeedRecord`]s; unknown exchange names are tolerated and routed through the CCXT-bridged
/// adapter path with the exchange name used verbatim as the CCXT id (§6).
#[derive(Debug, Clone, Default)]
pub struct FeedConfig {
    pub feeds: Vec<ResolvedFeed>,
}

#[derive(Debug, Clone)]
pub struct ResolvedFeed {
    pub id: FeedId,
    pub primary_sources: Vec<SourceRecord>,
    pub backup_sources: Vec<SourceRecord>,
}

impl FeedConfig {
    /// Parse a `feeds.json` record sequence into a resolved topology, applying the
    /// perpetual-symbol filter and USDT/USD name normalization (§6). The first
    /// `gracefulDegradationThreshold`-worth of sources (by config convention, all sources
    /// listed for a feed up to the category minimum) are treated as primaries; any additional
    /// configured sources are backups available to the failover coordinator (§4.3).
    pub fn from_records(records: Vec<FeedRecord>) -> Result<Self, crate::error::RequestError> {
        let mut feeds = Vec::with_capacity(records.len());
        for record in records {
            let id = FeedId::new(record.feed.category, record.feed.name);
            let min_sources = id.category.default_min_sources();

            let filtered: Vec<SourceRecord> = record
                .sources
                .into_iter()
                .filter(|s| !is_filtered_perpetual_symbol(&s.symbol))
                .collect();

            if filtered.is_empty() {
                return Err(crate::error::RequestError::ConfigInvalid {
                    detail: format!("feed {id} has no usable sources after symbol filtering"),
                });
            }

            let split = filtered.len().min(min_sources.max(1));
            let (primary_sources, backup_sources) = filtered.split_at(split);
            feeds.push(ResolvedFeed {
                id,
                primary_sources: primary_sources.to_vec(),
                backup_sources: backup_sources.to_vec(),
            });
        }
        Ok(Self { feeds })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usdt_normalizes_to_usd() {
        assert_eq!(normalize_feed_name("BTC/USDT"), "BTC/USD");
        assert_eq!(normalize_feed_name("BTC/USD"), "BTC/USD");
    }

    #[test]
    fn feed_id_equality_is_structural_post_normalization() {
        let a = FeedId::new(FeedCategory::Crypto, "BTC/USDT");
        let b = FeedId::new(FeedCategory::Crypto, "BTC/USD");
        assert_eq!(a, b);
    }

    #[test]
    fn perpetual_tagged_symbols_are_filtered() {
        assert!(is_filtered_perpetual_symbol("BTCUSDT:USDT"));
        assert!(is_filtered_perpetual_symbol("BTC:PERP"));
        assert!(!is_filtered_perpetual_symbol("BTCUSDT"));
    }

    #[test]
    fn from_records_splits_primaries_by_category_minimum() {
        let records = vec![FeedRecord {
            feed: FeedRef {
                category: FeedCategory::Crypto,
                name: "BTC/USD".into(),
            },
            sources: vec![
                SourceRecord { exchange: "binance".into(), symbol: "BTCUSDT".into() },
                SourceRecord { exchange: "kraken".into(), symbol: "XBT/USD".into() },
                SourceRecord { exchange: "okx".into(), symbol: "BTC-USDT".into() },
                SourceRecord { exchange: "coinbase".into(), symbol: "BTC-USD".into() },
            ],
        }];
        let config = FeedConfig::from_records(records).unwrap();
        assert_eq!(config.feeds.len(), 1);
        assert_eq!(config.feeds[0].primary_sources.len(), 3);
        assert_eq!(config.feeds[0].backup_sources.len(), 1);
    }

    #[test]
    fn from_records_rejects_feed_with_only_filtered_sources() {
        let records = vec![FeedRecord {
            feed: FeedRef {
                category: FeedCategory::Crypto,
                name: "BTC/USD".into(),
            },
            sources: vec![SourceRecord {
                exchange: "binance".into(),
                symbol: "BTCUSDT:USDT".into(),
            }],
        }];
        assert!(FeedConfig::from_records(records).is_err());
    }

    #[test]
    fn unknown_exchange_name_is_tolerated_as_ccxt_bridge_id() {
        let records = vec![FeedRecord {
            feed: FeedRef {
                category: FeedCategory::Forex,
                name: "EUR/USD".into(),
            },
            sources: vec![
                SourceRecord { exchange: "some-ccxt-venue".into(), symbol: "EUR/USD".into() },
                SourceRecord { exchange: "another-ccxt-venue".into(), symbol: "EUR/USD".into() },
            ],
        }];
        let config = FeedConfig::from_records(records).unwrap();
        assert_eq!(config.feeds[0].primary_sources[0].exchange, "some-ccxt-venue");
    }
}
