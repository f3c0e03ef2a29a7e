//! Adapter interface (C1, §4.1) and the per-exchange implementations.
//!
//! Each adapter owns one physical connection, translates venue-specific messages into
//! [`PriceUpdate`](crate::models::PriceUpdate), and pushes them through a bounded sink supplied
//! at construction (§4.1 "Push channel"). Connection-state transitions and classified errors
//! surface on separate broadcast channels (§4.1 "Event callbacks").

pub mod binance;
pub mod ccxt_bridge;
pub mod coinbase;
pub mod crypto_com;
pub mod kraken;
pub mod okx;
pub mod runtime;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};

use crate::error::AdapterError;
use crate::feeds::FeedCategory;
use crate::models::PriceUpdate;

/// Per-exchange capability advertisement (§6 Adapter SPI).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_stream: bool,
    pub supports_rest: bool,
    pub supports_volume: bool,
}

/// Integration depth (§GLOSSARY Tier): Tier 1 native adapters get a higher aggregator weight
/// multiplier than Tier 2 CCXT-bridged venues (§4.6). Affects weight only, never eligibility
/// (§9 open question).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Native,
    CcxtBridged,
}

impl Tier {
    pub fn weight_multiplier(self) -> f64 {
        match self {
            Self::Native => 1.4,
            Self::CcxtBridged => 1.0,
        }
    }
}

/// Connection-state transition, broadcast on an adapter's event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// The sink an adapter pushes normalized updates into (§4.1 "Push channel", §5
/// "Back-pressure"). A single-slot-per-`(symbol, source)` mailbox rather than a plain bounded
/// channel: pushing never blocks and never fails, and a push for a key that already holds an
/// undrained value *replaces* it, which is the strongest possible reading of "if the sink is
/// full, the oldest value for that `(feed, source)` pair is dropped (newer is always
/// preferred)" - there is never more than one buffered value per key to begin with. The
/// registry (C4) drains the whole mailbox every time it is notified.
#[derive(Clone)]
pub struct UpdateSink {
    slots: Arc<Mutex<HashMap<(String, String), PriceUpdate>>>,
    notify: Arc<Notify>,
}

impl UpdateSink {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Push a normalized update. Never suspends, never fails; a prior undrained update for the
    /// same `(symbol, source)` key is silently overwritten.
    pub fn push(&self, update: PriceUpdate) {
        let key = (update.symbol.clone(), update.source.clone());
        self.slots.lock().insert(key, update);
        self.notify.notify_one();
    }

    /// Suspend until at least one update has been pushed, then drain everything currently
    /// buffered. Used by the registry's fan-out task (§4.4).
    pub async fn drain(&self) -> Vec<PriceUpdate> {
        loop {
            let notified = self.notify.notified();
            {
                let mut slots = self.slots.lock();
                if !slots.is_empty() {
                    return slots.drain().map(|(_, v)| v).collect();
                }
            }
            notified.await;
        }
    }
}

impl Default for UpdateSink {
    fn default() -> Self {
        Self::new()
    }
}

/// The adapter-to-orchestrator event/error channels (§4.1 "Event callbacks").
#[derive(Clone)]
pub struct AdapterChannels {
    pub events: broadcast::Sender<ConnectionEvent>,
    pub errors: broadcast::Sender<AdapterError>,
}

impl AdapterChannels {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        let (errors, _) = broadcast::channel(64);
        Self { events, errors }
    }
}

impl Default for AdapterChannels {
    fn default() -> Self {
        Self::new()
    }
}

/// The adapter SPI (§4.1, §6). Every method is async because every operation it performs -
/// connect, subscribe, REST fetch, health probe - is a suspension point (§5).
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Stable identifier, e.g. `"binance"`, used as `PriceUpdate.source` and as the
    /// `(source, symbol)` subscription key (§3 invariants).
    fn exchange_name(&self) -> &'static str;

    fn category(&self) -> FeedCategory;

    fn capabilities(&self) -> Capabilities;

    fn tier(&self) -> Tier;

    /// Establish the streaming transport. Idempotent: calling on an already-connected adapter
    /// returns immediately (§4.1).
    async fn connect(&self) -> Result<(), AdapterError>;

    /// Idempotent with respect to the subscription set; silently skips already-subscribed
    /// pairs (§4.1).
    async fn subscribe(&self, symbols: &[String]) -> Result<(), AdapterError>;

    async fn unsubscribe(&self, symbols: &[String]) -> Result<(), AdapterError>;

    /// Synchronous HTTP fallback returning a single update (§4.1).
    async fn fetch_ticker_rest(&self, symbol: &str) -> Result<PriceUpdate, AdapterError>;

    /// Prefers a REST probe if the stream is unavailable (§4.1).
    async fn health_check(&self) -> bool;

    /// Adapter-private symbol mapping: canonical `BASE/QUOTE` -> exchange-native form.
    fn to_exchange_symbol(&self, canonical: &str) -> String;

    /// Adapter-private symbol mapping: exchange-native form -> canonical `BASE/QUOTE`.
    /// Must satisfy `normalize(to_exchange_symbol(x)) == x` for every symbol the adapter
    /// advertises (§4.1, P5).
    fn normalize_symbol(&self, exchange_symbol: &str) -> String;
}

/// Reject any raw message missing symbol, price, or timestamp, or whose price does not parse
/// as a positive finite number (§4.1 "Validation of raw message"). Adapters call this before
/// constructing a `PriceUpdate` from venue-specific JSON.
pub fn validate_raw_fields(
    symbol: Option<&str>,
    price: Option<f64>,
    timestamp: Option<i64>,
) -> Result<(String, f64, i64), AdapterError> {
    let symbol = symbol
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AdapterError::parse("missing symbol"))?;
    let price = price.ok_or_else(|| AdapterError::parse("missing price"))?;
    if !price.is_finite() || price <= 0.0 {
        return Err(AdapterError::parse(format!("non-positive or non-finite price: {price}")));
    }
    let timestamp = timestamp.ok_or_else(|| AdapterError::parse("missing timestamp"))?;
    Ok((symbol.to_string(), price, timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_raw_fields_rejects_missing_symbol() {
        assert!(validate_raw_fields(None, Some(1.0), Some(1)).is_err());
    }

    #[test]
    fn validate_raw_fields_rejects_non_positive_price() {
        assert!(validate_raw_fields(Some("BTCUSDT"), Some(0.0), Some(1)).is_err());
        assert!(validate_raw_fields(Some("BTCUSDT"), Some(-5.0), Some(1)).is_err());
        assert!(validate_raw_fields(Some("BTCUSDT"), Some(f64::NAN), Some(1)).is_err());
        assert!(validate_raw_fields(Some("BTCUSDT"), Some(f64::INFINITY), Some(1)).is_err());
    }

    #[test]
    fn validate_raw_fields_accepts_well_formed_message() {
        let (symbol, price, ts) =
            validate_raw_fields(Some("BTCUSDT"), Some(30_000.5), Some(1_700_000_000_000)).unwrap();
        assert_eq!(symbol, "BTCUSDT");
        assert_eq!(price, 30_000.5);
        assert_eq!(ts, 1_700_000_000_000);
    }

    #[test]
    fn tier_weight_multipliers_match_spec() {
        assert_eq!(Tier::Native.weight_multiplier(), 1.4);
        assert_eq!(Tier::CcxtBridged.weight_multiplier(), 1.0);
    }

    #[tokio::test]
    async fn update_sink_coalesces_same_key_to_newest() {
        let sink = UpdateSink::new();
        sink.push(PriceUpdate::new("BTC/USD", 30_000.0, 1, "binance"));
        sink.push(PriceUpdate::new("BTC/USD", 30_050.0, 2, "binance"));
        let drained = sink.drain().await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].price, 30_050.0);
    }

    #[tokio::test]
    async fn update_sink_keeps_distinct_keys_separate() {
        let sink = UpdateSink::new();
        sink.push(PriceUpdate::new("BTC/USD", 30_000.0, 1, "binance"));
        sink.push(PriceUpdate::new("BTC/USD", 30_010.0, 1, "kraken"));
        let mut drained = sink.drain().await;
        drained.sort_by(|a, b| a.source.cmp(&b.source));
        assert_eq!(drained.len(), 2);
    }
}
