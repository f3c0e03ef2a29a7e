//! Kraken adapter (§4.1). Tier 1 native integration. Symbol mapping: `BTC/USD` <-> `XBT/USD`
//! (Kraken's historical `XBT` basis-for-bitcoin asset code). Keepalive: transport ping/pong
//! only, same 30s/10s schedule as Binance/OKX (§4.1).

use async_trait::async_trait;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::runtime::{compute_confidence, AdapterRuntime, VenueProtocol};
use super::{Adapter, AdapterChannels, Capabilities, Tier, UpdateSink};
use crate::config::AdapterSettings;
use crate::error::AdapterError;
use crate::feeds::FeedCategory;
use crate::models::PriceUpdate;

fn canonical_base_to_kraken(base: &str) -> String {
    if base.eq_ignore_ascii_case("BTC") {
        "XBT".to_string()
    } else {
        base.to_uppercase()
    }
}

fn kraken_base_to_canonical(base: &str) -> String {
    if base.eq_ignore_ascii_case("XBT") {
        "BTC".to_string()
    } else {
        base.to_uppercase()
    }
}

#[derive(Deserialize)]
struct TickerRow {
    symbol: String,
    bid: f64,
    ask: f64,
    last: f64,
    volume: f64,
}

#[derive(Deserialize)]
struct TickerEnvelope {
    channel: String,
    data: Option<Vec<TickerRow>>,
}

struct KrakenProtocol;

impl VenueProtocol for KrakenProtocol {
    fn exchange_name(&self) -> &'static str {
        "kraken"
    }

    fn ws_url(&self) -> String {
        "wss://ws.kraken.com/v2".to_string()
    }

    fn subscribe_frame(&self, exchange_symbols: &[String]) -> WsMessage {
        let frame = serde_json::json!({
            "method": "subscribe",
            "params": {"channel": "ticker", "symbol": exchange_symbols},
        });
        WsMessage::Text(frame.to_string())
    }

    fn unsubscribe_frame(&self, exchange_symbols: &[String]) -> WsMessage {
        let frame = serde_json::json!({
            "method": "unsubscribe",
            "params": {"channel": "ticker", "symbol": exchange_symbols},
        });
        WsMessage::Text(frame.to_string())
    }

    fn parse_stream_message(&self, text: &str) -> Result<Option<PriceUpdate>, AdapterError> {
        let envelope: TickerEnvelope =
            serde_json::from_str(text).map_err(|e| AdapterError::parse(e.to_string()))?;
        if envelope.channel != "ticker" {
            return Ok(None);
        }
        let Some(rows) = envelope.data else { return Ok(None) };
        let Some(row) = rows.into_iter().next() else { return Ok(None) };
        row_to_update(row).map(Some)
    }

    fn rest_ticker_url(&self, exchange_symbol: &str) -> String {
        let pair = exchange_symbol.replace('/', "");
        format!("https://api.kraken.com/0/public/Ticker?pair={pair}")
    }

    fn parse_rest_ticker(&self, body: &str, exchange_symbol: &str) -> Result<PriceUpdate, AdapterError> {
        #[derive(Deserialize)]
        struct RestResult {
            result: std::collections::HashMap<String, RestPair>,
        }
        #[derive(Deserialize)]
        struct RestPair {
            // [price, wholeLotVolume, lotVolume]
            b: Vec<String>,
            a: Vec<String>,
            c: Vec<String>,
            v: Vec<String>,
        }
        let parsed: RestResult = serde_json::from_str(body).map_err(|e| AdapterError::parse(e.to_string()))?;
        let pair = parsed
            .result
            .values()
            .next()
            .ok_or_else(|| AdapterError::parse("empty kraken ticker result"))?;
        let bid: f64 = pair.b.first().and_then(|s| s.parse().ok()).unwrap_or(0.0);
        let ask: f64 = pair.a.first().and_then(|s| s.parse().ok()).unwrap_or(0.0);
        let last: f64 = pair.c.first().and_then(|s| s.parse().ok()).unwrap_or(0.0);
        let volume: f64 = pair.v.get(1).and_then(|s| s.parse().ok()).unwrap_or(0.0);
        row_to_update(TickerRow { symbol: exchange_symbol.to_string(), bid, ask, last, volume })
    }
}

fn row_to_update(row: TickerRow) -> Result<PriceUpdate, AdapterError> {
    let mut parts = row.symbol.splitn(2, '/');
    let base = parts.next().ok_or_else(|| AdapterError::parse("missing base"))?;
    let quote = parts.next().ok_or_else(|| AdapterError::parse("missing quote"))?;
    let canonical = format!("{}/{}", kraken_base_to_canonical(base), quote.to_uppercase());
    if !row.last.is_finite() || row.last <= 0.0 {
        return Err(AdapterError::parse("non-positive or non-finite price"));
    }
    let now_ms = chrono::Utc::now().timestamp_millis();
    let mid = (row.bid + row.ask) / 2.0;
    let confidence = compute_confidence(row.bid, row.ask, if mid > 0.0 { mid } else { row.last }, Some(row.volume), 0.0);
    Ok(PriceUpdate::new(canonical, row.last, now_ms, "kraken")
        .with_volume(row.volume)
        .with_confidence(confidence))
}

pub struct KrakenAdapter {
    runtime: std::sync::Arc<AdapterRuntime<KrakenProtocol>>,
}

impl KrakenAdapter {
    pub fn new(settings: AdapterSettings, sink: UpdateSink, channels: AdapterChannels) -> Self {
        Self {
            runtime: std::sync::Arc::new(AdapterRuntime::new(KrakenProtocol, settings, sink, channels)),
        }
    }
}

#[async_trait]
impl Adapter for KrakenAdapter {
    fn exchange_name(&self) -> &'static str {
        "kraken"
    }

    fn category(&self) -> FeedCategory {
        FeedCategory::Crypto
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { supports_stream: true, supports_rest: true, supports_volume: true }
    }

    fn tier(&self) -> Tier {
        Tier::Native
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        self.runtime.connect();
        Ok(())
    }

    async fn subscribe(&self, symbols: &[String]) -> Result<(), AdapterError> {
        let exchange_symbols = symbols.iter().map(|s| self.to_exchange_symbol(s)).collect();
        self.runtime.subscribe(exchange_symbols)
    }

    async fn unsubscribe(&self, symbols: &[String]) -> Result<(), AdapterError> {
        let exchange_symbols = symbols.iter().map(|s| self.to_exchange_symbol(s)).collect();
        self.runtime.unsubscribe(exchange_symbols)
    }

    async fn fetch_ticker_rest(&self, symbol: &str) -> Result<PriceUpdate, AdapterError> {
        self.runtime.fetch_ticker_rest(&self.to_exchange_symbol(symbol)).await
    }

    async fn health_check(&self) -> bool {
        self.runtime.health_check(Some("XBT/USD")).await
    }

    fn to_exchange_symbol(&self, canonical: &str) -> String {
        let mut parts = canonical.splitn(2, '/');
        let base = parts.next().unwrap_or_default();
        let quote = parts.next().unwrap_or_default();
        format!("{}/{}", canonical_base_to_kraken(base), quote.to_uppercase())
    }

    fn normalize_symbol(&self, exchange_symbol: &str) -> String {
        let mut parts = exchange_symbol.splitn(2, '/');
        let base = parts.next().unwrap_or_default();
        let quote = parts.next().unwrap_or_default();
        format!("{}/{}", kraken_base_to_canonical(base), quote.to_uppercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> KrakenAdapter {
        KrakenAdapter::new(crate::config::Settings::default().adapter, UpdateSink::new(), AdapterChannels::new())
    }

    #[test]
    fn symbol_round_trips_through_xbt_alias() {
        let a = adapter();
        for canonical in ["BTC/USD", "ETH/USD"] {
            let exchange = a.to_exchange_symbol(canonical);
            assert_eq!(a.normalize_symbol(&exchange), canonical);
        }
        assert_eq!(a.to_exchange_symbol("BTC/USD"), "XBT/USD");
    }

    #[test]
    fn parses_v2_ticker_channel_update() {
        let proto = KrakenProtocol;
        let msg = serde_json::json!({
            "channel": "ticker",
            "type": "update",
            "data": [{"symbol": "XBT/USD", "bid": 29_999.5, "ask": 30_000.5, "last": 30_000.0, "volume": 42.0}]
        })
        .to_string();
        let update = proto.parse_stream_message(&msg).unwrap().unwrap();
        assert_eq!(update.symbol, "BTC/USD");
        assert_eq!(update.price, 30_000.0);
    }

    #[test]
    fn ignores_non_ticker_channels() {
        let proto = KrakenProtocol;
        let msg = serde_json::json!({"channel": "heartbeat"}).to_string();
        assert!(proto.parse_stream_message(&msg).unwrap().is_none());
    }
}
