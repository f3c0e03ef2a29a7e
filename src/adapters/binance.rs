//! Binance adapter (§4.1). Tier 1 native integration, grounded on
//! `scrapers::binance_session`'s state machine and `scrapers::binance_price_feed`'s ticker
//! shape, generalized onto [`super::runtime::AdapterRuntime`].
//!
//! Symbol mapping: `BTC/USDT` <-> `BTCUSDT` (compact, no separator). Keepalive: transport
//! ping/pong only, 30s period / 10s pong timeout (§4.1).

use async_trait::async_trait;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::runtime::{compute_confidence, AdapterRuntime, ConnectionState, VenueProtocol};
use super::{Adapter, AdapterChannels, Capabilities, Tier, UpdateSink};
use crate::config::AdapterSettings;
use crate::error::AdapterError;
use crate::feeds::FeedCategory;
use crate::models::PriceUpdate;

/// Quote assets recognized when splitting Binance's compact `BASEQUOTE` symbols, ordered
/// longest-first so `USDT` is preferred over a coincidental `USD` suffix match.
const QUOTE_ASSETS: &[&str] = &["USDT", "USDC", "BUSD", "TUSD", "USD", "BTC", "ETH", "BNB"];

fn split_compact(symbol: &str) -> Option<(&str, &str)> {
    for quote in QUOTE_ASSETS {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return Some((base, quote));
            }
        }
    }
    None
}

#[derive(Deserialize)]
struct TickerData {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    bid: String,
    #[serde(rename = "a")]
    ask: String,
    #[serde(rename = "c")]
    last: String,
    #[serde(rename = "v")]
    volume: String,
}

#[derive(Deserialize)]
struct CombinedEnvelope {
    data: TickerData,
}

struct BinanceProtocol;

impl VenueProtocol for BinanceProtocol {
    fn exchange_name(&self) -> &'static str {
        "binance"
    }

    fn ws_url(&self) -> String {
        "wss://stream.binance.com:9443/stream".to_string()
    }

    fn subscribe_frame(&self, exchange_symbols: &[String]) -> WsMessage {
        let params: Vec<String> = exchange_symbols
            .iter()
            .map(|s| format!("{}@ticker", s.to_lowercase()))
            .collect();
        let frame = serde_json::json!({"method": "SUBSCRIBE", "params": params, "id": 1});
        WsMessage::Text(frame.to_string())
    }

    fn unsubscribe_frame(&self, exchange_symbols: &[String]) -> WsMessage {
        let params: Vec<String> = exchange_symbols
            .iter()
            .map(|s| format!("{}@ticker", s.to_lowercase()))
            .collect();
        let frame = serde_json::json!({"method": "UNSUBSCRIBE", "params": params, "id": 1});
        WsMessage::Text(frame.to_string())
    }

    fn parse_stream_message(&self, text: &str) -> Result<Option<PriceUpdate>, AdapterError> {
        if text.contains("\"result\"") {
            return Ok(None);
        }
        let envelope: CombinedEnvelope =
            serde_json::from_str(text).map_err(|e| AdapterError::parse(e.to_string()))?;
        ticker_to_update(envelope.data)
    }

    fn rest_ticker_url(&self, exchange_symbol: &str) -> String {
        format!("https://api.binance.com/api/v3/ticker/24hr?symbol={exchange_symbol}")
    }

    fn parse_rest_ticker(&self, body: &str, _exchange_symbol: &str) -> Result<PriceUpdate, AdapterError> {
        #[derive(Deserialize)]
        struct RestTicker {
            #[serde(rename = "symbol")]
            symbol: String,
            #[serde(rename = "bidPrice")]
            bid: String,
            #[serde(rename = "askPrice")]
            ask: String,
            #[serde(rename = "lastPrice")]
            last: String,
            #[serde(rename = "volume")]
            volume: String,
            #[serde(rename = "closeTime")]
            close_time: i64,
        }
        let t: RestTicker = serde_json::from_str(body).map_err(|e| AdapterError::parse(e.to_string()))?;
        ticker_to_update(TickerData {
            event_time: t.close_time,
            symbol: t.symbol,
            bid: t.bid,
            ask: t.ask,
            last: t.last,
            volume: t.volume,
        })
    }
}

fn ticker_to_update(t: TickerData) -> Result<Option<PriceUpdate>, AdapterError> {
    let (base, quote) = split_compact(&t.symbol)
        .ok_or_else(|| AdapterError::parse(format!("unrecognized symbol {}", t.symbol)))?;
    let canonical = format!("{base}/{quote}");
    let price: f64 = t.last.parse().map_err(|_| AdapterError::parse("bad last price"))?;
    let bid: f64 = t.bid.parse().unwrap_or(price);
    let ask: f64 = t.ask.parse().unwrap_or(price);
    let volume: f64 = t.volume.parse().unwrap_or(0.0);
    if !price.is_finite() || price <= 0.0 {
        return Err(AdapterError::parse("non-positive or non-finite price"));
    }
    let now_ms = chrono::Utc::now().timestamp_millis();
    let latency_ms = (now_ms - t.event_time).max(0) as f64;
    let mid = (bid + ask) / 2.0;
    let confidence = compute_confidence(bid, ask, if mid > 0.0 { mid } else { price }, Some(volume), latency_ms);
    Ok(Some(
        PriceUpdate::new(canonical, price, t.event_time, "binance")
            .with_volume(volume)
            .with_confidence(confidence),
    ))
}

pub struct BinanceAdapter {
    runtime: std::sync::Arc<AdapterRuntime<BinanceProtocol>>,
}

impl BinanceAdapter {
    pub fn new(settings: AdapterSettings, sink: UpdateSink, channels: AdapterChannels) -> Self {
        Self {
            runtime: std::sync::Arc::new(AdapterRuntime::new(BinanceProtocol, settings, sink, channels)),
        }
    }
}

#[async_trait]
impl Adapter for BinanceAdapter {
    fn exchange_name(&self) -> &'static str {
        "binance"
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
        self.runtime.health_check(Some("BTCUSDT")).await
    }

    fn to_exchange_symbol(&self, canonical: &str) -> String {
        canonical.replace('/', "").to_uppercase()
    }

    fn normalize_symbol(&self, exchange_symbol: &str) -> String {
        match split_compact(exchange_symbol) {
            Some((base, quote)) => format!("{base}/{quote}"),
            None => exchange_symbol.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> BinanceAdapter {
        BinanceAdapter::new(
            crate::config::Settings::default().adapter,
            UpdateSink::new(),
            AdapterChannels::new(),
        )
    }

    #[test]
    fn symbol_round_trips() {
        let a = adapter();
        for canonical in ["BTC/USDT", "ETH/USDT", "SOL/USDC"] {
            let exchange = a.to_exchange_symbol(canonical);
            assert_eq!(a.normalize_symbol(&exchange), canonical);
        }
    }

    #[test]
    fn parses_combined_stream_ticker() {
        let proto = BinanceProtocol;
        let msg = serde_json::json!({
            "stream": "btcusdt@ticker",
            "data": {
                "e": "24hrTicker", "E": 1_700_000_000_000i64, "s": "BTCUSDT",
                "b": "29999.5", "a": "30000.5", "c": "30000.0", "v": "1234.5"
            }
        })
        .to_string();
        let update = proto.parse_stream_message(&msg).unwrap().unwrap();
        assert_eq!(update.symbol, "BTC/USDT");
        assert_eq!(update.price, 30_000.0);
        assert_eq!(update.source, "binance");
        assert!(update.confidence > 0.0);
    }

    #[test]
    fn subscribe_ack_yields_no_update() {
        let proto = BinanceProtocol;
        let ack = r#"{"result": null, "id": 1}"#;
        assert!(proto.parse_stream_message(ack).unwrap().is_none());
    }

    #[test]
    fn connection_state_starts_disconnected() {
        assert_eq!(adapter().runtime.state(), ConnectionState::Disconnected);
    }
}
