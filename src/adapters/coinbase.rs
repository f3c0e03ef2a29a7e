//! Coinbase adapter (§4.1). Tier 1 native integration. Symbol mapping: `BTC/USD` <-> `BTC-USD`.
//! Keepalive: transport ping/pong only. The one adapter-private wrinkle is the wire timestamp
//! format: Coinbase emits RFC3339 strings, not epoch ms, so this adapter is the one place in
//! the crate that normalizes a timestamp format at the edge (§4.1 "normalized to ms").

use async_trait::async_trait;
use chrono::DateTime;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::runtime::{compute_confidence, AdapterRuntime, VenueProtocol};
use super::{Adapter, AdapterChannels, Capabilities, Tier, UpdateSink};
use crate::config::AdapterSettings;
use crate::error::AdapterError;
use crate::feeds::FeedCategory;
use crate::models::PriceUpdate;

fn parse_rfc3339_ms(s: &str) -> i64 {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_else(|_| chrono::Utc::now().timestamp_millis())
}

#[derive(Deserialize)]
struct TickerMsg {
    #[serde(rename = "type")]
    kind: String,
    product_id: Option<String>,
    price: Option<String>,
    best_bid: Option<String>,
    best_ask: Option<String>,
    volume_24h: Option<String>,
    time: Option<String>,
}

struct CoinbaseProtocol;

impl VenueProtocol for CoinbaseProtocol {
    fn exchange_name(&self) -> &'static str {
        "coinbase"
    }

    fn ws_url(&self) -> String {
        "wss://ws-feed.exchange.coinbase.com".to_string()
    }

    fn subscribe_frame(&self, exchange_symbols: &[String]) -> WsMessage {
        let frame = serde_json::json!({
            "type": "subscribe",
            "channels": [{"name": "ticker", "product_ids": exchange_symbols}],
        });
        WsMessage::Text(frame.to_string())
    }

    fn unsubscribe_frame(&self, exchange_symbols: &[String]) -> WsMessage {
        let frame = serde_json::json!({
            "type": "unsubscribe",
            "channels": [{"name": "ticker", "product_ids": exchange_symbols}],
        });
        WsMessage::Text(frame.to_string())
    }

    fn parse_stream_message(&self, text: &str) -> Result<Option<PriceUpdate>, AdapterError> {
        let msg: TickerMsg = serde_json::from_str(text).map_err(|e| AdapterError::parse(e.to_string()))?;
        if msg.kind != "ticker" {
            return Ok(None);
        }
        ticker_to_update(msg).map(Some)
    }

    fn rest_ticker_url(&self, exchange_symbol: &str) -> String {
        format!("https://api.exchange.coinbase.com/products/{exchange_symbol}/ticker")
    }

    fn parse_rest_ticker(&self, body: &str, exchange_symbol: &str) -> Result<PriceUpdate, AdapterError> {
        #[derive(Deserialize)]
        struct RestTicker {
            bid: String,
            ask: String,
            price: String,
            volume: String,
            time: String,
        }
        let t: RestTicker = serde_json::from_str(body).map_err(|e| AdapterError::parse(e.to_string()))?;
        ticker_to_update(TickerMsg {
            kind: "ticker".to_string(),
            product_id: Some(exchange_symbol.to_string()),
            price: Some(t.price),
            best_bid: Some(t.bid),
            best_ask: Some(t.ask),
            volume_24h: Some(t.volume),
            time: Some(t.time),
        })
    }
}

fn ticker_to_update(msg: TickerMsg) -> Result<PriceUpdate, AdapterError> {
    let product_id = msg.product_id.ok_or_else(|| AdapterError::parse("missing product_id"))?;
    let canonical = product_id.replace('-', "/");
    let price: f64 = msg
        .price
        .as_deref()
        .ok_or_else(|| AdapterError::parse("missing price"))?
        .parse()
        .map_err(|_| AdapterError::parse("bad price"))?;
    if !price.is_finite() || price <= 0.0 {
        return Err(AdapterError::parse("non-positive or non-finite price"));
    }
    let bid: f64 = msg.best_bid.as_deref().and_then(|s| s.parse().ok()).unwrap_or(price);
    let ask: f64 = msg.best_ask.as_deref().and_then(|s| s.parse().ok()).unwrap_or(price);
    let volume: f64 = msg.volume_24h.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0.0);
    let ts = msg.time.as_deref().map(parse_rfc3339_ms).unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
    let now_ms = chrono::Utc::now().timestamp_millis();
    let mid = (bid + ask) / 2.0;
    let confidence =
        compute_confidence(bid, ask, if mid > 0.0 { mid } else { price }, Some(volume), (now_ms - ts).max(0) as f64);
    Ok(PriceUpdate::new(canonical, price, ts, "coinbase").with_volume(volume).with_confidence(confidence))
}

pub struct CoinbaseAdapter {
    runtime: std::sync::Arc<AdapterRuntime<CoinbaseProtocol>>,
}

impl CoinbaseAdapter {
    pub fn new(settings: AdapterSettings, sink: UpdateSink, channels: AdapterChannels) -> Self {
        Self { runtime: std::sync::Arc::new(AdapterRuntime::new(CoinbaseProtocol, settings, sink, channels)) }
    }
}

#[async_trait]
impl Adapter for CoinbaseAdapter {
    fn exchange_name(&self) -> &'static str {
        "coinbase"
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
        self.runtime.health_check(Some("BTC-USD")).await
    }

    fn to_exchange_symbol(&self, canonical: &str) -> String {
        canonical.replace('/', "-").to_uppercase()
    }

    fn normalize_symbol(&self, exchange_symbol: &str) -> String {
        exchange_symbol.replace('-', "/").to_uppercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> CoinbaseAdapter {
        CoinbaseAdapter::new(crate::config::Settings::default().adapter, UpdateSink::new(), AdapterChannels::new())
    }

    #[test]
    fn symbol_round_trips() {
        let a = adapter();
        for canonical in ["BTC/USD", "ETH/USD"] {
            let exchange = a.to_exchange_symbol(canonical);
            assert_eq!(a.normalize_symbol(&exchange), canonical);
        }
    }

    #[test]
    fn parses_ticker_message_and_normalizes_rfc3339_timestamp() {
        let proto = CoinbaseProtocol;
        let msg = serde_json::json!({
            "type": "ticker", "product_id": "BTC-USD", "price": "30000.00",
            "best_bid": "29999.50", "best_ask": "30000.50", "volume_24h": "1234.5",
            "time": "2023-11-14T22:01:19.000000Z"
        })
        .to_string();
        let update = proto.parse_stream_message(&msg).unwrap().unwrap();
        assert_eq!(update.symbol, "BTC/USD");
        assert_eq!(update.price, 30_000.0);
        assert!(update.timestamp > 0);
    }

    #[test]
    fn non_ticker_messages_are_ignored() {
        let proto = CoinbaseProtocol;
        let msg = serde_json::json!({"type": "subscriptions"}).to_string();
        assert!(proto.parse_stream_message(&msg).unwrap().is_none());
    }
}
