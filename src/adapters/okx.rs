//! OKX adapter (§4.1). Tier 1 native integration. Symbol mapping: `BTC/USDT` <-> `BTC-USDT`.
//! Keepalive: transport ping/pong only (§4.1).

use async_trait::async_trait;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::runtime::{compute_confidence, AdapterRuntime, VenueProtocol};
use super::{Adapter, AdapterChannels, Capabilities, Tier, UpdateSink};
use crate::config::AdapterSettings;
use crate::error::AdapterError;
use crate::feeds::FeedCategory;
use crate::models::PriceUpdate;

#[derive(Deserialize)]
struct OkxTicker {
    #[serde(rename = "instId")]
    inst_id: String,
    last: String,
    #[serde(rename = "askPx")]
    ask_px: String,
    #[serde(rename = "bidPx")]
    bid_px: String,
    #[serde(rename = "vol24h")]
    vol_24h: String,
    ts: String,
}

#[derive(Deserialize)]
struct OkxPushEnvelope {
    arg: Option<OkxArg>,
    data: Option<Vec<OkxTicker>>,
}

#[derive(Deserialize)]
struct OkxArg {
    channel: String,
}

#[derive(Deserialize)]
struct OkxRestEnvelope {
    data: Vec<OkxTicker>,
}

struct OkxProtocol;

impl VenueProtocol for OkxProtocol {
    fn exchange_name(&self) -> &'static str {
        "okx"
    }

    fn ws_url(&self) -> String {
        "wss://ws.okx.com:8443/ws/v5/public".to_string()
    }

    fn subscribe_frame(&self, exchange_symbols: &[String]) -> WsMessage {
        let args: Vec<_> = exchange_symbols
            .iter()
            .map(|s| serde_json::json!({"channel": "tickers", "instId": s}))
            .collect();
        WsMessage::Text(serde_json::json!({"op": "subscribe", "args": args}).to_string())
    }

    fn unsubscribe_frame(&self, exchange_symbols: &[String]) -> WsMessage {
        let args: Vec<_> = exchange_symbols
            .iter()
            .map(|s| serde_json::json!({"channel": "tickers", "instId": s}))
            .collect();
        WsMessage::Text(serde_json::json!({"op": "unsubscribe", "args": args}).to_string())
    }

    fn parse_stream_message(&self, text: &str) -> Result<Option<PriceUpdate>, AdapterError> {
        let envelope: OkxPushEnvelope =
            serde_json::from_str(text).map_err(|e| AdapterError::parse(e.to_string()))?;
        let is_ticker = envelope.arg.as_ref().is_some_and(|a| a.channel == "tickers");
        if !is_ticker {
            return Ok(None);
        }
        let Some(ticker) = envelope.data.and_then(|d| d.into_iter().next()) else { return Ok(None) };
        ticker_to_update(ticker).map(Some)
    }

    fn rest_ticker_url(&self, exchange_symbol: &str) -> String {
        format!("https://www.okx.com/api/v5/market/ticker?instId={exchange_symbol}")
    }

    fn parse_rest_ticker(&self, body: &str, _exchange_symbol: &str) -> Result<PriceUpdate, AdapterError> {
        let envelope: OkxRestEnvelope =
            serde_json::from_str(body).map_err(|e| AdapterError::parse(e.to_string()))?;
        let ticker = envelope
            .data
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::parse("empty okx ticker response"))?;
        ticker_to_update(ticker)
    }
}

fn ticker_to_update(t: OkxTicker) -> Result<PriceUpdate, AdapterError> {
    let canonical = t.inst_id.replace('-', "/");
    let price: f64 = t.last.parse().map_err(|_| AdapterError::parse("bad last price"))?;
    if !price.is_finite() || price <= 0.0 {
        return Err(AdapterError::parse("non-positive or non-finite price"));
    }
    let bid: f64 = t.bid_px.parse().unwrap_or(price);
    let ask: f64 = t.ask_px.parse().unwrap_or(price);
    let volume: f64 = t.vol_24h.parse().unwrap_or(0.0);
    let ts: i64 = t.ts.parse().unwrap_or_else(|_| chrono::Utc::now().timestamp_millis());
    let now_ms = chrono::Utc::now().timestamp_millis();
    let mid = (bid + ask) / 2.0;
    let confidence =
        compute_confidence(bid, ask, if mid > 0.0 { mid } else { price }, Some(volume), (now_ms - ts).max(0) as f64);
    Ok(PriceUpdate::new(canonical, price, ts, "okx").with_volume(volume).with_confidence(confidence))
}

pub struct OkxAdapter {
    runtime: std::sync::Arc<AdapterRuntime<OkxProtocol>>,
}

impl OkxAdapter {
    pub fn new(settings: AdapterSettings, sink: UpdateSink, channels: AdapterChannels) -> Self {
        Self { runtime: std::sync::Arc::new(AdapterRuntime::new(OkxProtocol, settings, sink, channels)) }
    }
}

#[async_trait]
impl Adapter for OkxAdapter {
    fn exchange_name(&self) -> &'static str {
        "okx"
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
        self.runtime.health_check(Some("BTC-USDT")).await
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

    fn adapter() -> OkxAdapter {
        OkxAdapter::new(crate::config::Settings::default().adapter, UpdateSink::new(), AdapterChannels::new())
    }

    #[test]
    fn symbol_round_trips() {
        let a = adapter();
        for canonical in ["BTC/USDT", "ETH/USDT"] {
            let exchange = a.to_exchange_symbol(canonical);
            assert_eq!(a.normalize_symbol(&exchange), canonical);
        }
        assert_eq!(a.to_exchange_symbol("BTC/USDT"), "BTC-USDT");
    }

    #[test]
    fn parses_tickers_channel_push() {
        let proto = OkxProtocol;
        let msg = serde_json::json!({
            "arg": {"channel": "tickers", "instId": "BTC-USDT"},
            "data": [{"instId": "BTC-USDT", "last": "30000.0", "askPx": "30000.5", "bidPx": "29999.5", "vol24h": "500.0", "ts": "1700000000000"}]
        }).to_string();
        let update = proto.parse_stream_message(&msg).unwrap().unwrap();
        assert_eq!(update.symbol, "BTC/USDT");
        assert_eq!(update.price, 30_000.0);
        assert_eq!(update.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn non_tickers_channel_is_ignored() {
        let proto = OkxProtocol;
        let msg = serde_json::json!({"event": "subscribe", "arg": {"channel": "tickers"}}).to_string();
        assert!(proto.parse_stream_message(&msg).unwrap().is_none());
    }
}
