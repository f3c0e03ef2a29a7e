//! Crypto.com adapter (§4.1). Tier 1 native integration. Symbol mapping: `BTC/USDT` <->
//! `BTC_USDT`. Keepalive is the one adapter-private exception to transport ping/pong: the
//! venue pushes `public/heartbeat` every 30s and the client must echo back
//! `public/respond-heartbeat` with the same request id or the venue drops the connection
//! (§4.1).

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
struct TickerRow {
    #[serde(rename = "i")]
    instrument: String,
    #[serde(rename = "b")]
    bid: f64,
    #[serde(rename = "k")]
    ask: f64,
    #[serde(rename = "a")]
    last: f64,
    #[serde(rename = "v")]
    volume: f64,
    #[serde(rename = "t")]
    timestamp: i64,
}

#[derive(Deserialize)]
struct PushResult {
    channel: Option<String>,
    data: Option<Vec<TickerRow>>,
}

#[derive(Deserialize)]
struct PushEnvelope {
    method: Option<String>,
    id: Option<i64>,
    result: Option<PushResult>,
}

struct CryptoComProtocol;

impl VenueProtocol for CryptoComProtocol {
    fn exchange_name(&self) -> &'static str {
        "crypto_com"
    }

    fn ws_url(&self) -> String {
        "wss://stream.crypto.com/v2/market".to_string()
    }

    fn subscribe_frame(&self, exchange_symbols: &[String]) -> WsMessage {
        let channels: Vec<String> = exchange_symbols.iter().map(|s| format!("ticker.{s}")).collect();
        let frame = serde_json::json!({"id": 1, "method": "subscribe", "params": {"channels": channels}});
        WsMessage::Text(frame.to_string())
    }

    fn unsubscribe_frame(&self, exchange_symbols: &[String]) -> WsMessage {
        let channels: Vec<String> = exchange_symbols.iter().map(|s| format!("ticker.{s}")).collect();
        let frame = serde_json::json!({"id": 1, "method": "unsubscribe", "params": {"channels": channels}});
        WsMessage::Text(frame.to_string())
    }

    fn heartbeat_reply(&self, text: &str) -> Option<WsMessage> {
        let envelope: PushEnvelope = serde_json::from_str(text).ok()?;
        if envelope.method.as_deref() == Some("public/heartbeat") {
            let id = envelope.id.unwrap_or(0);
            let reply = serde_json::json!({"id": id, "method": "public/respond-heartbeat"});
            return Some(WsMessage::Text(reply.to_string()));
        }
        None
    }

    fn parse_stream_message(&self, text: &str) -> Result<Option<PriceUpdate>, AdapterError> {
        let envelope: PushEnvelope = serde_json::from_str(text).map_err(|e| AdapterError::parse(e.to_string()))?;
        let Some(result) = envelope.result else { return Ok(None) };
        if result.channel.as_deref() != Some("ticker") {
            return Ok(None);
        }
        let Some(row) = result.data.and_then(|d| d.into_iter().next()) else { return Ok(None) };
        row_to_update(row).map(Some)
    }

    fn rest_ticker_url(&self, exchange_symbol: &str) -> String {
        format!("https://api.crypto.com/v2/public/get-ticker?instrument_name={exchange_symbol}")
    }

    fn parse_rest_ticker(&self, body: &str, _exchange_symbol: &str) -> Result<PriceUpdate, AdapterError> {
        #[derive(Deserialize)]
        struct RestEnvelope {
            result: RestResult,
        }
        #[derive(Deserialize)]
        struct RestResult {
            data: TickerRow,
        }
        let envelope: RestEnvelope = serde_json::from_str(body).map_err(|e| AdapterError::parse(e.to_string()))?;
        row_to_update(envelope.result.data)
    }
}

fn row_to_update(row: TickerRow) -> Result<PriceUpdate, AdapterError> {
    let canonical = row.instrument.replace('_', "/");
    if !row.last.is_finite() || row.last <= 0.0 {
        return Err(AdapterError::parse("non-positive or non-finite price"));
    }
    let now_ms = chrono::Utc::now().timestamp_millis();
    let mid = (row.bid + row.ask) / 2.0;
    let confidence = compute_confidence(
        row.bid,
        row.ask,
        if mid > 0.0 { mid } else { row.last },
        Some(row.volume),
        (now_ms - row.timestamp).max(0) as f64,
    );
    Ok(PriceUpdate::new(canonical, row.last, row.timestamp, "crypto_com")
        .with_volume(row.volume)
        .with_confidence(confidence))
}

pub struct CryptoComAdapter {
    runtime: std::sync::Arc<AdapterRuntime<CryptoComProtocol>>,
}

impl CryptoComAdapter {
    pub fn new(settings: AdapterSettings, sink: UpdateSink, channels: AdapterChannels) -> Self {
        Self { runtime: std::sync::Arc::new(AdapterRuntime::new(CryptoComProtocol, settings, sink, channels)) }
    }
}

#[async_trait]
impl Adapter for CryptoComAdapter {
    fn exchange_name(&self) -> &'static str {
        "crypto_com"
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
        self.runtime.health_check(Some("BTC_USDT")).await
    }

    fn to_exchange_symbol(&self, canonical: &str) -> String {
        canonical.replace('/', "_").to_uppercase()
    }

    fn normalize_symbol(&self, exchange_symbol: &str) -> String {
        exchange_symbol.replace('_', "/").to_uppercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> CryptoComAdapter {
        CryptoComAdapter::new(crate::config::Settings::default().adapter, UpdateSink::new(), AdapterChannels::new())
    }

    #[test]
    fn symbol_round_trips() {
        let a = adapter();
        for canonical in ["BTC/USDT", "ETH/USDT"] {
            let exchange = a.to_exchange_symbol(canonical);
            assert_eq!(a.normalize_symbol(&exchange), canonical);
        }
    }

    #[test]
    fn heartbeat_is_echoed_with_same_id() {
        let proto = CryptoComProtocol;
        let push = serde_json::json!({"id": 42, "method": "public/heartbeat", "code": 0}).to_string();
        let reply = proto.heartbeat_reply(&push).expect("heartbeat reply");
        match reply {
            WsMessage::Text(t) => {
                assert!(t.contains("\"id\":42"));
                assert!(t.contains("public/respond-heartbeat"));
            }
            _ => panic!("expected text frame"),
        }
    }

    #[test]
    fn parses_ticker_channel_result() {
        let proto = CryptoComProtocol;
        let msg = serde_json::json!({
            "id": -1, "method": "subscribe", "code": 0,
            "result": {
                "instrument_name": "BTC_USDT", "subscription": "ticker.BTC_USDT", "channel": "ticker",
                "data": [{"i": "BTC_USDT", "b": 29999.5, "k": 30000.5, "a": 30000.0, "v": 10.0, "t": 1_700_000_000_000i64}]
            }
        }).to_string();
        let update = proto.parse_stream_message(&msg).unwrap().unwrap();
        assert_eq!(update.symbol, "BTC/USDT");
        assert_eq!(update.price, 30_000.0);
    }
}
