//! CCXT-bridged adapter (§4.1, §6, Tier 2 "library-bridged"). Catch-all for any exchange name
//! the `feeds.json` loader doesn't recognize as one of the native integrations: routed through
//! a normalizing REST bridge with the exchange name used verbatim as the CCXT id (§6). No
//! persistent stream - REST-polling only, grounded on `scrapers::hashdive_api`'s rate-limited
//! polling client.
//!
//! Symbol mapping is the identity function: CCXT's own symbol convention is already
//! `BASE/QUOTE`, matching this crate's canonical form, so no translation is needed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::task::JoinHandle;

use super::runtime::compute_confidence;
use super::{Adapter, AdapterChannels, Capabilities, ConnectionEvent, Tier, UpdateSink};
use crate::config::AdapterSettings;
use crate::error::AdapterError;
use crate::feeds::FeedCategory;
use crate::models::PriceUpdate;

#[derive(Deserialize)]
struct BridgeTicker {
    bid: f64,
    ask: f64,
    last: f64,
    #[serde(default)]
    volume: f64,
    timestamp: i64,
}

/// Polls a normalizing REST bridge that fronts the CCXT runtime this adapter delegates to
/// (out of scope, §1: exchange wire formats are pluggable adapters; the bridge process itself
/// is the external collaborator). Base URL is configurable per deployment; defaults to a
/// localhost sidecar, matching how `scrapers::dome_rest` talks to its own companion process.
pub struct CcxtBridgeAdapter {
    ccxt_id: String,
    /// Same string as `ccxt_id`, leaked once at construction so `exchange_name()` can satisfy
    /// the `Adapter` trait's `&'static str` return without colliding across distinct venues
    /// (the registry keys `add_data_source` by `exchange_name()` - a shared literal here would
    /// make every CCXT-bridged source after the first look already-registered). Bounded by the
    /// number of distinct CCXT ids a process ever configures, which is the feed universe size.
    exchange_name: &'static str,
    category: FeedCategory,
    bridge_base_url: String,
    http: reqwest::Client,
    sink: UpdateSink,
    channels: AdapterChannels,
    poll_interval: Duration,
    connected: AtomicBool,
    pollers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl CcxtBridgeAdapter {
    pub fn new(
        ccxt_id: impl Into<String>,
        category: FeedCategory,
        settings: &AdapterSettings,
        sink: UpdateSink,
        channels: AdapterChannels,
    ) -> Self {
        let ccxt_id = ccxt_id.into();
        let exchange_name: &'static str = Box::leak(ccxt_id.clone().into_boxed_str());
        Self {
            ccxt_id,
            exchange_name,
            category,
            bridge_base_url: std::env::var("ORACLEFEED_CCXT_BRIDGE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8787".to_string()),
            http: reqwest::Client::builder()
                .timeout(settings.http_timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            sink,
            channels,
            poll_interval: Duration::from_secs(2),
            connected: AtomicBool::new(false),
            pollers: Mutex::new(HashMap::new()),
        }
    }

    fn ticker_url(&self, symbol: &str) -> String {
        format!(
            "{}/ticker?exchange={}&symbol={}",
            self.bridge_base_url,
            self.ccxt_id,
            urlencode(symbol)
        )
    }

    async fn fetch_once(http: &reqwest::Client, url: &str, symbol: &str, source: &str) -> Result<PriceUpdate, AdapterError> {
        let resp = http.get(url).send().await.map_err(|e| AdapterError::connection(e.to_string()))?;
        let body = resp.text().await.map_err(|e| AdapterError::connection(e.to_string()))?;
        let t: BridgeTicker = serde_json::from_str(&body).map_err(|e| AdapterError::parse(e.to_string()))?;
        if !t.last.is_finite() || t.last <= 0.0 {
            return Err(AdapterError::parse("non-positive or non-finite price"));
        }
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mid = (t.bid + t.ask) / 2.0;
        let confidence = compute_confidence(
            t.bid,
            t.ask,
            if mid > 0.0 { mid } else { t.last },
            Some(t.volume),
            (now_ms - t.timestamp).max(0) as f64,
        );
        Ok(PriceUpdate::new(symbol, t.last, t.timestamp, source).with_volume(t.volume).with_confidence(confidence))
    }
}

fn urlencode(s: &str) -> String {
    s.replace('/', "%2F")
}

#[async_trait]
impl Adapter for CcxtBridgeAdapter {
    fn exchange_name(&self) -> &'static str {
        self.exchange_name
    }

    fn category(&self) -> FeedCategory {
        self.category
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { supports_stream: false, supports_rest: true, supports_volume: true }
    }

    fn tier(&self) -> Tier {
        Tier::CcxtBridged
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.channels.events.send(ConnectionEvent::Connected);
        Ok(())
    }

    async fn subscribe(&self, symbols: &[String]) -> Result<(), AdapterError> {
        let mut pollers = self.pollers.lock();
        for symbol in symbols {
            if pollers.contains_key(symbol) {
                continue;
            }
            let url = self.ticker_url(symbol);
            let http = self.http.clone();
            let sink = self.sink.clone();
            let errors = self.channels.errors.clone();
            let source = self.ccxt_id.clone();
            let symbol_owned = symbol.clone();
            let interval = self.poll_interval;
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    match Self::fetch_once(&http, &url, &symbol_owned, &source).await {
                        Ok(update) => sink.push(update),
                        Err(e) => {
                            let _ = errors.send(e);
                        }
                    }
                }
            });
            pollers.insert(symbol.clone(), handle);
        }
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> Result<(), AdapterError> {
        let mut pollers = self.pollers.lock();
        for symbol in symbols {
            if let Some(handle) = pollers.remove(symbol) {
                handle.abort();
            }
        }
        Ok(())
    }

    async fn fetch_ticker_rest(&self, symbol: &str) -> Result<PriceUpdate, AdapterError> {
        let url = self.ticker_url(symbol);
        Self::fetch_once(&self.http, &url, symbol, &self.ccxt_id).await
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/health?exchange={}", self.bridge_base_url, self.ccxt_id);
        self.http.get(&url).send().await.map(|r| r.status().is_success()).unwrap_or(false)
    }

    fn to_exchange_symbol(&self, canonical: &str) -> String {
        canonical.to_string()
    }

    fn normalize_symbol(&self, exchange_symbol: &str) -> String {
        exchange_symbol.to_string()
    }
}

impl Drop for CcxtBridgeAdapter {
    fn drop(&mut self) {
        for (_, handle) in self.pollers.lock().drain() {
            handle.abort();
        }
    }
}
