//! Shared connection-lifecycle plumbing reused by every per-exchange adapter (§4.1 state
//! machine, §5 reconnect/backoff). Generalized from `binance_session::SessionConfig`,
//! `BackoffCalculator` and `HeartbeatMonitor` - one hard-coded venue's fields turned into
//! adapter-agnostic helpers any `Adapter` impl composes.
//!
//! [`AdapterRuntime`] goes one step further: it is the one reconnect-with-backoff /
//! heartbeat / subscription-bookkeeping state machine, generic over a small per-venue
//! [`VenueProtocol`] trait that supplies only what actually differs between exchanges (the
//! wire URL, the subscribe/unsubscribe frame shape, and how to parse a stream or REST
//! message into a [`PriceUpdate`]). Every file under `adapters/` besides this one is a
//! `VenueProtocol` impl plus the handful of lines `Adapter` requires to delegate into it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use super::{AdapterChannels, ConnectionEvent, UpdateSink};
use crate::config::AdapterSettings;
use crate::error::AdapterError;
use crate::models::PriceUpdate;

/// `Disconnected -> Connecting -> Connected -> {Connected | Reconnecting | Disconnected}` (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Exponential backoff with jitter (§4.1: "starting at 5s, capped at 5 min, reset to base on
/// any fully successful subscribe"). A fast xorshift64 PRNG avoids pulling in a `rand`
/// dependency on the hot reconnect path, matching `BackoffCalculator::next_random`.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
    rng_state: u64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64 | 1)
                .unwrap_or(0x9E37_79B9_7F4A_7C15),
        }
    }

    pub fn from_settings(settings: &AdapterSettings) -> Self {
        Self::new(settings.reconnect_backoff_base, settings.reconnect_backoff_max)
    }

    #[inline]
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    /// Next backoff duration; bumps the internal attempt counter.
    pub fn next_backoff(&mut self) -> Duration {
        let base_ms = self.base.as_millis() as f64 * 2f64.powi(self.attempt as i32);
        let capped_ms = base_ms.min(self.max.as_millis() as f64);
        let jitter = (self.next_random() * 2.0 - 1.0) * capped_ms * 0.3;
        let final_ms = (capped_ms + jitter).max(self.base.as_millis() as f64);
        self.attempt += 1;
        Duration::from_millis(final_ms as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Ping/pong and data-staleness monitoring (§4.1 keepalive), generalized from
/// `binance_session::HeartbeatMonitor`.
#[derive(Debug)]
pub struct Heartbeat {
    ping_interval: Duration,
    pong_timeout: Duration,
    last_ping_sent: Option<Instant>,
    awaiting_pong: bool,
    last_data_received: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Ok,
    SendPing,
    PongTimeout,
    DataStale,
}

impl Heartbeat {
    pub fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
            last_ping_sent: None,
            awaiting_pong: false,
            last_data_received: Instant::now(),
        }
    }

    pub fn record_data_received(&mut self) {
        self.last_data_received = Instant::now();
    }

    pub fn record_ping_sent(&mut self) {
        self.last_ping_sent = Some(Instant::now());
        self.awaiting_pong = true;
    }

    pub fn record_pong_received(&mut self) {
        self.awaiting_pong = false;
    }

    pub fn check(&self, stale_after: Duration) -> HeartbeatAction {
        let now = Instant::now();
        if self.awaiting_pong {
            if let Some(ping_time) = self.last_ping_sent {
                if now.duration_since(ping_time) > self.pong_timeout {
                    return HeartbeatAction::PongTimeout;
                }
            }
        }
        if now.duration_since(self.last_data_received) > stale_after {
            return HeartbeatAction::DataStale;
        }
        let should_ping = match self.last_ping_sent {
            None => true,
            Some(t) => now.duration_since(t) > self.ping_interval,
        };
        if should_ping && !self.awaiting_pong {
            return HeartbeatAction::SendPing;
        }
        HeartbeatAction::Ok
    }
}

/// Confidence computation shared by every adapter (§4.1): narrower spread -> higher
/// confidence, higher volume -> higher confidence, larger emit latency -> lower confidence.
/// Output clamped to `[0, 1]`.
pub fn compute_confidence(bid: f64, ask: f64, mid: f64, volume: Option<f64>, latency_ms: f64) -> f64 {
    if mid <= 0.0 {
        return 0.0;
    }
    let spread = ((ask - bid) / mid).abs();
    let spread_component = (1.0 - (spread * 200.0)).clamp(0.0, 1.0);

    let volume_component = match volume {
        Some(v) if v > 0.0 => (v.ln() / 20.0).clamp(0.0, 1.0),
        _ => 0.5,
    };

    let latency_component = (1.0 - (latency_ms / 2_000.0)).clamp(0.0, 1.0);

    (0.5 * spread_component + 0.3 * volume_component + 0.2 * latency_component).clamp(0.0, 1.0)
}

/// What actually differs between exchanges (§4.1 "Per-exchange differences"): the wire URL,
/// the subscribe/unsubscribe frame shape, keepalive handling, and venue-specific parsing. A
/// `VenueProtocol` impl holds no connection state of its own - that lives in
/// [`AdapterRuntime`].
pub trait VenueProtocol: Send + Sync + 'static {
    fn exchange_name(&self) -> &'static str;

    fn ws_url(&self) -> String;

    /// Build the subscribe frame for a batch of already-normalized exchange symbols.
    fn subscribe_frame(&self, exchange_symbols: &[String]) -> WsMessage;

    fn unsubscribe_frame(&self, exchange_symbols: &[String]) -> WsMessage;

    /// A venue-initiated keepalive frame this adapter must reply to (§4.1 keepalive), e.g.
    /// Crypto.com's `public/heartbeat`. `None` for venues that rely purely on transport
    /// ping/pong, which [`AdapterRuntime`] already handles.
    fn heartbeat_reply(&self, _text: &str) -> Option<WsMessage> {
        None
    }

    /// Parse one streaming text message. `Ok(None)` for non-price control frames (acks,
    /// heartbeats, subscription confirmations).
    fn parse_stream_message(&self, text: &str) -> Result<Option<PriceUpdate>, AdapterError>;

    fn rest_ticker_url(&self, exchange_symbol: &str) -> String;

    fn parse_rest_ticker(&self, body: &str, exchange_symbol: &str) -> Result<PriceUpdate, AdapterError>;
}

/// Commands sent from `Adapter::subscribe`/`unsubscribe` into the running stream task.
enum WsCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

/// The one `Disconnected -> Connecting -> Connected -> {Connected | Reconnecting |
/// Disconnected}` state machine (§4.1), generic over a [`VenueProtocol`]. Every per-exchange
/// adapter wraps one of these and delegates `Adapter::connect/subscribe/unsubscribe/
/// fetch_ticker_rest/health_check` straight through.
pub struct AdapterRuntime<P: VenueProtocol> {
    protocol: Arc<P>,
    settings: AdapterSettings,
    sink: UpdateSink,
    channels: AdapterChannels,
    http: reqwest::Client,
    state: Mutex<ConnectionState>,
    subscribed: Mutex<HashSet<String>>,
    running: AtomicBool,
    ws_cmd_tx: Mutex<Option<mpsc::UnboundedSender<WsCommand>>>,
}

impl<P: VenueProtocol> AdapterRuntime<P> {
    pub fn new(protocol: P, settings: AdapterSettings, sink: UpdateSink, channels: AdapterChannels) -> Self {
        Self {
            protocol: Arc::new(protocol),
            http: reqwest::Client::builder()
                .timeout(settings.http_timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            settings,
            sink,
            channels,
            state: Mutex::new(ConnectionState::Disconnected),
            subscribed: Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
            ws_cmd_tx: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    /// Idempotent: a second call while already connecting/connected is a no-op (§4.1).
    pub fn connect(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await });
    }

    pub fn subscribe(&self, exchange_symbols: Vec<String>) -> Result<(), AdapterError> {
        let mut fresh = Vec::new();
        {
            let mut subs = self.subscribed.lock();
            for s in &exchange_symbols {
                if subs.insert(s.clone()) {
                    fresh.push(s.clone());
                }
            }
        }
        if fresh.is_empty() {
            return Ok(());
        }
        if let Some(tx) = self.ws_cmd_tx.lock().as_ref() {
            let _ = tx.send(WsCommand::Subscribe(fresh));
        }
        Ok(())
    }

    pub fn unsubscribe(&self, exchange_symbols: Vec<String>) -> Result<(), AdapterError> {
        let mut removed = Vec::new();
        {
            let mut subs = self.subscribed.lock();
            for s in &exchange_symbols {
                if subs.remove(s) {
                    removed.push(s.clone());
                }
            }
        }
        if removed.is_empty() {
            return Ok(());
        }
        if let Some(tx) = self.ws_cmd_tx.lock().as_ref() {
            let _ = tx.send(WsCommand::Unsubscribe(removed));
        }
        Ok(())
    }

    pub async fn fetch_ticker_rest(&self, exchange_symbol: &str) -> Result<PriceUpdate, AdapterError> {
        let url = self.protocol.rest_ticker_url(exchange_symbol);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AdapterError::connection(e.to_string()))?;
        let body = resp
            .text()
            .await
            .map_err(|e| AdapterError::connection(e.to_string()))?;
        self.protocol.parse_rest_ticker(&body, exchange_symbol)
    }

    /// Prefers a REST probe (§4.1); falls back to the live connection state if the probe
    /// itself errors for a reason unrelated to reachability (timeouts still count as down).
    pub async fn health_check(&self, probe_symbol: Option<&str>) -> bool {
        if let Some(symbol) = probe_symbol {
            if self.fetch_ticker_rest(symbol).await.is_ok() {
                return true;
            }
        }
        self.state() == ConnectionState::Connected
    }

    async fn run(self: Arc<Self>) {
        let mut backoff = Backoff::from_settings(&self.settings);
        loop {
            *self.state.lock() = ConnectionState::Connecting;
            let _ = self.channels.events.send(ConnectionEvent::Connecting);

            match connect_async(self.protocol.ws_url()).await {
                Ok((ws_stream, _)) => {
                    *self.state.lock() = ConnectionState::Connected;
                    let _ = self.channels.events.send(ConnectionEvent::Connected);
                    backoff.reset();
                    info!(exchange = self.protocol.exchange_name(), "adapter connected");
                    self.stream_session(ws_stream).await;
                }
                Err(e) => {
                    let err = AdapterError::connection(e.to_string());
                    warn!(exchange = self.protocol.exchange_name(), error = %err, "connect failed");
                    let _ = self.channels.errors.send(err);
                }
            }

            if backoff.attempt() >= self.settings.max_reconnect_attempts {
                *self.state.lock() = ConnectionState::Disconnected;
                self.running.store(false, Ordering::SeqCst);
                let _ = self.channels.errors.send(AdapterError::connection(
                    "max reconnect attempts exhausted, operator intervention required",
                ));
                return;
            }
            *self.state.lock() = ConnectionState::Reconnecting;
            let _ = self.channels.events.send(ConnectionEvent::Reconnecting);
            tokio::time::sleep(backoff.next_backoff()).await;
        }
    }

    async fn stream_session<S>(&self, ws_stream: S)
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + futures_util::Sink<WsMessage>
            + Unpin,
    {
        let (mut write, mut read) = ws_stream.split();
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        *self.ws_cmd_tx.lock() = Some(cmd_tx);

        let already_subscribed: Vec<String> = self.subscribed.lock().iter().cloned().collect();
        if !already_subscribed.is_empty() {
            let _ = write.send(self.protocol.subscribe_frame(&already_subscribed)).await;
        }

        let mut heartbeat = Heartbeat::new(self.settings.ping_interval, self.settings.pong_timeout);
        let mut ticker = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            heartbeat.record_data_received();
                            if let Some(reply) = self.protocol.heartbeat_reply(&text) {
                                let _ = write.send(reply).await;
                                continue;
                            }
                            match self.protocol.parse_stream_message(&text) {
                                Ok(Some(update)) => self.sink.push(update),
                                Ok(None) => {}
                                Err(e) => {
                                    debug!(exchange = self.protocol.exchange_name(), error = %e, "unparseable message");
                                    let _ = self.channels.errors.send(e);
                                }
                            }
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            heartbeat.record_data_received();
                            let _ = write.send(WsMessage::Pong(payload)).await;
                        }
                        Some(Ok(WsMessage::Pong(_))) => {
                            heartbeat.record_data_received();
                            heartbeat.record_pong_received();
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            warn!(exchange = self.protocol.exchange_name(), "stream closed");
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = self.channels.errors.send(AdapterError::connection(e.to_string()));
                            return;
                        }
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(WsCommand::Subscribe(symbols)) => {
                            let _ = write.send(self.protocol.subscribe_frame(&symbols)).await;
                        }
                        Some(WsCommand::Unsubscribe(symbols)) => {
                            let _ = write.send(self.protocol.unsubscribe_frame(&symbols)).await;
                        }
                        None => {}
                    }
                }
                _ = ticker.tick() => {
                    match heartbeat.check(self.settings.ping_interval * 3) {
                        HeartbeatAction::SendPing => {
                            let _ = write.send(WsMessage::Ping(Vec::new())).await;
                            heartbeat.record_ping_sent();
                        }
                        HeartbeatAction::PongTimeout | HeartbeatAction::DataStale => {
                            warn!(exchange = self.protocol.exchange_name(), "heartbeat timeout, reconnecting");
                            return;
                        }
                        HeartbeatAction::Ok => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_starts_at_base_and_never_exceeds_max() {
        let mut b = Backoff::new(Duration::from_secs(5), Duration::from_secs(300));
        let first = b.next_backoff();
        assert!(first.as_secs_f64() >= 5.0 * 0.7);
        for _ in 0..20 {
            let d = b.next_backoff();
            assert!(d.as_secs_f64() <= 300.0 * 1.3);
        }
    }

    #[test]
    fn backoff_resets_to_base_attempt() {
        let mut b = Backoff::new(Duration::from_secs(5), Duration::from_secs(300));
        b.next_backoff();
        b.next_backoff();
        assert!(b.attempt() >= 2);
        b.reset();
        assert_eq!(b.attempt(), 0);
    }

    #[test]
    fn confidence_is_clamped_and_monotonic_in_spread() {
        let tight = compute_confidence(99.9, 100.1, 100.0, Some(1000.0), 10.0);
        let wide = compute_confidence(90.0, 110.0, 100.0, Some(1000.0), 10.0);
        assert!(tight > wide);
        assert!((0.0..=1.0).contains(&tight));
        assert!((0.0..=1.0).contains(&wide));
    }

    #[test]
    fn confidence_decreases_with_latency() {
        let fresh = compute_confidence(99.9, 100.1, 100.0, Some(1000.0), 10.0);
        let stale = compute_confidence(99.9, 100.1, 100.0, Some(1000.0), 1_900.0);
        assert!(fresh > stale);
    }

    #[test]
    fn heartbeat_requests_ping_after_interval_elapses() {
        let hb = Heartbeat::new(Duration::from_millis(0), Duration::from_secs(10));
        assert_eq!(hb.check(Duration::from_secs(60)), HeartbeatAction::SendPing);
    }
}
