//! Shared error taxonomy scaffolding.
//!
//! Every fallible boundary in this crate returns a typed enum implementing
//! [`std::error::Error`], never a bare string or an opaque `anyhow::Error` - mirrors
//! `edge::wire::EdgeWireError` and `backtest_v2::market_registry::MarketRegistryError`
//! in spirit. `anyhow` stays confined to service-wiring glue in `main`/`orchestrator::start`.

use std::fmt;

/// Severity of a validator finding or a classified runtime error. Ordered so that
/// `Severity::Critical > Severity::High > ...` compares the way the validator needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Transport-tier errors raised by adapters (connect/send/receive failures). Retried with
/// backoff at the adapter level; surfaced to the breaker only on repeated occurrence.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    Connection { detail: String },
    Timeout { detail: String },
    RateLimit { retry_after_ms: u64 },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection { detail } => write!(f, "connection error: {detail}"),
            Self::Timeout { detail } => write!(f, "timeout: {detail}"),
            Self::RateLimit { retry_after_ms } => {
                write!(f, "rate limited, retry after {retry_after_ms}ms")
            }
        }
    }
}

impl std::error::Error for TransportError {}

/// Protocol-tier errors raised by adapters. Not retried at the adapter level; reported to
/// the breaker and the health bus immediately.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    Parse { detail: String },
    Auth { detail: String },
    Exchange { detail: String },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse { detail } => write!(f, "parse error: {detail}"),
            Self::Auth { detail } => write!(f, "auth error: {detail}"),
            Self::Exchange { detail } => write!(f, "exchange error: {detail}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Closed enum of classified adapter errors (§4.1, §7 Transport/Protocol taxonomy).
/// Any error an adapter cannot identify maps to `Exchange` (the `ExchangeError` catch-all).
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterError {
    Transport(TransportError),
    Protocol(ProtocolError),
}

impl AdapterError {
    /// The discriminant the circuit breaker and health bus key off of.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(TransportError::Connection { .. }) => ErrorKind::ConnectionError,
            Self::Transport(TransportError::Timeout { .. }) => ErrorKind::TimeoutError,
            Self::Transport(TransportError::RateLimit { .. }) => ErrorKind::RateLimitError,
            Self::Protocol(ProtocolError::Parse { .. }) => ErrorKind::ParseError,
            Self::Protocol(ProtocolError::Auth { .. }) => ErrorKind::AuthError,
            Self::Protocol(ProtocolError::Exchange { .. }) => ErrorKind::ExchangeError,
        }
    }

    /// True for the classes that count toward the circuit breaker's `consecutiveFailures`
    /// (§4.2): everything except `RateLimitError`, which uses its own cooldown track.
    pub fn counts_toward_breaker(&self) -> bool {
        self.kind() != ErrorKind::RateLimitError
    }

    pub fn exchange(detail: impl Into<String>) -> Self {
        Self::Protocol(ProtocolError::Exchange {
            detail: detail.into(),
        })
    }

    pub fn connection(detail: impl Into<String>) -> Self {
        Self::Transport(TransportError::Connection {
            detail: detail.into(),
        })
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::Transport(TransportError::Timeout {
            detail: detail.into(),
        })
    }

    pub fn rate_limit(retry_after_ms: u64) -> Self {
        Self::Transport(TransportError::RateLimit { retry_after_ms })
    }

    pub fn parse(detail: impl Into<String>) -> Self {
        Self::Protocol(ProtocolError::Parse {
            detail: detail.into(),
        })
    }

    pub fn auth(detail: impl Into<String>) -> Self {
        Self::Protocol(ProtocolError::Auth {
            detail: detail.into(),
        })
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{e}"),
            Self::Protocol(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AdapterError {}

/// The classification discriminant carried alongside `AdapterError`; this is what the
/// circuit breaker, failover coordinator and health bus key rules off of (§7 Observability:
/// every error is tagged with `component`/`operationName`/`sourceId`/`feedId`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionError,
    TimeoutError,
    RateLimitError,
    ParseError,
    AuthError,
    ExchangeError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ConnectionError => "connection_error",
            Self::TimeoutError => "timeout_error",
            Self::RateLimitError => "rate_limit_error",
            Self::ParseError => "parse_error",
            Self::AuthError => "auth_error",
            Self::ExchangeError => "exchange_error",
        };
        f.write_str(s)
    }
}

/// Aggregation-tier errors (§7 Aggregation): surfaced as health-bus events, never thrown
/// across the aggregator/validator boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationError {
    InsufficientSources { feed: String, eligible: usize, required: usize },
    StaleBuffer { feed: String, age_ms: i64 },
}

impl fmt::Display for AggregationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientSources { feed, eligible, required } => write!(
                f,
                "insufficient_sources: feed={feed} eligible={eligible} required={required}"
            ),
            Self::StaleBuffer { feed, age_ms } => {
                write!(f, "stale_buffer: feed={feed} age_ms={age_ms}")
            }
        }
    }
}

impl std::error::Error for AggregationError {}

/// Request-tier failures returned to the public API caller (§6, §7 Request).
#[derive(Debug, Clone, PartialEq)]
pub enum RequestError {
    NotFound { feed: String },
    Stale { feed: String, age_ms: i64 },
    Degraded { feed: String, eligible: usize, required: usize },
    Timeout,
    ConfigInvalid { detail: String },
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { feed } => write!(f, "feed not found: {feed}"),
            Self::Stale { feed, age_ms } => write!(f, "stale data for {feed}: age_ms={age_ms}"),
            Self::Degraded { feed, eligible, required } => write!(
                f,
                "degraded aggregation for {feed}: eligible={eligible} required={required}"
            ),
            Self::Timeout => write!(f, "request timed out"),
            Self::ConfigInvalid { detail } => write!(f, "invalid feed configuration: {detail}"),
        }
    }
}

impl std::error::Error for RequestError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_matches_spec() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn rate_limit_error_does_not_count_toward_breaker() {
        let e = AdapterError::rate_limit(5_000);
        assert!(!e.counts_toward_breaker());
        assert_eq!(e.kind(), ErrorKind::RateLimitError);
    }

    #[test]
    fn unclassified_protocol_detail_maps_to_exchange_error() {
        let e = AdapterError::exchange("unexpected payload shape");
        assert_eq!(e.kind(), ErrorKind::ExchangeError);
        assert!(e.counts_toward_breaker());
    }
}
