//! Error classifier (§2 "failure isolation fabric", §4.1 "unknown errors map to
//! `ExchangeError`", §7 taxonomy). Adapters already tag their own parse/auth/exchange errors
//! at the point they're raised (`AdapterError::parse`/`auth`/`exchange`); this module is the
//! one place that classifies errors arriving from generic transport layers - HTTP status
//! codes, `reqwest` errors, raw I/O errors - that don't know about the adapter taxonomy.
//!
//! Grounded on `scrapers::binance_session::TransitionReason`: a small closed reason enum that
//! every retry/rotation decision switches on, rather than matching on error message text.

use crate::error::AdapterError;

/// Classify an HTTP response status from a REST fallback call (§4.1 `FetchTickerREST`).
pub fn classify_http_status(status: u16, body_hint: &str) -> AdapterError {
    match status {
        429 => AdapterError::rate_limit(default_retry_after_ms(status)),
        401 | 403 => AdapterError::auth(format!("http {status}: {body_hint}")),
        408 | 504 => AdapterError::timeout(format!("http {status}")),
        500..=599 => AdapterError::exchange(format!("http {status}: {body_hint}")),
        _ => AdapterError::exchange(format!("unexpected http {status}: {body_hint}")),
    }
}

fn default_retry_after_ms(_status: u16) -> u64 {
    5_000
}

/// Classify a `reqwest` transport-level failure (connect refused, DNS failure, TLS handshake,
/// timeout). Timeouts are distinguished from generic connection failures because only the
/// former should ever be retried without counting as an immediate breaker strike under some
/// deployments; here both count identically per §4.2 (`TimeoutError` counts toward the
/// breaker same as `ConnectionError`), but keeping them distinct preserves the right
/// `ErrorKind` for observability (§7).
pub fn classify_reqwest_error(err: &reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::timeout(err.to_string())
    } else if err.is_connect() {
        AdapterError::connection(err.to_string())
    } else if err.is_decode() {
        AdapterError::parse(err.to_string())
    } else {
        AdapterError::exchange(err.to_string())
    }
}

/// Classify a raw I/O failure from the WebSocket transport (§4.1 handshake/TLS/timeout
/// failure). `ErrorKind::TimeoutError` for timed-out kinds, `ConnectionError` otherwise.
pub fn classify_io_error(err: &std::io::Error) -> AdapterError {
    use std::io::ErrorKind as IoKind;
    match err.kind() {
        IoKind::TimedOut => AdapterError::timeout(err.to_string()),
        _ => AdapterError::connection(err.to_string()),
    }
}

/// Fallback for any error this crate cannot otherwise identify (§4.1: "unknown errors map to
/// `ExchangeError`"). Adapters should prefer a specific `classify_*`/`AdapterError::*`
/// constructor; this exists so the mapping is total.
pub fn classify_unknown(detail: impl Into<String>) -> AdapterError {
    AdapterError::exchange(detail.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn http_429_classifies_as_rate_limit() {
        assert_eq!(classify_http_status(429, "too many requests").kind(), ErrorKind::RateLimitError);
    }

    #[test]
    fn http_401_classifies_as_auth() {
        assert_eq!(classify_http_status(401, "bad key").kind(), ErrorKind::AuthError);
    }

    #[test]
    fn http_5xx_classifies_as_exchange() {
        assert_eq!(classify_http_status(503, "maintenance").kind(), ErrorKind::ExchangeError);
    }

    #[test]
    fn io_timeout_classifies_as_timeout() {
        let e = std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline exceeded");
        assert_eq!(classify_io_error(&e).kind(), ErrorKind::TimeoutError);
    }

    #[test]
    fn io_refused_classifies_as_connection() {
        let e = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(classify_io_error(&e).kind(), ErrorKind::ConnectionError);
    }

    #[test]
    fn unknown_falls_back_to_exchange_error() {
        assert_eq!(classify_unknown("mystery").kind(), ErrorKind::ExchangeError);
    }
}
