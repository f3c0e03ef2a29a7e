//! Health & alert bus (C9, §4.9). In-process pub/sub: rule evaluation over the same state
//! `GetSystemHealth` reads, rate-limited per rule id by a cooldown and an hourly cap, with a
//! single "rate-limited" meta-alert standing in for everything the cap drops.
//!
//! Grounded on `middleware::rate_limit::RateLimitLayer` (per-key sliding-window counter with a
//! window reset and a burst allowance) generalized from per-IP HTTP request keys to per-rule-id
//! alert keys, and on `scrapers::oracle_comparison`'s divergence-bps computation feeding the
//! `consensusDeviation` rule.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::HealthSettings;

/// Alert severities (§4.9 rule table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// A fully-formed alert envelope (§4.9 "the bus only needs to hand it a fully-formed alert
/// envelope"), ready for an external SMTP/webhook transport to pick up.
#[derive(Debug, Clone)]
pub struct Alert {
    /// Unique per emission, so a downstream SMTP/webhook transport can dedupe retries without
    /// inventing its own id scheme.
    pub id: Uuid,
    pub rule_id: &'static str,
    pub severity: AlertSeverity,
    pub message: String,
    pub at_ms: i64,
}

/// The metric inputs every rule in §4.9 is evaluated against. Callers (the orchestrator or a
/// periodic sampling task) build one of these from `GetSystemHealth`-equivalent state and pass
/// it to [`HealthBus::evaluate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthSnapshot {
    pub consensus_deviation_pct: f64,
    pub connection_rate_pct: f64,
    pub error_rate_per_min: f64,
    pub data_age_ms: i64,
    pub quality_score: f64,
}

struct RuleLimiter {
    count_in_window: u32,
    window_start: Instant,
    last_emitted: Option<Instant>,
}

impl RuleLimiter {
    fn new(now: Instant) -> Self {
        Self { count_in_window: 0, window_start: now, last_emitted: None }
    }
}

/// Per-rule-id cooldown + hourly cap, grounded on `RateLimitLayer`'s sliding-window-per-key
/// shape (§4.9 "rate-limited per rule id with a configurable cooldown ... and per-hour cap").
pub struct HealthBus {
    settings: HealthSettings,
    limiters: Mutex<HashMap<&'static str, RuleLimiter>>,
    meta_alert_emitted_this_hour: Mutex<HashMap<&'static str, bool>>,
    alerts: broadcast::Sender<Alert>,
}

impl HealthBus {
    pub fn new(settings: HealthSettings) -> Self {
        let (alerts, _) = broadcast::channel(512);
        Self {
            settings,
            limiters: Mutex::new(HashMap::new()),
            meta_alert_emitted_this_hour: Mutex::new(HashMap::new()),
            alerts,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    /// Evaluate every rule in §4.9 against one snapshot and emit whatever fires, subject to
    /// rate limiting. `now_ms` stamps emitted alerts; rate-limiting bookkeeping itself uses
    /// `Instant` (wall-clock cooldowns are not something callers need to control deterministically
    /// at the millisecond level the way breaker/aggregator timing is).
    pub fn evaluate(&self, snapshot: &HealthSnapshot, now_ms: i64) {
        if snapshot.consensus_deviation_pct > 1.0 {
            self.raise("consensus_deviation", AlertSeverity::Critical, format!("consensus deviation {:.2}%", snapshot.consensus_deviation_pct), now_ms);
        } else if snapshot.consensus_deviation_pct > 0.5 {
            self.raise("consensus_deviation", AlertSeverity::Error, format!("consensus deviation {:.2}%", snapshot.consensus_deviation_pct), now_ms);
        }

        if snapshot.connection_rate_pct < 90.0 {
            self.raise("connection_rate", AlertSeverity::Error, format!("connection rate {:.1}%", snapshot.connection_rate_pct), now_ms);
        }

        if snapshot.error_rate_per_min > 5.0 {
            self.raise("error_rate", AlertSeverity::Error, format!("error rate {:.1}/min", snapshot.error_rate_per_min), now_ms);
        }

        if snapshot.data_age_ms > 2_000 {
            self.raise("data_age", AlertSeverity::Error, format!("data age {}ms", snapshot.data_age_ms), now_ms);
        }

        if snapshot.quality_score < 70.0 {
            self.raise("quality_score", AlertSeverity::Warning, format!("quality score {:.1}", snapshot.quality_score), now_ms);
        }
    }

    /// Rate-limit and emit one rule firing (§4.9). A rule id tracks its own rolling-hour count
    /// and its own cooldown timer; once the cap is hit within the hour, further firings for
    /// that rule are dropped and (once, per hour) a "rate-limited" meta-alert stands in.
    fn raise(&self, rule_id: &'static str, severity: AlertSeverity, message: String, now_ms: i64) {
        let now = Instant::now();
        let mut limiters = self.limiters.lock();
        let limiter = limiters.entry(rule_id).or_insert_with(|| RuleLimiter::new(now));

        if now.duration_since(limiter.window_start) >= std::time::Duration::from_secs(3600) {
            limiter.count_in_window = 0;
            limiter.window_start = now;
            self.meta_alert_emitted_this_hour.lock().remove(rule_id);
        }

        if let Some(last) = limiter.last_emitted {
            if now.duration_since(last) < self.settings.alert_cooldown {
                return;
            }
        }

        if limiter.count_in_window >= self.settings.alerts_per_hour_cap {
            let mut meta_emitted = self.meta_alert_emitted_this_hour.lock();
            if !meta_emitted.get(rule_id).copied().unwrap_or(false) {
                meta_emitted.insert(rule_id, true);
                warn!(rule_id, "alert rate cap exceeded, suppressing further firings this hour");
                let _ = self.alerts.send(Alert {
                    id: Uuid::new_v4(),
                    rule_id: "rate_limited",
                    severity: AlertSeverity::Warning,
                    message: format!("rule {rule_id} exceeded {} alerts/hour, further firings suppressed", self.settings.alerts_per_hour_cap),
                    at_ms: now_ms,
                });
            }
            return;
        }

        limiter.count_in_window += 1;
        limiter.last_emitted = Some(now);
        info!(rule_id, %severity, message, "health alert raised");
        let _ = self.alerts.send(Alert { id: Uuid::new_v4(), rule_id, severity, message, at_ms: now_ms });
    }
}
