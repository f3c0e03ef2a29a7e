//! Standalone health-snapshot printer.
//!
//! Usage:
//!   oraclefeed-health-monitor --feeds-path feeds.json [--interval-secs 5]
//!
//! Starts its own orchestrator against the same feed configuration as the main service,
//! prints `GetSystemHealth()` (§6) to stdout at the configured interval, and exits on
//! `Ctrl+C`. It is a diagnostics tool, not a supervisor - it does not share process state with
//! a running `oraclefeed` instance.
//!
//! Grounded on `src/bin/perf_monitor.rs` (a small standalone bin that polls and prints a live
//! status snapshot) and `src/bin/route_quality_monitor.rs`'s clap-args + logging init shape.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oraclefeed_backend::config::Settings;
use oraclefeed_backend::feeds::{FeedConfig, FeedRecord};
use oraclefeed_backend::orchestrator::Orchestrator;

#[derive(Parser, Debug)]
#[command(name = "oraclefeed-health-monitor")]
#[command(about = "Print periodic GetSystemHealth() snapshots for a feed configuration")]
struct Args {
    #[arg(long, env = "ORACLEFEED_FEEDS_PATH", default_value = "feeds.json")]
    feeds_path: String,

    #[arg(long, default_value_t = 5)]
    interval_secs: u64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oraclefeed_health_monitor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let raw = std::fs::read_to_string(&args.feeds_path)
        .map_err(|e| anyhow::anyhow!("failed to read feed config {}: {e}", args.feeds_path))?;
    let records: Vec<FeedRecord> = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse feed config {}: {e}", args.feeds_path))?;
    let feed_config = FeedConfig::from_records(records)
        .map_err(|e| anyhow::anyhow!("invalid feed configuration: {e}"))?;

    let orchestrator = Orchestrator::start(Settings::from_env(), feed_config).await.map_err(|e| anyhow::anyhow!(e))?;
    orchestrator.run(now_ms).await;

    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(args.interval_secs));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let health = orchestrator.get_system_health(now_ms());
                println!(
                    "status={} sources={} health_score_avg_confidence={:.1} perf_avg_response_ms={:.1} timestamp={}",
                    health.status,
                    health.sources.len(),
                    health.accuracy_avg_confidence * 100.0,
                    health.performance_avg_response_time_ms,
                    health.timestamp,
                );
            }
            _ = tokio::signal::ctrl_c() => {
                println!("shutting down health monitor");
                break;
            }
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}
