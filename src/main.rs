//! Service entrypoint. Loads environment/config, starts the orchestrator (C8), and runs its
//! background tasks until `Ctrl+C` or the process receives a termination signal, then shuts
//! down within the bounded grace period.
//!
//! Grounded on the teacher's own `main.rs` init sequence (`load_env()` + `init_tracing()`
//! before anything else) and `src/bin/route_quality_monitor.rs`'s clap-args + `tokio::select!`
//! over `ctrl_c()` shutdown pattern - this binary has no HTTP surface of its own (§6 "Public
//! API consumed by the out-of-scope request surface"), so there is no `axum::serve` to select
//! alongside the signal.

use std::path::Path;

use clap::Parser;
use dotenv::dotenv;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oraclefeed_backend::config::Settings;
use oraclefeed_backend::feeds::{FeedConfig, FeedRecord};
use oraclefeed_backend::orchestrator::Orchestrator;

#[derive(Parser, Debug)]
#[command(name = "oraclefeed")]
#[command(about = "Multi-exchange price-feed oracle core")]
struct Args {
    /// Path to the feeds.json configuration file (§6 feed configuration).
    #[arg(long, env = "ORACLEFEED_FEEDS_PATH", default_value = "feeds.json")]
    feeds_path: String,
}

/// Mirrors the teacher's own `load_env()`: a standard `cwd`-and-parents dotenv search, plus a
/// fallback to the crate-root `.env` for `cargo run --manifest-path` invocations from elsewhere.
fn load_env() {
    let _ = dotenv();
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    for candidate in [manifest_dir.join(".env"), manifest_dir.join("../.env")] {
        if candidate.exists() {
            let _ = dotenv::from_path(&candidate);
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oraclefeed_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();
    let settings = Settings::from_env();

    let raw = std::fs::read_to_string(&args.feeds_path)
        .map_err(|e| anyhow::anyhow!("failed to read feed config {}: {e}", args.feeds_path))?;
    let records: Vec<FeedRecord> = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse feed config {}: {e}", args.feeds_path))?;
    let feed_config = FeedConfig::from_records(records)
        .map_err(|e| anyhow::anyhow!("invalid feed configuration: {e}"))?;

    tracing::info!(feeds = feed_config.feeds.len(), path = %args.feeds_path, "starting oraclefeed core");

    let orchestrator = Orchestrator::start(settings, feed_config).await.map_err(|e| anyhow::anyhow!(e))?;
    orchestrator.run(now_ms).await;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}
