//! Promo Code Aggregator — Binary Entrypoint
//! Boots the Axum HTTP server, wiring routes, shared state, and background
//! tasks (scheduled refresh, cache sweeper, optional snapshots).

use std::sync::Arc;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use promo_code_aggregator::config::AggregatorConfig;
use promo_code_aggregator::metrics::Metrics;
use promo_code_aggregator::refresh::{spawn_refresh_scheduler, AGGREGATE_KEY};
use promo_code_aggregator::snapshot::{spawn_snapshot_task, FileSink};
use promo_code_aggregator::{build_context, create_router};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("promo_code_aggregator=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = AggregatorConfig::load_default()?;
    let metrics = Metrics::init(config.refresh.force_refresh_secs);
    let snapshot_dir = config.snapshot_dir.clone();
    let refresh_interval = config.refresh.interval_secs;

    let ctx = build_context(config).await?;

    // Scheduled pipeline runs keep the cache warm independent of reads.
    spawn_refresh_scheduler(Arc::clone(&ctx.refresh), AGGREGATE_KEY);

    if let Some(dir) = snapshot_dir {
        spawn_snapshot_task(
            Arc::clone(&ctx.cache),
            FileSink::new(dir),
            refresh_interval,
        );
    }

    let router = create_router(ctx).merge(metrics.router());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "promo-code-aggregator listening");
    axum::serve(listener, router).await?;

    Ok(())
}
