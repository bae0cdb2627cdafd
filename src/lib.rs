// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod aggregator;
pub mod api;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod extract;
pub mod metrics;
pub mod model;
pub mod refresh;
pub mod snapshot;
pub mod sources;
pub mod trust;

use std::sync::Arc;

use anyhow::Result;

use crate::aggregator::Aggregator;
use crate::breaker::FallbackManager;
use crate::cache::CacheStore;
use crate::config::AggregatorConfig;
use crate::dedup::DedupEngine;
use crate::refresh::{RefreshManager, RefreshSource};
use crate::trust::TrustConfig;

// ---- Re-exports for stable public API ----
pub use crate::api::create_router;
pub use crate::model::{AggregationResult, Code, Provenance, Scope};

/// Everything the service shares, constructed once at startup and passed
/// explicitly. Lifecycle is tied to the process; no module-level state.
pub struct AppContext {
    pub config: AggregatorConfig,
    pub trust: Arc<TrustConfig>,
    pub cache: Arc<dyn CacheStore>,
    pub fallback: Arc<FallbackManager>,
    pub aggregator: Arc<Aggregator>,
    pub refresh: Arc<RefreshManager>,
}

/// Wire the full pipeline from a loaded configuration. Also spawns the
/// in-process cache sweeper when no remote store is reachable.
pub async fn build_context(config: AggregatorConfig) -> Result<Arc<AppContext>> {
    let trust = Arc::new(TrustConfig::load_from_file(&config.trust_path));

    let (cache, memory) = cache::select_store(&config.cache).await;
    if let Some(mem) = memory {
        cache::spawn_sweeper(mem, 60);
    }

    let fallback = Arc::new(FallbackManager::new(Arc::clone(&cache), config.breaker));
    let adapters = sources::build_adapters(&config, &trust);
    let configured = config.sources.iter().map(|s| s.name.clone()).collect();
    let dedup = DedupEngine::from_config(&config);
    let aggregator = Arc::new(Aggregator::new(
        adapters,
        configured,
        Arc::clone(&fallback),
        dedup,
        Arc::clone(&cache),
        config.breaker.stale_ceiling_secs,
    ));
    let refresh = RefreshManager::new(
        Arc::clone(&cache),
        Arc::clone(&aggregator) as Arc<dyn RefreshSource>,
        config.refresh,
    );

    Ok(Arc::new(AppContext {
        config,
        trust,
        cache,
        fallback,
        aggregator,
        refresh,
    }))
}

/// Build the in-process app router the way `main` does, for tests.
pub async fn app() -> Result<axum::Router> {
    let config = AggregatorConfig::load_default()?;
    let ctx = build_context(config).await?;
    Ok(api::create_router(ctx))
}
