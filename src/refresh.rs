//! # Refresh Manager
//! Stale-while-revalidate over the aggregate result as a whole.
//!
//! A cached aggregate younger than the force-refresh threshold is returned
//! as-is. A stale one is returned immediately while a single detached
//! background refresh repopulates the cache; concurrent stale reads observe
//! the in-flight flag and do not pile on. A cache miss blocks the caller on
//! one synchronous run. A timer-based scheduler re-runs the pipeline on a
//! fixed interval so read latency stays decoupled from provider latency.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use metrics::{counter, gauge};
use tokio::task::JoinHandle;

use crate::cache::{get_json, set_json, CacheStore, Envelope};
use crate::config::RefreshConfig;
use crate::model::{now_unix, AggregationResult};

/// Cache key for the live aggregate served to readers.
pub const AGGREGATE_KEY: &str = "aggregate:result";

/// Whatever can rebuild the aggregate; the orchestrator in production, a
/// counting fake in tests.
#[async_trait]
pub trait RefreshSource: Send + Sync {
    async fn produce(&self) -> Result<AggregationResult>;
}

pub struct RefreshManager {
    cache: Arc<dyn CacheStore>,
    source: Arc<dyn RefreshSource>,
    cfg: RefreshConfig,
    in_flight: Mutex<HashSet<String>>,
}

impl RefreshManager {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        source: Arc<dyn RefreshSource>,
        cfg: RefreshConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            source,
            cfg,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Serve the aggregate for `key` with bounded staleness.
    pub async fn get(self: &Arc<Self>, key: &str) -> AggregationResult {
        let cached: Option<Envelope<AggregationResult>> =
            get_json(self.cache.as_ref(), key).await;
        let now = now_unix();
        match cached {
            Some(env) if env.age_secs(now) < self.cfg.force_refresh_secs => {
                let mut result = env.payload;
                result.stats.cache_hit = true;
                result
            }
            Some(env) if self.cfg.background => {
                self.trigger_background(key);
                counter!("refresh_served_stale_total").increment(1);
                let mut result = env.payload;
                result.stats.cache_hit = true;
                result.stats.stale = true;
                result
            }
            // Background refresh disabled: a stale read pays for the rebuild.
            Some(_) | None => self.refresh_now(key).await,
        }
    }

    /// Run the pipeline synchronously and repopulate the cache.
    pub async fn refresh_now(self: &Arc<Self>, key: &str) -> AggregationResult {
        counter!("refresh_sync_total").increment(1);
        self.produce_and_cache(key).await
    }

    /// A failed rebuild never writes to the cache: a stale-but-servable
    /// aggregate under `key` must survive the failure and keep answering
    /// readers. Only when nothing is cached does the caller get the
    /// empty-but-well-formed result.
    async fn produce_and_cache(&self, key: &str) -> AggregationResult {
        match self.source.produce().await {
            Ok(result) => {
                set_json(
                    self.cache.as_ref(),
                    key,
                    &Envelope::new(&result),
                    self.cfg.result_ttl_secs,
                )
                .await;
                gauge!("refresh_last_run_ts").set(now_unix() as f64);
                result
            }
            Err(e) => {
                counter!("refresh_failed_total").increment(1);
                tracing::error!(key, error = %format!("{e:#}"), "refresh source failed");
                let cached: Option<Envelope<AggregationResult>> =
                    get_json(self.cache.as_ref(), key).await;
                match cached {
                    Some(env) => {
                        let mut result = env.payload;
                        result.stats.cache_hit = true;
                        result.stats.stale = true;
                        result
                    }
                    None => AggregationResult::empty(Default::default()),
                }
            }
        }
    }

    /// Atomically claim the in-flight slot for `key`.
    fn try_begin(&self, key: &str) -> bool {
        let mut flags = self.in_flight.lock().expect("refresh mutex poisoned");
        flags.insert(key.to_string())
    }

    fn end(&self, key: &str) {
        let mut flags = self.in_flight.lock().expect("refresh mutex poisoned");
        flags.remove(key);
    }

    /// Detached revalidation; at most one per key at any time.
    fn trigger_background(self: &Arc<Self>, key: &str) {
        if !self.try_begin(key) {
            counter!("refresh_suppressed_total").increment(1);
            return;
        }
        counter!("refresh_background_total").increment(1);
        let mgr = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            let result = mgr.produce_and_cache(&key).await;
            tracing::info!(
                key = %key,
                unique = result.stats.unique,
                "background refresh complete"
            );
            mgr.end(&key);
        });
    }
}

/// Timer-based variant: re-run the pipeline every `interval_secs` regardless
/// of read traffic.
pub fn spawn_refresh_scheduler(mgr: Arc<RefreshManager>, key: &'static str) -> JoinHandle<()> {
    let interval = Duration::from_secs(mgr.cfg.interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The immediate first tick warms the cache at startup.
        loop {
            ticker.tick().await;
            let result = mgr.refresh_now(key).await;
            tracing::info!(
                target: "refresh",
                key,
                unique = result.stats.unique,
                "scheduled refresh tick"
            );
        }
    })
}
