//! # Aggregator Orchestrator
//! Fans out to every enabled adapter concurrently (each call wrapped by the
//! fallback manager), merges the combined candidate list through the dedup
//! engine, and assembles the final `AggregationResult` with per-source
//! status metadata.
//!
//! One adapter failing, hanging, or panicking never cancels its siblings;
//! the orchestrator always returns a structurally valid result, falling back
//! to the last good cached aggregate and finally to an empty result with
//! honest zeroed metadata.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::task::JoinSet;

use crate::breaker::{BreakerView, FallbackManager, FallbackOutcome};
use crate::cache::{get_json, set_json, CacheStore, Envelope};
use crate::dedup::DedupEngine;
use crate::model::{
    now_unix, AggregationResult, AggregationStats, SourceReport, SourceStatus,
};
use crate::refresh::RefreshSource;
use crate::sources::{FetchSuccess, HealthReport, SourceAdapter};

const LAST_GOOD_KEY: &str = "aggregate:last_good";
const CACHE_PROBE_KEY: &str = "health:probe";

/// Read-only diagnostic returned by `/status`.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub cache_backend: String,
    pub cache_reachable: bool,
    pub sources: BTreeMap<String, HealthReport>,
    pub breakers: BTreeMap<String, BreakerView>,
}

pub struct Aggregator {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    /// Every source name the config knows about, enabled or not; names
    /// without a live adapter are reported `not_configured`.
    configured: Vec<String>,
    fallback: Arc<FallbackManager>,
    dedup: DedupEngine,
    cache: Arc<dyn CacheStore>,
    last_good_ttl_secs: u64,
}

fn source_key(name: &str) -> String {
    format!("source:{name}")
}

impl Aggregator {
    pub fn new(
        adapters: Vec<Arc<dyn SourceAdapter>>,
        configured: Vec<String>,
        fallback: Arc<FallbackManager>,
        dedup: DedupEngine,
        cache: Arc<dyn CacheStore>,
        last_good_ttl_secs: u64,
    ) -> Self {
        Self {
            adapters,
            configured,
            fallback,
            dedup,
            cache,
            last_good_ttl_secs,
        }
    }

    /// The entry point. Never fails; the worst case is an empty result with
    /// per-source `failed`/`not_configured` statuses.
    pub async fn aggregate_codes(&self) -> AggregationResult {
        counter!("aggregate_runs_total").increment(1);
        match self.run_pipeline().await {
            Ok(result) => {
                set_json(
                    self.cache.as_ref(),
                    LAST_GOOD_KEY,
                    &Envelope::new(&result),
                    self.last_good_ttl_secs,
                )
                .await;
                gauge!("aggregate_unique_codes").set(result.stats.unique as f64);
                gauge!("aggregate_last_run_ts").set(result.generated_at as f64);
                result
            }
            Err(e) => {
                counter!("aggregate_pipeline_errors_total").increment(1);
                tracing::error!(error = %format!("{e:#}"), "aggregation pipeline failed");
                let cached: Option<Envelope<AggregationResult>> =
                    get_json(self.cache.as_ref(), LAST_GOOD_KEY).await;
                match cached {
                    Some(env) => {
                        let mut result = env.payload;
                        result.stats.cache_hit = true;
                        result.stats.stale = true;
                        result
                    }
                    None => AggregationResult::empty(self.failure_reports()),
                }
            }
        }
    }

    async fn run_pipeline(&self) -> Result<AggregationResult> {
        let mut set: JoinSet<(String, Result<FallbackOutcome<FetchSuccess>>)> = JoinSet::new();
        for adapter in &self.adapters {
            let adapter = Arc::clone(adapter);
            let fallback = Arc::clone(&self.fallback);
            set.spawn(async move {
                let name = adapter.name().to_string();
                let key = source_key(&name);
                let outcome = fallback
                    .execute_with_fallback(&key, || adapter.fetch(), None)
                    .await;
                (name, outcome)
            });
        }

        let now = now_unix();
        let mut candidates = Vec::new();
        let mut reports: BTreeMap<String, SourceReport> = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, outcome)) => {
                    let (codes, report) = classify_outcome(outcome, now);
                    candidates.extend(codes);
                    reports.insert(name, report);
                }
                Err(e) => {
                    // A panicked adapter task loses its name; log and move on,
                    // the report map fills the gap below as `failed`.
                    tracing::error!(error = %e, "adapter task aborted");
                }
            }
        }

        for adapter in &self.adapters {
            reports.entry(adapter.name().to_string()).or_insert(SourceReport {
                status: SourceStatus::Failed,
                items: 0,
                last_fetch_at: None,
                error: Some("adapter task aborted".to_string()),
            });
        }
        for name in &self.configured {
            reports
                .entry(name.clone())
                .or_insert_with(SourceReport::not_configured);
        }

        let total_candidates = candidates.len();
        let outcome = self.dedup.run(candidates, now);
        let stats = AggregationStats {
            total: outcome.stats.total,
            unique: outcome.stats.unique,
            duplicates: outcome.stats.duplicates,
            merged: outcome.stats.merged,
            cache_hit: false,
            stale: false,
        };
        tracing::info!(
            candidates = total_candidates,
            unique = stats.unique,
            merged = stats.merged,
            "aggregation run complete"
        );

        Ok(AggregationResult {
            generated_at: now,
            codes: outcome.codes,
            sources: reports,
            stats,
        })
    }

    /// Report map for the last-resort empty result.
    fn failure_reports(&self) -> BTreeMap<String, SourceReport> {
        let mut reports: BTreeMap<String, SourceReport> = BTreeMap::new();
        for adapter in &self.adapters {
            reports.insert(
                adapter.name().to_string(),
                SourceReport {
                    status: SourceStatus::Failed,
                    items: 0,
                    last_fetch_at: None,
                    error: Some("pipeline failed with no cached fallback".to_string()),
                },
            );
        }
        for name in &self.configured {
            reports
                .entry(name.clone())
                .or_insert_with(SourceReport::not_configured);
        }
        reports
    }

    /// Live diagnostic: adapter health checks, cache reachability, breaker
    /// states. Off the hot path.
    pub async fn health_status(&self) -> HealthStatus {
        let mut sources = BTreeMap::new();
        for adapter in &self.adapters {
            sources.insert(adapter.name().to_string(), adapter.health_check().await);
        }

        self.cache.set(CACHE_PROBE_KEY, "1", 60).await;
        let cache_reachable = self.cache.exists(CACHE_PROBE_KEY).await;

        HealthStatus {
            cache_backend: self.cache.backend().to_string(),
            cache_reachable,
            sources,
            breakers: self.fallback.snapshot(),
        }
    }
}

/// Map a per-source fallback outcome onto codes + report metadata.
fn classify_outcome(
    outcome: Result<FallbackOutcome<FetchSuccess>>,
    now: u64,
) -> (Vec<crate::model::Code>, SourceReport) {
    match outcome {
        Ok(FallbackOutcome::Fresh(s)) => (
            s.codes,
            SourceReport {
                status: SourceStatus::Ok,
                items: s.count,
                last_fetch_at: Some(now),
                error: None,
            },
        ),
        Ok(FallbackOutcome::Stale { value, age_secs }) => (
            value.codes,
            SourceReport {
                status: SourceStatus::Degraded,
                items: value.count,
                last_fetch_at: Some(now.saturating_sub(age_secs)),
                error: Some(format!("serving cached data, {age_secs}s old")),
            },
        ),
        Ok(FallbackOutcome::Default(s)) => (
            s.codes,
            SourceReport {
                status: SourceStatus::Degraded,
                items: 0,
                last_fetch_at: None,
                error: Some("no live or cached data, default used".to_string()),
            },
        ),
        Err(e) => (
            Vec::new(),
            SourceReport {
                status: SourceStatus::Failed,
                items: 0,
                last_fetch_at: None,
                error: Some(format!("{e:#}")),
            },
        ),
    }
}

#[async_trait]
impl RefreshSource for Aggregator {
    async fn produce(&self) -> Result<AggregationResult> {
        Ok(self.aggregate_codes().await)
    }
}
