//! Prometheus recorder installation and the `/metrics` route. Every series
//! the pipeline emits is described here so exposition metadata lives in one
//! place.

use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder, register series metadata, and expose
    /// a static gauge for the stale-while-revalidate threshold.
    pub fn init(force_refresh_secs: u64) -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("prometheus: install recorder");

        describe_series();
        gauge!("aggregate_refresh_threshold_secs").set(force_refresh_secs as f64);

        Self { handle }
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

fn describe_series() {
    // Source adapters.
    describe_counter!("source_codes_total", "Candidate codes emitted by providers.");
    describe_counter!("source_fetch_errors_total", "Provider fetches that failed every attempt.");
    describe_counter!(
        "source_rate_limited_total",
        "Fetch attempts delayed by provider rate limiting."
    );
    describe_histogram!("source_fetch_ms", "Provider fetch+parse time in milliseconds.");

    // Breaker / fallback.
    describe_counter!("breaker_opened_total", "Circuit breakers tripped open.");
    describe_counter!("fallback_served_total", "Fetches answered from the fallback cache.");

    // Orchestrator.
    describe_counter!("aggregate_runs_total", "Full aggregation pipeline runs.");
    describe_counter!(
        "aggregate_pipeline_errors_total",
        "Pipeline faults answered from the last good cache."
    );
    describe_gauge!("aggregate_unique_codes", "Unique codes in the last result.");
    describe_gauge!("aggregate_last_run_ts", "Unix ts of the last pipeline run.");

    // Refresh manager.
    describe_counter!("refresh_sync_total", "Blocking refreshes (cache miss).");
    describe_counter!(
        "refresh_background_total",
        "Detached refreshes triggered by stale reads."
    );
    describe_counter!(
        "refresh_suppressed_total",
        "Stale reads that found a refresh already in flight."
    );
    describe_counter!("refresh_served_stale_total", "Reads answered with stale data.");
    describe_counter!("refresh_failed_total", "Refresh runs whose rebuild errored.");
    describe_gauge!("refresh_last_run_ts", "Unix ts of the last completed refresh.");
}
