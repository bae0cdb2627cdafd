use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::aggregator::HealthStatus;
use crate::breaker::BreakerView;
use crate::model::{filter_scope, filter_search, now_unix, Code, Scope};
use crate::refresh::AGGREGATE_KEY;
use crate::AppContext;

#[derive(Clone)]
pub struct AppState {
    ctx: Arc<AppContext>,
}

pub fn create_router(ctx: Arc<AppContext>) -> Router {
    let state = AppState { ctx };

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/codes", get(get_codes))
        .route("/status", get(get_status))
        .route("/admin/refresh", post(admin_refresh))
        .route("/debug/breakers", get(debug_breakers))
        .route("/debug/source-weight", get(debug_source_weight))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(serde::Deserialize)]
struct CodesQuery {
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    search: Option<String>,
}

#[derive(serde::Serialize)]
struct CodesResponse {
    generated_at: u64,
    scope: Scope,
    codes: Vec<Code>,
    sources: BTreeMap<String, crate::model::SourceReport>,
    stats: crate::model::AggregationStats,
}

async fn get_codes(
    State(state): State<AppState>,
    Query(q): Query<CodesQuery>,
) -> Result<Json<CodesResponse>, (axum::http::StatusCode, String)> {
    let scope: Scope = q
        .scope
        .as_deref()
        .unwrap_or("all")
        .parse()
        .map_err(|e: anyhow::Error| (axum::http::StatusCode::BAD_REQUEST, e.to_string()))?;

    let result = state.ctx.refresh.get(AGGREGATE_KEY).await;

    let mut codes = filter_scope(&result.codes, scope, now_unix());
    if let Some(needle) = q.search.as_deref() {
        codes = filter_search(&codes, needle);
    }

    Ok(Json(CodesResponse {
        generated_at: result.generated_at,
        scope,
        codes,
        sources: result.sources,
        stats: result.stats,
    }))
}

async fn get_status(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(state.ctx.aggregator.health_status().await)
}

#[derive(serde::Serialize)]
struct RefreshOut {
    unique: usize,
    total: usize,
    generated_at: u64,
}

async fn admin_refresh(State(state): State<AppState>) -> Json<RefreshOut> {
    let result = state.ctx.refresh.refresh_now(AGGREGATE_KEY).await;
    Json(RefreshOut {
        unique: result.stats.unique,
        total: result.stats.total,
        generated_at: result.generated_at,
    })
}

async fn debug_breakers(State(state): State<AppState>) -> Json<BTreeMap<String, BreakerView>> {
    Json(state.ctx.fallback.snapshot())
}

async fn debug_source_weight(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> String {
    let s = q.get("source").cloned().unwrap_or_default();
    let w = state.ctx.trust.weight_for(&s);
    let auth = state.ctx.trust.is_authoritative(&s);
    format!("source='{}' -> weight={:.2} authoritative={}", s, w, auth)
}
