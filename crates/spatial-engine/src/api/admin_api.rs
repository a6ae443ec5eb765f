//! Operational views: health, cache, query latency and index state

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::api::{ApiResult, AppState};
use crate::index_optimizer::IndexRecommendation;
use crate::optimizer::{CacheMetrics, PrefetchStats, QueryLatency};
use crate::store::IndexUsage;
use crate::types::StoreHealth;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub primary: StoreHealth,
    pub spatial_support: bool,
    pub sync_queue_depth: usize,
    pub active_subscriptions: usize,
    pub prefetch: PrefetchStats,
}

/// GET /admin/health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let primary = state.store.store_health();
    let status = if primary.available { "healthy" } else { "degraded" };
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        spatial_support: state.store.has_spatial_support(),
        sync_queue_depth: state.store.sync_queue_depth(),
        active_subscriptions: state.store.optimizer().active_subscriptions(),
        prefetch: state.store.optimizer().prefetch_stats(),
        primary,
    })
}

/// GET /admin/cache
pub async fn cache_metrics(State(state): State<AppState>) -> Json<CacheMetrics> {
    Json(state.store.cache_metrics())
}

/// GET /admin/queries, slowest first
pub async fn query_metrics(State(state): State<AppState>) -> Json<Vec<QueryLatency>> {
    Json(state.store.query_metrics())
}

/// GET /admin/indices
pub async fn index_usage(State(state): State<AppState>) -> ApiResult<Vec<IndexUsage>> {
    let usage = state.indexer.analyze_usage().await?;
    Ok(Json(usage.as_ref().clone()))
}

/// GET /admin/indices/recommendations, from a fresh analysis run
pub async fn index_recommendations(State(state): State<AppState>) -> Json<Vec<IndexRecommendation>> {
    Json(state.indexer.run_analysis().await.as_ref().clone())
}
