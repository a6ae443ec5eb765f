//! HTTP handlers over the fallback store and the index optimizer

pub mod admin_api;
pub mod position_api;
pub mod query_api;

pub use admin_api::{cache_metrics, health, index_recommendations, index_usage, query_metrics};
pub use position_api::{bulk_update_positions, get_confidence, get_position, record_verification, update_position};
pub use query_api::{
    bulk_near, by_confidence, clusters, nearest, needing_verification, path_corridor, query_bbox, query_near,
    stream_near,
};

use crate::error::{ErrorClass, StoreError};
use crate::fallback::FallbackDataStore;
use crate::index_optimizer::IndexOptimizer;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<FallbackDataStore>,
    pub indexer: Arc<IndexOptimizer>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(store: Arc<FallbackDataStore>, indexer: Arc<IndexOptimizer>) -> Self {
        Self {
            store,
            indexer,
            started_at: Instant::now(),
        }
    }
}

/// Store error rendered as a JSON body with a matching status code.
#[derive(Debug)]
pub struct ApiError(pub StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            StoreError::Constraint(_) => StatusCode::CONFLICT,
            StoreError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            e if e.class() == ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            warn!("Request rejected: {}", self.0);
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;
