//! Position and confidence endpoints

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use tracing::debug;

use crate::api::{ApiResult, AppState};
use crate::optimizer::BulkWriteReport;
use crate::types::{
    now_micros, ConfidenceAspect, ConfidenceLevel, ConfidenceRecord, Point3D, PositionResult, SpatialPosition,
    VerificationEvent,
};

#[derive(Debug, Deserialize)]
pub struct UpdatePositionRequest {
    pub position: Point3D,
    pub confidence: ConfidenceLevel,
    pub source: String,
}

#[derive(Debug, Deserialize)]
pub struct VerificationRequest {
    pub verified_by: String,
    #[serde(default = "default_aspect")]
    pub aspect: ConfidenceAspect,
    pub level: ConfidenceLevel,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_aspect() -> ConfidenceAspect {
    ConfidenceAspect::Position
}

/// PUT /positions/:id
pub async fn update_position(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
    Json(req): Json<UpdatePositionRequest>,
) -> ApiResult<SpatialPosition> {
    let written = state
        .store
        .update_entity_position(&entity_id, req.position, req.confidence, &req.source)
        .await?;
    debug!("Position for {} written at {}", entity_id, written.updated_at);
    Ok(Json(written))
}

/// POST /positions/bulk
pub async fn bulk_update_positions(
    State(state): State<AppState>,
    Json(positions): Json<Vec<SpatialPosition>>,
) -> ApiResult<BulkWriteReport> {
    Ok(Json(state.store.bulk_update_positions(&positions).await?))
}

/// GET /positions/:id
pub async fn get_position(State(state): State<AppState>, Path(entity_id): Path<String>) -> ApiResult<PositionResult> {
    Ok(Json(state.store.get_entity_position(&entity_id).await?))
}

/// GET /confidence/:id
pub async fn get_confidence(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
) -> ApiResult<ConfidenceRecord> {
    Ok(Json(state.store.get_confidence_record(&entity_id).await?))
}

/// POST /confidence/:id/verifications, returns the updated record.
pub async fn record_verification(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
    Json(req): Json<VerificationRequest>,
) -> ApiResult<ConfidenceRecord> {
    let event = VerificationEvent {
        verified_at: now_micros(),
        verified_by: req.verified_by,
        aspect: req.aspect,
        level: req.level,
        notes: req.notes,
    };
    state.store.record_verification(&entity_id, event).await?;
    Ok(Json(state.store.get_confidence_record(&entity_id).await?))
}
