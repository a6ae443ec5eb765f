//! Spatial query endpoints and the change stream.
//!
//! Every query goes through the fallback store, so answers come from the primary's
//! cached, indexed path when it is healthy and from the secondary's scans otherwise.

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::{ApiError, ApiResult, AppState};
use crate::store::GridResolution;
use crate::types::{BoundingBox, ConfidenceLevel, EntityDistance, EntityResult, Point3D, SpatialCluster};

#[derive(Debug, Deserialize)]
pub struct NearRequest {
    pub center: Point3D,
    pub radius: f64,
}

#[derive(Debug, Deserialize)]
pub struct NearestRequest {
    pub center: Point3D,
    #[serde(default = "default_k")]
    pub k: usize,
}

fn default_k() -> usize {
    10
}

#[derive(Debug, Deserialize)]
pub struct BulkNearRequest {
    pub centers: Vec<Point3D>,
    pub radius: f64,
}

#[derive(Debug, Deserialize)]
pub struct PathRequest {
    pub path: Vec<Point3D>,
    pub width: f64,
}

#[derive(Debug, Deserialize)]
pub struct ClusterRequest {
    pub bbox: BoundingBox,
    #[serde(default = "default_resolution")]
    pub resolution: GridResolution,
    #[serde(default = "default_min_count")]
    pub min_count: usize,
}

fn default_resolution() -> GridResolution {
    GridResolution::Medium
}

fn default_min_count() -> usize {
    2
}

/// Query string of `GET /query/confidence`.
#[derive(Debug, Deserialize)]
pub struct ConfidenceParams {
    pub min: ConfidenceLevel,
}

/// Query string of `GET /query/needing-verification`.
#[derive(Debug, Deserialize)]
pub struct VerificationParams {
    #[serde(default = "default_verification_days")]
    pub days: u32,
}

fn default_verification_days() -> u32 {
    30
}

/// Query string of `GET /stream/near`.
#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
    pub radius: f64,
}

/// POST /query/near
pub async fn query_near(State(state): State<AppState>, Json(req): Json<NearRequest>) -> ApiResult<Vec<EntityResult>> {
    Ok(Json(state.store.find_near(req.center, req.radius).await?))
}

/// POST /query/bbox
pub async fn query_bbox(State(state): State<AppState>, Json(bbox): Json<BoundingBox>) -> ApiResult<Vec<EntityResult>> {
    Ok(Json(state.store.find_in_bounding_box(bbox).await?))
}

/// POST /query/nearest
pub async fn nearest(State(state): State<AppState>, Json(req): Json<NearestRequest>) -> ApiResult<Vec<EntityDistance>> {
    Ok(Json(state.store.find_k_nearest(req.center, req.k).await?))
}

/// POST /query/bulk-near
pub async fn bulk_near(
    State(state): State<AppState>,
    Json(req): Json<BulkNearRequest>,
) -> ApiResult<HashMap<usize, Vec<String>>> {
    Ok(Json(state.store.bulk_find_near(req.centers, req.radius).await?))
}

/// POST /query/path
pub async fn path_corridor(State(state): State<AppState>, Json(req): Json<PathRequest>) -> ApiResult<Vec<EntityResult>> {
    Ok(Json(state.store.find_along_path(req.path, req.width).await?))
}

/// POST /query/clusters
pub async fn clusters(
    State(state): State<AppState>,
    Json(req): Json<ClusterRequest>,
) -> ApiResult<Vec<SpatialCluster>> {
    Ok(Json(
        state
            .store
            .find_clusters(req.bbox, req.resolution, req.min_count)
            .await?,
    ))
}

/// GET /query/confidence?min=high
pub async fn by_confidence(
    State(state): State<AppState>,
    Query(params): Query<ConfidenceParams>,
) -> ApiResult<Vec<EntityResult>> {
    Ok(Json(state.store.find_by_confidence(params.min).await?))
}

/// GET /query/needing-verification?days=30
pub async fn needing_verification(
    State(state): State<AppState>,
    Query(params): Query<VerificationParams>,
) -> ApiResult<Vec<EntityResult>> {
    Ok(Json(state.store.find_needing_verification(params.days).await?))
}

/// GET /stream/near?x=..&y=..&z=..&radius=..
///
/// Server-sent events, one `change` event per matching position write on the primary.
pub async fn stream_near(State(state): State<AppState>, Query(params): Query<StreamParams>) -> Response {
    let center = Point3D::new(params.x, params.y, params.z);
    let mut changes = match state.store.stream_near(center, params.radius) {
        Ok(stream) => stream,
        Err(e) => return ApiError(e).into_response(),
    };
    info!("Change stream {} opened around {} (r={})", changes.id(), center, params.radius);

    let events = async_stream::stream! {
        while let Some(change) = changes.recv().await {
            match Event::default().event("change").json_data(&change) {
                Ok(event) => yield Ok::<_, Infallible>(event),
                Err(e) => warn!("Could not encode change for {}: {}", change.entity_id, e),
            }
        }
        debug!("Change stream {} ended ({} dropped)", changes.id(), changes.dropped());
    };

    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}
