//! HTTP server startup
//!
//! Opens both stores, wires the fallback store and index optimizer into one shared
//! [`AppState`], and serves the API until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::api::AppState;
use crate::config::Config;
use crate::fallback::FallbackDataStore;
use crate::index_optimizer::IndexOptimizer;
use crate::store::{RtreeStore, SpatialStore, SqliteStore};

/// Builds and connects every component described by `cfg`.
///
/// The secondary must be reachable; the primary may come up later.
pub async fn build_state(cfg: &Config) -> anyhow::Result<AppState> {
    let primary: Arc<dyn SpatialStore> = Arc::new(RtreeStore::new(&cfg.primary_path, cfg.timeouts.clone()));
    let secondary = Arc::new(SqliteStore::new(&cfg.secondary_path, cfg.timeouts.clone()));

    let store = Arc::new(FallbackDataStore::new(
        Arc::clone(&primary),
        secondary,
        cfg.fallback.clone(),
    ));
    store.connect().await?;
    store.start();

    let indexer = Arc::new(
        IndexOptimizer::new(primary, cfg.index.clone())
            .with_query_metrics(Arc::clone(store.optimizer().metrics_collector())),
    );
    if store.store_health().available {
        indexer.ensure_indices().await;
    }
    // an unreachable primary gets its indices on recovery
    indexer.schedule_recovery_indexing(store.subscribe_recoveries());
    if !indexer.schedule_maintenance() {
        warn!("Index maintenance jobs not scheduled");
    }

    Ok(AppState::new(store, indexer))
}

/// Router with every endpoint, CORS, request tracing and a request timeout.
pub fn build_router(state: AppState, request_timeout: Duration) -> axum::Router {
    use axum::{
        routing::{get, post, put},
        Router,
    };
    use tower_http::{
        cors::{Any, CorsLayer},
        timeout::TimeoutLayer,
        trace::TraceLayer,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST, axum::http::Method::PUT])
        .allow_headers(Any);

    Router::new()
        // Positions and confidence
        .route("/positions/bulk", post(crate::api::bulk_update_positions))
        .route(
            "/positions/:id",
            put(crate::api::update_position).get(crate::api::get_position),
        )
        .route("/confidence/:id", get(crate::api::get_confidence))
        .route("/confidence/:id/verifications", post(crate::api::record_verification))
        // Spatial queries
        .route("/query/near", post(crate::api::query_near))
        .route("/query/bbox", post(crate::api::query_bbox))
        .route("/query/nearest", post(crate::api::nearest))
        .route("/query/bulk-near", post(crate::api::bulk_near))
        .route("/query/path", post(crate::api::path_corridor))
        .route("/query/clusters", post(crate::api::clusters))
        .route("/query/confidence", get(crate::api::by_confidence))
        .route("/query/needing-verification", get(crate::api::needing_verification))
        .route("/stream/near", get(crate::api::stream_near))
        // Operations
        .route("/admin/health", get(crate::api::health))
        .route("/admin/cache", get(crate::api::cache_metrics))
        .route("/admin/queries", get(crate::api::query_metrics))
        .route("/admin/indices", get(crate::api::index_usage))
        .route("/admin/indices/recommendations", get(crate::api::index_recommendations))
        .route("/metrics", get(crate::metrics::get_metrics))
        .route("/healthz", get(|| async { "OK" }))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}

/// Runs the server until Ctrl-C, then shuts every component down.
pub async fn run_server(cfg: Config, log_filter: Option<&str>) -> anyhow::Result<()> {
    crate::telemetry::init_tracing(log_filter);
    crate::metrics::init_metrics();

    let state = build_state(&cfg).await?;
    let addr = cfg.api_addr()?;
    let app = build_router(state.clone(), Duration::from_secs(cfg.request_timeout_seconds));

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await?;

    state.indexer.shutdown().await;
    state.store.shutdown().await;
    info!("Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    /// Helper: config with both databases under a temp directory
    fn create_test_config(dir: &TempDir) -> Config {
        let mut cfg = Config::from_lookup(|_| None).unwrap();
        cfg.primary_path = dir.path().join("primary/primary.db");
        cfg.secondary_path = dir.path().join("secondary/secondary.db");
        cfg.fallback.health_interval = Duration::from_secs(3600);
        cfg
    }

    async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
        };
        (status, body)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    // ===== Full Stack Tests =====

    #[tokio::test]
    async fn test_position_round_trip_over_http() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("primary")).unwrap();
        let state = build_state(&create_test_config(&dir)).await.unwrap();
        let app = build_router(state.clone(), Duration::from_secs(5));

        let (status, _) = send(
            &app,
            json_request(
                "PUT",
                "/positions/forklift-7",
                json!({"position": {"x": 1.0, "y": 2.0, "z": 0.0}, "confidence": "high", "source": "uwb"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, get("/positions/forklift-7")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["position"]["entity_id"], "forklift-7");
        assert_eq!(body["served_by"], "primary");

        let (status, body) = send(
            &app,
            json_request("POST", "/query/near", json!({"center": {"x": 1.0, "y": 2.0, "z": 0.0}, "radius": 1.0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, body) = send(&app, get("/query/confidence?min=high")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["entity_id"], "forklift-7");
        let (status, body) = send(&app, get("/query/needing-verification?days=7")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        let (status, _) = send(&app, get("/query/confidence?min=certain")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        state.indexer.shutdown().await;
        state.store.shutdown().await;
    }

    #[tokio::test]
    async fn test_errors_map_to_status_codes() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("primary")).unwrap();
        let state = build_state(&create_test_config(&dir)).await.unwrap();
        let app = build_router(state.clone(), Duration::from_secs(5));

        let (status, body) = send(&app, get("/positions/nobody")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());

        let (status, _) = send(
            &app,
            json_request("POST", "/query/near", json!({"center": {"x": 0.0, "y": 0.0, "z": 0.0}, "radius": -1.0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        state.indexer.shutdown().await;
        state.store.shutdown().await;
    }

    #[tokio::test]
    async fn test_degraded_health_when_primary_missing() {
        let dir = TempDir::new().unwrap();
        let state = build_state(&create_test_config(&dir)).await.unwrap();
        let app = build_router(state.clone(), Duration::from_secs(5));

        let (status, body) = send(&app, get("/admin/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["spatial_support"], false);

        // stream subscriptions need the primary
        let (status, _) = send(&app, get("/stream/near?x=0&y=0&radius=5")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, body) = send(&app, get("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::String("OK".into()));

        state.indexer.shutdown().await;
        state.store.shutdown().await;
    }

    #[tokio::test]
    async fn test_index_creation_at_startup() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("primary")).unwrap();
        let state = build_state(&create_test_config(&dir)).await.unwrap();
        let app = build_router(state.clone(), Duration::from_secs(5));

        let (status, body) = send(&app, get("/admin/indices")).await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|u| u["name"].as_str())
            .collect();
        assert!(names.contains(&"idx_positions_grid_fine"));
        assert!(names.contains(&crate::index_optimizer::rules::FLOOR_INDEX));

        state.indexer.shutdown().await;
        state.store.shutdown().await;
    }

    #[tokio::test]
    async fn test_indices_created_when_primary_recovers() {
        let dir = TempDir::new().unwrap();
        let state = build_state(&create_test_config(&dir)).await.unwrap();
        let app = build_router(state.clone(), Duration::from_secs(5));
        assert!(state.indexer.scheduled_jobs().contains(&"recovery_indexing".to_string()));

        std::fs::create_dir_all(dir.path().join("primary")).unwrap();
        assert!(state.store.check_health().await);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let (status, body) = send(&app, get("/admin/indices")).await;
            let names: Vec<String> = match (status, body.as_array()) {
                (StatusCode::OK, Some(usage)) => usage
                    .iter()
                    .filter_map(|u| u["name"].as_str().map(String::from))
                    .collect(),
                _ => Vec::new(),
            };
            if names.iter().any(|n| n == "idx_positions_grid_fine")
                && names.iter().any(|n| n == crate::index_optimizer::rules::FLOOR_INDEX)
            {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "indices missing after recovery: {:?}", names);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        state.indexer.shutdown().await;
        state.store.shutdown().await;
    }
}
