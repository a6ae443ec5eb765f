// crates/spatial-engine/tests/failover_scenarios.rs
//
// End-to-end behaviour of the fallback store over real SQLite files.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use proptest::prelude::*;
use spatial_engine::optimizer::{CacheConfig, QueryCache, QueryResult};
use spatial_engine::{
    BasicStore, BoundingBox, ConfidenceLevel, FallbackConfig, FallbackDataStore, Point3D, QuerySpec, RetryPolicy,
    RtreeStore, SpatialPosition, SpatialStore, SqliteStore, StoreRole, StoreTimeouts,
};
use tempfile::TempDir;

fn fast_config() -> FallbackConfig {
    FallbackConfig {
        health_interval: Duration::from_secs(3600),
        retry: RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        },
        ..FallbackConfig::default()
    }
}

/// Fallback store whose primary lives under `primary_dir` (which may not exist yet).
async fn open_store(dir: &TempDir, primary_dir: &str) -> Arc<FallbackDataStore> {
    let primary: Arc<dyn SpatialStore> = Arc::new(RtreeStore::new(
        dir.path().join(primary_dir).join("primary.db"),
        StoreTimeouts::default(),
    ));
    let secondary = Arc::new(SqliteStore::new(dir.path().join("secondary.db"), StoreTimeouts::default()));
    let store = Arc::new(FallbackDataStore::new(primary, secondary, fast_config()));
    store.connect().await.unwrap();
    store
}

// ===== Scenario A: primary down at startup =====

#[tokio::test]
async fn test_primary_down_at_startup_then_recovers() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, "primary").await;

    assert!(!store.has_spatial_support());
    assert!(!store.store_health().available);

    store
        .update_entity_position("E1", Point3D::new(1.0, 2.0, 3.0), ConfidenceLevel::High, "scan")
        .await
        .unwrap();
    assert_eq!(store.sync_queue_depth(), 1);

    // served by the secondary meanwhile
    let read = store.get_entity_position("E1").await.unwrap();
    assert_eq!(read.served_by, StoreRole::Secondary);
    assert_eq!(read.position.position, Point3D::new(1.0, 2.0, 3.0));

    std::fs::create_dir_all(dir.path().join("primary")).unwrap();
    assert!(store.check_health().await);

    assert!(store.has_spatial_support());
    assert_eq!(store.sync_queue_depth(), 0);
    let replayed = store.primary().get_position("E1").await.unwrap();
    assert_eq!(replayed.position, Point3D::new(1.0, 2.0, 3.0));

    store.shutdown().await;
}

// ===== Scenario B: last write wins =====

#[tokio::test]
async fn test_second_write_replaces_first() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("primary")).unwrap();
    let store = open_store(&dir, "primary").await;

    store
        .update_entity_position("E1", Point3D::new(0.0, 0.0, 0.0), ConfidenceLevel::High, "scan")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    store
        .update_entity_position("E1", Point3D::new(10.0, 0.0, 0.0), ConfidenceLevel::High, "scan")
        .await
        .unwrap();

    let read = store.get_entity_position("E1").await.unwrap();
    assert_eq!(read.position.position, Point3D::new(10.0, 0.0, 0.0));

    let around = store.find_near(Point3D::new(5.0, 0.0, 0.0), 20.0).await.unwrap();
    assert_eq!(around.len(), 1);

    store.shutdown().await;
}

// ===== Scenario C: radius search ordering =====

#[tokio::test]
async fn test_find_near_orders_by_distance() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("primary")).unwrap();
    let store = open_store(&dir, "primary").await;

    for (id, x) in [("far", 600.0), ("mid", 150.0), ("close", 50.0)] {
        store
            .update_entity_position(id, Point3D::new(x, 0.0, 0.0), ConfidenceLevel::Medium, "survey")
            .await
            .unwrap();
    }

    let found = store.find_near(Point3D::new(0.0, 0.0, 0.0), 200.0).await.unwrap();
    let ids: Vec<&str> = found.iter().map(|r| r.entity_id.as_str()).collect();
    assert_eq!(ids, vec!["close", "mid"]);
    assert!(found[0].distance <= found[1].distance);

    store.shutdown().await;
}

// ===== Scenario D: cache eviction =====

#[test]
fn test_eviction_removes_least_used_entry_once() {
    let config = CacheConfig {
        capacity: 3 * 256,
        entry_overhead: 256,
        row_cost: 128,
        ..CacheConfig::default()
    };
    let cache = QueryCache::new(config);
    let specs: Vec<QuerySpec> = (0..4)
        .map(|i| QuerySpec::Near {
            center: Point3D::new(i as f64, 0.0, 0.0),
            radius: 1.0,
        })
        .collect();
    let empty = || Arc::new(QueryResult::Entities(Vec::new()));

    for spec in &specs[..3] {
        assert!(cache.insert(spec.fingerprint(), empty()));
    }
    assert!(cache.get(&specs[0].fingerprint()).is_some());
    assert!(cache.get(&specs[1].fingerprint()).is_some());

    assert!(cache.insert(specs[3].fingerprint(), empty()));

    assert!(!cache.contains(&specs[2].fingerprint()));
    assert!(cache.contains(&specs[0].fingerprint()));
    assert!(cache.contains(&specs[1].fingerprint()));
    assert_eq!(cache.metrics().evictions, 1);
}

// ===== Edge Cases =====

#[tokio::test]
async fn test_read_after_write_with_primary_down() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, "missing").await;

    let written = store
        .update_entity_position("bldg-1/2/201/pump-4", Point3D::new(4.0, 4.0, 6.0), ConfidenceLevel::Low, "manual")
        .await
        .unwrap();
    let read = store.get_entity_position("bldg-1/2/201/pump-4").await.unwrap();

    assert_eq!(read.position, written);
    store.shutdown().await;
}

#[tokio::test]
async fn test_zero_radius_and_degenerate_box_match_exact_point_only() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("primary")).unwrap();
    let store = open_store(&dir, "primary").await;

    let spot = Point3D::new(3.0, 3.0, 0.0);
    store
        .update_entity_position("on-spot", spot, ConfidenceLevel::High, "scan")
        .await
        .unwrap();
    store
        .update_entity_position("nearby", Point3D::new(3.001, 3.0, 0.0), ConfidenceLevel::High, "scan")
        .await
        .unwrap();

    let by_radius = store.find_near(spot, 0.0).await.unwrap();
    assert_eq!(by_radius.len(), 1);
    assert_eq!(by_radius[0].entity_id, "on-spot");

    let by_box = store.find_in_bounding_box(BoundingBox::new(spot, spot)).await.unwrap();
    assert_eq!(by_box.len(), 1);
    assert_eq!(by_box[0].entity_id, "on-spot");

    store.shutdown().await;
}

// ===== Replay Properties =====

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_replaying_writes_twice_is_idempotent(
        writes in prop::collection::vec((0usize..3, -50.0f64..50.0, 0i64..1_000_000), 1..12)
    ) {
        tokio_test::block_on(async {
            let dir = TempDir::new().unwrap();
            let store = SqliteStore::new(dir.path().join("replay.db"), StoreTimeouts::default());
            store.connect().await.unwrap();

            let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let positions: Vec<SpatialPosition> = writes
                .iter()
                .map(|(entity, x, offset)| {
                    SpatialPosition::new(format!("e{}", entity), Point3D::new(*x, 0.0, 0.0), ConfidenceLevel::Medium, "replay")
                        .with_updated_at(base + ChronoDuration::microseconds(*offset))
                })
                .collect();

            for p in &positions {
                store.upsert_position(p).await.unwrap();
            }
            let mut first = Vec::new();
            for entity in 0..3 {
                first.push(store.get_position(&format!("e{}", entity)).await.ok());
            }

            for p in &positions {
                store.upsert_position(p).await.unwrap();
            }
            for (entity, expected) in first.iter().enumerate() {
                let again = store.get_position(&format!("e{}", entity)).await.ok();
                assert_eq!(&again, expected);
            }

            // the newest timestamp per entity wins regardless of apply order
            for (entity, stored) in first.iter().enumerate() {
                let newest = positions
                    .iter()
                    .filter(|p| p.entity_id == format!("e{}", entity))
                    .map(|p| p.updated_at)
                    .max();
                assert_eq!(stored.as_ref().map(|p| p.updated_at), newest);
            }

            store.close().await.unwrap();
        });
    }
}
