//! Always-available secondary store: plain tables, spatial predicates by scanning
use crate::error::{StoreError, StoreResult};
use crate::store::schema::SECONDARY_MIGRATIONS;
use crate::store::{
    check_bbox, check_path, check_point, check_radius, open_pool, records, BasicStore, GridResolution,
    MigrationManager, PoolSlot, StoreTimeouts,
};
use crate::types::{
    BoundingBox, ConfidenceLevel, ConfidenceRecord, ConfidenceUpdate, EntityDistance, EntityResult, Point3D,
    SpatialCluster, SpatialPosition, VerificationEvent,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tracing::{debug, info};

pub struct SqliteStore {
    path: PathBuf,
    pool_size: u32,
    timeouts: StoreTimeouts,
    slot: PoolSlot,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>, timeouts: StoreTimeouts) -> Self {
        Self {
            path: path.into(),
            pool_size: 8,
            timeouts,
            slot: PoolSlot::new("secondary"),
        }
    }

    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl BasicStore for SqliteStore {
    fn name(&self) -> &str {
        "secondary"
    }

    async fn connect(&self) -> StoreResult<()> {
        if self.slot.is_connected() {
            return Ok(());
        }
        info!("Opening secondary store at {}", self.path.display());
        let path = self.path.clone();
        let pool_size = self.pool_size;
        let deadline = self.timeouts.probe;
        let pool = tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Connectivity(format!("unable to open {}: {}", parent.display(), e)))?;
            }
            let pool = open_pool(&path, pool_size, deadline)?;
            let mut conn = pool.get()?;
            let version = MigrationManager::new(&mut conn, "secondary").migrate(SECONDARY_MIGRATIONS)?;
            debug!("Secondary schema version {}", version);
            drop(conn);
            Ok::<_, StoreError>(pool)
        })
        .await??;
        self.slot.install(pool);
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        if self.slot.clear() {
            info!("Secondary store closed");
        }
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.slot
            .run("ping", self.timeouts.probe, |conn| {
                conn.query_row("SELECT 1", [], |_| Ok(()))?;
                Ok(())
            })
            .await
    }

    async fn upsert_position(&self, position: &SpatialPosition) -> StoreResult<bool> {
        check_point(&position.position)?;
        let position = position.clone();
        self.slot
            .run("upsert_position", self.timeouts.read, move |conn| records::upsert_position(conn, &position))
            .await
    }

    async fn get_position(&self, entity_id: &str) -> StoreResult<SpatialPosition> {
        let id = entity_id.to_string();
        self.slot
            .run("get_position", self.timeouts.read, move |conn| records::get_position(conn, &id))
            .await
    }

    async fn apply_positions(&self, positions: &[SpatialPosition]) -> StoreResult<usize> {
        positions.iter().try_for_each(|p| check_point(&p.position))?;
        let positions = positions.to_vec();
        self.slot
            .run("apply_positions", self.timeouts.bulk, move |conn| {
                let tx = conn.transaction()?;
                let mut changed = 0;
                for p in &positions {
                    if records::upsert_position(&tx, p)? {
                        changed += 1;
                    }
                }
                tx.commit()?;
                Ok(changed)
            })
            .await
    }

    async fn upsert_confidence(&self, update: &ConfidenceUpdate) -> StoreResult<()> {
        let update = update.clone();
        self.slot
            .run("upsert_confidence", self.timeouts.read, move |conn| records::upsert_confidence(conn, &update))
            .await
    }

    async fn append_verification(&self, entity_id: &str, event: &VerificationEvent) -> StoreResult<()> {
        let id = entity_id.to_string();
        let event = event.clone();
        self.slot
            .run("append_verification", self.timeouts.read, move |conn| {
                records::append_verification(conn, &id, &event)
            })
            .await
    }

    async fn get_confidence(&self, entity_id: &str) -> StoreResult<ConfidenceRecord> {
        let id = entity_id.to_string();
        self.slot
            .run("get_confidence", self.timeouts.read, move |conn| records::get_confidence(conn, &id))
            .await
    }

    async fn find_by_confidence(&self, min_level: ConfidenceLevel) -> StoreResult<Vec<EntityResult>> {
        self.slot
            .run("find_by_confidence", self.timeouts.read, move |conn| {
                records::scan_by_confidence(conn, min_level)
            })
            .await
    }

    async fn find_needing_verification(&self, verified_before: DateTime<Utc>) -> StoreResult<Vec<EntityResult>> {
        self.slot
            .run("find_needing_verification", self.timeouts.read, move |conn| {
                records::scan_needing_verification(conn, verified_before)
            })
            .await
    }

    async fn find_near(&self, center: Point3D, radius: f64) -> StoreResult<Vec<EntityResult>> {
        check_point(&center)?;
        check_radius(radius)?;
        self.slot
            .run("find_near", self.timeouts.read, move |conn| records::scan_near(conn, center, radius))
            .await
    }

    async fn find_in_bbox(&self, bbox: BoundingBox) -> StoreResult<Vec<EntityResult>> {
        check_bbox(&bbox)?;
        self.slot
            .run("find_in_bbox", self.timeouts.read, move |conn| records::scan_bbox(conn, bbox))
            .await
    }

    async fn find_k_nearest(&self, center: Point3D, k: usize) -> StoreResult<Vec<EntityDistance>> {
        check_point(&center)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        self.slot
            .run("find_k_nearest", self.timeouts.read, move |conn| records::scan_k_nearest(conn, center, k))
            .await
    }

    async fn find_along_path(&self, path: &[Point3D], width: f64) -> StoreResult<Vec<EntityResult>> {
        check_path(path, width)?;
        let path = path.to_vec();
        self.slot
            .run("find_along_path", self.timeouts.read, move |conn| {
                records::scan_along_path(conn, &path, width)
            })
            .await
    }

    async fn find_clusters(
        &self,
        bbox: BoundingBox,
        resolution: GridResolution,
        min_count: usize,
    ) -> StoreResult<Vec<SpatialCluster>> {
        check_bbox(&bbox)?;
        self.slot
            .run("find_clusters", self.timeouts.read, move |conn| {
                records::scan_clusters(conn, bbox, resolution, min_count)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConfidenceLevel;
    use tempfile::tempdir;

    fn pos(id: &str, x: f64) -> SpatialPosition {
        SpatialPosition::new(id, Point3D::new(x, 0.0, 0.0), ConfidenceLevel::Medium, "manual")
    }

    #[tokio::test]
    async fn test_connect_creates_parent_directory() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("nested/deeper/secondary.db"), StoreTimeouts::default());
        store.connect().await.unwrap();
        store.connect().await.unwrap();
        store.ping().await.unwrap();
        assert!(dir.path().join("nested/deeper/secondary.db").exists());
    }

    #[tokio::test]
    async fn test_calls_before_connect_are_connectivity_errors() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("s.db"), StoreTimeouts::default());
        let err = store.get_position("E1").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_read_after_write() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("s.db"), StoreTimeouts::default());
        store.connect().await.unwrap();

        store.upsert_position(&pos("E1", 0.0)).await.unwrap();
        store.upsert_position(&pos("E1", 10.0)).await.unwrap();
        let stored = store.get_position("E1").await.unwrap();
        assert_eq!(stored.position.x, 10.0);

        let all = store.find_near(Point3D::default(), 1000.0).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_apply_positions_single_transaction() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("s.db"), StoreTimeouts::default());
        store.connect().await.unwrap();

        let batch: Vec<_> = (0..25).map(|i| pos(&format!("E{}", i), i as f64)).collect();
        assert_eq!(store.apply_positions(&batch).await.unwrap(), 25);
        let nearest = store.find_k_nearest(Point3D::new(3.2, 0.0, 0.0), 2).await.unwrap();
        assert_eq!(nearest[0].entity_id, "E3");
        assert_eq!(nearest[1].entity_id, "E4");
    }

    #[tokio::test]
    async fn test_invalid_arguments_rejected_before_io() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("s.db"), StoreTimeouts::default());
        let err = store.find_near(Point3D::default(), -1.0).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }
}
