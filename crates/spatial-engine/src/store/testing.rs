//! Fault-injecting wrapper used by unit tests
use crate::error::{StoreError, StoreResult};
use crate::store::{
    BasicStore, GridResolution, IndexDefinition, IndexUsage, RtreeStore, SpatialStore, StoreTimeouts,
};
use crate::types::{
    BoundingBox, ChangeNotification, ConfidenceLevel, ConfidenceRecord, ConfidenceUpdate, EntityDistance,
    EntityResult, Point3D, SpatialCluster, SpatialPosition, VerificationEvent,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::broadcast;

pub struct FlakyStore {
    inner: RtreeStore,
    pub offline: AtomicBool,
    /// 1-based `apply_positions` call that fails; 0 never fails.
    pub fail_apply_call: AtomicUsize,
    pub apply_calls: AtomicUsize,
    /// 1-based `upsert_position` call that fails with a connection reset; 0 never fails.
    pub fail_upsert_call: AtomicUsize,
    /// 1-based `upsert_position` call rejected as a constraint violation; 0 never rejects.
    pub reject_upsert_call: AtomicUsize,
    pub upsert_calls: AtomicUsize,
    pub pings: AtomicUsize,
    pub created_indices: std::sync::Mutex<Vec<String>>,
    pub reject_index: std::sync::Mutex<Option<String>>,
}

impl FlakyStore {
    pub async fn connected(dir: &Path) -> Self {
        let inner = RtreeStore::new(dir.join("primary.db"), StoreTimeouts::default()).with_pool_size(2);
        inner.connect().await.expect("connect test primary");
        Self {
            inner,
            offline: AtomicBool::new(false),
            fail_apply_call: AtomicUsize::new(0),
            apply_calls: AtomicUsize::new(0),
            fail_upsert_call: AtomicUsize::new(0),
            reject_upsert_call: AtomicUsize::new(0),
            upsert_calls: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            created_indices: std::sync::Mutex::new(Vec::new()),
            reject_index: std::sync::Mutex::new(None),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn gate(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Connectivity("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BasicStore for FlakyStore {
    fn name(&self) -> &str {
        "flaky-primary"
    }

    async fn connect(&self) -> StoreResult<()> {
        self.gate()?;
        self.inner.connect().await
    }

    async fn close(&self) -> StoreResult<()> {
        self.inner.close().await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        self.gate()?;
        self.inner.ping().await
    }

    async fn upsert_position(&self, position: &SpatialPosition) -> StoreResult<bool> {
        self.gate()?;
        let call = self.upsert_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_upsert_call.load(Ordering::SeqCst) {
            return Err(StoreError::Connectivity("connection reset by peer".into()));
        }
        if call == self.reject_upsert_call.load(Ordering::SeqCst) {
            return Err(StoreError::Constraint(format!("injected rejection of {}", position.entity_id)));
        }
        self.inner.upsert_position(position).await
    }

    async fn get_position(&self, entity_id: &str) -> StoreResult<SpatialPosition> {
        self.gate()?;
        self.inner.get_position(entity_id).await
    }

    async fn apply_positions(&self, positions: &[SpatialPosition]) -> StoreResult<usize> {
        self.gate()?;
        let call = self.apply_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_apply_call.load(Ordering::SeqCst) {
            return Err(StoreError::Constraint("injected batch failure".into()));
        }
        self.inner.apply_positions(positions).await
    }

    async fn upsert_confidence(&self, update: &ConfidenceUpdate) -> StoreResult<()> {
        self.gate()?;
        self.inner.upsert_confidence(update).await
    }

    async fn append_verification(&self, entity_id: &str, event: &VerificationEvent) -> StoreResult<()> {
        self.gate()?;
        self.inner.append_verification(entity_id, event).await
    }

    async fn get_confidence(&self, entity_id: &str) -> StoreResult<ConfidenceRecord> {
        self.gate()?;
        self.inner.get_confidence(entity_id).await
    }

    async fn find_by_confidence(&self, min_level: ConfidenceLevel) -> StoreResult<Vec<EntityResult>> {
        self.gate()?;
        self.inner.find_by_confidence(min_level).await
    }

    async fn find_needing_verification(&self, verified_before: DateTime<Utc>) -> StoreResult<Vec<EntityResult>> {
        self.gate()?;
        self.inner.find_needing_verification(verified_before).await
    }

    async fn find_near(&self, center: Point3D, radius: f64) -> StoreResult<Vec<EntityResult>> {
        self.gate()?;
        self.inner.find_near(center, radius).await
    }

    async fn find_in_bbox(&self, bbox: BoundingBox) -> StoreResult<Vec<EntityResult>> {
        self.gate()?;
        self.inner.find_in_bbox(bbox).await
    }

    async fn find_k_nearest(&self, center: Point3D, k: usize) -> StoreResult<Vec<EntityDistance>> {
        self.gate()?;
        self.inner.find_k_nearest(center, k).await
    }

    async fn find_along_path(&self, path: &[Point3D], width: f64) -> StoreResult<Vec<EntityResult>> {
        self.gate()?;
        self.inner.find_along_path(path, width).await
    }

    async fn find_clusters(
        &self,
        bbox: BoundingBox,
        resolution: GridResolution,
        min_count: usize,
    ) -> StoreResult<Vec<SpatialCluster>> {
        self.gate()?;
        self.inner.find_clusters(bbox, resolution, min_count).await
    }
}

#[async_trait]
impl SpatialStore for FlakyStore {
    async fn probe_spatial_support(&self) -> StoreResult<bool> {
        self.gate()?;
        self.inner.probe_spatial_support().await
    }

    async fn find_near_indexed(
        &self,
        center: Point3D,
        radius: f64,
        resolution: GridResolution,
    ) -> StoreResult<Vec<EntityResult>> {
        self.gate()?;
        self.inner.find_near_indexed(center, radius, resolution).await
    }

    async fn bulk_find_near(&self, centers: &[Point3D], radius: f64) -> StoreResult<HashMap<usize, Vec<String>>> {
        self.gate()?;
        self.inner.bulk_find_near(centers, radius).await
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeNotification> {
        self.inner.subscribe_changes()
    }

    async fn index_usage(&self) -> StoreResult<Vec<IndexUsage>> {
        self.gate()?;
        self.inner.index_usage().await
    }

    async fn create_index(&self, definition: &IndexDefinition) -> StoreResult<()> {
        self.gate()?;
        let rejected = self.reject_index.lock().unwrap().clone();
        if rejected.as_deref() == Some(definition.name.as_str()) {
            return Err(StoreError::Internal(format!("injected failure for {}", definition.name)));
        }
        self.inner.create_index(definition).await?;
        self.created_indices.lock().unwrap().push(definition.name.clone());
        Ok(())
    }

    async fn reindex(&self, index_name: &str) -> StoreResult<()> {
        self.gate()?;
        self.inner.reindex(index_name).await
    }

    async fn refresh_statistics(&self) -> StoreResult<()> {
        self.gate()?;
        self.inner.refresh_statistics().await
    }
}
