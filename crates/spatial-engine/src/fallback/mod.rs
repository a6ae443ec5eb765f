//! Dual-store facade: durable writes to the secondary, best-effort writes and indexed
//! reads on the primary, and a replay queue that catches the primary up after an outage.
pub mod health;
pub mod sync_queue;

pub use health::HealthMonitor;
pub use sync_queue::SyncQueue;

use crate::error::{StoreError, StoreResult};
use crate::optimizer::{
    BulkWriteReport, CacheMetrics, ChangeStream, OptimizerConfig, QueryLatency, SpatialQueryOptimizer,
};
use crate::retry::{with_deadline, with_retry, RetryPolicy};
use crate::store::{BasicStore, GridResolution, SpatialStore};
use crate::types::{
    now_micros, BoundingBox, ConfidenceAspect, ConfidenceLevel, ConfidenceRecord, ConfidenceUpdate, EntityDistance,
    EntityResult, Point3D, PositionResult, SpatialCluster, SpatialPosition, StoreHealth, StoreRole, VerificationEvent,
};
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    pub health_interval: Duration,
    pub probe_deadline: Duration,
    pub retry: RetryPolicy,
    pub optimizer: OptimizerConfig,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(30),
            probe_deadline: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

/// Cutoff for "not verified within `days`", truncated to the minute so that
/// repeated calls share one fingerprint.
pub fn verification_cutoff(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    let cutoff = now - ChronoDuration::days(i64::from(days));
    cutoff.duration_trunc(ChronoDuration::minutes(1)).unwrap_or(cutoff)
}

pub struct FallbackDataStore {
    primary: Arc<dyn SpatialStore>,
    secondary: Arc<dyn BasicStore>,
    optimizer: Arc<SpatialQueryOptimizer>,
    health: HealthMonitor,
    queue: SyncQueue,
    /// Entities whose latest write the primary rejected; read from the secondary until it accepts one.
    secondary_only: DashSet<String>,
    config: FallbackConfig,
    draining: tokio::sync::Mutex<()>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl FallbackDataStore {
    pub fn new(primary: Arc<dyn SpatialStore>, secondary: Arc<dyn BasicStore>, config: FallbackConfig) -> Self {
        let optimizer = Arc::new(SpatialQueryOptimizer::new(
            Arc::clone(&primary),
            config.optimizer.clone(),
        ));
        let (shutdown, _) = watch::channel(false);
        Self {
            primary,
            secondary,
            optimizer,
            health: HealthMonitor::new(),
            queue: SyncQueue::new(),
            secondary_only: DashSet::new(),
            config,
            draining: tokio::sync::Mutex::new(()),
            ticker: Mutex::new(None),
            shutdown,
        }
    }

    pub fn primary(&self) -> &Arc<dyn SpatialStore> {
        &self.primary
    }

    pub fn optimizer(&self) -> &Arc<SpatialQueryOptimizer> {
        &self.optimizer
    }

    /// Connects the secondary (required) and the primary (optional).
    pub async fn connect(&self) -> StoreResult<()> {
        let secondary = Arc::clone(&self.secondary);
        with_retry(&self.config.retry, "connect secondary", || secondary.connect()).await?;
        info!("Secondary store {} connected", self.secondary.name());

        match self.connect_primary().await {
            Ok(spatial) => {
                self.health.mark_available(spatial);
                info!(
                    "Primary store {} connected (spatial support: {})",
                    self.primary.name(),
                    spatial
                );
            }
            Err(e) => {
                warn!("Primary store {} unavailable, serving from secondary: {}", self.primary.name(), e);
                self.health.mark_unavailable(e.to_string());
            }
        }
        Ok(())
    }

    async fn connect_primary(&self) -> StoreResult<bool> {
        let primary = Arc::clone(&self.primary);
        with_deadline("primary probe", self.config.probe_deadline, async move {
            if primary.ping().await.is_err() {
                primary.connect().await?;
                primary.ping().await?;
            }
            match primary.probe_spatial_support().await {
                Ok(spatial) => Ok(spatial),
                Err(e) if e.is_availability_failure() => Err(e),
                Err(e) => {
                    warn!("Spatial capability probe failed: {}", e);
                    Ok(false)
                }
            }
        })
        .await
    }

    /// Spawns the health ticker and the optimizer's background work.
    pub fn start(self: &Arc<Self>) {
        self.optimizer.start();
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!("No Tokio runtime, primary health will not be re-probed: {}", e);
                return;
            }
        };
        let mut guard = self.ticker.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_some() {
            return;
        }
        let this: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.health_interval;
        let mut shutdown = self.shutdown.subscribe();
        *guard = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let Some(store) = this.upgrade() else { break };
                        store.check_health().await;
                    }
                }
            }
            debug!("Health ticker stopped");
        }));
        info!("Health ticker started, interval {:?}", interval);
    }

    /// Probes the primary once and replays the sync queue when it is reachable.
    pub async fn check_health(&self) -> bool {
        match self.connect_primary().await {
            Ok(spatial) => {
                let flipped = {
                    let queue = self.queue.lock();
                    queue.is_empty().then(|| self.health.mark_available(spatial))
                };
                match flipped {
                    Some(true) => {
                        info!("Primary store {} available again", self.primary.name());
                        true
                    }
                    Some(false) => true,
                    None => self.drain_sync_queue(spatial).await,
                }
            }
            Err(e) => {
                if self.health.mark_unavailable(e.to_string()) {
                    warn!("Primary store {} became unavailable: {}", self.primary.name(), e);
                } else {
                    debug!("Primary store {} still unavailable: {}", self.primary.name(), e);
                }
                false
            }
        }
    }

    /// Replays queued writes in order. Health flips to available only once the queue is empty.
    async fn drain_sync_queue(&self, spatial: bool) -> bool {
        let Ok(_draining) = self.draining.try_lock() else {
            debug!("Sync queue replay already running");
            return self.health.is_available();
        };
        let mut replayed = 0usize;
        loop {
            let entry = {
                let mut queue = self.queue.lock();
                match queue.pop_front() {
                    Some(entry) => entry,
                    None => {
                        self.health.mark_available(spatial);
                        drop(queue);
                        info!("Sync queue drained ({} writes replayed), primary available", replayed);
                        return true;
                    }
                }
            };

            match self.primary.upsert_position(&entry.position).await {
                Ok(changed) => {
                    replayed += 1;
                    self.secondary_only.remove(&entry.position.entity_id);
                    if !changed {
                        debug!("Replay of #{} ignored, primary holds a newer row", entry.sequence);
                    }
                    let update = ConfidenceUpdate::for_position(&entry.position);
                    if let Err(e) = self.primary.upsert_confidence(&update).await {
                        debug!("Confidence mirror for #{} failed: {}", entry.sequence, e);
                    }
                }
                Err(e) if e.is_availability_failure() => {
                    warn!(
                        "Replay of #{} ({}) failed, {} remain: {}",
                        entry.sequence,
                        entry.position.entity_id,
                        self.queue.len() + 1,
                        e
                    );
                    self.queue.lock().push_front(entry);
                    self.health.mark_unavailable(e.to_string());
                    return false;
                }
                Err(e) => {
                    error!(
                        "Dropping queued write #{} for {}, primary rejected it: {}",
                        entry.sequence, entry.position.entity_id, e
                    );
                    self.secondary_only.insert(entry.position.entity_id.clone());
                }
            }
        }
    }

    fn demote(&self, operation: &str, e: &StoreError) {
        if e.is_availability_failure() && self.health.mark_unavailable(e.to_string()) {
            warn!("Primary store demoted after failed {}: {}", operation, e);
        }
    }

    /// Queues under the lock when the primary is down, so a finishing replay cannot strand the entry.
    fn queue_if_unavailable(&self, position: &SpatialPosition) -> bool {
        let mut queue = self.queue.lock();
        if self.health.is_available() {
            return false;
        }
        let sequence = queue.push(position.clone());
        debug!("Queued {} as #{} for replay", position.entity_id, sequence);
        true
    }

    pub async fn update_entity_position(
        &self,
        entity_id: &str,
        position: Point3D,
        confidence: ConfidenceLevel,
        source: &str,
    ) -> StoreResult<SpatialPosition> {
        let position = SpatialPosition::new(entity_id, position, confidence, source);
        self.write_position(&position).await?;
        Ok(position)
    }

    /// Durable secondary write, then the primary or the sync queue.
    pub async fn write_position(&self, position: &SpatialPosition) -> StoreResult<()> {
        crate::store::check_point(&position.position)?;
        let secondary = &self.secondary;
        with_retry(&self.config.retry, "secondary position write", || {
            secondary.upsert_position(position)
        })
        .await?;
        let update = ConfidenceUpdate::for_position(position);
        with_retry(&self.config.retry, "secondary confidence write", || {
            secondary.upsert_confidence(&update)
        })
        .await?;

        if self.queue_if_unavailable(position) {
            return Ok(());
        }
        match self.primary.upsert_position(position).await {
            Ok(_) => {
                self.secondary_only.remove(&position.entity_id);
                if let Err(e) = self.primary.upsert_confidence(&update).await {
                    debug!("Primary confidence mirror for {} failed: {}", position.entity_id, e);
                }
            }
            Err(e) if e.is_availability_failure() => {
                warn!("Primary write for {} failed, queued for replay: {}", position.entity_id, e);
                self.demote("position write", &e);
                self.queue.lock().push(position.clone());
            }
            Err(e) => {
                // replaying would be rejected again
                warn!(
                    "Primary rejected write for {}, reading it from the secondary until a write is accepted: {}",
                    position.entity_id, e
                );
                self.secondary_only.insert(position.entity_id.clone());
            }
        }
        Ok(())
    }

    /// Entities currently read from the secondary because the primary rejected their latest write.
    pub fn secondary_only_entities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.secondary_only.iter().map(|id| id.key().clone()).collect();
        ids.sort();
        ids
    }

    /// One secondary transaction, then chunked primary batches; uncommitted positions are queued.
    pub async fn bulk_update_positions(&self, positions: &[SpatialPosition]) -> StoreResult<BulkWriteReport> {
        positions.iter().try_for_each(|p| crate::store::check_point(&p.position))?;
        let secondary = &self.secondary;
        let written = with_retry(&self.config.retry, "secondary bulk write", || {
            secondary.apply_positions(positions)
        })
        .await?;
        debug!("Secondary applied {} of {} positions", written, positions.len());

        if !self.health.is_available() {
            let mut queue = self.queue.lock();
            for p in positions {
                queue.push(p.clone());
            }
            return Ok(BulkWriteReport {
                submitted: positions.len(),
                ..BulkWriteReport::default()
            });
        }

        let report = self.optimizer.bulk_write(positions).await;
        if !report.is_complete() {
            let rest = report.uncommitted(positions);
            warn!("Bulk write stopped at batch {:?}, queueing {} positions", report.failed_batch, rest.len());
            if report.availability_failure {
                self.health
                    .mark_unavailable(report.error.clone().unwrap_or_else(|| "bulk write failed".into()));
            }
            let mut queue = self.queue.lock();
            for p in rest {
                queue.push(p.clone());
            }
        }
        Ok(report)
    }

    pub async fn update_confidence(
        &self,
        entity_id: &str,
        aspect: ConfidenceAspect,
        level: ConfidenceLevel,
        source: &str,
    ) -> StoreResult<()> {
        let update = ConfidenceUpdate {
            entity_id: entity_id.to_string(),
            aspect,
            level,
            source: source.to_string(),
            updated_at: now_micros(),
        };
        let secondary = &self.secondary;
        with_retry(&self.config.retry, "secondary confidence write", || {
            secondary.upsert_confidence(&update)
        })
        .await?;
        if self.health.is_available() {
            if let Err(e) = self.primary.upsert_confidence(&update).await {
                warn!("Primary confidence mirror for {} failed: {}", entity_id, e);
                self.demote("confidence write", &e);
            }
        }
        Ok(())
    }

    pub async fn record_verification(&self, entity_id: &str, event: VerificationEvent) -> StoreResult<()> {
        let secondary = &self.secondary;
        with_retry(&self.config.retry, "secondary verification write", || {
            secondary.append_verification(entity_id, &event)
        })
        .await?;
        if self.health.is_available() {
            if let Err(e) = self.primary.append_verification(entity_id, &event).await {
                warn!("Primary verification mirror for {} failed: {}", entity_id, e);
                self.demote("verification write", &e);
            }
        }
        Ok(())
    }

    /// Primary first when healthy; any primary error falls through to the secondary.
    async fn route<T, P, S>(
        &self,
        operation: &str,
        use_primary: bool,
        primary: P,
        secondary: S,
    ) -> StoreResult<(T, StoreRole)>
    where
        P: Future<Output = StoreResult<T>>,
        S: Future<Output = StoreResult<T>>,
    {
        let mut primary_error = None;
        if use_primary {
            match primary.await {
                Ok(value) => return Ok((value, StoreRole::Primary)),
                Err(e) => {
                    debug!("Primary {} failed, using secondary: {}", operation, e);
                    self.demote(operation, &e);
                    primary_error = Some(e);
                }
            }
        }
        match secondary.await {
            Ok(value) => Ok((value, StoreRole::Secondary)),
            Err(e) if e.is_availability_failure() => {
                let primary = match primary_error {
                    Some(p) => p.to_string(),
                    None => self
                        .health
                        .current()
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "primary unavailable".to_string()),
                };
                error!("Both stores failed {}: primary: {}; secondary: {}", operation, primary, e);
                Err(StoreError::BothUnavailable {
                    primary,
                    secondary: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_entity_position(&self, entity_id: &str) -> StoreResult<PositionResult> {
        let (position, served_by) = self
            .route(
                "get_position",
                self.health.is_available() && !self.secondary_only.contains(entity_id),
                self.primary.get_position(entity_id),
                self.secondary.get_position(entity_id),
            )
            .await?;
        Ok(PositionResult { position, served_by })
    }

    pub async fn get_confidence_record(&self, entity_id: &str) -> StoreResult<ConfidenceRecord> {
        self.route(
            "get_confidence",
            self.health.is_available(),
            self.primary.get_confidence(entity_id),
            self.secondary.get_confidence(entity_id),
        )
        .await
        .map(|(record, _)| record)
    }

    pub async fn find_near(&self, center: Point3D, radius: f64) -> StoreResult<Vec<EntityResult>> {
        self.route(
            "find_near",
            self.health.has_spatial_support(),
            self.optimizer.find_near(center, radius),
            self.secondary.find_near(center, radius),
        )
        .await
        .map(|(rows, _)| rows)
    }

    pub async fn find_in_bounding_box(&self, bbox: BoundingBox) -> StoreResult<Vec<EntityResult>> {
        self.route(
            "find_in_bbox",
            self.health.has_spatial_support(),
            self.optimizer.find_in_bbox(bbox),
            self.secondary.find_in_bbox(bbox),
        )
        .await
        .map(|(rows, _)| rows)
    }

    pub async fn find_k_nearest(&self, center: Point3D, k: usize) -> StoreResult<Vec<EntityDistance>> {
        self.route(
            "find_k_nearest",
            self.health.has_spatial_support(),
            self.optimizer.find_k_nearest(center, k),
            self.secondary.find_k_nearest(center, k),
        )
        .await
        .map(|(rows, _)| rows)
    }

    /// Center index to entity ids; the secondary answers one center at a time.
    pub async fn bulk_find_near(&self, centers: Vec<Point3D>, radius: f64) -> StoreResult<HashMap<usize, Vec<String>>> {
        let secondary = async {
            let mut found = HashMap::with_capacity(centers.len());
            for (i, center) in centers.iter().enumerate() {
                let rows = self.secondary.find_near(*center, radius).await?;
                found.insert(i, rows.into_iter().map(|r| r.entity_id).collect());
            }
            Ok(found)
        };
        self.route(
            "bulk_find_near",
            self.health.has_spatial_support(),
            self.optimizer.bulk_find_near(centers.clone(), radius),
            secondary,
        )
        .await
        .map(|(found, _)| found)
    }

    pub async fn find_along_path(&self, path: Vec<Point3D>, width: f64) -> StoreResult<Vec<EntityResult>> {
        self.route(
            "find_along_path",
            self.health.has_spatial_support(),
            self.optimizer.find_along_path(path.clone(), width),
            self.secondary.find_along_path(&path, width),
        )
        .await
        .map(|(rows, _)| rows)
    }

    pub async fn find_clusters(
        &self,
        bbox: BoundingBox,
        resolution: GridResolution,
        min_count: usize,
    ) -> StoreResult<Vec<SpatialCluster>> {
        self.route(
            "find_clusters",
            self.health.has_spatial_support(),
            self.optimizer.find_clusters(bbox, resolution, min_count),
            self.secondary.find_clusters(bbox, resolution, min_count),
        )
        .await
        .map(|(clusters, _)| clusters)
    }

    pub async fn find_by_confidence(&self, min_level: ConfidenceLevel) -> StoreResult<Vec<EntityResult>> {
        self.route(
            "find_by_confidence",
            self.health.is_available(),
            self.optimizer.find_by_confidence(min_level),
            self.secondary.find_by_confidence(min_level),
        )
        .await
        .map(|(rows, _)| rows)
    }

    /// Entities not field-verified in the last `days` days; see [`verification_cutoff`].
    pub async fn find_needing_verification(&self, days: u32) -> StoreResult<Vec<EntityResult>> {
        let cutoff = verification_cutoff(Utc::now(), days);
        self.route(
            "find_needing_verification",
            self.health.is_available(),
            self.optimizer.find_needing_verification(cutoff),
            self.secondary.find_needing_verification(cutoff),
        )
        .await
        .map(|(rows, _)| rows)
    }

    /// Live changes near `center`. Only the primary publishes changes.
    pub fn stream_near(&self, center: Point3D, radius: f64) -> StoreResult<ChangeStream> {
        if !self.health.is_available() {
            return Err(StoreError::Capability(format!(
                "change streams need the primary store {}, which is unavailable",
                self.primary.name()
            )));
        }
        self.optimizer.stream_near(center, radius)
    }

    pub fn has_spatial_support(&self) -> bool {
        self.health.has_spatial_support()
    }

    /// Changes each time the primary flips back to available.
    pub fn subscribe_recoveries(&self) -> watch::Receiver<u64> {
        self.health.subscribe_recoveries()
    }

    pub fn store_health(&self) -> StoreHealth {
        self.health.current().as_ref().clone()
    }

    pub fn sync_queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn cache_metrics(&self) -> CacheMetrics {
        self.optimizer.cache_metrics()
    }

    pub fn query_metrics(&self) -> Vec<QueryLatency> {
        self.optimizer.query_metrics()
    }

    /// Stops the health ticker and optimizer tasks, then closes both stores.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let ticker = self.ticker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = ticker {
            if let Err(e) = handle.await {
                warn!("Health ticker ended abnormally: {}", e);
            }
        }
        self.optimizer.shutdown().await;
        if let Err(e) = self.primary.close().await {
            debug!("Closing primary: {}", e);
        }
        if let Err(e) = self.secondary.close().await {
            warn!("Closing secondary: {}", e);
        }
        info!("Fallback data store shut down ({} writes still queued)", self.queue.len());
    }
}
