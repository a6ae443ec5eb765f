//! Spatial query optimizer: result cache, miss coalescing, bulk operations,
//! change streams, predictive prefetch and latency tracking over the primary store.
pub mod bulk;
pub mod fingerprint;
pub mod latency;
pub mod prefetch;
pub mod query_cache;
pub mod stream;

pub use bulk::{BulkOperator, BulkWriteReport};
pub use fingerprint::Fingerprint;
pub use latency::{MetricsCollector, QueryLatency};
pub use prefetch::{PrefetchConfig, PrefetchStats, Prefetcher, QueryPattern};
pub use query_cache::{CacheConfig, CacheMetrics, QueryCache};
pub use stream::{ChangeStream, StreamConfig, StreamFilter, StreamHub};

use crate::error::{StoreError, StoreResult};
use crate::store::{check_bbox, check_path, check_point, check_radius, GridResolution, SpatialStore};
use crate::types::{
    BoundingBox, ConfidenceLevel, EntityDistance, EntityResult, Point3D, SpatialCluster, SpatialPosition,
};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fingerprint::{snap, FingerprintBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Near,
    BoundingBox,
    KNearest,
    BulkNear,
    AlongPath,
    Clusters,
    ByConfidence,
    NeedingVerification,
}

impl QueryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryKind::Near => "near",
            QueryKind::BoundingBox => "bbox",
            QueryKind::KNearest => "k_nearest",
            QueryKind::BulkNear => "bulk_near",
            QueryKind::AlongPath => "along_path",
            QueryKind::Clusters => "clusters",
            QueryKind::ByConfidence => "by_confidence",
            QueryKind::NeedingVerification => "needing_verification",
        }
    }
}

/// Everything needed to execute (or re-execute, when prefetching) one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuerySpec {
    Near { center: Point3D, radius: f64 },
    BoundingBox { bbox: BoundingBox },
    KNearest { center: Point3D, k: usize },
    BulkNear { centers: Vec<Point3D>, radius: f64 },
    AlongPath { path: Vec<Point3D>, width: f64 },
    Clusters { bbox: BoundingBox, resolution: GridResolution, min_count: usize },
    /// Effective position confidence (confidence record first, then the position row) at or above `min_level`.
    ByConfidence { min_level: ConfidenceLevel },
    /// Never verified, or last verified before `verified_before`.
    NeedingVerification { verified_before: DateTime<Utc> },
}

fn snap_point(p: &Point3D) -> Point3D {
    Point3D::new(snap(p.x), snap(p.y), snap(p.z))
}

fn snap_bbox(b: &BoundingBox) -> BoundingBox {
    BoundingBox::new(snap_point(&b.min), snap_point(&b.max))
}

impl QuerySpec {
    pub fn kind(&self) -> QueryKind {
        match self {
            QuerySpec::Near { .. } => QueryKind::Near,
            QuerySpec::BoundingBox { .. } => QueryKind::BoundingBox,
            QuerySpec::KNearest { .. } => QueryKind::KNearest,
            QuerySpec::BulkNear { .. } => QueryKind::BulkNear,
            QuerySpec::AlongPath { .. } => QueryKind::AlongPath,
            QuerySpec::Clusters { .. } => QueryKind::Clusters,
            QuerySpec::ByConfidence { .. } => QueryKind::ByConfidence,
            QuerySpec::NeedingVerification { .. } => QueryKind::NeedingVerification,
        }
    }

    /// Search radius or corridor width, for the kinds that have one.
    pub fn radius(&self) -> Option<f64> {
        match self {
            QuerySpec::Near { radius, .. } | QuerySpec::BulkNear { radius, .. } => Some(*radius),
            QuerySpec::AlongPath { width, .. } => Some(*width),
            _ => None,
        }
    }

    /// Every coordinate and length snapped to the fingerprint quantum, so the
    /// executed query is exactly the one its fingerprint names.
    pub fn quantized(&self) -> QuerySpec {
        match self {
            QuerySpec::Near { center, radius } => QuerySpec::Near {
                center: snap_point(center),
                radius: snap(*radius),
            },
            QuerySpec::BoundingBox { bbox } => QuerySpec::BoundingBox { bbox: snap_bbox(bbox) },
            QuerySpec::KNearest { center, k } => QuerySpec::KNearest {
                center: snap_point(center),
                k: *k,
            },
            QuerySpec::BulkNear { centers, radius } => QuerySpec::BulkNear {
                centers: centers.iter().map(snap_point).collect(),
                radius: snap(*radius),
            },
            QuerySpec::AlongPath { path, width } => QuerySpec::AlongPath {
                path: path.iter().map(snap_point).collect(),
                width: snap(*width),
            },
            QuerySpec::Clusters { bbox, resolution, min_count } => QuerySpec::Clusters {
                bbox: snap_bbox(bbox),
                resolution: *resolution,
                min_count: *min_count,
            },
            QuerySpec::ByConfidence { .. } | QuerySpec::NeedingVerification { .. } => self.clone(),
        }
    }

    pub fn validate(&self) -> StoreResult<()> {
        match self {
            QuerySpec::Near { center, radius } => {
                check_point(center)?;
                check_radius(*radius)
            }
            QuerySpec::BoundingBox { bbox } | QuerySpec::Clusters { bbox, .. } => check_bbox(bbox),
            QuerySpec::KNearest { center, .. } => check_point(center),
            QuerySpec::BulkNear { centers, radius } => {
                centers.iter().try_for_each(check_point)?;
                check_radius(*radius)
            }
            QuerySpec::AlongPath { path, width } => check_path(path, *width),
            QuerySpec::ByConfidence { .. } | QuerySpec::NeedingVerification { .. } => Ok(()),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let b = FingerprintBuilder::new(self.kind().as_str());
        match self {
            QuerySpec::Near { center, radius } => b.point(center).meters(*radius),
            QuerySpec::BoundingBox { bbox } => b.point(&bbox.min).point(&bbox.max),
            QuerySpec::KNearest { center, k } => b.point(center).count(*k as u64),
            QuerySpec::BulkNear { centers, radius } => centers
                .iter()
                .fold(b.count(centers.len() as u64), |b, c| b.point(c))
                .meters(*radius),
            QuerySpec::AlongPath { path, width } => path
                .iter()
                .fold(b.count(path.len() as u64), |b, p| b.point(p))
                .meters(*width),
            QuerySpec::Clusters { bbox, resolution, min_count } => b
                .point(&bbox.min)
                .point(&bbox.max)
                .tag(resolution.as_str())
                .count(*min_count as u64),
            QuerySpec::ByConfidence { min_level } => b.count(min_level.as_i64() as u64),
            QuerySpec::NeedingVerification { verified_before } => b.instant(verified_before),
        }
        .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "rows", rename_all = "snake_case")]
pub enum QueryResult {
    Entities(Vec<EntityResult>),
    Distances(Vec<EntityDistance>),
    Bulk(HashMap<usize, Vec<String>>),
    Clusters(Vec<SpatialCluster>),
}

impl QueryResult {
    /// Row estimate used for cache costing.
    pub fn row_count(&self) -> usize {
        match self {
            QueryResult::Entities(rows) => rows.len(),
            QueryResult::Distances(rows) => rows.len(),
            QueryResult::Bulk(map) => map.len() + map.values().map(Vec::len).sum::<usize>(),
            QueryResult::Clusters(clusters) => {
                clusters.len() + clusters.iter().map(|c| c.entity_ids.len()).sum::<usize>()
            }
        }
    }

    fn variant(&self) -> &'static str {
        match self {
            QueryResult::Entities(_) => "entities",
            QueryResult::Distances(_) => "distances",
            QueryResult::Bulk(_) => "bulk",
            QueryResult::Clusters(_) => "clusters",
        }
    }
}

fn mismatch(expected: &str, got: &QueryResult) -> StoreError {
    StoreError::Internal(format!("expected {} result, found {}", expected, got.variant()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub cache: CacheConfig,
    pub prefetch: PrefetchConfig,
    pub stream: StreamConfig,
    pub bulk_batch_size: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            prefetch: PrefetchConfig::default(),
            stream: StreamConfig::default(),
            bulk_batch_size: bulk::DEFAULT_BATCH_SIZE,
        }
    }
}

/// Removes the in-flight marker on every exit path; dropping the sender wakes all followers.
struct InflightGuard<'a> {
    inflight: &'a DashMap<Fingerprint, watch::Sender<()>>,
    fingerprint: Fingerprint,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.inflight.remove(&self.fingerprint);
    }
}

/// Cache-through execution shared by request handling and the prefetch worker.
pub struct Executor {
    store: Arc<dyn SpatialStore>,
    cache: Arc<QueryCache>,
    metrics: Arc<MetricsCollector>,
    bulk: BulkOperator,
    inflight: DashMap<Fingerprint, watch::Sender<()>>,
    coalesced: AtomicU64,
}

impl Executor {
    fn new(store: Arc<dyn SpatialStore>, config: &OptimizerConfig) -> Self {
        Self {
            bulk: BulkOperator::new(Arc::clone(&store), config.bulk_batch_size),
            store,
            cache: Arc::new(QueryCache::new(config.cache.clone())),
            metrics: Arc::new(MetricsCollector::new()),
            inflight: DashMap::new(),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Cached, or already being fetched.
    pub fn is_cached(&self, fingerprint: &Fingerprint) -> bool {
        self.cache.contains(fingerprint) || self.inflight.contains_key(fingerprint)
    }

    /// Serves from cache, waits on an in-flight fetch of the same fingerprint, or runs the query.
    pub async fn fetch(&self, fingerprint: Fingerprint, spec: &QuerySpec) -> StoreResult<Arc<QueryResult>> {
        loop {
            if let Some(hit) = self.cache.get(&fingerprint) {
                return Ok(hit);
            }
            let mut waiter = match self.inflight.entry(fingerprint) {
                Entry::Occupied(leader) => leader.get().subscribe(),
                Entry::Vacant(slot) => {
                    slot.insert(watch::channel(()).0);
                    break;
                }
            };
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            trace!("Waiting on in-flight {}", fingerprint.short());
            // resolves with an error once the leader drops its sender
            let _ = waiter.changed().await;
        }

        let _guard = InflightGuard {
            inflight: &self.inflight,
            fingerprint,
        };
        let started = Instant::now();
        let result = Arc::new(self.execute(spec).await?);
        self.metrics.record_execution(fingerprint, spec, started.elapsed());
        if !self.cache.insert(fingerprint, Arc::clone(&result)) {
            debug!("{} result not cached", fingerprint.short());
        }
        Ok(result)
    }

    async fn execute(&self, spec: &QuerySpec) -> StoreResult<QueryResult> {
        Ok(match spec {
            QuerySpec::Near { center, radius } => QueryResult::Entities(
                self.store
                    .find_near_indexed(*center, *radius, GridResolution::for_radius(*radius))
                    .await?,
            ),
            QuerySpec::BoundingBox { bbox } => QueryResult::Entities(self.store.find_in_bbox(*bbox).await?),
            QuerySpec::KNearest { center, k } => QueryResult::Distances(self.store.find_k_nearest(*center, *k).await?),
            QuerySpec::BulkNear { centers, radius } => QueryResult::Bulk(self.bulk.find_near(centers, *radius).await?),
            QuerySpec::AlongPath { path, width } => {
                QueryResult::Entities(self.store.find_along_path(path, *width).await?)
            }
            QuerySpec::Clusters { bbox, resolution, min_count } => {
                QueryResult::Clusters(self.store.find_clusters(*bbox, *resolution, *min_count).await?)
            }
            QuerySpec::ByConfidence { min_level } => {
                QueryResult::Entities(self.store.find_by_confidence(*min_level).await?)
            }
            QuerySpec::NeedingVerification { verified_before } => {
                QueryResult::Entities(self.store.find_needing_verification(*verified_before).await?)
            }
        })
    }
}

pub struct SpatialQueryOptimizer {
    store: Arc<dyn SpatialStore>,
    executor: Arc<Executor>,
    prefetcher: Arc<Prefetcher>,
    hub: StreamHub,
}

impl SpatialQueryOptimizer {
    pub fn new(store: Arc<dyn SpatialStore>, config: OptimizerConfig) -> Self {
        Self {
            executor: Arc::new(Executor::new(Arc::clone(&store), &config)),
            prefetcher: Arc::new(Prefetcher::new(config.prefetch.clone())),
            hub: StreamHub::new(Arc::clone(&store), config.stream),
            store,
        }
    }

    /// Starts the prefetch worker. Queries work without it.
    pub fn start(&self) {
        self.prefetcher.start(Arc::clone(&self.executor));
    }

    pub fn store(&self) -> &Arc<dyn SpatialStore> {
        &self.store
    }

    /// Runs `spec` through the cache, records its pattern and schedules related prefetches.
    ///
    /// Arguments are snapped to the fingerprint quantum first; the answer is the
    /// store's answer for the snapped query.
    pub async fn query(&self, spec: QuerySpec) -> StoreResult<Arc<QueryResult>> {
        let started = Instant::now();
        spec.validate()?;
        let spec = spec.quantized();
        let fingerprint = spec.fingerprint();
        self.prefetcher.record(fingerprint, &spec);
        let result = self.executor.fetch(fingerprint, &spec).await?;
        self.executor.metrics.record_call(fingerprint, &spec, started.elapsed());
        let executor = &self.executor;
        self.prefetcher
            .schedule_related(&fingerprint, |other| executor.is_cached(other));
        Ok(result)
    }

    async fn query_entities(&self, spec: QuerySpec) -> StoreResult<Vec<EntityResult>> {
        match self.query(spec).await?.as_ref() {
            QueryResult::Entities(rows) => Ok(rows.clone()),
            other => Err(mismatch("entities", other)),
        }
    }

    pub async fn find_near(&self, center: Point3D, radius: f64) -> StoreResult<Vec<EntityResult>> {
        self.query_entities(QuerySpec::Near { center, radius }).await
    }

    pub async fn find_in_bbox(&self, bbox: BoundingBox) -> StoreResult<Vec<EntityResult>> {
        self.query_entities(QuerySpec::BoundingBox { bbox }).await
    }

    pub async fn find_k_nearest(&self, center: Point3D, k: usize) -> StoreResult<Vec<EntityDistance>> {
        match self.query(QuerySpec::KNearest { center, k }).await?.as_ref() {
            QueryResult::Distances(rows) => Ok(rows.clone()),
            other => Err(mismatch("distances", other)),
        }
    }

    pub async fn bulk_find_near(&self, centers: Vec<Point3D>, radius: f64) -> StoreResult<HashMap<usize, Vec<String>>> {
        if centers.is_empty() {
            return Ok(HashMap::new());
        }
        match self.query(QuerySpec::BulkNear { centers, radius }).await?.as_ref() {
            QueryResult::Bulk(map) => Ok(map.clone()),
            other => Err(mismatch("bulk", other)),
        }
    }

    pub async fn find_along_path(&self, path: Vec<Point3D>, width: f64) -> StoreResult<Vec<EntityResult>> {
        self.query_entities(QuerySpec::AlongPath { path, width }).await
    }

    pub async fn find_clusters(
        &self,
        bbox: BoundingBox,
        resolution: GridResolution,
        min_count: usize,
    ) -> StoreResult<Vec<SpatialCluster>> {
        let spec = QuerySpec::Clusters { bbox, resolution, min_count };
        match self.query(spec).await?.as_ref() {
            QueryResult::Clusters(clusters) => Ok(clusters.clone()),
            other => Err(mismatch("clusters", other)),
        }
    }

    pub async fn find_by_confidence(&self, min_level: ConfidenceLevel) -> StoreResult<Vec<EntityResult>> {
        self.query_entities(QuerySpec::ByConfidence { min_level }).await
    }

    pub async fn find_needing_verification(&self, verified_before: DateTime<Utc>) -> StoreResult<Vec<EntityResult>> {
        self.query_entities(QuerySpec::NeedingVerification { verified_before }).await
    }

    /// Chunked transactional write; see [`BulkOperator::write`].
    pub async fn bulk_write(&self, updates: &[SpatialPosition]) -> BulkWriteReport {
        self.executor.bulk.write(updates).await
    }

    pub fn subscribe(&self, filter: StreamFilter) -> StoreResult<ChangeStream> {
        self.hub.subscribe(filter)
    }

    pub fn stream_near(&self, center: Point3D, radius: f64) -> StoreResult<ChangeStream> {
        self.subscribe(StreamFilter::Proximity { center, radius })
    }

    pub fn active_subscriptions(&self) -> usize {
        self.hub.active_subscriptions()
    }

    pub fn is_cached(&self, fingerprint: &Fingerprint) -> bool {
        self.executor.cache.contains(fingerprint)
    }

    pub fn cache_metrics(&self) -> CacheMetrics {
        self.executor.cache.metrics()
    }

    pub fn query_metrics(&self) -> Vec<QueryLatency> {
        self.executor.metrics.snapshot()
    }

    pub fn metrics_collector(&self) -> &Arc<MetricsCollector> {
        &self.executor.metrics
    }

    /// Followers that waited on another caller's fetch instead of querying.
    pub fn coalesced_misses(&self) -> u64 {
        self.executor.coalesced.load(Ordering::Relaxed)
    }

    pub fn patterns(&self) -> Vec<QueryPattern> {
        self.prefetcher.patterns()
    }

    pub fn prefetch_stats(&self) -> PrefetchStats {
        self.prefetcher.stats()
    }

    pub async fn shutdown(&self) {
        self.hub.shutdown().await;
        self.prefetcher.shutdown().await;
    }
}
