//! Adaptive index management for the primary store.
//!
//! Creates the base and specialized index sets, keeps them maintained on a schedule,
//! and turns slow query samples into index recommendations. Indices are created again
//! whenever the primary comes back. Nothing here fails a user-facing request: every
//! store error is logged and reported, never raised.
pub mod rules;
pub mod scheduler;

pub use rules::{IndexRecommendation, PredicateShape, QuerySample};
pub use scheduler::MaintenanceScheduler;

use crate::error::StoreResult;
use crate::optimizer::{MetricsCollector, QueryLatency};
use crate::store::schema::RTREE_TABLE;
use crate::store::{IndexDefinition, IndexUsage, SpatialStore};
use arc_swap::ArcSwap;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexOptimizerConfig {
    pub slow_query_threshold: Duration,
    /// Indices larger than this are rebuilt by the reindex job.
    pub reindex_size_threshold: u64,
    pub statistics_interval: Duration,
    pub reindex_interval: Duration,
}

impl Default for IndexOptimizerConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold: Duration::from_millis(100),
            reindex_size_threshold: 10 * 1024 * 1024,
            statistics_interval: Duration::from_secs(3600),
            reindex_interval: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexFailure {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexCreationReport {
    pub created: Vec<String>,
    pub failed: Vec<IndexFailure>,
}

impl IndexCreationReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Non-rtree indices larger than `threshold` bytes.
pub fn reindex_candidates(usage: &[IndexUsage], threshold: u64) -> Vec<String> {
    usage
        .iter()
        .filter(|u| u.name != RTREE_TABLE && u.size_bytes > threshold)
        .map(|u| u.name.clone())
        .collect()
}

async fn reindex_pass(store: &dyn SpatialStore, threshold: u64) -> usize {
    let usage = match store.index_usage().await {
        Ok(usage) => usage,
        Err(e) => {
            warn!("Reindex pass skipped, usage unavailable: {}", e);
            return 0;
        }
    };
    let mut rebuilt = 0;
    for name in reindex_candidates(&usage, threshold) {
        match store.reindex(&name).await {
            Ok(()) => {
                rebuilt += 1;
                debug!("Rebuilt index {}", name);
            }
            Err(e) => warn!("Reindex of {} failed: {}", name, e),
        }
    }
    if rebuilt > 0 {
        info!("Reindex pass rebuilt {} indices", rebuilt);
    }
    rebuilt
}

pub struct IndexOptimizer {
    store: Arc<dyn SpatialStore>,
    config: IndexOptimizerConfig,
    usage: ArcSwap<Vec<IndexUsage>>,
    created: DashSet<String>,
    scheduler: MaintenanceScheduler,
    metrics: Option<Arc<MetricsCollector>>,
    recommendations: ArcSwap<Vec<IndexRecommendation>>,
}

impl IndexOptimizer {
    pub fn new(store: Arc<dyn SpatialStore>, config: IndexOptimizerConfig) -> Self {
        Self {
            store,
            config,
            usage: ArcSwap::from_pointee(Vec::new()),
            created: DashSet::new(),
            scheduler: MaintenanceScheduler::new(),
            metrics: None,
            recommendations: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Latency source for the periodic analysis job.
    pub fn with_query_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &IndexOptimizerConfig {
        &self.config
    }

    /// Reads per-index usage from the primary and keeps it as the current snapshot.
    pub async fn analyze_usage(&self) -> StoreResult<Arc<Vec<IndexUsage>>> {
        let usage = Arc::new(self.store.index_usage().await?);
        debug!("Index usage snapshot holds {} indices", usage.len());
        self.usage.store(Arc::clone(&usage));
        Ok(usage)
    }

    pub fn usage_snapshot(&self) -> Arc<Vec<IndexUsage>> {
        self.usage.load_full()
    }

    async fn create_all(&self, definitions: Vec<IndexDefinition>) -> IndexCreationReport {
        let mut report = IndexCreationReport::default();
        for def in definitions {
            match self.store.create_index(&def).await {
                Ok(()) => {
                    self.created.insert(def.name.clone());
                    report.created.push(def.name);
                }
                Err(e) => {
                    warn!("Failed to create index {}: {}", def.name, e);
                    report.failed.push(IndexFailure {
                        name: def.name,
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Grid, floor and temporal composites. Safe to repeat.
    pub async fn create_base_indices(&self) -> IndexCreationReport {
        let report = self.create_all(rules::base_indices()).await;
        info!(
            "Base indices: {} created, {} failed",
            report.created.len(),
            report.failed.len()
        );
        report
    }

    /// Partial and density indices. Safe to repeat.
    pub async fn create_specialized_indices(&self) -> IndexCreationReport {
        let report = self.create_all(rules::specialized_indices()).await;
        info!(
            "Specialized indices: {} created, {} failed",
            report.created.len(),
            report.failed.len()
        );
        report
    }

    /// Base and specialized indices, when the primary answers and supports them.
    /// Returns true only when every index exists afterwards.
    pub async fn ensure_indices(&self) -> bool {
        match self.store.probe_spatial_support().await {
            Ok(true) => {}
            Ok(false) => {
                info!("Primary without spatial support, skipping index creation");
                return false;
            }
            Err(e) => {
                info!("Primary unreachable, index creation deferred: {}", e);
                return false;
            }
        }
        let base = self.create_base_indices().await;
        let specialized = self.create_specialized_indices().await;
        info!(
            "Spatial indices ready ({} created, {} failed)",
            base.created.len() + specialized.created.len(),
            base.failed.len() + specialized.failed.len()
        );
        base.is_complete() && specialized.is_complete()
    }

    /// Runs [`Self::ensure_indices`] on every primary recovery.
    pub fn schedule_recovery_indexing(self: &Arc<Self>, recoveries: watch::Receiver<u64>) -> bool {
        let optimizer: Weak<Self> = Arc::downgrade(self);
        let registered = self.scheduler.on_change("recovery_indexing", recoveries, move || {
            let optimizer = optimizer.clone();
            async move {
                if let Some(optimizer) = optimizer.upgrade() {
                    info!("Primary recovered, ensuring spatial indices");
                    optimizer.ensure_indices().await;
                }
            }
        });
        if let Err(e) = registered {
            warn!("Indices will not follow primary recovery: {}", e);
            return false;
        }
        true
    }

    /// Registers the reindex, statistics and analysis jobs. Returns false when no scheduler is available.
    pub fn schedule_maintenance(self: &Arc<Self>) -> bool {
        let store = Arc::clone(&self.store);
        let threshold = self.config.reindex_size_threshold;
        let reindex = self.scheduler.every("reindex", self.config.reindex_interval, move || {
            let store = Arc::clone(&store);
            async move {
                reindex_pass(store.as_ref(), threshold).await;
            }
        });
        if let Err(e) = reindex {
            warn!("Continuing without scheduled index maintenance: {}", e);
            return false;
        }

        let store = Arc::clone(&self.store);
        let statistics = self.scheduler.every("statistics", self.config.statistics_interval, move || {
            let store = Arc::clone(&store);
            async move {
                if let Err(e) = store.refresh_statistics().await {
                    warn!("Statistics refresh failed: {}", e);
                }
            }
        });
        if let Err(e) = statistics {
            warn!("Continuing without scheduled statistics refresh: {}", e);
            return false;
        }

        let optimizer: Weak<Self> = Arc::downgrade(self);
        let analysis = self.scheduler.every("index_analysis", self.config.statistics_interval, move || {
            let optimizer = optimizer.clone();
            async move {
                if let Some(optimizer) = optimizer.upgrade() {
                    optimizer.run_analysis().await;
                }
            }
        });
        if let Err(e) = analysis {
            warn!("Continuing without scheduled index analysis: {}", e);
            return false;
        }
        true
    }

    /// Refreshes usage, matches recorded latencies against the rules and keeps the result.
    pub async fn run_analysis(&self) -> Arc<Vec<IndexRecommendation>> {
        if let Err(e) = self.analyze_usage().await {
            debug!("Index analysis without fresh usage: {}", e);
        }
        let samples = match &self.metrics {
            Some(metrics) => self.slow_query_samples(&metrics.snapshot()),
            None => Vec::new(),
        };
        let recommendations = Arc::new(self.recommend_indices(&samples));
        for rec in recommendations.iter() {
            info!(
                "Recommending index {} ({}, {:.1} ms)",
                rec.index.name, rec.rule, rec.sample.latency_ms
            );
        }
        self.recommendations.store(Arc::clone(&recommendations));
        recommendations
    }

    /// Result of the most recent analysis run.
    pub fn latest_recommendations(&self) -> Arc<Vec<IndexRecommendation>> {
        self.recommendations.load_full()
    }

    pub fn scheduled_jobs(&self) -> Vec<String> {
        self.scheduler.job_names()
    }

    /// One reindex pass now, outside the schedule.
    pub async fn reindex_large_indices(&self) -> usize {
        reindex_pass(self.store.as_ref(), self.config.reindex_size_threshold).await
    }

    fn existing_indices(&self) -> HashSet<String> {
        let mut names: HashSet<String> = self.usage.load().iter().map(|u| u.name.clone()).collect();
        names.extend(self.created.iter().map(|n| n.key().clone()));
        names
    }

    /// Matches slow samples against the rule table. Nothing is applied.
    pub fn recommend_indices(&self, samples: &[QuerySample]) -> Vec<IndexRecommendation> {
        let threshold_ms = self.config.slow_query_threshold.as_secs_f64() * 1000.0;
        let mut slow: Vec<&QuerySample> = samples.iter().filter(|s| s.latency_ms > threshold_ms).collect();
        slow.sort_by(|a, b| b.latency_ms.total_cmp(&a.latency_ms));

        let mut taken = self.existing_indices();
        let mut out = Vec::new();
        for sample in slow {
            for rule in rules::RULES {
                let Some(index) = (rule.propose)(&sample.shape) else {
                    continue;
                };
                if taken.insert(index.name.clone()) {
                    out.push(IndexRecommendation {
                        sample: sample.clone(),
                        rule: rule.name,
                        index,
                    });
                }
            }
        }
        out
    }

    pub fn slow_query_samples(&self, metrics: &[QueryLatency]) -> Vec<QuerySample> {
        metrics.iter().map(QuerySample::from).collect()
    }

    pub async fn apply_recommendation(&self, recommendation: &IndexRecommendation) -> StoreResult<()> {
        self.store.create_index(&recommendation.index).await?;
        self.created.insert(recommendation.index.name.clone());
        info!(
            "Applied index {} ({})",
            recommendation.index.name, recommendation.rule
        );
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{QueryKind, QuerySpec};
    use crate::store::testing::FlakyStore;
    use crate::store::{GridResolution, SpatialStore};
    use crate::types::Point3D;
    use tempfile::tempdir;

    fn sample(shape: PredicateShape, latency_ms: f64) -> QuerySample {
        QuerySample {
            fingerprint: QuerySpec::KNearest { center: Point3D::default(), k: latency_ms as usize }.fingerprint(),
            shape,
            latency_ms,
        }
    }

    fn usage(name: &str, size_bytes: u64) -> IndexUsage {
        IndexUsage {
            name: name.to_string(),
            table: "positions".to_string(),
            scans: 0,
            tuples_read: 0,
            size_bytes,
        }
    }

    // ===== Index creation =====

    #[tokio::test]
    async fn test_base_indices_created_idempotently() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FlakyStore::connected(dir.path()).await);
        let optimizer = IndexOptimizer::new(store.clone(), IndexOptimizerConfig::default());

        let first = optimizer.create_base_indices().await;
        assert!(first.is_complete());
        assert_eq!(first.created.len(), 5);
        assert!(optimizer.create_base_indices().await.is_complete());

        let names: Vec<String> = optimizer.analyze_usage().await.unwrap().iter().map(|u| u.name.clone()).collect();
        for res in GridResolution::ALL {
            assert!(names.contains(&res.index_name().to_string()));
        }
        assert!(names.contains(&rules::FLOOR_INDEX.to_string()));
    }

    #[tokio::test]
    async fn test_failed_index_does_not_stop_the_rest() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FlakyStore::connected(dir.path()).await);
        *store.reject_index.lock().unwrap() = Some(rules::HIGH_CONFIDENCE_INDEX.to_string());
        let optimizer = IndexOptimizer::new(store.clone(), IndexOptimizerConfig::default());

        let report = optimizer.create_specialized_indices().await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].name, rules::HIGH_CONFIDENCE_INDEX);
        assert_eq!(report.created.len(), 2);
        assert_eq!(store.created_indices.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_primary_reports_every_failure() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FlakyStore::connected(dir.path()).await);
        store.set_offline(true);
        let optimizer = IndexOptimizer::new(store.clone(), IndexOptimizerConfig::default());
        let report = optimizer.create_base_indices().await;
        assert!(report.created.is_empty());
        assert_eq!(report.failed.len(), 5);
        assert!(optimizer.analyze_usage().await.is_err());
    }

    #[tokio::test]
    async fn test_grid_query_counts_against_its_index() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FlakyStore::connected(dir.path()).await);
        let optimizer = IndexOptimizer::new(store.clone(), IndexOptimizerConfig::default());
        optimizer.create_base_indices().await;
        store
            .find_near_indexed(Point3D::default(), 2.0, GridResolution::Fine)
            .await
            .unwrap();

        let snapshot = optimizer.analyze_usage().await.unwrap();
        let fine = snapshot
            .iter()
            .find(|u| u.name == GridResolution::Fine.index_name())
            .unwrap();
        assert_eq!(fine.scans, 1);
        assert_eq!(optimizer.usage_snapshot().len(), snapshot.len());
    }

    // ===== Recommendations =====

    #[tokio::test]
    async fn test_recommends_only_for_slow_samples_and_dedups() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FlakyStore::connected(dir.path()).await);
        let optimizer = IndexOptimizer::new(store.clone(), IndexOptimizerConfig::default());

        let recs = optimizer.recommend_indices(&[
            sample(PredicateShape::Clustering, 250.0),
            sample(PredicateShape::Clustering, 400.0),
            sample(PredicateShape::BoundingBox, 20.0),
        ]);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].rule, "clustering_without_density");
        assert_eq!(recs[0].sample.latency_ms, 400.0);
        // recommending never touches the store
        assert!(store.created_indices.lock().unwrap().is_empty());

        optimizer.apply_recommendation(&recs[0]).await.unwrap();
        assert!(optimizer
            .recommend_indices(&[sample(PredicateShape::Clustering, 400.0)])
            .is_empty());
    }

    #[tokio::test]
    async fn test_existing_indices_suppress_recommendations() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FlakyStore::connected(dir.path()).await);
        let optimizer = IndexOptimizer::new(store.clone(), IndexOptimizerConfig::default());
        optimizer.create_base_indices().await;
        optimizer.analyze_usage().await.unwrap();

        let recs = optimizer.recommend_indices(&[
            sample(PredicateShape::Proximity { radius: Some(3.0) }, 500.0),
            sample(PredicateShape::KNearest, 500.0),
            sample(PredicateShape::TemporalFilter, 500.0),
            sample(PredicateShape::ConfidenceFilter, 500.0),
        ]);
        let names: Vec<_> = recs.iter().map(|r| r.index.name.as_str()).collect();
        assert_eq!(names, vec![rules::HIGH_CONFIDENCE_INDEX]);
    }

    #[test]
    fn test_samples_built_from_latency_metrics() {
        let latency = QueryLatency {
            fingerprint: QuerySpec::BoundingBox {
                bbox: crate::types::BoundingBox::around(&Point3D::default(), 1.0),
            }
            .fingerprint(),
            kind: QueryKind::BoundingBox,
            radius: None,
            count: 3,
            min_ms: 1.0,
            max_ms: 300.0,
            avg_ms: 100.7,
            executions: 1,
            execution_avg_ms: 300.0,
            last_seen: chrono::Utc::now(),
        };
        let sample = QuerySample::from(&latency);
        assert_eq!(sample.shape, PredicateShape::BoundingBox);
        // cache hits do not hide a slow store query
        assert_eq!(sample.latency_ms, 300.0);
    }

    #[tokio::test]
    async fn test_analysis_turns_recorded_queries_into_recommendations() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FlakyStore::connected(dir.path()).await);
        let metrics = Arc::new(MetricsCollector::new());
        let optimizer = IndexOptimizer::new(store.clone(), IndexOptimizerConfig::default())
            .with_query_metrics(Arc::clone(&metrics));
        assert!(optimizer.run_analysis().await.is_empty());

        let confidence = QuerySpec::ByConfidence { min_level: crate::types::ConfidenceLevel::High };
        let stale = QuerySpec::NeedingVerification { verified_before: chrono::Utc::now() };
        metrics.record_execution(confidence.fingerprint(), &confidence, Duration::from_millis(400));
        metrics.record_call(confidence.fingerprint(), &confidence, Duration::from_millis(401));
        metrics.record_execution(stale.fingerprint(), &stale, Duration::from_millis(300));

        let recs = optimizer.run_analysis().await;
        let names: Vec<_> = recs.iter().map(|r| r.index.name.as_str()).collect();
        assert_eq!(names, vec![rules::HIGH_CONFIDENCE_INDEX, rules::TEMPORAL_INDEX]);
        assert_eq!(optimizer.latest_recommendations(), recs);
    }

    #[tokio::test]
    async fn test_ensure_indices_follows_primary_availability() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FlakyStore::connected(dir.path()).await);
        store.set_offline(true);
        let optimizer = IndexOptimizer::new(store.clone(), IndexOptimizerConfig::default());
        assert!(!optimizer.ensure_indices().await);
        assert!(store.created_indices.lock().unwrap().is_empty());

        store.set_offline(false);
        assert!(optimizer.ensure_indices().await);
        let created = store.created_indices.lock().unwrap().clone();
        assert!(created.contains(&rules::FLOOR_INDEX.to_string()));
        assert!(created.contains(&rules::HIGH_CONFIDENCE_INDEX.to_string()));
    }

    #[tokio::test]
    async fn test_recovery_signal_creates_indices() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FlakyStore::connected(dir.path()).await);
        store.set_offline(true);
        let optimizer = Arc::new(IndexOptimizer::new(store.clone(), IndexOptimizerConfig::default()));
        let (recoveries, receiver) = watch::channel(0u64);
        assert!(optimizer.schedule_recovery_indexing(receiver));
        assert_eq!(optimizer.scheduled_jobs(), vec!["recovery_indexing"]);

        store.set_offline(false);
        recoveries.send_modify(|n| *n += 1);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.created_indices.lock().unwrap().len() < 8 {
            assert!(tokio::time::Instant::now() < deadline, "indices not created after recovery");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        optimizer.shutdown().await;
    }

    // ===== Maintenance =====

    #[test]
    fn test_reindex_candidates_skip_small_and_rtree() {
        let usage = vec![
            usage("idx_positions_grid_fine", 20 * 1024 * 1024),
            usage("idx_positions_floor", 1024),
            usage(RTREE_TABLE, 50 * 1024 * 1024),
        ];
        assert_eq!(
            reindex_candidates(&usage, 10 * 1024 * 1024),
            vec!["idx_positions_grid_fine".to_string()]
        );
    }

    #[tokio::test]
    async fn test_maintenance_jobs_registered_and_joined() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FlakyStore::connected(dir.path()).await);
        let optimizer = Arc::new(IndexOptimizer::new(store.clone(), IndexOptimizerConfig::default()));
        assert!(optimizer.schedule_maintenance());
        assert_eq!(optimizer.scheduled_jobs(), vec!["reindex", "statistics", "index_analysis"]);
        optimizer.shutdown().await;
        assert!(optimizer.scheduled_jobs().is_empty());
    }

    #[test]
    fn test_maintenance_without_runtime_is_soft() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn SpatialStore> = Arc::new(crate::store::RtreeStore::new(
            dir.path().join("primary.db"),
            crate::store::StoreTimeouts::default(),
        ));
        let optimizer = Arc::new(IndexOptimizer::new(store, IndexOptimizerConfig::default()));
        assert!(!optimizer.schedule_maintenance());
        assert!(optimizer.scheduled_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_analysis_job_publishes_recommendations() {
        let dir = tempdir().unwrap();
        // never connected: usage lookups fail fast and nothing counts as existing
        let store: Arc<dyn SpatialStore> = Arc::new(crate::store::RtreeStore::new(
            dir.path().join("primary.db"),
            crate::store::StoreTimeouts::default(),
        ));
        let metrics = Arc::new(MetricsCollector::new());
        let near = QuerySpec::Near { center: Point3D::default(), radius: 2.0 };
        metrics.record_execution(near.fingerprint(), &near, Duration::from_millis(500));
        let optimizer = Arc::new(
            IndexOptimizer::new(store, IndexOptimizerConfig::default()).with_query_metrics(Arc::clone(&metrics)),
        );
        assert!(optimizer.schedule_maintenance());
        assert!(optimizer.latest_recommendations().is_empty());

        let interval = optimizer.config().statistics_interval;
        tokio::time::sleep(interval + Duration::from_secs(1)).await;
        let latest = optimizer.latest_recommendations();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].index.name, GridResolution::Fine.index_name());
        assert_eq!(latest[0].rule, "proximity_without_grid");

        optimizer.shutdown().await;
    }
}
