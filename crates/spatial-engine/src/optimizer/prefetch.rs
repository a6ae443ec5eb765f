//! Co-occurrence based cache warming
use crate::optimizer::fingerprint::Fingerprint;
use crate::optimizer::{Executor, QueryKind, QuerySpec};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchConfig {
    pub enabled: bool,
    /// Fingerprints served within this window of each other become related.
    pub co_occurrence_window: Duration,
    /// Upper bound on related fingerprints kept per pattern.
    pub max_related: usize,
    pub queue_capacity: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            co_occurrence_window: Duration::from_secs(2),
            max_related: 8,
            queue_capacity: 64,
        }
    }
}

struct PatternState {
    kind: QueryKind,
    frequency: u64,
    last_seen: DateTime<Utc>,
    related: Vec<Fingerprint>,
    spec: QuerySpec,
}

impl PatternState {
    fn relate(&mut self, other: Fingerprint, max_related: usize) {
        if self.related.contains(&other) {
            return;
        }
        if self.related.len() >= max_related {
            self.related.remove(0);
        }
        self.related.push(other);
    }
}

/// Learned access pattern for one fingerprint.
#[derive(Debug, Clone, Serialize)]
pub struct QueryPattern {
    pub fingerprint: Fingerprint,
    pub kind: QueryKind,
    pub frequency: u64,
    pub last_seen: DateTime<Utc>,
    pub related: Vec<Fingerprint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrefetchStats {
    pub patterns: usize,
    pub scheduled: u64,
    pub dropped: u64,
    pub completed: u64,
    pub failed: u64,
}

pub struct Prefetcher {
    config: PrefetchConfig,
    patterns: DashMap<Fingerprint, PatternState>,
    recent: Cache<Fingerprint, ()>,
    jobs: mpsc::Sender<QuerySpec>,
    queue: Mutex<Option<mpsc::Receiver<QuerySpec>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    scheduled: AtomicU64,
    dropped: AtomicU64,
    completed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl Prefetcher {
    pub fn new(config: PrefetchConfig) -> Self {
        let (jobs, queue) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let recent = Cache::builder()
            .max_capacity(4096)
            .time_to_live(config.co_occurrence_window)
            .build();
        Self {
            config,
            patterns: DashMap::new(),
            recent,
            jobs,
            queue: Mutex::new(Some(queue)),
            worker: Mutex::new(None),
            shutdown,
            scheduled: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            completed: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawns the worker that executes and caches scheduled specs.
    pub fn start(&self, executor: Arc<Executor>) {
        if !self.config.enabled {
            return;
        }
        let Some(mut queue) = self.queue.lock().unwrap_or_else(|p| p.into_inner()).take() else {
            return;
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!("No Tokio runtime, prefetching disabled: {}", e);
                return;
            }
        };
        let mut shutdown = self.shutdown.subscribe();
        let completed = Arc::clone(&self.completed);
        let failed = Arc::clone(&self.failed);

        let handle = runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    job = queue.recv() => {
                        let Some(spec) = job else { break };
                        let fingerprint = spec.fingerprint();
                        if executor.is_cached(&fingerprint) {
                            continue;
                        }
                        match executor.fetch(fingerprint, &spec).await {
                            Ok(_) => {
                                completed.fetch_add(1, Ordering::Relaxed);
                                debug!("Prefetched {}", fingerprint.short());
                            }
                            Err(e) => {
                                failed.fetch_add(1, Ordering::Relaxed);
                                debug!("Prefetch of {} failed: {}", fingerprint.short(), e);
                            }
                        }
                    }
                }
            }
            debug!("Prefetch worker stopped");
        });
        *self.worker.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    /// Counts an access and relates it to everything served within the co-occurrence window.
    pub fn record(&self, fingerprint: Fingerprint, spec: &QuerySpec) {
        let now = Utc::now();
        let others: Vec<Fingerprint> = self
            .recent
            .iter()
            .map(|(fp, _)| *fp)
            .filter(|fp| *fp != fingerprint)
            .collect();

        {
            let mut state = self.patterns.entry(fingerprint).or_insert_with(|| PatternState {
                kind: spec.kind(),
                frequency: 0,
                last_seen: now,
                related: Vec::new(),
                spec: spec.clone(),
            });
            state.frequency += 1;
            state.last_seen = now;
            for other in &others {
                state.relate(*other, self.config.max_related);
            }
        }
        for other in &others {
            if let Some(mut state) = self.patterns.get_mut(other) {
                state.relate(fingerprint, self.config.max_related);
            }
        }
        self.recent.insert(fingerprint, ());
    }

    /// Queues related fingerprints that `is_cached` reports missing. Never blocks.
    pub fn schedule_related(&self, fingerprint: &Fingerprint, is_cached: impl Fn(&Fingerprint) -> bool) -> usize {
        if !self.config.enabled {
            return 0;
        }
        let candidates: Vec<QuerySpec> = {
            let Some(state) = self.patterns.get(fingerprint) else {
                return 0;
            };
            state.related.clone()
        }
        .into_iter()
        .filter(|fp| !is_cached(fp))
        .filter_map(|fp| self.patterns.get(&fp).map(|s| s.spec.clone()))
        .collect();

        let mut queued = 0;
        for spec in candidates {
            match self.jobs.try_send(spec) {
                Ok(()) => {
                    queued += 1;
                    self.scheduled.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("Prefetch queue full, job dropped");
                }
            }
        }
        queued
    }

    pub fn pattern(&self, fingerprint: &Fingerprint) -> Option<QueryPattern> {
        self.patterns.get(fingerprint).map(|s| QueryPattern {
            fingerprint: *fingerprint,
            kind: s.kind,
            frequency: s.frequency,
            last_seen: s.last_seen,
            related: s.related.clone(),
        })
    }

    /// Most frequent patterns first.
    pub fn patterns(&self) -> Vec<QueryPattern> {
        let mut out: Vec<QueryPattern> = self
            .patterns
            .iter()
            .map(|s| QueryPattern {
                fingerprint: *s.key(),
                kind: s.kind,
                frequency: s.frequency,
                last_seen: s.last_seen,
                related: s.related.clone(),
            })
            .collect();
        out.sort_by(|a, b| b.frequency.cmp(&a.frequency).then(a.fingerprint.cmp(&b.fingerprint)));
        out
    }

    pub fn stats(&self) -> PrefetchStats {
        PrefetchStats {
            patterns: self.patterns.len(),
            scheduled: self.scheduled.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Prefetch worker ended abnormally: {}", e);
            } else {
                info!("Prefetch worker stopped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Point3D;

    fn near(x: f64) -> QuerySpec {
        QuerySpec::Near {
            center: Point3D::new(x, 0.0, 0.0),
            radius: 10.0,
        }
    }

    #[test]
    fn test_frequency_is_monotonic() {
        let prefetcher = Prefetcher::new(PrefetchConfig::default());
        let spec = near(1.0);
        let fp = spec.fingerprint();
        let mut last = 0;
        for _ in 0..5 {
            prefetcher.record(fp, &spec);
            let now = prefetcher.pattern(&fp).unwrap().frequency;
            assert!(now > last);
            last = now;
        }
        assert_eq!(last, 5);
    }

    #[test]
    fn test_co_occurring_fingerprints_become_related() {
        let prefetcher = Prefetcher::new(PrefetchConfig::default());
        let (a, b) = (near(1.0), near(2.0));
        prefetcher.record(a.fingerprint(), &a);
        prefetcher.record(b.fingerprint(), &b);

        assert_eq!(prefetcher.pattern(&a.fingerprint()).unwrap().related, vec![b.fingerprint()]);
        assert_eq!(prefetcher.pattern(&b.fingerprint()).unwrap().related, vec![a.fingerprint()]);
    }

    #[test]
    fn test_outside_window_not_related() {
        let prefetcher = Prefetcher::new(PrefetchConfig {
            co_occurrence_window: Duration::from_millis(20),
            ..PrefetchConfig::default()
        });
        let (a, b) = (near(1.0), near(2.0));
        prefetcher.record(a.fingerprint(), &a);
        std::thread::sleep(Duration::from_millis(60));
        prefetcher.record(b.fingerprint(), &b);
        assert!(prefetcher.pattern(&b.fingerprint()).unwrap().related.is_empty());
    }

    #[test]
    fn test_related_set_is_bounded() {
        let prefetcher = Prefetcher::new(PrefetchConfig {
            max_related: 2,
            ..PrefetchConfig::default()
        });
        let specs: Vec<_> = (0..5).map(|i| near(i as f64)).collect();
        for spec in &specs {
            prefetcher.record(spec.fingerprint(), spec);
        }
        assert_eq!(prefetcher.pattern(&specs[4].fingerprint()).unwrap().related.len(), 2);
    }

    #[tokio::test]
    async fn test_schedule_skips_cached_and_drops_when_full() {
        let prefetcher = Prefetcher::new(PrefetchConfig {
            queue_capacity: 1,
            ..PrefetchConfig::default()
        });
        let specs: Vec<_> = (0..3).map(|i| near(i as f64)).collect();
        for spec in &specs {
            prefetcher.record(spec.fingerprint(), spec);
        }
        let cached = specs[1].fingerprint();
        // worker not started, so the single slot fills and the rest are dropped
        let queued = prefetcher.schedule_related(&specs[0].fingerprint(), |fp| *fp == cached);
        assert_eq!(queued, 1);
        let stats = prefetcher.stats();
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.dropped, 0);

        let queued = prefetcher.schedule_related(&specs[0].fingerprint(), |_| false);
        assert_eq!(queued, 0);
        assert_eq!(prefetcher.stats().dropped, 2);
    }
}
