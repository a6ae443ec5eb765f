//! Per-fingerprint latency statistics
use crate::metrics;
use crate::optimizer::fingerprint::Fingerprint;
use crate::optimizer::{QueryKind, QuerySpec};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone)]
struct LatencyStats {
    kind: QueryKind,
    radius: Option<f64>,
    count: u64,
    total: Duration,
    min: Duration,
    max: Duration,
    executions: u64,
    execution_total: Duration,
    last_seen: DateTime<Utc>,
}

impl LatencyStats {
    fn new(spec: &QuerySpec) -> Self {
        Self {
            kind: spec.kind(),
            radius: spec.radius(),
            count: 0,
            total: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
            executions: 0,
            execution_total: Duration::ZERO,
            last_seen: Utc::now(),
        }
    }
}

/// Read-only view of one fingerprint's latency.
///
/// `count`, `min_ms`, `max_ms` and `avg_ms` cover every caller, cache hits included.
/// `executions` and `execution_avg_ms` cover the store round trips behind them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryLatency {
    pub fingerprint: Fingerprint,
    pub kind: QueryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
    pub count: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub executions: u64,
    pub execution_avg_ms: f64,
    pub last_seen: DateTime<Utc>,
}

impl QueryLatency {
    /// Calls answered without a store round trip of their own.
    pub fn cache_hits(&self) -> u64 {
        self.count.saturating_sub(self.executions)
    }

    /// What the store costs for this query: execution time when it ran, caller time otherwise.
    pub fn store_latency_ms(&self) -> f64 {
        if self.executions > 0 {
            self.execution_avg_ms
        } else {
            self.avg_ms
        }
    }
}

#[derive(Default)]
pub struct MetricsCollector {
    stats: DashMap<Fingerprint, LatencyStats>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// One answered call, as long as its caller waited.
    pub fn record_call(&self, fingerprint: Fingerprint, spec: &QuerySpec, elapsed: Duration) {
        metrics::observe_query_latency(spec.kind().as_str(), elapsed.as_secs_f64());
        let mut stats = self.stats.entry(fingerprint).or_insert_with(|| LatencyStats::new(spec));
        stats.count += 1;
        stats.total += elapsed;
        stats.min = stats.min.min(elapsed);
        stats.max = stats.max.max(elapsed);
        stats.last_seen = Utc::now();
    }

    /// One store round trip, including speculative prefetches.
    pub fn record_execution(&self, fingerprint: Fingerprint, spec: &QuerySpec, elapsed: Duration) {
        let mut stats = self.stats.entry(fingerprint).or_insert_with(|| LatencyStats::new(spec));
        stats.executions += 1;
        stats.execution_total += elapsed;
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<QueryLatency> {
        self.stats.get(fingerprint).map(|s| to_view(*s.key(), &s))
    }

    /// All fingerprints, slowest average first.
    pub fn snapshot(&self) -> Vec<QueryLatency> {
        let mut out: Vec<QueryLatency> = self.stats.iter().map(|s| to_view(*s.key(), &s)).collect();
        out.sort_by(|a, b| b.avg_ms.total_cmp(&a.avg_ms).then(a.fingerprint.cmp(&b.fingerprint)));
        out
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

fn to_view(fingerprint: Fingerprint, s: &LatencyStats) -> QueryLatency {
    let ms = |d: Duration| d.as_secs_f64() * 1000.0;
    QueryLatency {
        fingerprint,
        kind: s.kind,
        radius: s.radius,
        count: s.count,
        min_ms: if s.count == 0 { 0.0 } else { ms(s.min) },
        max_ms: ms(s.max),
        avg_ms: ms(s.total) / s.count.max(1) as f64,
        executions: s.executions,
        execution_avg_ms: ms(s.execution_total) / s.executions.max(1) as f64,
        last_seen: s.last_seen,
    }
}
