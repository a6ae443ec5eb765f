//! Cost-bounded TTL cache of query results, evicting least-frequently then least-recently used entries
use crate::metrics;
use crate::optimizer::fingerprint::Fingerprint;
use crate::optimizer::QueryResult;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub ttl: Duration,
    /// Total cost budget. One cost unit approximates one byte.
    pub capacity: u64,
    /// Fixed cost charged per entry.
    pub entry_overhead: u64,
    /// Cost charged per result row.
    pub row_cost: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            capacity: 100 * 1024 * 1024,
            entry_overhead: 256,
            row_cost: 128,
        }
    }
}

impl CacheConfig {
    pub fn estimate_cost(&self, result: &QueryResult) -> u64 {
        self.entry_overhead + self.row_cost * result.row_count() as u64
    }
}

struct CacheEntry {
    value: Arc<QueryResult>,
    cost: u64,
    expires_at: Instant,
    hits: AtomicU64,
    last_access: AtomicU64,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Cumulative counters plus current occupancy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub cost: u64,
    pub capacity: u64,
    pub hit_rate: f64,
}

pub struct QueryCache {
    config: CacheConfig,
    entries: DashMap<Fingerprint, CacheEntry>,
    cost: AtomicU64,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    /// Serializes admission so cost accounting and victim selection see one writer.
    admission: Mutex<()>,
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            cost: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            admission: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns a live entry and counts the hit, or counts a miss.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<QueryResult>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(fingerprint) {
            if entry.is_live(now) {
                entry.hits.fetch_add(1, Ordering::Relaxed);
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::inc_cache_event("hit");
                return Some(Arc::clone(&entry.value));
            }
            drop(entry);
            self.expire(fingerprint, now);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::inc_cache_event("miss");
        None
    }

    /// Live-entry check that touches no counters.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        let now = Instant::now();
        self.entries.get(fingerprint).map(|e| e.is_live(now)).unwrap_or(false)
    }

    fn expire(&self, fingerprint: &Fingerprint, now: Instant) {
        if let Some((_, old)) = self.entries.remove_if(fingerprint, |_, e| !e.is_live(now)) {
            self.cost.fetch_sub(old.cost, Ordering::Relaxed);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            metrics::inc_cache_event("expiration");
        }
    }

    /// Admits `value`, evicting as needed. Results costlier than the whole budget are refused.
    pub fn insert(&self, fingerprint: Fingerprint, value: Arc<QueryResult>) -> bool {
        let cost = self.config.estimate_cost(&value);
        if cost > self.config.capacity {
            debug!(
                "Not caching {}: cost {} exceeds capacity {}",
                fingerprint.short(),
                cost,
                self.config.capacity
            );
            return false;
        }

        let _admission = self.admission.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some((_, old)) = self.entries.remove(&fingerprint) {
            self.cost.fetch_sub(old.cost, Ordering::Relaxed);
        }
        if self.cost.load(Ordering::Relaxed) + cost > self.config.capacity {
            self.purge_expired();
        }
        while self.cost.load(Ordering::Relaxed) + cost > self.config.capacity {
            if !self.evict_one() {
                break;
            }
        }

        let entry = CacheEntry {
            value,
            cost,
            expires_at: Instant::now() + self.config.ttl,
            hits: AtomicU64::new(0),
            last_access: AtomicU64::new(self.tick()),
        };
        self.entries.insert(fingerprint, entry);
        self.cost.fetch_add(cost, Ordering::Relaxed);
        trace!("Cached {} at cost {}", fingerprint.short(), cost);
        true
    }

    /// Drops every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|e| !e.is_live(now))
            .map(|e| *e.key())
            .collect();
        let mut removed = 0;
        for fingerprint in expired {
            let before = self.expirations.load(Ordering::Relaxed);
            self.expire(&fingerprint, now);
            if self.expirations.load(Ordering::Relaxed) > before {
                removed += 1;
            }
        }
        removed
    }

    /// Removes the entry with the fewest hits, oldest access first among equals.
    fn evict_one(&self) -> bool {
        let victim = self
            .entries
            .iter()
            .map(|e| {
                (
                    e.hits.load(Ordering::Relaxed),
                    e.last_access.load(Ordering::Relaxed),
                    *e.key(),
                )
            })
            .min();
        let Some((hits, _, fingerprint)) = victim else {
            return false;
        };
        match self.entries.remove(&fingerprint) {
            Some((_, old)) => {
                self.cost.fetch_sub(old.cost, Ordering::Relaxed);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                metrics::inc_cache_event("eviction");
                debug!("Evicted {} ({} hits, cost {})", fingerprint.short(), hits, old.cost);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn metrics(&self) -> CacheMetrics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheMetrics {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            entries: self.entries.len(),
            cost: self.cost.load(Ordering::Relaxed),
            capacity: self.config.capacity,
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::fingerprint::FingerprintBuilder;
    use crate::types::{ConfidenceLevel, EntityResult, Point3D};

    fn fp(n: u64) -> Fingerprint {
        FingerprintBuilder::new("test").count(n).finish()
    }

    fn rows(n: usize) -> Arc<QueryResult> {
        let now = crate::types::now_micros();
        Arc::new(QueryResult::Entities(
            (0..n)
                .map(|i| EntityResult {
                    entity_id: format!("E{}", i),
                    position: Point3D::new(i as f64, 0.0, 0.0),
                    confidence: ConfidenceLevel::High,
                    source: "scan".into(),
                    updated_at: now,
                    distance: None,
                })
                .collect(),
        ))
    }

    /// Budget for exactly three single-row entries.
    fn three_entry_config() -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_secs(60),
            capacity: 3 * (100 + 10),
            entry_overhead: 100,
            row_cost: 10,
        }
    }

    #[test]
    fn test_hit_returns_identical_result() {
        let cache = QueryCache::new(CacheConfig::default());
        let value = rows(3);
        cache.insert(fp(1), Arc::clone(&value));
        let hit = cache.get(&fp(1)).unwrap();
        assert_eq!(*hit, *value);
        assert!(cache.get(&fp(2)).is_none());

        let m = cache.metrics();
        assert_eq!((m.hits, m.misses), (1, 1));
        assert!((m.hit_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(m.cost, 256 + 3 * 128);
    }

    #[test]
    fn test_lowest_frequency_evicted_once_per_eviction() {
        let cache = QueryCache::new(three_entry_config());
        for n in 1..=3 {
            assert!(cache.insert(fp(n), rows(1)));
        }
        cache.get(&fp(1));
        cache.get(&fp(1));
        cache.get(&fp(2));

        assert!(cache.insert(fp(4), rows(1)));
        assert_eq!(cache.metrics().evictions, 1);
        assert!(!cache.contains(&fp(3)));

        // fp(4) has no hits yet, so it goes next
        assert!(cache.insert(fp(5), rows(1)));
        assert_eq!(cache.metrics().evictions, 2);
        assert!(!cache.contains(&fp(4)));
        assert!(cache.contains(&fp(1)) && cache.contains(&fp(2)) && cache.contains(&fp(5)));
    }

    #[test]
    fn test_equal_frequency_evicts_least_recent() {
        let cache = QueryCache::new(three_entry_config());
        for n in 1..=3 {
            cache.insert(fp(n), rows(1));
        }
        cache.get(&fp(3));
        cache.get(&fp(1));
        cache.get(&fp(2));
        cache.insert(fp(4), rows(1));
        assert!(!cache.contains(&fp(3)));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_oversized_result_not_admitted() {
        let cache = QueryCache::new(three_entry_config());
        assert!(!cache.insert(fp(1), rows(100)));
        assert!(cache.is_empty());
        assert_eq!(cache.metrics().evictions, 0);
    }

    #[test]
    fn test_replacing_entry_keeps_cost_consistent() {
        let cache = QueryCache::new(three_entry_config());
        cache.insert(fp(1), rows(1));
        cache.insert(fp(1), rows(2));
        assert_eq!(cache.metrics().cost, 100 + 20);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_entries_never_served_past_ttl() {
        let cache = QueryCache::new(CacheConfig {
            ttl: Duration::from_millis(20),
            ..CacheConfig::default()
        });
        cache.insert(fp(1), rows(1));
        assert!(cache.get(&fp(1)).is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get(&fp(1)).is_none());
        let m = cache.metrics();
        assert_eq!(m.expirations, 1);
        assert_eq!(m.cost, 0);
        assert_eq!(m.entries, 0);
    }

    #[test]
    fn test_expired_entries_removed_before_evicting_live_ones() {
        let cache = QueryCache::new(CacheConfig {
            ttl: Duration::from_millis(20),
            ..three_entry_config()
        });
        for n in 1..=3 {
            cache.insert(fp(n), rows(1));
        }
        std::thread::sleep(Duration::from_millis(40));
        cache.insert(fp(4), rows(1));
        let m = cache.metrics();
        assert_eq!(m.evictions, 0);
        assert_eq!(m.expirations, 3);
        assert_eq!(m.entries, 1);
    }
}
