//! Process-wide Prometheus metrics

use lazy_static::lazy_static;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;
use tracing::warn;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static CACHE_EVENTS: OnceLock<IntCounterVec> = OnceLock::new();
static SYNC_QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();
static PRIMARY_AVAILABLE: OnceLock<IntGauge> = OnceLock::new();
static QUERY_LATENCY: OnceLock<HistogramVec> = OnceLock::new();
static STREAM_DROPS: OnceLock<IntCounter> = OnceLock::new();

fn register<M>(cell: &OnceLock<M>, metric: prometheus::Result<M>)
where
    M: prometheus::core::Collector + Clone + 'static,
{
    match metric {
        Ok(m) => {
            if cell.set(m.clone()).is_ok() {
                REGISTRY.register(Box::new(m)).ok();
            }
        }
        Err(e) => warn!("Failed to build metric: {}", e),
    }
}

/// Registers every collector. Safe to call more than once.
pub fn init_metrics() {
    register(
        &CACHE_EVENTS,
        IntCounterVec::new(
            prometheus::opts!("spatial_cache_events_total", "Query cache hits, misses, evictions and expirations"),
            &["event"],
        ),
    );
    register(
        &SYNC_QUEUE_DEPTH,
        IntGauge::new("spatial_sync_queue_depth", "Position writes waiting for primary replay"),
    );
    register(
        &PRIMARY_AVAILABLE,
        IntGauge::new("spatial_primary_available", "1 when the primary store passed its last probe"),
    );
    register(
        &QUERY_LATENCY,
        HistogramVec::new(
            HistogramOpts::new("spatial_query_latency_seconds", "Store latency of optimized spatial queries")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
            &["kind"],
        ),
    );
    register(
        &STREAM_DROPS,
        IntCounter::new("spatial_stream_dropped_total", "Change events dropped on full subscriber queues"),
    );
}

pub fn inc_cache_event(event: &str) {
    if let Some(counter) = CACHE_EVENTS.get() {
        counter.with_label_values(&[event]).inc();
    }
}

pub fn set_sync_queue_depth(depth: usize) {
    if let Some(gauge) = SYNC_QUEUE_DEPTH.get() {
        gauge.set(depth as i64);
    }
}

pub fn set_primary_available(available: bool) {
    if let Some(gauge) = PRIMARY_AVAILABLE.get() {
        gauge.set(i64::from(available));
    }
}

pub fn observe_query_latency(kind: &str, seconds: f64) {
    if let Some(histogram) = QUERY_LATENCY.get() {
        histogram.with_label_values(&[kind]).observe(seconds);
    }
}

pub fn inc_stream_drops() {
    if let Some(counter) = STREAM_DROPS.get() {
        counter.inc();
    }
}

/// Prometheus text exposition of the registry.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(feature = "cli")]
pub async fn get_metrics() -> impl axum::response::IntoResponse {
    (
        axum::http::StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent_and_renders() {
        init_metrics();
        init_metrics();
        inc_cache_event("hit");
        set_sync_queue_depth(3);
        observe_query_latency("near", 0.002);
        let text = render();
        assert!(text.contains("spatial_cache_events_total"));
        assert!(text.contains("spatial_sync_queue_depth"));
    }
}
