//! Last-probed primary health, read lock-free on every routing decision
use crate::metrics;
use crate::types::StoreHealth;
use arc_swap::ArcSwap;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;

pub struct HealthMonitor {
    state: ArcSwap<StoreHealth>,
    recoveries: watch::Sender<u64>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    /// Starts unavailable until the first probe.
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(StoreHealth::unknown()),
            recoveries: watch::channel(0).0,
        }
    }

    /// Counts unavailable-to-available flips. Receivers see only flips after subscribing.
    pub fn subscribe_recoveries(&self) -> watch::Receiver<u64> {
        self.recoveries.subscribe()
    }

    pub fn current(&self) -> Arc<StoreHealth> {
        self.state.load_full()
    }

    pub fn is_available(&self) -> bool {
        self.state.load().available
    }

    pub fn has_spatial_support(&self) -> bool {
        let state = self.state.load();
        state.available && state.spatial_support
    }

    /// Returns true when this call flipped the primary from unavailable.
    pub fn mark_available(&self, spatial_support: bool) -> bool {
        let previous = self.state.swap(Arc::new(StoreHealth {
            available: true,
            spatial_support,
            last_checked: Some(Utc::now()),
            last_error: None,
        }));
        metrics::set_primary_available(true);
        let flipped = !previous.available;
        if flipped {
            self.recoveries.send_modify(|n| *n += 1);
        }
        flipped
    }

    /// Keeps the last known spatial capability. Returns true when this call demoted the primary.
    pub fn mark_unavailable(&self, error: impl Into<String>) -> bool {
        let error = error.into();
        let previous = self.state.rcu(|current| StoreHealth {
            available: false,
            spatial_support: current.spatial_support,
            last_checked: Some(Utc::now()),
            last_error: Some(error.clone()),
        });
        metrics::set_primary_available(false);
        previous.available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_reported_once() {
        let health = HealthMonitor::new();
        assert!(!health.is_available());
        assert!(health.current().last_checked.is_none());

        assert!(health.mark_available(true));
        assert!(!health.mark_available(true));
        assert!(health.has_spatial_support());

        assert!(health.mark_unavailable("connection refused"));
        assert!(!health.mark_unavailable("connection refused"));
        let state = health.current();
        assert!(!state.available);
        assert!(state.spatial_support);
        assert!(!health.has_spatial_support());
        assert_eq!(state.last_error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_recovery_signalled_once_per_flip() {
        let health = HealthMonitor::new();
        let mut recoveries = health.subscribe_recoveries();
        assert!(!recoveries.has_changed().unwrap());

        health.mark_available(true);
        assert!(recoveries.has_changed().unwrap());
        assert_eq!(*recoveries.borrow_and_update(), 1);

        health.mark_available(true);
        assert!(!recoveries.has_changed().unwrap());

        health.mark_unavailable("gone");
        health.mark_available(false);
        assert_eq!(*recoveries.borrow_and_update(), 2);
    }
}
