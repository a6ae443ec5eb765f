//! Filtered change subscriptions over the primary's notification channel
use crate::error::{StoreError, StoreResult};
use crate::metrics;
use crate::store::{check_bbox, check_point, check_radius, SpatialStore};
use crate::types::{BoundingBox, ChangeNotification, Point3D, POSITION_EPSILON};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Per-subscriber queue capacity; events beyond it are dropped.
    pub queue_capacity: usize,
    /// Silence after which the store is pinged.
    pub heartbeat: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            heartbeat: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFilter {
    Proximity { center: Point3D, radius: f64 },
    BoundingBox { bbox: BoundingBox },
}

impl StreamFilter {
    pub fn validate(&self) -> StoreResult<()> {
        match self {
            StreamFilter::Proximity { center, radius } => {
                check_point(center)?;
                check_radius(*radius)
            }
            StreamFilter::BoundingBox { bbox } => check_bbox(bbox),
        }
    }

    pub fn matches(&self, p: &Point3D) -> bool {
        match self {
            StreamFilter::Proximity { center, radius } => center.distance_to(p) <= radius + POSITION_EPSILON,
            StreamFilter::BoundingBox { bbox } => bbox.expand(POSITION_EPSILON).contains(p),
        }
    }
}

/// Receiving side of a subscription. Dropping it cancels the subscription.
pub struct ChangeStream {
    id: u64,
    rx: mpsc::Receiver<ChangeNotification>,
    cancel: Option<oneshot::Sender<()>>,
    dropped: Arc<AtomicU64>,
}

impl ChangeStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next matching change, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<ChangeNotification> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChangeNotification> {
        self.rx.try_recv().ok()
    }

    /// Events dropped because this subscriber's queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

struct Delivery {
    id: u64,
    store: Arc<dyn SpatialStore>,
    filter: StreamFilter,
    changes: broadcast::Receiver<ChangeNotification>,
    tx: mpsc::Sender<ChangeNotification>,
    cancel: oneshot::Receiver<()>,
    shutdown: watch::Receiver<bool>,
    heartbeat: Duration,
    dropped: Arc<AtomicU64>,
}

impl Delivery {
    async fn run(mut self) {
        if *self.shutdown.borrow() {
            return;
        }
        loop {
            tokio::select! {
                _ = &mut self.cancel => break,
                _ = self.shutdown.changed() => break,
                received = tokio::time::timeout(self.heartbeat, self.changes.recv()) => match received {
                    Ok(Ok(note)) => {
                        if self.filter.matches(&note.position) && !self.forward(note) {
                            break;
                        }
                    }
                    Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                        self.dropped.fetch_add(skipped, Ordering::Relaxed);
                        warn!("Subscription {} lagged, {} changes skipped", self.id, skipped);
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) => {
                        warn!("Change channel closed under subscription {}", self.id);
                        break;
                    }
                    Err(_) => match self.store.ping().await {
                        Ok(()) => debug!("Subscription {} heartbeat ok", self.id),
                        Err(e) => warn!("Subscription {} heartbeat failed: {}", self.id, e),
                    },
                },
            }
        }
        debug!("Subscription {} ended", self.id);
    }

    /// Returns false once the subscriber is gone.
    fn forward(&self, note: ChangeNotification) -> bool {
        match self.tx.try_send(note) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(note)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::inc_stream_drops();
                warn!("Subscription {} queue full, dropped change for {}", self.id, note.entity_id);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

pub struct StreamHub {
    store: Arc<dyn SpatialStore>,
    config: StreamConfig,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl StreamHub {
    pub fn new(store: Arc<dyn SpatialStore>, config: StreamConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            config,
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Registers a filter and starts its delivery task. Must be called inside a Tokio runtime.
    pub fn subscribe(&self, filter: StreamFilter) -> StoreResult<ChangeStream> {
        filter.validate()?;
        if *self.shutdown.borrow() {
            return Err(StoreError::Capability("change stream hub is shut down".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let dropped = Arc::new(AtomicU64::new(0));

        let delivery = Delivery {
            id,
            store: Arc::clone(&self.store),
            filter,
            changes: self.store.subscribe_changes(),
            tx,
            cancel: cancel_rx,
            shutdown: self.shutdown.subscribe(),
            heartbeat: self.config.heartbeat,
            dropped: Arc::clone(&dropped),
        };
        let handle = tokio::spawn(delivery.run());

        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.retain(|_, h| !h.is_finished());
        tasks.insert(id, handle);
        debug!("Subscription {} registered ({:?})", id, filter);

        Ok(ChangeStream {
            id,
            rx,
            cancel: Some(cancel_tx),
            dropped,
        })
    }

    pub fn active_subscriptions(&self) -> usize {
        let tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.values().filter(|h| !h.is_finished()).count()
    }

    /// Stops every delivery task and waits for them.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            tasks.drain().map(|(_, h)| h).collect()
        };
        let count = handles.len();
        for result in futures_util::future::join_all(handles).await {
            if let Err(e) = result {
                warn!("Delivery task ended abnormally: {}", e);
            }
        }
        if count > 0 {
            info!("Change stream hub stopped {} subscriptions", count);
        }
    }
}
