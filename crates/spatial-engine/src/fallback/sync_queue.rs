//! FIFO of position writes the primary has not seen yet
use crate::metrics;
use crate::types::{now_micros, SpatialPosition, SyncQueueEntry};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct QueueState {
    entries: VecDeque<SyncQueueEntry>,
    next_sequence: u64,
}

#[derive(Default)]
pub struct SyncQueue {
    state: Mutex<QueueState>,
}

/// Exclusive access to the queue. Never held across an await.
pub struct SyncQueueGuard<'a> {
    state: MutexGuard<'a, QueueState>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> SyncQueueGuard<'_> {
        SyncQueueGuard {
            state: self.state.lock().unwrap_or_else(|p| p.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the pending entries in replay order.
    pub fn snapshot(&self) -> Vec<SyncQueueEntry> {
        self.lock().state.entries.iter().cloned().collect()
    }
}

impl SyncQueueGuard<'_> {
    pub fn push(&mut self, position: SpatialPosition) -> u64 {
        let sequence = self.state.next_sequence;
        self.state.next_sequence += 1;
        self.state.entries.push_back(SyncQueueEntry {
            sequence,
            position,
            enqueued_at: now_micros(),
        });
        metrics::set_sync_queue_depth(self.state.entries.len());
        sequence
    }

    pub fn pop_front(&mut self) -> Option<SyncQueueEntry> {
        let entry = self.state.entries.pop_front();
        metrics::set_sync_queue_depth(self.state.entries.len());
        entry
    }

    /// Returns a failed replay to the head so order is preserved.
    pub fn push_front(&mut self, entry: SyncQueueEntry) {
        self.state.entries.push_front(entry);
        metrics::set_sync_queue_depth(self.state.entries.len());
    }

    pub fn len(&self) -> usize {
        self.state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConfidenceLevel, Point3D};

    fn pos(id: &str) -> SpatialPosition {
        SpatialPosition::new(id, Point3D::default(), ConfidenceLevel::Low, "test")
    }

    #[test]
    fn test_fifo_with_requeue_at_head() {
        let queue = SyncQueue::new();
        {
            let mut q = queue.lock();
            assert_eq!(q.push(pos("a")), 0);
            assert_eq!(q.push(pos("b")), 1);
            assert_eq!(q.push(pos("c")), 2);
        }
        let first = queue.lock().pop_front().unwrap();
        assert_eq!(first.position.entity_id, "a");
        queue.lock().push_front(first);

        let order: Vec<_> = queue.snapshot().into_iter().map(|e| e.sequence).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_sequences_keep_increasing_after_drain() {
        let queue = SyncQueue::new();
        queue.lock().push(pos("a"));
        assert!(queue.lock().pop_front().is_some());
        assert!(queue.is_empty());
        assert_eq!(queue.lock().push(pos("b")), 1);
    }
}
