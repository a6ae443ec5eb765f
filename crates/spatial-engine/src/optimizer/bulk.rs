//! Batched point queries and chunked position writes
use crate::error::StoreResult;
use crate::store::SpatialStore;
use crate::types::{Point3D, SpatialPosition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Outcome of a chunked write. Batches before `failed_batch` are committed; later ones were not attempted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkWriteReport {
    pub submitted: usize,
    pub committed_batches: usize,
    pub committed_positions: usize,
    pub changed_rows: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_batch: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The failure was connectivity or capability class rather than bad data.
    #[serde(default)]
    pub availability_failure: bool,
}

impl BulkWriteReport {
    pub fn is_complete(&self) -> bool {
        self.failed_batch.is_none() && self.committed_positions == self.submitted
    }

    /// Positions from the failed batch onward, none of which were committed.
    pub fn uncommitted<'a>(&self, updates: &'a [SpatialPosition]) -> &'a [SpatialPosition] {
        &updates[self.committed_positions.min(updates.len())..]
    }
}

pub struct BulkOperator {
    store: Arc<dyn SpatialStore>,
    batch_size: usize,
}

impl BulkOperator {
    pub fn new(store: Arc<dyn SpatialStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Center index to matching entity ids, one store round trip for all centers.
    pub async fn find_near(&self, centers: &[Point3D], radius: f64) -> StoreResult<HashMap<usize, Vec<String>>> {
        let mut found = self.store.bulk_find_near(centers, radius).await?;
        for i in 0..centers.len() {
            found.entry(i).or_default();
        }
        Ok(found)
    }

    /// Writes `updates` in order, one transaction per batch, stopping at the first failed batch.
    pub async fn write(&self, updates: &[SpatialPosition]) -> BulkWriteReport {
        let mut report = BulkWriteReport {
            submitted: updates.len(),
            ..BulkWriteReport::default()
        };
        for (n, batch) in updates.chunks(self.batch_size).enumerate() {
            match self.store.apply_positions(batch).await {
                Ok(changed) => {
                    report.committed_batches += 1;
                    report.committed_positions += batch.len();
                    report.changed_rows += changed;
                    debug!("Bulk batch {} committed ({} positions, {} changed)", n, batch.len(), changed);
                }
                Err(e) => {
                    warn!("Bulk batch {} failed after {} committed batches: {}", n, report.committed_batches, e);
                    report.failed_batch = Some(n);
                    report.error = Some(e.to_string());
                    report.availability_failure = e.is_availability_failure();
                    break;
                }
            }
        }
        report
    }
}
