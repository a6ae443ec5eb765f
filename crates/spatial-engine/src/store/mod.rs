//! Store contracts and the SQLite-backed primary and secondary implementations
pub mod migration;
pub mod records;
pub mod rtree_store;
pub mod schema;
pub mod sqlite_store;
#[cfg(test)]
pub(crate) mod testing;

pub use migration::MigrationManager;
pub use rtree_store::RtreeStore;
pub use sqlite_store::SqliteStore;

use crate::error::{StoreError, StoreResult};
use crate::retry::with_deadline;
use crate::types::{
    BoundingBox, ChangeNotification, ConfidenceLevel, ConfidenceRecord, ConfidenceUpdate, EntityDistance,
    EntityResult, Point3D, SpatialCluster, SpatialPosition, VerificationEvent,
};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Store operations every backend supports, spatial predicates included (possibly by scanning).
#[async_trait]
pub trait BasicStore: Send + Sync {
    fn name(&self) -> &str;

    /// Idempotent.
    async fn connect(&self) -> StoreResult<()>;
    async fn close(&self) -> StoreResult<()>;
    async fn ping(&self) -> StoreResult<()>;

    /// Last-write-wins by `updated_at`. Returns whether the stored row changed.
    async fn upsert_position(&self, position: &SpatialPosition) -> StoreResult<bool>;
    async fn get_position(&self, entity_id: &str) -> StoreResult<SpatialPosition>;
    /// Applies all positions in one transaction and returns how many rows changed.
    async fn apply_positions(&self, positions: &[SpatialPosition]) -> StoreResult<usize>;

    async fn upsert_confidence(&self, update: &ConfidenceUpdate) -> StoreResult<()>;
    async fn append_verification(&self, entity_id: &str, event: &VerificationEvent) -> StoreResult<()>;
    async fn get_confidence(&self, entity_id: &str) -> StoreResult<ConfidenceRecord>;

    /// Effective position confidence at or above `min_level`, ordered by entity id.
    async fn find_by_confidence(&self, min_level: ConfidenceLevel) -> StoreResult<Vec<EntityResult>>;
    /// Never verified, or last verified before `verified_before`, ordered by entity id.
    async fn find_needing_verification(&self, verified_before: DateTime<Utc>) -> StoreResult<Vec<EntityResult>>;

    async fn find_near(&self, center: Point3D, radius: f64) -> StoreResult<Vec<EntityResult>>;
    async fn find_in_bbox(&self, bbox: BoundingBox) -> StoreResult<Vec<EntityResult>>;
    async fn find_k_nearest(&self, center: Point3D, k: usize) -> StoreResult<Vec<EntityDistance>>;
    async fn find_along_path(&self, path: &[Point3D], width: f64) -> StoreResult<Vec<EntityResult>>;
    async fn find_clusters(
        &self,
        bbox: BoundingBox,
        resolution: GridResolution,
        min_count: usize,
    ) -> StoreResult<Vec<SpatialCluster>>;
}

/// Capabilities only a spatially indexed store provides.
#[async_trait]
pub trait SpatialStore: BasicStore {
    async fn probe_spatial_support(&self) -> StoreResult<bool>;

    /// Radius search bounded by the precomputed grid of `resolution` before exact distance.
    async fn find_near_indexed(
        &self,
        center: Point3D,
        radius: f64,
        resolution: GridResolution,
    ) -> StoreResult<Vec<EntityResult>>;

    /// One combined statement for all centers. Every center index is present in the result.
    async fn bulk_find_near(&self, centers: &[Point3D], radius: f64) -> StoreResult<HashMap<usize, Vec<String>>>;

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeNotification>;

    async fn index_usage(&self) -> StoreResult<Vec<IndexUsage>>;
    async fn create_index(&self, definition: &IndexDefinition) -> StoreResult<()>;
    async fn reindex(&self, index_name: &str) -> StoreResult<()>;
    async fn refresh_statistics(&self) -> StoreResult<()>;
}

/// Precomputed spatial grouping used to bound radius searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridResolution {
    Fine,
    Medium,
    Coarse,
}

impl GridResolution {
    pub const ALL: [GridResolution; 3] = [GridResolution::Fine, GridResolution::Medium, GridResolution::Coarse];

    /// Small radii use the fine grid, large radii the coarse one.
    pub fn for_radius(radius: f64) -> Self {
        if radius <= 5.0 {
            GridResolution::Fine
        } else if radius <= 50.0 {
            GridResolution::Medium
        } else {
            GridResolution::Coarse
        }
    }

    /// Cell edge length in meters.
    pub fn cell_size(self) -> f64 {
        match self {
            GridResolution::Fine => 1.0,
            GridResolution::Medium => 10.0,
            GridResolution::Coarse => 100.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GridResolution::Fine => "fine",
            GridResolution::Medium => "medium",
            GridResolution::Coarse => "coarse",
        }
    }

    pub fn cell_of(self, value: f64) -> i64 {
        (value / self.cell_size()).floor() as i64
    }

    pub fn cell(self, p: &Point3D) -> (i64, i64, i64) {
        (self.cell_of(p.x), self.cell_of(p.y), self.cell_of(p.z))
    }

    /// `(gx, gy, gz)` column names on the primary's positions table.
    pub fn columns(self) -> (&'static str, &'static str, &'static str) {
        match self {
            GridResolution::Fine => ("gx_fine", "gy_fine", "gz_fine"),
            GridResolution::Medium => ("gx_medium", "gy_medium", "gz_medium"),
            GridResolution::Coarse => ("gx_coarse", "gy_coarse", "gz_coarse"),
        }
    }

    /// Name of the composite grid index over this resolution's columns.
    pub fn index_name(self) -> &'static str {
        match self {
            GridResolution::Fine => "idx_positions_grid_fine",
            GridResolution::Medium => "idx_positions_grid_medium",
            GridResolution::Coarse => "idx_positions_grid_coarse",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Grid,
    Composite,
    Partial,
}

/// A secondary index the index optimizer may create on the primary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
    pub kind: IndexKind,
}

impl IndexDefinition {
    pub fn new(name: impl Into<String>, table: impl Into<String>, columns: &[&str], kind: IndexKind) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            predicate: None,
            kind,
        }
    }

    pub fn partial(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = Some(predicate.into());
        self.kind = IndexKind::Partial;
        self
    }

    /// `CREATE INDEX IF NOT EXISTS` statement. Names must be plain identifiers.
    pub fn to_sql(&self) -> StoreResult<String> {
        check_identifier(&self.name)?;
        check_identifier(&self.table)?;
        if self.columns.is_empty() {
            return Err(StoreError::InvalidArgument(format!("index {} has no columns", self.name)));
        }
        for column in &self.columns {
            check_identifier(column)?;
        }
        let mut sql = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            self.name,
            self.table,
            self.columns.join(", ")
        );
        if let Some(predicate) = &self.predicate {
            sql.push_str(" WHERE ");
            sql.push_str(predicate);
        }
        Ok(sql)
    }
}

/// Usage statistics for one index, as reported by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexUsage {
    pub name: String,
    pub table: String,
    pub scans: u64,
    pub tuples_read: u64,
    pub size_bytes: u64,
}

/// Per-operation deadlines applied to every store call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreTimeouts {
    pub read: Duration,
    pub bulk: Duration,
    pub probe: Duration,
}

impl Default for StoreTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(10),
            bulk: Duration::from_secs(30),
            probe: Duration::from_secs(5),
        }
    }
}

pub(crate) fn check_identifier(name: &str) -> StoreResult<()> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidArgument(format!("not a plain identifier: {:?}", name)))
    }
}

pub(crate) fn check_point(p: &Point3D) -> StoreResult<()> {
    if p.is_finite() {
        Ok(())
    } else {
        Err(StoreError::InvalidArgument(format!("non-finite coordinate in {}", p)))
    }
}

pub(crate) fn check_radius(radius: f64) -> StoreResult<()> {
    if radius.is_finite() && radius >= 0.0 {
        Ok(())
    } else {
        Err(StoreError::InvalidArgument(format!("radius must be finite and >= 0, got {}", radius)))
    }
}

pub(crate) fn check_bbox(bbox: &BoundingBox) -> StoreResult<()> {
    if bbox.is_valid() {
        Ok(())
    } else {
        Err(StoreError::InvalidArgument(format!("invalid bounding box {} .. {}", bbox.min, bbox.max)))
    }
}

pub(crate) fn check_path(path: &[Point3D], width: f64) -> StoreResult<()> {
    if path.is_empty() {
        return Err(StoreError::InvalidArgument("path has no points".into()));
    }
    path.iter().try_for_each(check_point)?;
    check_radius(width)
}

/// Opens a pooled SQLite file with the spatial scalar functions registered on every connection.
pub(crate) fn open_pool(path: &Path, max_size: u32, deadline: Duration) -> StoreResult<Pool<SqliteConnectionManager>> {
    let manager = SqliteConnectionManager::file(path)
        .with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(|conn| {
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            schema::register_spatial_functions(conn)
        });
    Ok(Pool::builder().max_size(max_size).connection_timeout(deadline).build(manager)?)
}

/// Swappable connection pool; empty while disconnected.
pub(crate) struct PoolSlot {
    store: String,
    pool: ArcSwapOption<Pool<SqliteConnectionManager>>,
}

impl PoolSlot {
    pub(crate) fn new(store: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            pool: ArcSwapOption::empty(),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.pool.load().is_some()
    }

    pub(crate) fn install(&self, pool: Pool<SqliteConnectionManager>) {
        self.pool.store(Some(Arc::new(pool)));
    }

    pub(crate) fn clear(&self) -> bool {
        self.pool.swap(None).is_some()
    }

    fn current(&self) -> StoreResult<Arc<Pool<SqliteConnectionManager>>> {
        self.pool.load_full().ok_or_else(|| StoreError::not_connected(&self.store))
    }

    /// Runs `f` on a pooled connection on the blocking pool, bounded by `deadline`.
    pub(crate) async fn run<T, F>(&self, operation: &'static str, deadline: Duration, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.current()?;
        with_deadline(operation, deadline, async move {
            tokio::task::spawn_blocking(move || {
                let mut conn = pool.get()?;
                f(&mut conn)
            })
            .await?
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_thresholds() {
        assert_eq!(GridResolution::for_radius(0.0), GridResolution::Fine);
        assert_eq!(GridResolution::for_radius(5.0), GridResolution::Fine);
        assert_eq!(GridResolution::for_radius(5.01), GridResolution::Medium);
        assert_eq!(GridResolution::for_radius(50.0), GridResolution::Medium);
        assert_eq!(GridResolution::for_radius(200.0), GridResolution::Coarse);
    }

    #[test]
    fn test_negative_coordinates_floor_into_lower_cell() {
        assert_eq!(GridResolution::Medium.cell_of(-0.5), -1);
        assert_eq!(GridResolution::Medium.cell_of(9.99), 0);
        assert_eq!(GridResolution::Coarse.cell(&Point3D::new(150.0, -150.0, 0.0)), (1, -2, 0));
    }

    #[test]
    fn test_index_definition_sql() {
        let def = IndexDefinition::new("idx_positions_high", "positions", &["gx_fine", "gy_fine"], IndexKind::Grid)
            .partial("confidence >= 3");
        assert_eq!(
            def.to_sql().unwrap(),
            "CREATE INDEX IF NOT EXISTS idx_positions_high ON positions (gx_fine, gy_fine) WHERE confidence >= 3"
        );
        assert_eq!(def.kind, IndexKind::Partial);

        let bad = IndexDefinition::new("idx; DROP TABLE positions", "positions", &["x"], IndexKind::Grid);
        assert!(matches!(bad.to_sql(), Err(StoreError::InvalidArgument(_))));
    }

    #[test]
    fn test_argument_checks() {
        assert!(check_radius(0.0).is_ok());
        assert!(check_radius(-1.0).is_err());
        assert!(check_radius(f64::NAN).is_err());
        let p = Point3D::new(1.0, 1.0, 1.0);
        assert!(check_bbox(&BoundingBox::new(p, p)).is_ok());
        assert!(check_bbox(&BoundingBox::new(p, Point3D::new(0.0, 2.0, 2.0))).is_err());
        assert!(check_path(&[], 1.0).is_err());
    }
}
