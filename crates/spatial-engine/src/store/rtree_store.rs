//! Spatially indexed primary store: R*Tree over point extents plus precomputed grid columns
use crate::error::{StoreError, StoreResult};
use crate::store::schema::{PRIMARY_MIGRATIONS, POSITION_COLUMNS, RTREE_TABLE};
use crate::store::{
    check_bbox, check_identifier, check_path, check_point, check_radius, open_pool, records, BasicStore,
    GridResolution, IndexDefinition, IndexUsage, MigrationManager, PoolSlot, SpatialStore, StoreTimeouts,
};
use crate::types::{
    BoundingBox, ChangeNotification, ConfidenceLevel, ConfidenceRecord, ConfidenceUpdate, EntityDistance,
    EntityResult, Point3D, SpatialCluster, SpatialPosition, VerificationEvent, POSITION_EPSILON,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Name usage counters are kept under for clustering queries.
pub const DENSITY_INDEX: &str = "idx_positions_density";

/// Centers per combined bulk statement, kept well under SQLite's bound-parameter limit.
const MAX_CENTERS_PER_STATEMENT: usize = 4096;

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

const UPSERT_SPATIAL: &str = "
    INSERT INTO positions (
        entity_id, x, y, z, confidence, source, updated_at, building_id, floor,
        gx_fine, gy_fine, gz_fine, gx_medium, gy_medium, gz_medium, gx_coarse, gy_coarse, gz_coarse
    )
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
    ON CONFLICT(entity_id) DO UPDATE SET
        x = excluded.x,
        y = excluded.y,
        z = excluded.z,
        confidence = excluded.confidence,
        source = excluded.source,
        updated_at = excluded.updated_at,
        building_id = excluded.building_id,
        floor = excluded.floor,
        gx_fine = excluded.gx_fine,
        gy_fine = excluded.gy_fine,
        gz_fine = excluded.gz_fine,
        gx_medium = excluded.gx_medium,
        gy_medium = excluded.gy_medium,
        gz_medium = excluded.gz_medium,
        gx_coarse = excluded.gx_coarse,
        gy_coarse = excluded.gy_coarse,
        gz_coarse = excluded.gz_coarse
    WHERE excluded.updated_at >= positions.updated_at";

#[derive(Default)]
struct IndexCounter {
    scans: AtomicU64,
    tuples_read: AtomicU64,
}

pub struct RtreeStore {
    path: PathBuf,
    pool_size: u32,
    timeouts: StoreTimeouts,
    slot: PoolSlot,
    changes: broadcast::Sender<ChangeNotification>,
    usage: Arc<DashMap<String, IndexCounter>>,
}

impl RtreeStore {
    pub fn new(path: impl Into<PathBuf>, timeouts: StoreTimeouts) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            path: path.into(),
            pool_size: num_cpus::get().clamp(2, 16) as u32,
            timeouts,
            slot: PoolSlot::new("primary"),
            changes,
            usage: Arc::new(DashMap::new()),
        }
    }

    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    fn record_scan(&self, index: &str, tuples: usize) {
        let counter = self.usage.entry(index.to_string()).or_default();
        counter.scans.fetch_add(1, Ordering::Relaxed);
        counter.tuples_read.fetch_add(tuples as u64, Ordering::Relaxed);
    }

    fn publish(&self, positions: &[SpatialPosition]) {
        for p in positions {
            // no receivers is not an error
            let _ = self.changes.send(ChangeNotification::from(p));
        }
    }

    fn location_reachable(&self) -> bool {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.is_dir(),
            _ => true,
        }
    }

    async fn near_via_rtree(&self, center: Point3D, radius: f64) -> StoreResult<Vec<EntityResult>> {
        let found = self
            .slot
            .run("find_near", self.timeouts.read, move |conn| rtree_near(conn, center, radius))
            .await?;
        self.record_scan(RTREE_TABLE, found.len());
        Ok(found)
    }
}

fn upsert_spatial(conn: &Connection, p: &SpatialPosition) -> StoreResult<bool> {
    let (fx, fy, fz) = GridResolution::Fine.cell(&p.position);
    let (mx, my, mz) = GridResolution::Medium.cell(&p.position);
    let (cx, cy, cz) = GridResolution::Coarse.cell(&p.position);
    let changed = conn.execute(
        UPSERT_SPATIAL,
        params![
            p.entity_id,
            p.position.x,
            p.position.y,
            p.position.z,
            p.confidence.as_i64(),
            p.source,
            crate::store::schema::to_micros(&p.updated_at),
            p.building_id(),
            p.floor(),
            fx,
            fy,
            fz,
            mx,
            my,
            mz,
            cx,
            cy,
            cz,
        ],
    )?;
    if changed == 0 {
        return Ok(false);
    }
    conn.execute(
        "INSERT OR REPLACE INTO positions_rtree (id, min_x, max_x, min_y, max_y, min_z, max_z)
         SELECT rowid, x, x, y, y, z, z FROM positions WHERE entity_id = ?1",
        [&p.entity_id],
    )?;
    Ok(true)
}

fn rtree_window(b: &BoundingBox) -> Vec<Value> {
    // rtree coordinates are 32-bit, so the window is only a candidate filter
    vec![
        Value::Real(b.min.x),
        Value::Real(b.max.x),
        Value::Real(b.min.y),
        Value::Real(b.max.y),
        Value::Real(b.min.z),
        Value::Real(b.max.z),
    ]
}

const RTREE_JOIN: &str = "positions_rtree r JOIN positions p ON p.rowid = r.id
     WHERE r.max_x >= ?1 AND r.min_x <= ?2
       AND r.max_y >= ?3 AND r.min_y <= ?4
       AND r.max_z >= ?5 AND r.min_z <= ?6";

fn query_entities(conn: &Connection, sql: &str, args: Vec<Value>, with_distance: bool) -> StoreResult<Vec<EntityResult>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let mut rows = stmt.query(params_from_iter(args))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(crate::store::schema::row_to_entity(row, with_distance)?);
    }
    Ok(out)
}

fn rtree_near(conn: &Connection, center: Point3D, radius: f64) -> StoreResult<Vec<EntityResult>> {
    let reach = radius + POSITION_EPSILON;
    let mut args = rtree_window(&BoundingBox::around(&center, reach));
    args.extend([center.x, center.y, center.z, reach].map(Value::Real));
    let sql = format!(
        "SELECT {cols}, dist3d(x, y, z, ?7, ?8, ?9) AS d FROM {join} AND d <= ?10 ORDER BY d, entity_id",
        cols = POSITION_COLUMNS,
        join = RTREE_JOIN
    );
    query_entities(conn, &sql, args, true)
}

fn rtree_bbox(conn: &Connection, bbox: BoundingBox) -> StoreResult<Vec<EntityResult>> {
    let b = bbox.expand(POSITION_EPSILON);
    let mut args = rtree_window(&b);
    args.extend(records::bbox_args(&b));
    let sql = format!(
        "SELECT {cols} FROM {join}
           AND p.x BETWEEN ?7 AND ?8 AND p.y BETWEEN ?9 AND ?10 AND p.z BETWEEN ?11 AND ?12
         ORDER BY entity_id",
        cols = POSITION_COLUMNS,
        join = RTREE_JOIN
    );
    query_entities(conn, &sql, args, false)
}

fn count_positions(conn: &Connection) -> StoreResult<usize> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM positions", [], |row| row.get(0))?;
    Ok(n.max(0) as usize)
}

/// Widens the search radius until `k` candidates fall inside it.
fn rtree_k_nearest(conn: &Connection, center: Point3D, k: usize) -> StoreResult<Vec<EntityDistance>> {
    let total = count_positions(conn)?;
    let wanted = k.min(total);
    if wanted == 0 {
        return Ok(Vec::new());
    }
    let mut radius = 8.0;
    while radius <= 1.0e7 {
        let found = rtree_near(conn, center, radius)?;
        if found.len() >= wanted {
            return Ok(found
                .into_iter()
                .take(wanted)
                .map(|e| EntityDistance {
                    distance: e.distance.unwrap_or_default(),
                    entity_id: e.entity_id,
                    position: e.position,
                })
                .collect());
        }
        radius *= 4.0;
    }
    records::scan_k_nearest(conn, center, k)
}

fn grid_near(conn: &Connection, center: Point3D, radius: f64, resolution: GridResolution) -> StoreResult<Vec<EntityResult>> {
    let reach = radius + POSITION_EPSILON;
    let (gx, gy, gz) = resolution.columns();
    let mut args: Vec<Value> = vec![
        Value::Real(center.x),
        Value::Real(center.y),
        Value::Real(center.z),
        Value::Real(reach),
    ];
    for c in [center.x, center.y, center.z] {
        args.push(Value::Integer(resolution.cell_of(c - reach)));
        args.push(Value::Integer(resolution.cell_of(c + reach)));
    }
    let sql = format!(
        "SELECT {cols}, dist3d(x, y, z, ?1, ?2, ?3) AS d FROM positions
         WHERE {gx} BETWEEN ?5 AND ?6 AND {gy} BETWEEN ?7 AND ?8 AND {gz} BETWEEN ?9 AND ?10
           AND d <= ?4
         ORDER BY d, entity_id",
        cols = POSITION_COLUMNS,
        gx = gx,
        gy = gy,
        gz = gz
    );
    query_entities(conn, &sql, args, true)
}

fn bulk_near(conn: &Connection, centers: &[Point3D], radius: f64) -> StoreResult<HashMap<usize, Vec<String>>> {
    let reach = radius + POSITION_EPSILON;
    let mut out: HashMap<usize, Vec<String>> = (0..centers.len()).map(|i| (i, Vec::new())).collect();

    for (chunk_no, chunk) in centers.chunks(MAX_CENTERS_PER_STATEMENT).enumerate() {
        let offset = chunk_no * MAX_CENTERS_PER_STATEMENT;
        let mut args: Vec<Value> = vec![Value::Real(reach)];
        let mut rows = Vec::with_capacity(chunk.len());
        for (i, c) in chunk.iter().enumerate() {
            let n = args.len() + 1;
            rows.push(format!("(?{}, ?{}, ?{}, ?{})", n, n + 1, n + 2, n + 3));
            args.push(Value::Integer((offset + i) as i64));
            args.extend([c.x, c.y, c.z].map(Value::Real));
        }
        let sql = format!(
            "WITH centers(idx, cx, cy, cz) AS (VALUES {rows})
             SELECT c.idx, p.entity_id
             FROM centers c
             JOIN positions_rtree r
               ON r.max_x >= c.cx - ?1 AND r.min_x <= c.cx + ?1
              AND r.max_y >= c.cy - ?1 AND r.min_y <= c.cy + ?1
              AND r.max_z >= c.cz - ?1 AND r.min_z <= c.cz + ?1
             JOIN positions p ON p.rowid = r.id
             WHERE dist3d(p.x, p.y, p.z, c.cx, c.cy, c.cz) <= ?1
             ORDER BY c.idx, dist3d(p.x, p.y, p.z, c.cx, c.cy, c.cz), p.entity_id",
            rows = rows.join(", ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut result = stmt.query(params_from_iter(args))?;
        while let Some(row) = result.next()? {
            let idx: i64 = row.get(0)?;
            out.entry(idx as usize).or_default().push(row.get(1)?);
        }
    }
    Ok(out)
}

fn index_sizes(conn: &Connection, name: &str) -> u64 {
    let pattern = if name == RTREE_TABLE {
        format!("{}_%", RTREE_TABLE)
    } else {
        name.to_string()
    };
    conn.query_row(
        "SELECT COALESCE(SUM(pgsize), 0) FROM dbstat WHERE name LIKE ?1",
        [&pattern],
        |row| row.get::<_, i64>(0),
    )
    .map(|v| v.max(0) as u64)
    .unwrap_or_else(|e| {
        debug!("dbstat unavailable for {}: {}", name, e);
        0
    })
}

#[async_trait]
impl BasicStore for RtreeStore {
    fn name(&self) -> &str {
        "primary"
    }

    async fn connect(&self) -> StoreResult<()> {
        if self.slot.is_connected() {
            return Ok(());
        }
        if !self.location_reachable() {
            return Err(StoreError::Connectivity(format!(
                "unable to open primary store at {}: directory does not exist",
                self.path.display()
            )));
        }
        let path = self.path.clone();
        let pool_size = self.pool_size;
        let deadline = self.timeouts.probe;
        let pool = tokio::task::spawn_blocking(move || {
            let pool = open_pool(&path, pool_size, deadline)?;
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn, "primary").migrate(PRIMARY_MIGRATIONS)?;
            drop(conn);
            Ok::<_, StoreError>(pool)
        })
        .await??;
        self.slot.install(pool);
        info!("Primary store connected at {}", self.path.display());
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        if self.slot.clear() {
            info!("Primary store closed");
        }
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        if !self.path.exists() {
            if self.slot.clear() {
                warn!("Primary database file {} disappeared", self.path.display());
            }
            return Err(StoreError::Connectivity(format!("unable to open {}", self.path.display())));
        }
        self.slot
            .run("ping", self.timeouts.probe, |conn| {
                conn.query_row("SELECT 1", [], |_| Ok(()))?;
                Ok(())
            })
            .await
    }

    async fn upsert_position(&self, position: &SpatialPosition) -> StoreResult<bool> {
        check_point(&position.position)?;
        let p = position.clone();
        let changed = self
            .slot
            .run("upsert_position", self.timeouts.read, move |conn| {
                let tx = conn.transaction()?;
                let changed = upsert_spatial(&tx, &p)?;
                tx.commit()?;
                Ok(changed)
            })
            .await?;
        if changed {
            self.publish(std::slice::from_ref(position));
        }
        Ok(changed)
    }

    async fn get_position(&self, entity_id: &str) -> StoreResult<SpatialPosition> {
        let id = entity_id.to_string();
        self.slot
            .run("get_position", self.timeouts.read, move |conn| records::get_position(conn, &id))
            .await
    }

    async fn apply_positions(&self, positions: &[SpatialPosition]) -> StoreResult<usize> {
        positions.iter().try_for_each(|p| check_point(&p.position))?;
        let batch = positions.to_vec();
        let applied = self
            .slot
            .run("apply_positions", self.timeouts.bulk, move |conn| {
                let tx = conn.transaction()?;
                let mut applied = Vec::new();
                for p in batch {
                    if upsert_spatial(&tx, &p)? {
                        applied.push(p);
                    }
                }
                tx.commit()?;
                Ok(applied)
            })
            .await?;
        self.publish(&applied);
        Ok(applied.len())
    }

    async fn upsert_confidence(&self, update: &ConfidenceUpdate) -> StoreResult<()> {
        let update = update.clone();
        self.slot
            .run("upsert_confidence", self.timeouts.read, move |conn| records::upsert_confidence(conn, &update))
            .await
    }

    async fn append_verification(&self, entity_id: &str, event: &VerificationEvent) -> StoreResult<()> {
        let id = entity_id.to_string();
        let event = event.clone();
        self.slot
            .run("append_verification", self.timeouts.read, move |conn| {
                records::append_verification(conn, &id, &event)
            })
            .await
    }

    async fn get_confidence(&self, entity_id: &str) -> StoreResult<ConfidenceRecord> {
        let id = entity_id.to_string();
        self.slot
            .run("get_confidence", self.timeouts.read, move |conn| records::get_confidence(conn, &id))
            .await
    }

    async fn find_by_confidence(&self, min_level: ConfidenceLevel) -> StoreResult<Vec<EntityResult>> {
        self.slot
            .run("find_by_confidence", self.timeouts.read, move |conn| {
                records::scan_by_confidence(conn, min_level)
            })
            .await
    }

    async fn find_needing_verification(&self, verified_before: DateTime<Utc>) -> StoreResult<Vec<EntityResult>> {
        self.slot
            .run("find_needing_verification", self.timeouts.read, move |conn| {
                records::scan_needing_verification(conn, verified_before)
            })
            .await
    }

    async fn find_near(&self, center: Point3D, radius: f64) -> StoreResult<Vec<EntityResult>> {
        check_point(&center)?;
        check_radius(radius)?;
        self.near_via_rtree(center, radius).await
    }

    async fn find_in_bbox(&self, bbox: BoundingBox) -> StoreResult<Vec<EntityResult>> {
        check_bbox(&bbox)?;
        let found = self
            .slot
            .run("find_in_bbox", self.timeouts.read, move |conn| rtree_bbox(conn, bbox))
            .await?;
        self.record_scan(RTREE_TABLE, found.len());
        Ok(found)
    }

    async fn find_k_nearest(&self, center: Point3D, k: usize) -> StoreResult<Vec<EntityDistance>> {
        check_point(&center)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let found = self
            .slot
            .run("find_k_nearest", self.timeouts.read, move |conn| rtree_k_nearest(conn, center, k))
            .await?;
        self.record_scan(RTREE_TABLE, found.len());
        Ok(found)
    }

    async fn find_along_path(&self, path: &[Point3D], width: f64) -> StoreResult<Vec<EntityResult>> {
        check_path(path, width)?;
        let path = path.to_vec();
        let found = self
            .slot
            .run("find_along_path", self.timeouts.read, move |conn| {
                let window = BoundingBox::enclosing(&path)
                    .map(|b| b.expand(width + POSITION_EPSILON))
                    .ok_or_else(|| StoreError::InvalidArgument("path has no points".into()))?;
                let mut args = rtree_window(&window);
                let expr = records::path_distance_expr(&path, args.len() + 1, &mut args);
                let width_param = args.len() + 1;
                args.push(Value::Real(width + POSITION_EPSILON));
                let sql = format!(
                    "SELECT {cols}, {expr} AS d FROM {join} AND d <= ?{w} ORDER BY d, entity_id",
                    cols = POSITION_COLUMNS,
                    expr = expr,
                    join = RTREE_JOIN,
                    w = width_param
                );
                query_entities(conn, &sql, args, true)
            })
            .await?;
        self.record_scan(RTREE_TABLE, found.len());
        Ok(found)
    }

    async fn find_clusters(
        &self,
        bbox: BoundingBox,
        resolution: GridResolution,
        min_count: usize,
    ) -> StoreResult<Vec<SpatialCluster>> {
        check_bbox(&bbox)?;
        let clusters = self
            .slot
            .run("find_clusters", self.timeouts.read, move |conn| {
                let b = bbox.expand(POSITION_EPSILON);
                let (gx, gy, gz) = resolution.columns();
                let mut args = records::bbox_args(&b);
                args.push(Value::Integer(min_count.max(1) as i64));
                let sql = format!(
                    "SELECT COUNT(*), AVG(x), AVG(y), AVG(z), group_concat(entity_id, char(31))
                     FROM positions
                     WHERE x BETWEEN ?1 AND ?2 AND y BETWEEN ?3 AND ?4 AND z BETWEEN ?5 AND ?6
                     GROUP BY {gx}, {gy}, {gz}
                     HAVING COUNT(*) >= ?7
                     ORDER BY COUNT(*) DESC, {gx}, {gy}, {gz}",
                    gx = gx,
                    gy = gy,
                    gz = gz
                );
                records::collect_clusters(conn, &sql, args)
            })
            .await?;
        self.record_scan(DENSITY_INDEX, clusters.iter().map(|c| c.count).sum());
        Ok(clusters)
    }
}

#[async_trait]
impl SpatialStore for RtreeStore {
    async fn probe_spatial_support(&self) -> StoreResult<bool> {
        self.slot
            .run("probe_spatial_support", self.timeouts.probe, |conn| {
                match conn.execute_batch(
                    "CREATE VIRTUAL TABLE temp.spatial_probe USING rtree(id, min_x, max_x);
                     DROP TABLE temp.spatial_probe;",
                ) {
                    Ok(()) => Ok(true),
                    Err(e) if e.to_string().contains("no such module") => Ok(false),
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    async fn find_near_indexed(
        &self,
        center: Point3D,
        radius: f64,
        resolution: GridResolution,
    ) -> StoreResult<Vec<EntityResult>> {
        check_point(&center)?;
        check_radius(radius)?;
        let found = self
            .slot
            .run("find_near_indexed", self.timeouts.read, move |conn| {
                grid_near(conn, center, radius, resolution)
            })
            .await?;
        self.record_scan(resolution.index_name(), found.len());
        Ok(found)
    }

    async fn bulk_find_near(&self, centers: &[Point3D], radius: f64) -> StoreResult<HashMap<usize, Vec<String>>> {
        centers.iter().try_for_each(check_point)?;
        check_radius(radius)?;
        if centers.is_empty() {
            return Ok(HashMap::new());
        }
        let centers = centers.to_vec();
        let found = self
            .slot
            .run("bulk_find_near", self.timeouts.bulk, move |conn| bulk_near(conn, &centers, radius))
            .await?;
        self.record_scan(RTREE_TABLE, found.values().map(Vec::len).sum());
        Ok(found)
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeNotification> {
        self.changes.subscribe()
    }

    async fn index_usage(&self) -> StoreResult<Vec<IndexUsage>> {
        let usage = Arc::clone(&self.usage);
        self.slot
            .run("index_usage", self.timeouts.read, move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT name, tbl_name FROM sqlite_master
                     WHERE (type = 'index' AND name NOT LIKE 'sqlite_autoindex%') OR name = ?1
                     ORDER BY name",
                )?;
                let names = stmt
                    .query_map([RTREE_TABLE], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(names
                    .into_iter()
                    .map(|(name, table)| {
                        let (scans, tuples_read) = usage
                            .get(&name)
                            .map(|c| (c.scans.load(Ordering::Relaxed), c.tuples_read.load(Ordering::Relaxed)))
                            .unwrap_or((0, 0));
                        let size_bytes = index_sizes(conn, &name);
                        IndexUsage {
                            // the rtree reports its own name as the table
                            table: if name == RTREE_TABLE { "positions".to_string() } else { table },
                            name,
                            scans,
                            tuples_read,
                            size_bytes,
                        }
                    })
                    .collect())
            })
            .await
    }

    async fn create_index(&self, definition: &IndexDefinition) -> StoreResult<()> {
        let sql = definition.to_sql()?;
        let name = definition.name.clone();
        self.slot
            .run("create_index", self.timeouts.bulk, move |conn| {
                conn.execute_batch(&sql)?;
                Ok(())
            })
            .await?;
        debug!("Index {} ensured", name);
        Ok(())
    }

    async fn reindex(&self, index_name: &str) -> StoreResult<()> {
        check_identifier(index_name)?;
        let sql = format!("REINDEX {}", index_name);
        self.slot
            .run("reindex", self.timeouts.bulk, move |conn| {
                conn.execute_batch(&sql)?;
                Ok(())
            })
            .await
    }

    async fn refresh_statistics(&self) -> StoreResult<()> {
        self.slot
            .run("refresh_statistics", self.timeouts.bulk, |conn| {
                conn.execute_batch("ANALYZE")?;
                Ok(())
            })
            .await
    }
}
