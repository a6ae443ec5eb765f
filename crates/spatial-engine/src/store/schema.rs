//! Table definitions, row mapping and the scalar functions registered on every connection
use crate::types::{ConfidenceLevel, EntityResult, Point3D, SpatialPosition};
use chrono::{DateTime, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, Row};

/// Tables shared by both stores. Timestamps are stored as microseconds since the epoch.
pub const BASE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS positions (
    entity_id   TEXT PRIMARY KEY,
    x           REAL NOT NULL,
    y           REAL NOT NULL,
    z           REAL NOT NULL,
    confidence  INTEGER NOT NULL,
    source      TEXT NOT NULL,
    updated_at  INTEGER NOT NULL,
    building_id TEXT,
    floor       INTEGER
);

CREATE TABLE IF NOT EXISTS confidence_records (
    entity_id            TEXT PRIMARY KEY,
    position_confidence  INTEGER NOT NULL DEFAULT 0,
    position_source      TEXT NOT NULL DEFAULT '',
    position_updated     INTEGER,
    semantic_confidence  INTEGER NOT NULL DEFAULT 0,
    semantic_source      TEXT NOT NULL DEFAULT '',
    semantic_updated     INTEGER,
    last_verified        INTEGER,
    verification_count   INTEGER NOT NULL DEFAULT 0,
    verification_history TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_positions_building ON positions (building_id);
";

/// Multi-resolution grid columns and the R*Tree over point extents, primary only.
pub const SPATIAL_SCHEMA: &str = "
ALTER TABLE positions ADD COLUMN gx_fine INTEGER;
ALTER TABLE positions ADD COLUMN gy_fine INTEGER;
ALTER TABLE positions ADD COLUMN gz_fine INTEGER;
ALTER TABLE positions ADD COLUMN gx_medium INTEGER;
ALTER TABLE positions ADD COLUMN gy_medium INTEGER;
ALTER TABLE positions ADD COLUMN gz_medium INTEGER;
ALTER TABLE positions ADD COLUMN gx_coarse INTEGER;
ALTER TABLE positions ADD COLUMN gy_coarse INTEGER;
ALTER TABLE positions ADD COLUMN gz_coarse INTEGER;

CREATE VIRTUAL TABLE IF NOT EXISTS positions_rtree USING rtree(
    id, min_x, max_x, min_y, max_y, min_z, max_z
);
";

pub const SECONDARY_MIGRATIONS: &[(i32, &str)] = &[(1, BASE_SCHEMA)];

pub const PRIMARY_MIGRATIONS: &[(i32, &str)] = &[(1, BASE_SCHEMA), (2, SPATIAL_SCHEMA)];

/// Column list matching [`row_to_position`] and [`row_to_entity`].
pub const POSITION_COLUMNS: &str = "entity_id, x, y, z, confidence, source, updated_at";

pub const RTREE_TABLE: &str = "positions_rtree";

pub fn to_micros(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

pub fn row_to_position(row: &Row<'_>) -> rusqlite::Result<SpatialPosition> {
    Ok(SpatialPosition {
        entity_id: row.get(0)?,
        position: Point3D::new(row.get(1)?, row.get(2)?, row.get(3)?),
        confidence: ConfidenceLevel::from_i64(row.get(4)?),
        source: row.get(5)?,
        updated_at: from_micros(row.get(6)?),
    })
}

/// Maps [`POSITION_COLUMNS`] plus an optional trailing distance column.
pub fn row_to_entity(row: &Row<'_>, with_distance: bool) -> rusqlite::Result<EntityResult> {
    let position = row_to_position(row)?;
    let distance = if with_distance { Some(row.get(7)?) } else { None };
    Ok(EntityResult {
        entity_id: position.entity_id,
        position: position.position,
        confidence: position.confidence,
        source: position.source,
        updated_at: position.updated_at,
        distance,
    })
}

fn segment_distance(p: [f64; 3], a: [f64; 3], b: [f64; 3]) -> f64 {
    let ab = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
    let ap = [p[0] - a[0], p[1] - a[1], p[2] - a[2]];
    let len2 = ab[0] * ab[0] + ab[1] * ab[1] + ab[2] * ab[2];
    let t = if len2 == 0.0 {
        0.0
    } else {
        ((ap[0] * ab[0] + ap[1] * ab[1] + ap[2] * ab[2]) / len2).clamp(0.0, 1.0)
    };
    let closest = Point3D::new(a[0] + t * ab[0], a[1] + t * ab[1], a[2] + t * ab[2]);
    closest.distance_to(&Point3D::new(p[0], p[1], p[2]))
}

/// Registers `dist3d`, `dist_to_segment` and `grid_cell`.
pub fn register_spatial_functions(conn: &Connection) -> rusqlite::Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    conn.create_scalar_function("dist3d", 6, flags, |ctx| {
        let a = Point3D::new(ctx.get(0)?, ctx.get(1)?, ctx.get(2)?);
        let b = Point3D::new(ctx.get(3)?, ctx.get(4)?, ctx.get(5)?);
        Ok(a.distance_to(&b))
    })?;

    conn.create_scalar_function("dist_to_segment", 9, flags, |ctx| {
        let mut v = [0.0f64; 9];
        for (i, slot) in v.iter_mut().enumerate() {
            *slot = ctx.get(i)?;
        }
        Ok(segment_distance([v[0], v[1], v[2]], [v[3], v[4], v[5]], [v[6], v[7], v[8]]))
    })?;

    conn.create_scalar_function("grid_cell", 2, flags, |ctx| {
        let value: f64 = ctx.get(0)?;
        let size: f64 = ctx.get(1)?;
        if size <= 0.0 {
            return Err(rusqlite::Error::UserFunctionError("grid_cell size must be positive".into()));
        }
        Ok((value / size).floor() as i64)
    })?;

    Ok(())
}
