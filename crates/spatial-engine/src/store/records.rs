//! Connection-level statements shared by both stores
use crate::error::{StoreError, StoreResult};
use crate::store::schema::{from_micros, row_to_entity, row_to_position, to_micros, POSITION_COLUMNS};
use crate::store::GridResolution;
use crate::types::{
    BoundingBox, ConfidenceAspect, ConfidenceLevel, ConfidenceRecord, ConfidenceUpdate, EntityDistance, EntityResult,
    Point3D, SpatialCluster, SpatialPosition, VerificationEvent, POSITION_EPSILON,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

const UPSERT_POSITION: &str = "
    INSERT INTO positions (entity_id, x, y, z, confidence, source, updated_at, building_id, floor)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
    ON CONFLICT(entity_id) DO UPDATE SET
        x = excluded.x,
        y = excluded.y,
        z = excluded.z,
        confidence = excluded.confidence,
        source = excluded.source,
        updated_at = excluded.updated_at,
        building_id = excluded.building_id,
        floor = excluded.floor
    WHERE excluded.updated_at >= positions.updated_at";

/// Last-write-wins upsert on the plain positions table.
pub fn upsert_position(conn: &Connection, p: &SpatialPosition) -> StoreResult<bool> {
    let changed = conn.execute(
        UPSERT_POSITION,
        params![
            p.entity_id,
            p.position.x,
            p.position.y,
            p.position.z,
            p.confidence.as_i64(),
            p.source,
            to_micros(&p.updated_at),
            p.building_id(),
            p.floor(),
        ],
    )?;
    Ok(changed > 0)
}

pub fn get_position(conn: &Connection, entity_id: &str) -> StoreResult<SpatialPosition> {
    conn.query_row(
        &format!("SELECT {} FROM positions WHERE entity_id = ?1", POSITION_COLUMNS),
        [entity_id],
        row_to_position,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("position for {}", entity_id)))
}

const UPSERT_POSITION_CONFIDENCE: &str = "
    INSERT INTO confidence_records (entity_id, position_confidence, position_source, position_updated)
    VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT(entity_id) DO UPDATE SET
        position_confidence = excluded.position_confidence,
        position_source = excluded.position_source,
        position_updated = excluded.position_updated
    WHERE confidence_records.position_updated IS NULL
       OR excluded.position_updated >= confidence_records.position_updated";

const UPSERT_SEMANTIC_CONFIDENCE: &str = "
    INSERT INTO confidence_records (entity_id, semantic_confidence, semantic_source, semantic_updated)
    VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT(entity_id) DO UPDATE SET
        semantic_confidence = excluded.semantic_confidence,
        semantic_source = excluded.semantic_source,
        semantic_updated = excluded.semantic_updated
    WHERE confidence_records.semantic_updated IS NULL
       OR excluded.semantic_updated >= confidence_records.semantic_updated";

pub fn upsert_confidence(conn: &Connection, update: &ConfidenceUpdate) -> StoreResult<()> {
    let sql = match update.aspect {
        ConfidenceAspect::Position => UPSERT_POSITION_CONFIDENCE,
        ConfidenceAspect::Semantic => UPSERT_SEMANTIC_CONFIDENCE,
    };
    conn.execute(
        sql,
        params![
            update.entity_id,
            update.level.as_i64(),
            update.source,
            to_micros(&update.updated_at),
        ],
    )?;
    Ok(())
}

/// Appends to the verification history and raises the verified aspect to the event's level.
pub fn append_verification(conn: &mut Connection, entity_id: &str, event: &VerificationEvent) -> StoreResult<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO confidence_records (entity_id) VALUES (?1) ON CONFLICT(entity_id) DO NOTHING",
        [entity_id],
    )?;
    let history: String = tx.query_row(
        "SELECT verification_history FROM confidence_records WHERE entity_id = ?1",
        [entity_id],
        |row| row.get(0),
    )?;
    let mut events: Vec<VerificationEvent> = serde_json::from_str(&history)?;
    events.push(event.clone());

    tx.execute(
        "UPDATE confidence_records SET
            verification_history = ?2,
            verification_count = verification_count + 1,
            last_verified = MAX(COALESCE(last_verified, 0), ?3)
         WHERE entity_id = ?1",
        params![entity_id, serde_json::to_string(&events)?, to_micros(&event.verified_at)],
    )?;
    upsert_confidence(
        &tx,
        &ConfidenceUpdate {
            entity_id: entity_id.to_string(),
            aspect: event.aspect,
            level: event.level,
            source: event.verified_by.clone(),
            updated_at: event.verified_at,
        },
    )?;
    tx.commit()?;
    Ok(())
}

pub fn get_confidence(conn: &Connection, entity_id: &str) -> StoreResult<ConfidenceRecord> {
    let row = conn
        .query_row(
            "SELECT position_confidence, position_source, position_updated,
                    semantic_confidence, semantic_source, semantic_updated,
                    last_verified, verification_count, verification_history
             FROM confidence_records WHERE entity_id = ?1",
            [entity_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, String>(8)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("confidence record for {}", entity_id)))?;

    Ok(ConfidenceRecord {
        entity_id: entity_id.to_string(),
        position_confidence: ConfidenceLevel::from_i64(row.0),
        position_source: row.1,
        position_updated: row.2.map(from_micros),
        semantic_confidence: ConfidenceLevel::from_i64(row.3),
        semantic_source: row.4,
        semantic_updated: row.5.map(from_micros),
        last_verified: row.6.filter(|v| *v > 0).map(from_micros),
        verification_count: row.7.max(0) as u32,
        verification_history: serde_json::from_str(&row.8)?,
    })
}

fn collect_entities(
    conn: &Connection,
    sql: &str,
    args: Vec<Value>,
    with_distance: bool,
) -> StoreResult<Vec<EntityResult>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let mut rows = stmt.query(params_from_iter(args))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_entity(row, with_distance)?);
    }
    Ok(out)
}

/// Effective position confidence at or above `min_level`: the confidence record once it
/// holds a position update, the position row otherwise.
pub fn scan_by_confidence(conn: &Connection, min_level: ConfidenceLevel) -> StoreResult<Vec<EntityResult>> {
    let sql = format!(
        "SELECT {cols} FROM positions
         WHERE COALESCE(
                 (SELECT cr.position_confidence FROM confidence_records cr
                  WHERE cr.entity_id = positions.entity_id AND cr.position_updated IS NOT NULL),
                 confidence) >= ?1
         ORDER BY entity_id",
        cols = POSITION_COLUMNS
    );
    collect_entities(conn, &sql, vec![Value::Integer(min_level.as_i64())], false)
}

/// Positions never field-verified, or last verified before `verified_before`.
pub fn scan_needing_verification(conn: &Connection, verified_before: DateTime<Utc>) -> StoreResult<Vec<EntityResult>> {
    let sql = format!(
        "SELECT {cols} FROM positions
         WHERE COALESCE(
                 (SELECT cr.last_verified FROM confidence_records cr WHERE cr.entity_id = positions.entity_id),
                 0) < ?1
         ORDER BY entity_id",
        cols = POSITION_COLUMNS
    );
    collect_entities(conn, &sql, vec![Value::Integer(to_micros(&verified_before))], false)
}

/// Full-scan radius search ordered by distance.
pub fn scan_near(conn: &Connection, center: Point3D, radius: f64) -> StoreResult<Vec<EntityResult>> {
    let sql = format!(
        "SELECT {cols}, dist3d(x, y, z, ?1, ?2, ?3) AS d FROM positions
         WHERE d <= ?4
         ORDER BY d, entity_id",
        cols = POSITION_COLUMNS
    );
    collect_entities(
        conn,
        &sql,
        vec![
            Value::Real(center.x),
            Value::Real(center.y),
            Value::Real(center.z),
            Value::Real(radius + POSITION_EPSILON),
        ],
        true,
    )
}

/// Full-scan containment search, inclusive on every face.
pub fn scan_bbox(conn: &Connection, bbox: BoundingBox) -> StoreResult<Vec<EntityResult>> {
    let b = bbox.expand(POSITION_EPSILON);
    let sql = format!(
        "SELECT {cols} FROM positions
         WHERE x BETWEEN ?1 AND ?2 AND y BETWEEN ?3 AND ?4 AND z BETWEEN ?5 AND ?6
         ORDER BY entity_id",
        cols = POSITION_COLUMNS
    );
    collect_entities(conn, &sql, bbox_args(&b), false)
}

pub fn scan_k_nearest(conn: &Connection, center: Point3D, k: usize) -> StoreResult<Vec<EntityDistance>> {
    let mut stmt = conn.prepare_cached(
        "SELECT entity_id, x, y, z, dist3d(x, y, z, ?1, ?2, ?3) AS d FROM positions
         ORDER BY d, entity_id LIMIT ?4",
    )?;
    let rows = stmt.query_map(params![center.x, center.y, center.z, k as i64], |row| {
        Ok(EntityDistance {
            entity_id: row.get(0)?,
            position: Point3D::new(row.get(1)?, row.get(2)?, row.get(3)?),
            distance: row.get(4)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Distance-to-path expression over numbered parameters starting at `first_param`.
pub fn path_distance_expr(path: &[Point3D], first_param: usize, args: &mut Vec<Value>) -> String {
    if path.len() == 1 {
        let p = path[0];
        let n = first_param;
        args.extend([Value::Real(p.x), Value::Real(p.y), Value::Real(p.z)]);
        return format!("dist3d(x, y, z, ?{}, ?{}, ?{})", n, n + 1, n + 2);
    }
    let mut terms = Vec::with_capacity(path.len() - 1);
    let mut n = first_param;
    for segment in path.windows(2) {
        let (a, b) = (segment[0], segment[1]);
        args.extend([a.x, a.y, a.z, b.x, b.y, b.z].map(Value::Real));
        terms.push(format!(
            "dist_to_segment(x, y, z, ?{}, ?{}, ?{}, ?{}, ?{}, ?{})",
            n,
            n + 1,
            n + 2,
            n + 3,
            n + 4,
            n + 5
        ));
        n += 6;
    }
    if terms.len() == 1 {
        terms.remove(0)
    } else {
        // multi-argument min() is the scalar form
        format!("min({})", terms.join(", "))
    }
}

/// Full-scan corridor search: entities within `width` of any path segment.
pub fn scan_along_path(conn: &Connection, path: &[Point3D], width: f64) -> StoreResult<Vec<EntityResult>> {
    let mut args = Vec::new();
    let expr = path_distance_expr(path, 1, &mut args);
    let width_param = args.len() + 1;
    args.push(Value::Real(width + POSITION_EPSILON));
    let sql = format!(
        "SELECT {cols}, {expr} AS d FROM positions WHERE d <= ?{w} ORDER BY d, entity_id",
        cols = POSITION_COLUMNS,
        expr = expr,
        w = width_param
    );
    collect_entities(conn, &sql, args, true)
}

/// Grid clustering computed with `grid_cell` over the rows inside `bbox`.
pub fn scan_clusters(
    conn: &Connection,
    bbox: BoundingBox,
    resolution: GridResolution,
    min_count: usize,
) -> StoreResult<Vec<SpatialCluster>> {
    let b = bbox.expand(POSITION_EPSILON);
    let mut args = bbox_args(&b);
    args.push(Value::Real(resolution.cell_size()));
    args.push(Value::Integer(min_count.max(1) as i64));
    let sql = "SELECT COUNT(*), AVG(x), AVG(y), AVG(z), group_concat(entity_id, char(31)) FROM (
            SELECT entity_id, x, y, z,
                   grid_cell(x, ?7) AS gx, grid_cell(y, ?7) AS gy, grid_cell(z, ?7) AS gz
            FROM positions
            WHERE x BETWEEN ?1 AND ?2 AND y BETWEEN ?3 AND ?4 AND z BETWEEN ?5 AND ?6
        )
        GROUP BY gx, gy, gz
        HAVING COUNT(*) >= ?8
        ORDER BY COUNT(*) DESC, gx, gy, gz";
    collect_clusters(conn, sql, args)
}

pub fn collect_clusters(conn: &Connection, sql: &str, args: Vec<Value>) -> StoreResult<Vec<SpatialCluster>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params_from_iter(args), |row| {
        let ids: String = row.get(4)?;
        let mut entity_ids: Vec<String> = ids.split('\u{1f}').map(str::to_owned).collect();
        entity_ids.sort();
        Ok(SpatialCluster {
            count: row.get::<_, i64>(0)? as usize,
            centroid: Point3D::new(row.get(1)?, row.get(2)?, row.get(3)?),
            entity_ids,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn bbox_args(b: &BoundingBox) -> Vec<Value> {
    vec![
        Value::Real(b.min.x),
        Value::Real(b.max.x),
        Value::Real(b.min.y),
        Value::Real(b.max.y),
        Value::Real(b.min.z),
        Value::Real(b.max.z),
    ]
}
