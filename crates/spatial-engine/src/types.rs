//! Shared domain types for positions, confidence and query results

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current time at the microsecond precision the stores persist.
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Floating point tolerance used for exact-point comparisons (radius 0, degenerate boxes).
pub const POSITION_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Point3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3D {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn distance_to(&self, other: &Point3D) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl fmt::Display for Point3D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

/// Axis-aligned 3D box, inclusive on every face.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: Point3D,
    pub max: Point3D,
}

impl BoundingBox {
    pub fn new(min: Point3D, max: Point3D) -> Self {
        Self { min, max }
    }

    /// Box enclosing a sphere, used to bound radius searches.
    pub fn around(center: &Point3D, radius: f64) -> Self {
        Self {
            min: Point3D::new(center.x - radius, center.y - radius, center.z - radius),
            max: Point3D::new(center.x + radius, center.y + radius, center.z + radius),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite()
            && self.max.is_finite()
            && self.min.x <= self.max.x
            && self.min.y <= self.max.y
            && self.min.z <= self.max.z
    }

    pub fn contains(&self, p: &Point3D) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    pub fn expand(&self, margin: f64) -> Self {
        Self {
            min: Point3D::new(self.min.x - margin, self.min.y - margin, self.min.z - margin),
            max: Point3D::new(self.max.x + margin, self.max.y + margin, self.max.z + margin),
        }
    }

    /// Smallest box containing every point of `points`.
    pub fn enclosing(points: &[Point3D]) -> Option<Self> {
        let first = points.first()?;
        let mut bbox = Self { min: *first, max: *first };
        for p in &points[1..] {
            bbox.min.x = bbox.min.x.min(p.x);
            bbox.min.y = bbox.min.y.min(p.y);
            bbox.min.z = bbox.min.z.min(p.z);
            bbox.max.x = bbox.max.x.max(p.x);
            bbox.max.y = bbox.max.y.max(p.y);
            bbox.max.z = bbox.max.z.max(p.z);
        }
        Some(bbox)
    }
}

/// Discrete trust rating attached to a position or a semantic fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    Estimated = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl ConfidenceLevel {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    /// Out-of-range values clamp to the nearest level.
    pub fn from_i64(value: i64) -> Self {
        match value {
            i64::MIN..=0 => ConfidenceLevel::Estimated,
            1 => ConfidenceLevel::Low,
            2 => ConfidenceLevel::Medium,
            _ => ConfidenceLevel::High,
        }
    }
}

impl fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfidenceLevel::Estimated => "estimated",
            ConfidenceLevel::Low => "low",
            ConfidenceLevel::Medium => "medium",
            ConfidenceLevel::High => "high",
        };
        f.write_str(name)
    }
}

/// Which half of a confidence record an update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceAspect {
    Position,
    Semantic,
}

/// Location of a tracked entity. Always written whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialPosition {
    pub entity_id: String,
    pub position: Point3D,
    pub confidence: ConfidenceLevel,
    pub source: String,
    pub updated_at: DateTime<Utc>,
}

impl SpatialPosition {
    pub fn new(
        entity_id: impl Into<String>,
        position: Point3D,
        confidence: ConfidenceLevel,
        source: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            position,
            confidence,
            source: source.into(),
            updated_at: now_micros(),
        }
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at.trunc_subsecs(6);
        self
    }

    /// Building id taken from the `building/floor/room/equipment` id path.
    pub fn building_id(&self) -> Option<&str> {
        let mut parts = self.entity_id.split('/');
        let building = parts.next()?;
        // a bare id carries no building
        parts.next()?;
        Some(building).filter(|b| !b.is_empty())
    }

    /// Floor number from the second id segment, if it parses.
    pub fn floor(&self) -> Option<i64> {
        self.entity_id.split('/').nth(1)?.parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationEvent {
    pub verified_at: DateTime<Utc>,
    pub verified_by: String,
    pub aspect: ConfidenceAspect,
    pub level: ConfidenceLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceRecord {
    pub entity_id: String,
    pub position_confidence: ConfidenceLevel,
    pub position_source: String,
    pub position_updated: Option<DateTime<Utc>>,
    pub semantic_confidence: ConfidenceLevel,
    pub semantic_source: String,
    pub semantic_updated: Option<DateTime<Utc>>,
    pub last_verified: Option<DateTime<Utc>>,
    pub verification_count: u32,
    pub verification_history: Vec<VerificationEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceUpdate {
    pub entity_id: String,
    pub aspect: ConfidenceAspect,
    pub level: ConfidenceLevel,
    pub source: String,
    pub updated_at: DateTime<Utc>,
}

impl ConfidenceUpdate {
    pub fn for_position(position: &SpatialPosition) -> Self {
        Self {
            entity_id: position.entity_id.clone(),
            aspect: ConfidenceAspect::Position,
            level: position.confidence,
            source: position.source.clone(),
            updated_at: position.updated_at,
        }
    }
}

/// Answer to a single-entity position lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionResult {
    pub position: SpatialPosition,
    pub served_by: StoreRole,
}

/// Entity returned by a spatial search, with its distance from the query center when one exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityResult {
    pub entity_id: String,
    pub position: Point3D,
    pub confidence: ConfidenceLevel,
    pub source: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDistance {
    pub entity_id: String,
    pub position: Point3D,
    pub distance: f64,
}

/// Group of nearby entities produced by grid clustering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialCluster {
    pub centroid: Point3D,
    pub count: usize,
    pub entity_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreRole {
    Primary,
    Secondary,
}

/// Last probed reachability and capability of the primary store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreHealth {
    pub available: bool,
    pub spatial_support: bool,
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl StoreHealth {
    pub fn unknown() -> Self {
        Self {
            available: false,
            spatial_support: false,
            last_checked: None,
            last_error: None,
        }
    }
}

/// Spatial write waiting for replay against the primary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    pub sequence: u64,
    pub position: SpatialPosition,
    pub enqueued_at: DateTime<Utc>,
}

/// Raw change published by a store after a committed position write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub entity_id: String,
    pub position: Point3D,
    pub confidence: ConfidenceLevel,
    pub source: String,
    pub updated_at: DateTime<Utc>,
}

impl From<&SpatialPosition> for ChangeNotification {
    fn from(p: &SpatialPosition) -> Self {
        Self {
            entity_id: p.entity_id.clone(),
            position: p.position,
            confidence: p.confidence,
            source: p.source.clone(),
            updated_at: p.updated_at,
        }
    }
}
