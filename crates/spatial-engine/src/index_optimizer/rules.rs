//! Index catalogue and the slow-query rule table
use crate::optimizer::{Fingerprint, QueryKind, QueryLatency};
use crate::store::rtree_store::DENSITY_INDEX;
use crate::store::{GridResolution, IndexDefinition, IndexKind};
use crate::types::ConfidenceLevel;
use serde::Serialize;

const POSITIONS: &str = "positions";

pub const FLOOR_INDEX: &str = "idx_positions_floor";
pub const TEMPORAL_INDEX: &str = "idx_positions_temporal";
pub const COORDINATE_INDEX: &str = "idx_positions_coordinates";
pub const HIGH_CONFIDENCE_INDEX: &str = "idx_positions_high_confidence";
pub const ESTABLISHED_INDEX: &str = "idx_positions_established";

pub fn grid_index(resolution: GridResolution) -> IndexDefinition {
    let (gx, gy, gz) = resolution.columns();
    IndexDefinition::new(resolution.index_name(), POSITIONS, &[gx, gy, gz], IndexKind::Grid)
}

pub fn floor_index() -> IndexDefinition {
    IndexDefinition::new(FLOOR_INDEX, POSITIONS, &["building_id", "floor", "gz_medium"], IndexKind::Composite)
}

pub fn temporal_index() -> IndexDefinition {
    IndexDefinition::new(
        TEMPORAL_INDEX,
        POSITIONS,
        &["updated_at", "gx_medium", "gy_medium"],
        IndexKind::Composite,
    )
}

pub fn coordinate_index() -> IndexDefinition {
    IndexDefinition::new(COORDINATE_INDEX, POSITIONS, &["x", "y", "z"], IndexKind::Composite)
}

pub fn high_confidence_index() -> IndexDefinition {
    IndexDefinition::new(
        HIGH_CONFIDENCE_INDEX,
        POSITIONS,
        &["gx_medium", "gy_medium", "gz_medium"],
        IndexKind::Partial,
    )
    .partial(format!("confidence >= {}", ConfidenceLevel::High.as_i64()))
}

pub fn density_index() -> IndexDefinition {
    IndexDefinition::new(
        DENSITY_INDEX,
        POSITIONS,
        &["building_id", "floor", "gx_coarse", "gy_coarse", "gz_coarse"],
        IndexKind::Composite,
    )
}

pub fn established_index() -> IndexDefinition {
    IndexDefinition::new(ESTABLISHED_INDEX, POSITIONS, &["entity_id", "updated_at"], IndexKind::Partial)
        .partial(format!("confidence > {}", ConfidenceLevel::Estimated.as_i64()))
}

/// Grid composites plus the floor-clustered and temporal composites.
pub fn base_indices() -> Vec<IndexDefinition> {
    let mut out: Vec<_> = GridResolution::ALL.iter().map(|r| grid_index(*r)).collect();
    out.push(floor_index());
    out.push(temporal_index());
    out
}

pub fn specialized_indices() -> Vec<IndexDefinition> {
    vec![high_confidence_index(), density_index(), established_index()]
}

/// Which predicates a slow query evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum PredicateShape {
    Proximity {
        #[serde(skip_serializing_if = "Option::is_none")]
        radius: Option<f64>,
    },
    KNearest,
    BoundingBox,
    ConfidenceFilter,
    TemporalFilter,
    Clustering,
}

impl PredicateShape {
    /// `radius` is the search radius or corridor width of proximity kinds.
    pub fn of(kind: QueryKind, radius: Option<f64>) -> Self {
        match kind {
            QueryKind::Near | QueryKind::BulkNear | QueryKind::AlongPath => PredicateShape::Proximity { radius },
            QueryKind::KNearest => PredicateShape::KNearest,
            QueryKind::BoundingBox => PredicateShape::BoundingBox,
            QueryKind::Clusters => PredicateShape::Clustering,
            QueryKind::ByConfidence => PredicateShape::ConfidenceFilter,
            QueryKind::NeedingVerification => PredicateShape::TemporalFilter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuerySample {
    pub fingerprint: Fingerprint,
    pub shape: PredicateShape,
    pub latency_ms: f64,
}

impl From<&QueryLatency> for QuerySample {
    fn from(q: &QueryLatency) -> Self {
        Self {
            fingerprint: q.fingerprint,
            shape: PredicateShape::of(q.kind, q.radius),
            latency_ms: q.store_latency_ms(),
        }
    }
}

/// A proposed index and the sample that triggered it. Not applied until asked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexRecommendation {
    pub sample: QuerySample,
    pub rule: &'static str,
    pub index: IndexDefinition,
}

pub(crate) struct IndexRule {
    pub name: &'static str,
    pub propose: fn(&PredicateShape) -> Option<IndexDefinition>,
}

pub(crate) const RULES: &[IndexRule] = &[
    IndexRule {
        name: "proximity_without_grid",
        propose: |shape| match shape {
            PredicateShape::Proximity { radius } => {
                let resolution = radius.map(GridResolution::for_radius).unwrap_or(GridResolution::Medium);
                Some(grid_index(resolution))
            }
            _ => None,
        },
    },
    IndexRule {
        name: "k_nearest_without_fine_grid",
        propose: |shape| matches!(shape, PredicateShape::KNearest).then(|| grid_index(GridResolution::Fine)),
    },
    IndexRule {
        name: "bbox_without_geometry",
        propose: |shape| matches!(shape, PredicateShape::BoundingBox).then(coordinate_index),
    },
    IndexRule {
        name: "confidence_without_partial",
        propose: |shape| matches!(shape, PredicateShape::ConfidenceFilter).then(high_confidence_index),
    },
    IndexRule {
        name: "temporal_without_composite",
        propose: |shape| matches!(shape, PredicateShape::TemporalFilter).then(temporal_index),
    },
    IndexRule {
        name: "clustering_without_density",
        propose: |shape| matches!(shape, PredicateShape::Clustering).then(density_index),
    },
];
