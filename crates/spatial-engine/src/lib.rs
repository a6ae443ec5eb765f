// crates/spatial-engine/src/lib.rs

#[cfg(feature = "cli")]
pub mod api;
pub mod config;
pub mod error;
pub mod fallback;
pub mod index_optimizer;
pub mod metrics;
pub mod optimizer;
pub mod retry;
#[cfg(feature = "cli")]
pub mod server;
pub mod store;
pub mod telemetry;
pub mod types;

// Public API exports
pub use config::Config;
pub use error::{ErrorClass, StoreError, StoreResult};
pub use fallback::{FallbackConfig, FallbackDataStore};
pub use index_optimizer::{IndexOptimizer, IndexOptimizerConfig, IndexRecommendation};
pub use optimizer::{OptimizerConfig, QueryResult, QuerySpec, SpatialQueryOptimizer};
pub use retry::RetryPolicy;
pub use store::{BasicStore, GridResolution, RtreeStore, SpatialStore, SqliteStore, StoreTimeouts};
pub use types::{
    BoundingBox, ChangeNotification, ConfidenceAspect, ConfidenceLevel, ConfidenceRecord, EntityDistance,
    EntityResult, Point3D, PositionResult, SpatialCluster, SpatialPosition, StoreHealth, StoreRole,
    VerificationEvent,
};

#[cfg(feature = "cli")]
pub use server::{build_router, build_state, run_server};
