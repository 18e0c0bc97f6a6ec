// src/error.rs
//
// Error hierarchy for the LLB solver.
//
// Configuration problems are reported at construction; consistency errors
// mean a broken invariant and abort the run; a region-cache rebuild failure
// is shared by every worker that touched the cache.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    /// Invalid or conflicting configuration value.
    #[error("config error: {0}")]
    Config(String),

    /// A coefficient override names a region the atlas does not know.
    #[error("{channel}[{entry}]: \"{name}\" is not a known region (known regions: {known})")]
    UnknownRegion {
        channel: String,
        entry: usize,
        name: String,
        known: String,
    },

    /// Only meshes with identical cell volumes are supported.
    #[error("non-uniform cell volume: cell {index} has volume {volume:e}, expected {expected:e}")]
    NonUniformVolume {
        index: usize,
        volume: f64,
        expected: f64,
    },

    /// Broken invariant (mesh mismatch, continuity break, invalid transition, ...).
    #[error("consistency error: {0}")]
    Consistency(String),

    /// Second write of a derived-data key with a different value.
    #[error("derived data \"{key}\" already set to {existing:e}, refusing {new:e}")]
    DerivedDataConflict { key: String, existing: f64, new: f64 },

    /// Region map rebuild failed; sticky until cleared.
    #[error("region cache rebuild failed: {0}")]
    RegionRebuild(String),

    /// Newton iteration did not converge.
    #[error("convergence error: {0}")]
    Convergence(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SimError>;
