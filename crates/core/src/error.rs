use thiserror::Error;

/// Failures surfaced by the tiling, merge and request-correlation core.
///
/// None of these are transient: each one is a contract violation by the caller
/// or a configuration defect, so nothing in the core retries on them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TilingError {
    /// Invalid crop/stride/image-size combination.
    #[error("tile geometry error: {0}")]
    TileGeometry(String),

    /// Source tensor or tile output does not match the computed geometry.
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("request '{0}' already has an outstanding tiling job")]
    DuplicateRequest(String),

    /// Unknown id, already finalized, or never begun.
    #[error("no tiling job registered for request '{0}'")]
    RequestNotFound(String),

    #[error("expected {expected} tile outputs, got {actual}")]
    CardinalityMismatch { expected: usize, actual: usize },

    /// Only part of a job's tile outputs were delivered.
    #[error("request '{request_id}' delivered {delivered} of {expected} tile outputs")]
    IncompleteJob {
        request_id: String,
        expected: usize,
        delivered: usize,
    },

    #[error("request '{0}' is already being finalized")]
    FinalizationInProgress(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The external raster writer rejected a finalized label map.
    #[error("raster writer failed: {0}")]
    Writer(String),
}

pub type TilingResult<T> = std::result::Result<T, TilingError>;
