use thiserror::Error;

use classwatch_vecindex::VecIndexError;

/// Errors returned by identity store operations.
#[derive(Debug, Error)]
pub enum FaceIdError {
    #[error("faceid: dimension mismatch: got {got}, want {want}")]
    DimensionMismatch { got: usize, want: usize },

    #[error("faceid: {0}")]
    Index(#[from] VecIndexError),

    /// A snapshot write failed. In-memory state may be ahead of the
    /// persisted state until the next successful mutating operation.
    #[error("faceid: persistence: {0}")]
    Persistence(String),

    #[error("faceid: extractor: {0}")]
    Extractor(String),

    #[error("faceid: no extractor configured")]
    NoExtractor,
}
