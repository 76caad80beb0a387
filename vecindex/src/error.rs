use thiserror::Error;

#[derive(Error, Debug)]
pub enum VecIndexError {
    #[error("vecindex: dimension mismatch: got {got}, want {want}")]
    DimensionMismatch { got: usize, want: usize },

    #[error("vecindex: {0}")]
    Io(String),

    #[error("vecindex: invalid format: {0}")]
    InvalidFormat(String),
}
