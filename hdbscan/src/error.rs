use thiserror::Error;

use crate::dataset::Label;

/// Errors returned by hdbscan operations.
#[derive(Debug, Error)]
pub enum HdbscanError {
    #[error("hdbscan: invalid config: {0}")]
    InvalidConfig(String),

    #[error("hdbscan: dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("hdbscan: empty vector")]
    EmptyVector,

    #[error("hdbscan: duplicate label {0}")]
    DuplicateLabel(Label),
}
