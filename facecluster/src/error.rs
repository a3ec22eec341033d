use facetag_hdbscan::HdbscanError;
use thiserror::Error;

/// Errors returned by facecluster operations.
#[derive(Debug, Error)]
pub enum FaceClusterError {
    #[error("facecluster: store: {0}")]
    Store(String),

    #[error(transparent)]
    Hdbscan(#[from] HdbscanError),

    #[error("facecluster: invalid config: {0}")]
    Config(String),

    #[error("facecluster: unknown cluster {0}")]
    UnknownCluster(i64),
}
