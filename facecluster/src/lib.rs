//! Incremental face clustering that keeps person identity stable across
//! runs.
//!
//! Detections arrive unclustered (`cluster_id = None`). Each
//! [`FaceClusterAnalyzer::run`] clusters a user's new detections together
//! with anchors sampled from that user's existing clusters, then carries the
//! old cluster ids over by anchor vote:
//!
//! - most of a cluster's anchors land in one flat cluster: it keeps the id;
//! - almost none do: a new cluster is created;
//! - anything in between is left for a later run.
//!
//! Detections that end up in no cluster are marked rejected (`-1`) and are
//! resampled by later runs.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use facetag_facecluster::{AnalyzerConfig, FaceClusterAnalyzer, MemoryStore};
//!
//! let store = Arc::new(MemoryStore::new());
//! let analyzer = FaceClusterAnalyzer::new(AnalyzerConfig::default(), store.clone()).unwrap();
//! let status = analyzer.run("alice").unwrap();
//! assert!(status.aborted.is_some()); // nothing to cluster yet
//! ```

mod analyzer;
mod config;
mod error;
mod store;
mod types;

#[cfg(test)]
mod tests;

pub use analyzer::FaceClusterAnalyzer;
pub use config::AnalyzerConfig;
pub use error::FaceClusterError;
pub use store::{FaceStore, MemoryStore};
pub use types::{BoundingBox, Cluster, Detection, REJECTED, RunStatus};
