//! Density-based clustering (HDBSCAN) over a mutual-reachability ball tree.
//!
//! The pipeline is:
//!
//! 1. [`BallTree::grow`] builds an arena ball tree over a labelled
//!    [`Dataset`];
//! 2. [`BallTree::precalculate_core_distances`] finds every point's
//!    `sample_size`-th neighbour with a dual-tree k-NN search, optionally
//!    reusing a [`CoreNeighborTable`] from an earlier run;
//! 3. [`MstSolver`] builds the mutual-reachability spanning tree with
//!    dual-tree Boruvka;
//! 4. [`ClusterExtractor`] cuts the tree longest edge first and selects flat
//!    clusters by excess of mass.
//!
//! [`Hdbscan`] wires the steps together.
//!
//! # Kernels
//!
//! The default [`SquaredEuclidean`] kernel skips the square root on every
//! pair. Tree bounds are computed in linear distance, so the kernel also
//! converts between its units and linear distance. Everything [`Hdbscan`]
//! returns is linear.

mod balltree;
mod dataset;
mod dualtree;
mod error;
mod extract;
mod hdbscan;
mod kernel;
mod mst;

pub use balltree::{BallTree, CoreNeighborTable};
pub use dataset::{Dataset, Label};
pub use error::HdbscanError;
pub use extract::{ClusterExtractor, FlatCluster};
pub use hdbscan::{Hdbscan, HdbscanConfig};
pub use kernel::{Euclidean, Kernel, SquaredEuclidean};
pub use mst::{MstEdge, MstSolver};
