use tracing::debug;

use crate::balltree::{BallTree, CoreNeighborTable};
use crate::dataset::{Dataset, Label};
use crate::error::HdbscanError;
use crate::extract::{ClusterExtractor, FlatCluster};
use crate::kernel::{Kernel, SquaredEuclidean};
use crate::mst::{MstEdge, MstSolver};

/// Parameters fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HdbscanConfig {
    /// Smallest group of points that can form a cluster. At least 2.
    pub min_cluster_size: usize,
    /// Neighbour rank used as the core distance. At least 2.
    pub sample_size: usize,
    /// Points per ball-tree leaf. At least 1.
    pub max_leaf_size: usize,
    /// Carry node bounds across Boruvka rounds.
    pub approximate: bool,
    /// Cache pairwise distances during the MST search.
    pub cache_distances: bool,
}

impl Default for HdbscanConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: 5,
            sample_size: 5,
            max_leaf_size: 20,
            approximate: false,
            cache_distances: true,
        }
    }
}

impl HdbscanConfig {
    pub fn validate(&self) -> Result<(), HdbscanError> {
        if self.min_cluster_size < 2 {
            return Err(HdbscanError::InvalidConfig(format!(
                "min_cluster_size must be at least 2, got {}",
                self.min_cluster_size
            )));
        }
        if self.sample_size < 2 {
            return Err(HdbscanError::InvalidConfig(format!(
                "sample_size must be at least 2, got {}",
                self.sample_size
            )));
        }
        if self.max_leaf_size < 1 {
            return Err(HdbscanError::InvalidConfig(
                "max_leaf_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// HDBSCAN over one dataset.
///
/// Construction grows the ball tree and computes core distances; the
/// spanning tree is built on first use and kept. Distances handed out by
/// this type are linear, whatever the kernel.
///
/// ```
/// use facetag_hdbscan::{Dataset, Hdbscan, HdbscanConfig};
///
/// let mut vectors = Vec::new();
/// for i in 0..20 {
///     vectors.push(vec![0.0, i as f32 * 0.01]);
///     vectors.push(vec![10.0, i as f32 * 0.01]);
/// }
/// let dataset = Dataset::from_vectors(vectors).unwrap();
/// let mut hdbscan = Hdbscan::new(dataset, HdbscanConfig::default()).unwrap();
/// let clusters = hdbscan.predict(0.35, 0.5);
/// assert_eq!(clusters.len(), 2);
/// ```
pub struct Hdbscan<K: Kernel = SquaredEuclidean> {
    config: HdbscanConfig,
    tree: BallTree<K>,
    mst: Option<Vec<MstEdge>>,
}

impl Hdbscan<SquaredEuclidean> {
    pub fn new(dataset: Dataset, config: HdbscanConfig) -> Result<Self, HdbscanError> {
        Self::with_kernel(dataset, config, SquaredEuclidean, None)
    }

    /// Like [`Hdbscan::new`], reusing a neighbour table exported by an
    /// earlier run over an overlapping dataset.
    pub fn with_core_neighbors(
        dataset: Dataset,
        config: HdbscanConfig,
        prior: &CoreNeighborTable,
    ) -> Result<Self, HdbscanError> {
        Self::with_kernel(dataset, config, SquaredEuclidean, Some(prior))
    }
}

impl<K: Kernel> Hdbscan<K> {
    pub fn with_kernel(
        dataset: Dataset,
        config: HdbscanConfig,
        kernel: K,
        prior: Option<&CoreNeighborTable>,
    ) -> Result<Self, HdbscanError> {
        config.validate()?;
        debug!(
            "hdbscan: {} points, min cluster size {}, sample size {}, prior table: {}",
            dataset.len(),
            config.min_cluster_size,
            config.sample_size,
            prior.map_or(0, |t| t.len())
        );

        let mut tree = BallTree::new(kernel, config.max_leaf_size);
        tree.set_distance_cache(config.cache_distances);
        tree.grow(dataset);
        tree.precalculate_core_distances(config.sample_size, prior);
        Ok(Self {
            config,
            tree,
            mst: None,
        })
    }

    pub fn config(&self) -> &HdbscanConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn tree(&self) -> &BallTree<K> {
        &self.tree
    }

    /// Mutual-reachability spanning tree with linear edge weights.
    pub fn mst(&mut self) -> &[MstEdge] {
        if self.mst.is_none() {
            let raw = MstSolver::new(self.config.approximate).solve(&mut self.tree);
            let kernel = self.tree.kernel();
            let edges: Vec<MstEdge> = raw
                .into_iter()
                .map(|e| MstEdge {
                    distance: kernel.to_linear(e.distance),
                    ..e
                })
                .collect();
            self.mst = Some(edges);
        }
        self.mst.as_deref().unwrap_or_default()
    }

    /// Runs extraction over the spanning tree. Both thresholds are linear
    /// distances.
    pub fn predict(&mut self, min_cluster_separation: f64, max_edge_length: f64) -> Vec<FlatCluster> {
        let extractor = ClusterExtractor::new(
            self.config.min_cluster_size,
            min_cluster_separation,
            max_edge_length,
        );
        extractor.extract(self.mst())
    }

    /// Linear core distance of a labelled point.
    pub fn core_distance(&self, label: Label) -> Option<f64> {
        self.tree
            .core_distance(label)
            .map(|d| self.tree.kernel().to_linear(d))
    }

    /// Neighbour table in kernel units, ready to be passed back through
    /// [`Hdbscan::with_kernel`] or [`Hdbscan::with_core_neighbors`].
    pub fn core_neighbor_table(&self) -> CoreNeighborTable {
        self.tree.core_neighbor_table()
    }
}
