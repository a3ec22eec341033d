//! Generic dual-tree traversal over pairs of ball-tree nodes.
//!
//! A rule decides how a pair `(Q, R)` is scored, what happens when two
//! leaves meet, and how an internal query node's bound is tightened from its
//! children. The k-nearest-neighbour search below and the Boruvka component
//! search in [`crate::mst`] are both rules of the same traversal.

use crate::balltree::{BallTree, insert_neighbor};
use crate::kernel::Kernel;

pub(crate) trait DualTreeRule<K: Kernel> {
    /// Lower bound for the pair, or `None` to prune it outright.
    fn score(&mut self, tree: &BallTree<K>, q: usize, r: usize) -> Option<f64>;

    /// Called for every leaf × leaf pair that survives pruning.
    fn base_case(&mut self, tree: &mut BallTree<K>, q: usize, r: usize);

    /// Called for an internal query node after its children were visited.
    fn update_bound(&mut self, tree: &mut BallTree<K>, q: usize);
}

/// Visits `(q, r)` and recurses. A pair is pruned when its score is strictly
/// greater than Q's bound, so equal-distance candidates are still explored.
pub(crate) fn traverse<K, R>(tree: &mut BallTree<K>, rule: &mut R, q: usize, r: usize)
where
    K: Kernel,
    R: DualTreeRule<K>,
{
    let Some(score) = rule.score(tree, q, r) else {
        return;
    };
    if score > tree.nodes[q].bound {
        return;
    }

    match (tree.children(q), tree.children(r)) {
        (None, None) => rule.base_case(tree, q, r),
        (None, Some((rl, rr))) => {
            let (first, second) = nearer_first(tree, q, rl, rr);
            traverse(tree, rule, q, first);
            traverse(tree, rule, q, second);
        }
        (Some((ql, qr)), r_children) => {
            for qc in [ql, qr] {
                match r_children {
                    Some((rl, rr)) => {
                        let (first, second) = nearer_first(tree, qc, rl, rr);
                        traverse(tree, rule, qc, first);
                        traverse(tree, rule, qc, second);
                    }
                    None => traverse(tree, rule, qc, r),
                }
            }
            rule.update_bound(tree, q);
        }
    }
}

fn nearer_first<K: Kernel>(tree: &BallTree<K>, q: usize, a: usize, b: usize) -> (usize, usize) {
    if tree.node_distance(q, a) <= tree.node_distance(q, b) {
        (a, b)
    } else {
        (b, a)
    }
}

// ---------------------------------------------------------------------------
// k-NN rule
// ---------------------------------------------------------------------------

/// All-points k-nearest-neighbour search (self excluded).
pub(crate) struct KnnRule {
    k: usize,
    neighbors: Vec<Vec<(usize, f64)>>,
}

impl KnnRule {
    pub(crate) fn new(n: usize, k: usize) -> Self {
        Self {
            k,
            neighbors: vec![Vec::with_capacity(k + 1); n],
        }
    }

    pub(crate) fn into_neighbors(self) -> Vec<Vec<(usize, f64)>> {
        self.neighbors
    }

    fn kth(&self, i: usize) -> f64 {
        let list = &self.neighbors[i];
        if list.len() < self.k {
            f64::INFINITY
        } else {
            list[self.k - 1].1
        }
    }
}

impl<K: Kernel> DualTreeRule<K> for KnnRule {
    fn score(&mut self, tree: &BallTree<K>, q: usize, r: usize) -> Option<f64> {
        Some(tree.node_distance(q, r))
    }

    fn base_case(&mut self, tree: &mut BallTree<K>, q: usize, r: usize) {
        let mut worst: f64 = 0.0;
        for &i in tree.leaf_points(q) {
            for &j in tree.leaf_points(r) {
                if i != j {
                    let d = tree.raw_distance(i, j);
                    insert_neighbor(&mut self.neighbors[i], self.k, j, d);
                }
            }
            worst = worst.max(self.kth(i));
        }
        let node = &mut tree.nodes[q];
        node.bound = node.bound.min(worst);
    }

    fn update_bound(&mut self, tree: &mut BallTree<K>, q: usize) {
        let Some((left, right)) = tree.children(q) else {
            return;
        };
        let (bl, br) = (tree.nodes[left].bound, tree.nodes[right].bound);
        let nearest = bl.min(br);
        let via_radius = if nearest.is_finite() {
            let kernel = tree.kernel();
            kernel.from_linear(kernel.to_linear(nearest) + 2.0 * kernel.to_linear(tree.nodes[q].radius))
        } else {
            f64::INFINITY
        };
        let bound = bl.max(br).min(via_radius);
        let node = &mut tree.nodes[q];
        node.bound = node.bound.min(bound);
    }
}
