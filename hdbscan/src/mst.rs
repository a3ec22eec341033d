use std::cmp::Ordering;

use tracing::{debug, warn};

use crate::balltree::BallTree;
use crate::dataset::Label;
use crate::dualtree::{self, DualTreeRule};
use crate::kernel::Kernel;

/// One edge of the mutual-reachability spanning tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MstEdge {
    pub from: Label,
    pub to: Label,
    /// MRD weight. Kernel units out of [`MstSolver::solve`], linear distance
    /// once it went through [`crate::Hdbscan::mst`].
    pub distance: f64,
    /// Lambda of the flat cluster this edge was retained in; 0 until
    /// extraction.
    pub final_lambda: f64,
}

/// Candidate edge between dense indices, ordered by `(mrd, low, high)`.
type Candidate = (f64, usize, usize);

fn candidate_cmp(a: &Candidate, b: &Candidate) -> Ordering {
    a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2))
}

fn candidate(mrd: f64, a: usize, b: usize) -> Candidate {
    (mrd, a.min(b), a.max(b))
}

// ---------------------------------------------------------------------------
// Union-find
// ---------------------------------------------------------------------------

struct UnionFind {
    parent: Vec<usize>,
    size: Vec<usize>,
    components: usize,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
            components: n,
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        while self.parent[x] != root {
            let next = self.parent[x];
            self.parent[x] = root;
            x = next;
        }
        root
    }

    /// Joins the sets of `a` and `b`; the smaller set is absorbed into the
    /// larger one. Returns false when they were already joined.
    fn union(&mut self, a: usize, b: usize) -> bool {
        let (mut ra, mut rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        if self.size[ra] < self.size[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        self.size[ra] += self.size[rb];
        self.components -= 1;
        true
    }
}

// ---------------------------------------------------------------------------
// MstSolver
// ---------------------------------------------------------------------------

/// Dual-tree Boruvka over mutual reachability distance.
///
/// Expects a tree whose core distances were already computed. In
/// `approximate` mode node bounds are carried over between rounds instead of
/// being reset, which prunes harder at the cost of guaranteed minimality.
#[derive(Debug, Clone, Copy, Default)]
pub struct MstSolver {
    approximate: bool,
}

impl MstSolver {
    pub fn new(approximate: bool) -> Self {
        Self { approximate }
    }

    pub fn solve<K: Kernel>(&self, tree: &mut BallTree<K>) -> Vec<MstEdge> {
        let n = tree.len();
        let mut edges = Vec::with_capacity(n.saturating_sub(1));
        let Some(root) = tree.root() else {
            return edges;
        };
        if n < 2 {
            return edges;
        }

        let mut uf = UnionFind::new(n);
        let seeded = seed_candidates(tree);
        let merged = merge(tree, &mut uf, seeded, &mut edges);
        debug!(
            "hdbscan: mst seed round: {} edges, {} components",
            merged, uf.components
        );

        let mut round = 1;
        while uf.components > 1 {
            round += 1;
            let components: Vec<usize> = (0..n).map(|i| uf.find(i)).collect();
            tree.update_components(&components);

            let reset = !self.approximate || round == 2;
            if reset {
                tree.reset_bounds();
            }
            let mut candidates = search_round(tree, root, &components);
            if candidates.is_empty() && !reset {
                debug!("hdbscan: mst round {}: retrying with fresh bounds", round);
                tree.reset_bounds();
                candidates = search_round(tree, root, &components);
            }

            let merged = merge(tree, &mut uf, candidates, &mut edges);
            debug!(
                "hdbscan: mst round {}: {} edges, {} components",
                round, merged, uf.components
            );
            if merged == 0 {
                warn!(
                    "hdbscan: mst round {} found no edge, {} components left",
                    round, uf.components
                );
                break;
            }
        }
        edges
    }
}

/// Seeds each point with its cheapest edge straight from the core-neighbour
/// lists: a neighbour q whose core distance does not exceed core(p) is
/// within core(p) of p, so MRD(p, q) = core(p), the least any edge of p
/// can weigh.
fn seed_candidates<K: Kernel>(tree: &BallTree<K>) -> Vec<Candidate> {
    let mut seeded = Vec::new();
    for p in 0..tree.len() {
        let core_p = tree.core_at(p);
        let best = tree
            .neighbors_at(p)
            .iter()
            .filter(|&&(q, _)| tree.core_at(q) <= core_p)
            .map(|&(q, _)| candidate(core_p, p, q))
            .min_by(candidate_cmp);
        if let Some(c) = best {
            seeded.push(c);
        }
    }
    seeded
}

fn search_round<K: Kernel>(tree: &mut BallTree<K>, root: usize, components: &[usize]) -> Vec<Candidate> {
    let mut rule = MstRule::new(components.to_vec());
    dualtree::traverse(tree, &mut rule, root, root);
    rule.into_candidates()
}

fn merge<K: Kernel>(
    tree: &BallTree<K>,
    uf: &mut UnionFind,
    mut candidates: Vec<Candidate>,
    edges: &mut Vec<MstEdge>,
) -> usize {
    candidates.sort_by(candidate_cmp);
    let mut merged = 0;
    for (mrd, a, b) in candidates {
        if uf.union(a, b) {
            edges.push(MstEdge {
                from: tree.dataset().label(a),
                to: tree.dataset().label(b),
                distance: mrd,
                final_lambda: 0.0,
            });
            merged += 1;
        }
    }
    merged
}

// ---------------------------------------------------------------------------
// MST rule
// ---------------------------------------------------------------------------

/// Finds the cheapest outgoing MRD edge of every component.
struct MstRule {
    components: Vec<usize>,
    /// Indexed by component root.
    best: Vec<Option<Candidate>>,
}

impl MstRule {
    fn new(components: Vec<usize>) -> Self {
        let n = components.len();
        Self {
            components,
            best: vec![None; n],
        }
    }

    fn into_candidates(self) -> Vec<Candidate> {
        self.best.into_iter().flatten().collect()
    }

    fn best_distance(&self, i: usize) -> f64 {
        self.best[self.components[i]].map_or(f64::INFINITY, |c| c.0)
    }
}

impl<K: Kernel> DualTreeRule<K> for MstRule {
    fn score(&mut self, tree: &BallTree<K>, q: usize, r: usize) -> Option<f64> {
        let (nq, nr) = (&tree.nodes[q], &tree.nodes[r]);
        if let (Some(a), Some(b)) = (nq.component, nr.component) {
            if a == b {
                return None;
            }
        }
        Some(
            tree.node_distance(q, r)
                .max(nq.min_core)
                .max(nr.min_core),
        )
    }

    fn base_case(&mut self, tree: &mut BallTree<K>, q: usize, r: usize) {
        let query = tree.leaf_points(q).to_vec();
        let reference = tree.leaf_points(r).to_vec();
        let mut worst: f64 = 0.0;
        for &i in &query {
            let ci = self.components[i];
            for &j in &reference {
                if self.components[j] == ci {
                    continue;
                }
                let c = candidate(tree.compute_mrd(i, j), i, j);
                let better = match &self.best[ci] {
                    Some(current) => candidate_cmp(&c, current) == Ordering::Less,
                    None => true,
                };
                if better {
                    self.best[ci] = Some(c);
                }
            }
            worst = worst.max(self.best_distance(i));
        }
        let node = &mut tree.nodes[q];
        node.bound = node.bound.min(worst);
    }

    fn update_bound(&mut self, tree: &mut BallTree<K>, q: usize) {
        let Some((left, right)) = tree.children(q) else {
            return;
        };
        let bound = tree.nodes[left].bound.max(tree.nodes[right].bound);
        let node = &mut tree.nodes[q];
        node.bound = node.bound.min(bound);
    }
}
