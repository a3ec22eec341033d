use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::dataset::{Dataset, Label};
use crate::dualtree::{self, KnnRule};
use crate::kernel::Kernel;

/// Label-keyed nearest-neighbour table.
///
/// Exported by [`BallTree::core_neighbor_table`] and accepted back by
/// [`BallTree::precalculate_core_distances`] so a later run over a grown
/// dataset only searches the new points. Lists are sorted by ascending
/// kernel distance.
pub type CoreNeighborTable = HashMap<Label, Vec<(Label, f64)>>;

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

pub(crate) enum NodeKind {
    /// Internal hypersphere with two children.
    Ball { left: usize, right: usize },
    /// Leaf holding a raw sub-dataset.
    Clique { points: Vec<usize> },
}

pub(crate) struct Node {
    pub(crate) center: Vec<f32>,
    /// Kernel distance from `center` to the farthest point below.
    pub(crate) radius: f64,
    pub(crate) kind: NodeKind,
    /// Dual-tree scratch: longest candidate distance of any point below.
    pub(crate) bound: f64,
    /// Dual-tree scratch: set when every point below is in one component.
    pub(crate) component: Option<usize>,
    /// Smallest core distance of any point below.
    pub(crate) min_core: f64,
}

// ---------------------------------------------------------------------------
// BallTree
// ---------------------------------------------------------------------------

/// Binary hypersphere tree over a labelled point set, answering the
/// neighbour and mutual-reachability queries HDBSCAN needs.
///
/// Nodes live in an arena and refer to each other by index. Children are
/// always pushed before their parent, so iterating the arena in order is a
/// bottom-up pass.
pub struct BallTree<K: Kernel> {
    kernel: K,
    max_leaf_size: usize,
    dataset: Dataset,
    pub(crate) nodes: Vec<Node>,
    root: Option<usize>,
    neighbors: Vec<Vec<(usize, f64)>>,
    core: Vec<f64>,
    cache: Option<HashMap<usize, f64>>,
}

impl<K: Kernel> BallTree<K> {
    /// Creates an empty tree. A `max_leaf_size` of 0 is treated as 1.
    pub fn new(kernel: K, max_leaf_size: usize) -> Self {
        Self {
            kernel,
            max_leaf_size: max_leaf_size.max(1),
            dataset: Dataset::new(),
            nodes: Vec::new(),
            root: None,
            neighbors: Vec::new(),
            core: Vec::new(),
            cache: Some(HashMap::new()),
        }
    }

    /// Turns the pairwise distance cache on or off. The cache grows toward
    /// O(n²) entries over an MST run; disable it for large batches.
    pub fn set_distance_cache(&mut self, enabled: bool) {
        self.cache = if enabled { Some(HashMap::new()) } else { None };
    }

    /// Builds the tree over `dataset`, replacing any previous contents.
    pub fn grow(&mut self, dataset: Dataset) {
        self.dataset = dataset;
        self.nodes.clear();
        self.root = None;
        if let Some(cache) = &mut self.cache {
            cache.clear();
        }

        let n = self.dataset.len();
        self.neighbors = vec![Vec::new(); n];
        self.core = vec![0.0; n];
        if n == 0 {
            return;
        }

        let root = self.build((0..n).collect());
        self.root = Some(root);
        debug!(
            "hdbscan: grew ball tree: {} points, {} nodes, dim {}",
            n,
            self.nodes.len(),
            self.dataset.dim()
        );
    }

    fn build(&mut self, points: Vec<usize>) -> usize {
        let center = self.centroid(&points);
        let radius = points
            .iter()
            .map(|&p| self.kernel.compute(&center, self.dataset.vector(p)))
            .fold(0.0, f64::max);

        if points.len() <= self.max_leaf_size {
            return self.push_node(center, radius, NodeKind::Clique { points });
        }

        let (left, right) = self.split(&center, points);
        let left = self.build(left);
        let right = self.build(right);
        self.push_node(center, radius, NodeKind::Ball { left, right })
    }

    fn push_node(&mut self, center: Vec<f32>, radius: f64, kind: NodeKind) -> usize {
        self.nodes.push(Node {
            center,
            radius,
            kind,
            bound: f64::INFINITY,
            component: None,
            min_core: 0.0,
        });
        self.nodes.len() - 1
    }

    /// Two-pole split: farthest point A from the centroid, farthest point B
    /// from A, then every point goes to the nearer pole (ties to A).
    fn split(&self, center: &[f32], points: Vec<usize>) -> (Vec<usize>, Vec<usize>) {
        let a = self.farthest_from(center, &points);
        let pole_a = self.dataset.vector(a);
        let b = self.farthest_from(pole_a, &points);
        let pole_b = self.dataset.vector(b);

        let mut left = Vec::with_capacity(points.len());
        let mut right = Vec::with_capacity(points.len());
        for &p in &points {
            let v = self.dataset.vector(p);
            if self.kernel.compute(v, pole_a) <= self.kernel.compute(v, pole_b) {
                left.push(p);
            } else {
                right.push(p);
            }
        }

        // Identical vectors put everything on one side.
        if left.is_empty() || right.is_empty() {
            let mut points = points;
            let right = points.split_off(points.len() / 2);
            return (points, right);
        }
        (left, right)
    }

    fn farthest_from(&self, from: &[f32], points: &[usize]) -> usize {
        let mut best = points[0];
        let mut best_dist = f64::NEG_INFINITY;
        for &p in points {
            let d = self.kernel.compute(from, self.dataset.vector(p));
            if d > best_dist {
                best = p;
                best_dist = d;
            }
        }
        best
    }

    fn centroid(&self, points: &[usize]) -> Vec<f32> {
        let mut sum = vec![0.0f64; self.dataset.dim()];
        for &p in points {
            for (s, &x) in sum.iter_mut().zip(self.dataset.vector(p)) {
                *s += x as f64;
            }
        }
        let n = points.len() as f64;
        sum.into_iter().map(|s| (s / n) as f32).collect()
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of point pairs currently held by the distance cache.
    pub fn cached_pairs(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.len())
    }

    pub(crate) fn root(&self) -> Option<usize> {
        self.root
    }

    pub(crate) fn children(&self, node: usize) -> Option<(usize, usize)> {
        match self.nodes[node].kind {
            NodeKind::Ball { left, right } => Some((left, right)),
            NodeKind::Clique { .. } => None,
        }
    }

    /// Points of a leaf; empty for internal nodes.
    pub(crate) fn leaf_points(&self, node: usize) -> &[usize] {
        match &self.nodes[node].kind {
            NodeKind::Clique { points } => points,
            NodeKind::Ball { .. } => &[],
        }
    }

    fn collect_points(&self, node: usize, out: &mut Vec<usize>) {
        let mut stack = vec![node];
        while let Some(idx) = stack.pop() {
            match &self.nodes[idx].kind {
                NodeKind::Clique { points } => out.extend_from_slice(points),
                NodeKind::Ball { left, right } => {
                    stack.push(*right);
                    stack.push(*left);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Distances and bounds
    // -----------------------------------------------------------------------

    /// Uncached kernel distance between two points.
    pub(crate) fn raw_distance(&self, a: usize, b: usize) -> f64 {
        self.kernel
            .compute(self.dataset.vector(a), self.dataset.vector(b))
    }

    /// Kernel distance through the pairwise cache.
    pub(crate) fn distance(&mut self, a: usize, b: usize) -> f64 {
        let n = self.dataset.len();
        let key = if a < b { a * n + b } else { b * n + a };
        if let Some(&d) = self.cache.as_ref().and_then(|c| c.get(&key)) {
            return d;
        }
        let d = self.raw_distance(a, b);
        if let Some(cache) = &mut self.cache {
            cache.insert(key, d);
        }
        d
    }

    /// Lower bound on the distance between any point of `q` and any point of
    /// `r`. A node against itself yields negative infinity so the root is
    /// always traversed against itself.
    pub(crate) fn node_distance(&self, q: usize, r: usize) -> f64 {
        if q == r {
            return f64::NEG_INFINITY;
        }
        let (nq, nr) = (&self.nodes[q], &self.nodes[r]);
        let centers = self
            .kernel
            .to_linear(self.kernel.compute(&nq.center, &nr.center));
        let gap =
            centers - self.kernel.to_linear(nq.radius) - self.kernel.to_linear(nr.radius);
        if gap <= 0.0 {
            0.0
        } else {
            self.kernel.from_linear(gap)
        }
    }

    /// Nearest and farthest possible kernel distance from `point` to any
    /// point below `node`.
    fn point_node_range(&self, point: &[f32], node: usize) -> (f64, f64) {
        let nd = &self.nodes[node];
        let center = self.kernel.to_linear(self.kernel.compute(point, &nd.center));
        let radius = self.kernel.to_linear(nd.radius);
        (
            self.kernel.from_linear((center - radius).max(0.0)),
            self.kernel.from_linear(center + radius),
        )
    }

    pub(crate) fn reset_bounds(&mut self) {
        for node in &mut self.nodes {
            node.bound = f64::INFINITY;
        }
    }

    /// Recomputes the "fully confined to one component" flag of every node
    /// from the per-point component ids.
    pub(crate) fn update_components(&mut self, components: &[usize]) {
        for idx in 0..self.nodes.len() {
            let component = match &self.nodes[idx].kind {
                NodeKind::Clique { points } => {
                    let first = components[points[0]];
                    points
                        .iter()
                        .all(|&p| components[p] == first)
                        .then_some(first)
                }
                NodeKind::Ball { left, right } => {
                    match (self.nodes[*left].component, self.nodes[*right].component) {
                        (Some(a), Some(b)) if a == b => Some(a),
                        _ => None,
                    }
                }
            };
            self.nodes[idx].component = component;
        }
    }

    fn update_min_core(&mut self) {
        for idx in 0..self.nodes.len() {
            let min_core = match &self.nodes[idx].kind {
                NodeKind::Clique { points } => points
                    .iter()
                    .map(|&p| self.core[p])
                    .fold(f64::INFINITY, f64::min),
                NodeKind::Ball { left, right } => {
                    self.nodes[*left].min_core.min(self.nodes[*right].min_core)
                }
            };
            self.nodes[idx].min_core = min_core;
        }
    }

    // -----------------------------------------------------------------------
    // Core distances
    // -----------------------------------------------------------------------

    /// Finds the `k` nearest neighbours of every point (self excluded) and
    /// sets each core distance to the farthest of them.
    ///
    /// With a `prior` table, entries whose neighbours are all still present
    /// are reused, only points absent from the table are searched from
    /// scratch, and those new points then patch the reused entries they are
    /// closer to.
    pub fn precalculate_core_distances(&mut self, k: usize, prior: Option<&CoreNeighborTable>) {
        let n = self.dataset.len();
        self.neighbors = vec![Vec::new(); n];
        self.core = vec![0.0; n];
        if n == 0 {
            return;
        }
        let k = k.max(1);

        match prior {
            Some(table) if !table.is_empty() => self.patch_core_neighbors(k, table),
            _ => self.search_core_neighbors(k),
        }

        self.core = self
            .neighbors
            .iter()
            .map(|nb| nb.last().map_or(0.0, |&(_, d)| d))
            .collect();
        self.update_min_core();
    }

    fn search_core_neighbors(&mut self, k: usize) {
        let Some(root) = self.root else {
            return;
        };
        self.reset_bounds();
        let mut rule = KnnRule::new(self.dataset.len(), k);
        dualtree::traverse(self, &mut rule, root, root);
        self.neighbors = rule.into_neighbors();
    }

    fn patch_core_neighbors(&mut self, k: usize, prior: &CoreNeighborTable) {
        let n = self.dataset.len();
        let want = k.min(n - 1);
        let mut reused = vec![false; n];
        let mut fresh = Vec::new();

        for i in 0..n {
            let label = self.dataset.label(i);
            let Some(old) = prior.get(&label) else {
                fresh.push(i);
                self.neighbors[i] = self.search_point(i, k);
                continue;
            };
            match self.reuse_entry(i, k, old) {
                Some(list) if list.len() >= want => {
                    self.neighbors[i] = list;
                    reused[i] = true;
                }
                _ => self.neighbors[i] = self.search_point(i, k),
            }
        }

        let reused_count = reused.iter().filter(|&&r| r).count();
        debug!(
            "hdbscan: core neighbours: {} reused, {} new, {} searched again",
            reused_count,
            fresh.len(),
            n - reused_count - fresh.len()
        );
        if fresh.is_empty() || reused_count == 0 {
            return;
        }

        let mut radius: f64 = 0.0;
        for i in (0..n).filter(|&i| reused[i]) {
            let list = &self.neighbors[i];
            match list.last() {
                Some(&(_, d)) if list.len() >= k => radius = radius.max(d),
                _ => radius = f64::INFINITY,
            }
        }

        for p in fresh {
            for q in self.cached_range(p, radius) {
                if !reused[q] {
                    continue;
                }
                let d = self.distance(p, q);
                insert_neighbor(&mut self.neighbors[q], k, p, d);
            }
        }
    }

    /// Translates a prior entry to dense indices, or `None` when one of its
    /// first `k` neighbours is gone.
    fn reuse_entry(&self, i: usize, k: usize, old: &[(Label, f64)]) -> Option<Vec<(usize, f64)>> {
        let mut list = Vec::with_capacity(k);
        for &(label, d) in old.iter().take(k) {
            let j = self.dataset.index_of(label)?;
            if j == i {
                return None;
            }
            list.push((j, d));
        }
        list.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        Some(list)
    }

    /// Branch-and-bound k-NN for a single point of the dataset.
    fn search_point(&self, i: usize, k: usize) -> Vec<(usize, f64)> {
        let mut best = Vec::with_capacity(k + 1);
        if let Some(root) = self.root {
            self.search_point_node(i, k, root, &mut best);
        }
        best
    }

    fn search_point_node(&self, i: usize, k: usize, node: usize, best: &mut Vec<(usize, f64)>) {
        let point = self.dataset.vector(i);
        let (nearest, _) = self.point_node_range(point, node);
        if best.len() >= k && nearest > best[k - 1].1 {
            return;
        }
        match &self.nodes[node].kind {
            NodeKind::Clique { points } => {
                for &j in points {
                    if j != i {
                        insert_neighbor(best, k, j, self.raw_distance(i, j));
                    }
                }
            }
            NodeKind::Ball { left, right } => {
                let (dl, _) = self.point_node_range(point, *left);
                let (dr, _) = self.point_node_range(point, *right);
                let (first, second) = if dl <= dr {
                    (*left, *right)
                } else {
                    (*right, *left)
                };
                self.search_point_node(i, k, first, best);
                self.search_point_node(i, k, second, best);
            }
        }
    }

    /// Returns the `k` nearest neighbours of a labelled point, self excluded.
    pub fn core_neighbors(&self, label: Label, k: usize) -> Option<Vec<(Label, f64)>> {
        let i = self.dataset.index_of(label)?;
        Some(
            self.search_point(i, k.max(1))
                .into_iter()
                .map(|(j, d)| (self.dataset.label(j), d))
                .collect(),
        )
    }

    /// All points (self excluded) within `radius` kernel distance of point
    /// `p`. A subtree whose farthest possible distance is within the radius
    /// is taken whole without per-point checks.
    pub(crate) fn cached_range(&mut self, p: usize, radius: f64) -> Vec<usize> {
        let mut found = Vec::new();
        let Some(root) = self.root else {
            return found;
        };
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            let (nearest, farthest) = self.point_node_range(self.dataset.vector(p), node);
            if nearest > radius {
                continue;
            }
            if farthest <= radius {
                self.collect_points(node, &mut found);
                continue;
            }
            match &self.nodes[node].kind {
                NodeKind::Ball { left, right } => {
                    stack.push(*right);
                    stack.push(*left);
                }
                NodeKind::Clique { points } => {
                    for j in points.clone() {
                        if self.distance(p, j) <= radius {
                            found.push(j);
                        }
                    }
                }
            }
        }
        found.retain(|&j| j != p);
        found
    }

    /// Labels within `radius` kernel distance of a labelled point.
    pub fn range(&mut self, label: Label, radius: f64) -> Option<Vec<Label>> {
        let p = self.dataset.index_of(label)?;
        let found = self.cached_range(p, radius);
        Some(found.into_iter().map(|j| self.dataset.label(j)).collect())
    }

    pub(crate) fn core_at(&self, i: usize) -> f64 {
        self.core[i]
    }

    pub(crate) fn neighbors_at(&self, i: usize) -> &[(usize, f64)] {
        &self.neighbors[i]
    }

    /// Core distance of a labelled point, in kernel units.
    pub fn core_distance(&self, label: Label) -> Option<f64> {
        let i = self.dataset.index_of(label)?;
        self.core.get(i).copied()
    }

    /// max(raw distance, core(a), core(b)) over dense indices.
    pub(crate) fn compute_mrd(&mut self, a: usize, b: usize) -> f64 {
        self.distance(a, b).max(self.core[a]).max(self.core[b])
    }

    /// Mutual reachability distance between two labelled points.
    pub fn mrd(&mut self, a: Label, b: Label) -> Option<f64> {
        let i = self.dataset.index_of(a)?;
        let j = self.dataset.index_of(b)?;
        Some(self.compute_mrd(i, j))
    }

    /// Exports the current neighbour lists keyed by label.
    pub fn core_neighbor_table(&self) -> CoreNeighborTable {
        self.neighbors
            .iter()
            .enumerate()
            .map(|(i, list)| {
                (
                    self.dataset.label(i),
                    list.iter()
                        .map(|&(j, d)| (self.dataset.label(j), d))
                        .collect(),
                )
            })
            .collect()
    }
}

impl<K: Kernel> fmt::Debug for BallTree<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BallTree")
            .field("points", &self.dataset.len())
            .field("dim", &self.dataset.dim())
            .field("nodes", &self.nodes.len())
            .field("max_leaf_size", &self.max_leaf_size)
            .field("cached_pairs", &self.cached_pairs())
            .finish()
    }
}

/// Inserts `(j, d)` into an ascending best-k list ordered by
/// `(distance, index)`, keeping at most `k` entries.
pub(crate) fn insert_neighbor(list: &mut Vec<(usize, f64)>, k: usize, j: usize, d: f64) {
    if list.len() >= k {
        let (lj, ld) = list[k - 1];
        if d > ld || (d == ld && j >= lj) {
            return;
        }
    }
    if list.iter().any(|&(x, _)| x == j) {
        return;
    }
    let pos = list.partition_point(|&(x, dx)| dx < d || (dx == d && x < j));
    list.insert(pos, (j, d));
    list.truncate(k);
}
