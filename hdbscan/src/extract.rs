use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::dataset::Label;
use crate::mst::MstEdge;

/// A stable cluster selected by [`ClusterExtractor`].
#[derive(Debug, Clone, PartialEq)]
pub struct FlatCluster {
    members: Vec<(Label, f64)>,
    weight: f64,
    final_lambda: f64,
    core_edges: Vec<MstEdge>,
}

impl FlatCluster {
    /// Member labels with the lambda at which each left the cluster.
    pub fn members(&self) -> &[(Label, f64)] {
        &self.members
    }

    pub fn labels(&self) -> impl Iterator<Item = Label> + '_ {
        self.members.iter().map(|&(label, _)| label)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Excess-of-mass stability.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn final_lambda(&self) -> f64 {
        self.final_lambda
    }

    /// Edges still holding the cluster together when it was finalised.
    pub fn core_edges(&self) -> &[MstEdge] {
        &self.core_edges
    }
}

// ---------------------------------------------------------------------------
// Forest
// ---------------------------------------------------------------------------

/// The spanning forest being cut apart, longest edge first.
struct Forest {
    labels: Vec<Label>,
    /// Sorted ascending; an edge id is its position here.
    edges: Vec<MstEdge>,
    ends: Vec<(usize, usize)>,
    adjacency: Vec<Vec<(usize, usize)>>,
    alive: Vec<bool>,
}

/// Vertices and edges reached by a walk over live edges.
struct Side {
    vertices: Vec<usize>,
    edges: Vec<usize>,
}

impl Forest {
    fn new(edges: &[MstEdge]) -> Self {
        let mut edges = edges.to_vec();
        edges.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.from.cmp(&b.from))
                .then(a.to.cmp(&b.to))
        });

        let mut index: HashMap<Label, usize> = HashMap::new();
        let mut labels = Vec::new();
        let mut vertex = |label: Label, labels: &mut Vec<Label>| {
            *index.entry(label).or_insert_with(|| {
                labels.push(label);
                labels.len() - 1
            })
        };
        let ends: Vec<(usize, usize)> = edges
            .iter()
            .map(|e| (vertex(e.from, &mut labels), vertex(e.to, &mut labels)))
            .collect();

        let mut adjacency = vec![Vec::new(); labels.len()];
        for (id, &(a, b)) in ends.iter().enumerate() {
            adjacency[a].push((b, id));
            adjacency[b].push((a, id));
        }

        Self {
            alive: vec![true; edges.len()],
            labels,
            edges,
            ends,
            adjacency,
        }
    }

    /// Breadth-first walk over live edges from `start`, stopping once
    /// `limit` vertices were reached.
    fn walk(&self, start: usize, limit: usize) -> Side {
        let mut seen = HashSet::from([start]);
        let mut side = Side {
            vertices: vec![start],
            edges: Vec::new(),
        };
        let mut queue = VecDeque::from([start]);
        while let Some(v) = queue.pop_front() {
            for &(w, id) in &self.adjacency[v] {
                if side.vertices.len() >= limit {
                    return side;
                }
                if !self.alive[id] || !seen.insert(w) {
                    continue;
                }
                side.vertices.push(w);
                side.edges.push(id);
                queue.push_back(w);
            }
        }
        side
    }

    fn kill(&mut self, edges: &[usize]) {
        for &id in edges {
            self.alive[id] = false;
        }
    }

    /// Connected components of the whole forest, as root clusters.
    fn roots(&self) -> Vec<ClusterNode> {
        let mut visited = vec![false; self.labels.len()];
        let mut roots = Vec::new();
        for v in 0..self.labels.len() {
            if visited[v] {
                continue;
            }
            let side = self.walk(v, usize::MAX);
            for &w in &side.vertices {
                visited[w] = true;
            }
            roots.push(ClusterNode::new(v, side, 0.0));
        }
        roots
    }
}

// ---------------------------------------------------------------------------
// Cluster hierarchy
// ---------------------------------------------------------------------------

struct ClusterNode {
    /// Ascending edge ids; dead ones are skipped lazily.
    edges: Vec<usize>,
    vertices: usize,
    /// Any vertex still inside the cluster.
    anchor: usize,
    members: Vec<(usize, f64)>,
    weight: f64,
    lambda: f64,
    death: Option<usize>,
    core_edges: Vec<usize>,
}

impl ClusterNode {
    fn new(anchor: usize, side: Side, lambda: f64) -> Self {
        let mut edges = side.edges;
        edges.sort_unstable();
        Self {
            edges,
            vertices: side.vertices.len(),
            anchor,
            members: Vec::new(),
            weight: 0.0,
            lambda,
            death: None,
            core_edges: Vec::new(),
        }
    }

    fn pop_live(&mut self, alive: &[bool]) -> Option<usize> {
        while let Some(id) = self.edges.pop() {
            if alive[id] {
                return Some(id);
            }
        }
        None
    }
}

/// Excess-of-mass flat cluster selection over a mutual-reachability MST.
///
/// Edges are cut longest first. Sides smaller than `min_cluster_size` fall
/// out of the cluster, sides split by an edge shorter than
/// `min_cluster_separation` are folded back into the larger side, and
/// anything hanging on an edge longer than `max_edge_length` is noise.
#[derive(Debug, Clone, Copy)]
pub struct ClusterExtractor {
    min_cluster_size: usize,
    min_cluster_separation: f64,
    max_edge_length: f64,
}

impl ClusterExtractor {
    pub fn new(min_cluster_size: usize, min_cluster_separation: f64, max_edge_length: f64) -> Self {
        Self {
            min_cluster_size: min_cluster_size.max(1),
            min_cluster_separation,
            max_edge_length,
        }
    }

    /// Extracts flat clusters from linear-distance MST edges.
    pub fn extract(&self, edges: &[MstEdge]) -> Vec<FlatCluster> {
        let mut forest = Forest::new(edges);
        let mut clusters = Vec::new();
        for root in forest.roots() {
            for node in self.process(&mut forest, root, true) {
                if let Some(flat) = self.finalize(&forest, node) {
                    clusters.push(flat);
                }
            }
        }
        debug!(
            "hdbscan: extracted {} clusters from {} edges ({} points clustered)",
            clusters.len(),
            edges.len(),
            clusters.iter().map(FlatCluster::len).sum::<usize>()
        );
        clusters
    }

    /// Cuts `node` down and returns the clusters selected within it.
    fn process(&self, forest: &mut Forest, mut node: ClusterNode, is_root: bool) -> Vec<ClusterNode> {
        let m = self.min_cluster_size;
        loop {
            if node.vertices < m {
                let rest = forest.walk(node.anchor, usize::MAX);
                forest.kill(&rest.edges);
                node.members
                    .extend(rest.vertices.iter().map(|&v| (v, node.lambda)));
                node.core_edges = rest.edges;
                node.core_edges.extend(node.death);
                break;
            }
            let Some(id) = node.pop_live(&forest.alive) else {
                break;
            };

            let d = forest.edges[id].distance;
            let lambda = if d > 0.0 { 1.0 / d } else { node.lambda };
            node.weight += (lambda - node.lambda) * (node.vertices - 1) as f64;
            node.lambda = lambda;
            node.death = Some(id);
            forest.alive[id] = false;
            let (a, b) = forest.ends[id];

            let side_b = forest.walk(b, m);
            if side_b.vertices.len() < m {
                self.shed(forest, &mut node, side_b, d);
                node.anchor = a;
                continue;
            }
            let side_a = forest.walk(a, m);
            if side_a.vertices.len() < m {
                self.shed(forest, &mut node, side_a, d);
                node.anchor = b;
                continue;
            }

            let side_a = forest.walk(a, usize::MAX);
            let side_b = forest.walk(b, usize::MAX);

            if d < self.min_cluster_separation {
                if side_a.vertices.len() < side_b.vertices.len() {
                    self.shed(forest, &mut node, side_a, d);
                    node.anchor = b;
                } else {
                    self.shed(forest, &mut node, side_b, d);
                    node.anchor = a;
                }
                continue;
            }

            // Genuine split.
            let mut swallowed: Vec<usize> = side_a.vertices.clone();
            swallowed.extend_from_slice(&side_b.vertices);
            let mut core_edges: Vec<usize> = side_a.edges.clone();
            core_edges.extend_from_slice(&side_b.edges);
            core_edges.push(id);

            let mut selected = self.process(forest, ClusterNode::new(a, side_a, lambda), false);
            selected.extend(self.process(forest, ClusterNode::new(b, side_b, lambda), false));
            let children_weight: f64 = selected.iter().map(|c| c.weight).sum();

            if is_root || d > self.max_edge_length || children_weight > node.weight {
                return selected;
            }
            node.members
                .extend(swallowed.into_iter().map(|v| (v, lambda)));
            node.core_edges = core_edges;
            return vec![node];
        }

        // A root that never split is a single dense group. One that never
        // left lambda 0 only had zero-length edges: identical points.
        if !self.is_valid(forest, &node) || (is_root && node.lambda <= 0.0) {
            return Vec::new();
        }
        vec![node]
    }

    /// Drops a side that fell off `node`. Its vertices stay on as members
    /// unless the cut edge was too long.
    fn shed(&self, forest: &mut Forest, node: &mut ClusterNode, side: Side, d: f64) {
        forest.kill(&side.edges);
        node.vertices -= side.vertices.len();
        if d <= self.max_edge_length {
            let lambda = node.lambda;
            node.members
                .extend(side.vertices.into_iter().map(|v| (v, lambda)));
        }
    }

    fn death_distance(forest: &Forest, node: &ClusterNode) -> f64 {
        node.death.map_or(0.0, |id| forest.edges[id].distance)
    }

    fn is_valid(&self, forest: &Forest, node: &ClusterNode) -> bool {
        Self::death_distance(forest, node) <= self.max_edge_length
            && node.members.len() >= self.min_cluster_size
    }

    fn finalize(&self, forest: &Forest, node: ClusterNode) -> Option<FlatCluster> {
        if !self.is_valid(forest, &node) {
            return None;
        }
        let final_lambda = node.lambda;
        Some(FlatCluster {
            members: node
                .members
                .into_iter()
                .map(|(v, lambda)| (forest.labels[v], lambda))
                .collect(),
            weight: node.weight,
            final_lambda,
            core_edges: node
                .core_edges
                .into_iter()
                .map(|id| MstEdge {
                    final_lambda,
                    ..forest.edges[id]
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(from: Label, to: Label, distance: f64) -> MstEdge {
        MstEdge {
            from,
            to,
            distance,
            final_lambda: 0.0,
        }
    }

    /// Path `first..first+len` with every edge of length `step`.
    fn chain(first: Label, len: u64, step: f64) -> Vec<MstEdge> {
        (first..first + len - 1).map(|i| edge(i, i + 1, step)).collect()
    }

    fn sorted_sizes(clusters: &[FlatCluster]) -> Vec<usize> {
        let mut sizes: Vec<usize> = clusters.iter().map(FlatCluster::len).collect();
        sizes.sort_unstable();
        sizes
    }

    fn sorted_labels(cluster: &FlatCluster) -> Vec<Label> {
        let mut labels: Vec<Label> = cluster.labels().collect();
        labels.sort_unstable();
        labels
    }

    #[test]
    fn two_far_chains_become_two_clusters() {
        let mut edges = chain(0, 5, 0.1);
        edges.extend(chain(5, 5, 0.1));
        edges.push(edge(4, 5, 10.0));

        let clusters = ClusterExtractor::new(3, 0.35, 0.5).extract(&edges);
        assert_eq!(clusters.len(), 2);
        let mut groups: Vec<Vec<Label>> = clusters.iter().map(sorted_labels).collect();
        groups.sort();
        assert_eq!(groups, vec![vec![0, 1, 2, 3, 4], vec![5, 6, 7, 8, 9]]);

        for c in &clusters {
            assert!((c.final_lambda() - 10.0).abs() < 1e-9);
            assert!(c.members().iter().all(|&(_, l)| (l - 10.0).abs() < 1e-9));
            assert!((c.weight() - 39.6).abs() < 1e-9, "weight {}", c.weight());
            assert_eq!(c.core_edges().len(), 2);
            assert!(c.core_edges().iter().all(|e| e.final_lambda == c.final_lambda()));
        }
    }

    #[test]
    fn close_groups_are_folded_together() {
        let mut edges = chain(0, 5, 0.1);
        edges.extend(chain(5, 5, 0.1));
        edges.push(edge(4, 5, 0.2));
        edges.extend(chain(10, 5, 0.1));
        edges.push(edge(9, 10, 10.0));

        let clusters = ClusterExtractor::new(3, 0.35, 0.5).extract(&edges);
        assert_eq!(sorted_sizes(&clusters), vec![5, 10]);
    }

    #[test]
    fn sparse_group_is_noise() {
        let mut edges = chain(0, 5, 0.1);
        edges.extend(chain(5, 5, 0.8));
        edges.push(edge(4, 5, 10.0));

        let clusters = ClusterExtractor::new(3, 0.35, 0.5).extract(&edges);
        assert_eq!(clusters.len(), 1);
        assert_eq!(sorted_labels(&clusters[0]), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn long_pendant_is_dropped_as_noise() {
        let mut edges = chain(0, 5, 0.1);
        edges.push(edge(2, 42, 0.9));
        edges.extend(chain(5, 5, 0.1));
        edges.push(edge(4, 5, 10.0));

        let clusters = ClusterExtractor::new(3, 0.35, 0.5).extract(&edges);
        assert_eq!(clusters.len(), 2);
        assert!(clusters.iter().all(|c| c.labels().all(|l| l != 42)));
        assert_eq!(sorted_sizes(&clusters), vec![5, 5]);
    }

    #[test]
    fn stable_parent_beats_fragile_children() {
        let mut edges = chain(0, 3, 0.3);
        edges.push(edge(2, 3, 0.4));
        edges.extend(chain(3, 3, 0.3));
        edges.extend(chain(6, 3, 0.1));
        edges.push(edge(5, 6, 10.0));

        let clusters = ClusterExtractor::new(3, 0.35, 0.5).extract(&edges);
        assert_eq!(sorted_sizes(&clusters), vec![3, 6]);
    }

    #[test]
    fn dense_children_beat_their_parent() {
        let mut edges = chain(0, 3, 0.01);
        edges.push(edge(2, 3, 0.4));
        edges.extend(chain(3, 3, 0.01));
        edges.extend(chain(6, 3, 0.1));
        edges.push(edge(5, 6, 10.0));

        let clusters = ClusterExtractor::new(3, 0.35, 0.5).extract(&edges);
        assert_eq!(sorted_sizes(&clusters), vec![3, 3, 3]);
    }

    #[test]
    fn single_dense_chain_is_one_cluster() {
        let clusters = ClusterExtractor::new(3, 0.35, 0.5).extract(&chain(0, 20, 0.1));
        assert_eq!(clusters.len(), 1);
        assert_eq!(sorted_labels(&clusters[0]), (0..20).collect::<Vec<_>>());
        assert!((clusters[0].final_lambda() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn single_group_sheds_its_outlier() {
        let mut edges = chain(0, 8, 0.05);
        edges.push(edge(7, 99, 3.0));

        let clusters = ClusterExtractor::new(3, 0.35, 0.5).extract(&edges);
        assert_eq!(clusters.len(), 1);
        assert_eq!(sorted_labels(&clusters[0]), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn single_sparse_chain_is_noise() {
        let clusters = ClusterExtractor::new(3, 0.35, 0.5).extract(&chain(0, 10, 0.8));
        assert!(clusters.is_empty());
    }

    #[test]
    fn zero_length_edges_and_empty_input() {
        let extractor = ClusterExtractor::new(3, 0.35, 0.5);
        assert!(extractor.extract(&[]).is_empty());
        assert!(extractor.extract(&chain(0, 10, 0.0)).is_empty());
    }

    #[test]
    fn every_cluster_meets_the_minimum_size() {
        let mut edges = Vec::new();
        let mut next = 0;
        for (len, step) in [(4u64, 0.05), (2, 0.05), (7, 0.2), (3, 0.01)] {
            edges.extend(chain(next, len, step));
            if next > 0 {
                edges.push(edge(next - 1, next, 5.0));
            }
            next += len;
        }
        let clusters = ClusterExtractor::new(3, 0.35, 0.5).extract(&edges);
        assert!(!clusters.is_empty());
        assert!(clusters.iter().all(|c| c.len() >= 3));
    }
}
