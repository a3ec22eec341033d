use serde::{Deserialize, Serialize};

use crate::error::FaceClusterError;

/// Tuning for [`crate::FaceClusterAnalyzer`].
///
/// Missing fields deserialize to their defaults, and [`with_defaults`]
/// replaces zero values the same way, so a partial YAML file is enough.
///
/// [`with_defaults`]: AnalyzerConfig::with_defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Runs with fewer points (anchors plus new detections) are skipped.
    pub min_dataset_size: usize,
    /// Clusters closer than this (linear distance) are folded together.
    pub min_cluster_separation: f64,
    /// Edges longer than this never hold a cluster together.
    pub max_cluster_edge_length: f64,
    /// Upper bound on new detections per run; 0 means unlimited.
    pub batch_size: usize,
    /// Faces narrower or shorter than this (relative) are left alone.
    pub min_detection_size: f32,
    /// Below this anchor overlap a flat cluster becomes a new person.
    pub max_overlap_new_cluster: f64,
    /// Above this anchor overlap a flat cluster keeps the old id.
    pub min_overlap_existing_cluster: f64,
    /// Total anchors spread across a user's clusters.
    pub anchor_budget: usize,
    pub min_anchors_per_cluster: usize,
    pub max_anchors_per_cluster: usize,
    pub max_leaf_size: usize,
    pub approximate_mst: bool,
    /// Fixed seed for anchor and rejected-detection sampling.
    pub seed: Option<u64>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            min_dataset_size: 120,
            min_cluster_separation: 0.35,
            max_cluster_edge_length: 0.5,
            batch_size: 0,
            min_detection_size: 0.03,
            max_overlap_new_cluster: 0.1,
            min_overlap_existing_cluster: 0.5,
            anchor_budget: 1000,
            min_anchors_per_cluster: 5,
            max_anchors_per_cluster: 50,
            max_leaf_size: 20,
            approximate_mst: false,
            seed: None,
        }
    }
}

impl AnalyzerConfig {
    /// Returns a copy with zero values replaced by defaults.
    pub fn with_defaults(&self) -> Self {
        let d = Self::default();
        let mut c = self.clone();
        if c.min_dataset_size == 0 {
            c.min_dataset_size = d.min_dataset_size;
        }
        if c.min_cluster_separation == 0.0 {
            c.min_cluster_separation = d.min_cluster_separation;
        }
        if c.max_cluster_edge_length == 0.0 {
            c.max_cluster_edge_length = d.max_cluster_edge_length;
        }
        if c.min_detection_size == 0.0 {
            c.min_detection_size = d.min_detection_size;
        }
        if c.max_overlap_new_cluster == 0.0 {
            c.max_overlap_new_cluster = d.max_overlap_new_cluster;
        }
        if c.min_overlap_existing_cluster == 0.0 {
            c.min_overlap_existing_cluster = d.min_overlap_existing_cluster;
        }
        if c.anchor_budget == 0 {
            c.anchor_budget = d.anchor_budget;
        }
        if c.min_anchors_per_cluster == 0 {
            c.min_anchors_per_cluster = d.min_anchors_per_cluster;
        }
        if c.max_anchors_per_cluster == 0 {
            c.max_anchors_per_cluster = d.max_anchors_per_cluster;
        }
        if c.max_leaf_size == 0 {
            c.max_leaf_size = d.max_leaf_size;
        }
        c
    }

    pub fn validate(&self) -> Result<(), FaceClusterError> {
        let non_negative = [
            ("min_cluster_separation", self.min_cluster_separation),
            ("max_cluster_edge_length", self.max_cluster_edge_length),
            ("min_detection_size", self.min_detection_size as f64),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(FaceClusterError::Config(format!(
                    "{name} must be a finite non-negative number, got {value}"
                )));
            }
        }
        for (name, value) in [
            ("max_overlap_new_cluster", self.max_overlap_new_cluster),
            ("min_overlap_existing_cluster", self.min_overlap_existing_cluster),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(FaceClusterError::Config(format!(
                    "{name} must be within 0..=1, got {value}"
                )));
            }
        }
        if self.max_overlap_new_cluster > self.min_overlap_existing_cluster {
            return Err(FaceClusterError::Config(format!(
                "max_overlap_new_cluster ({}) exceeds min_overlap_existing_cluster ({})",
                self.max_overlap_new_cluster, self.min_overlap_existing_cluster
            )));
        }
        if self.min_anchors_per_cluster > self.max_anchors_per_cluster {
            return Err(FaceClusterError::Config(format!(
                "min_anchors_per_cluster ({}) exceeds max_anchors_per_cluster ({})",
                self.min_anchors_per_cluster, self.max_anchors_per_cluster
            )));
        }
        Ok(())
    }

    /// Anchors to sample from each of `clusters` clusters.
    pub fn anchors_per_cluster(&self, clusters: usize) -> usize {
        if clusters == 0 {
            return 0;
        }
        (self.anchor_budget / clusters).clamp(self.min_anchors_per_cluster, self.max_anchors_per_cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let c: AnalyzerConfig = serde_yaml::from_str("batch_size: 500\nseed: 42\n").unwrap();
        assert_eq!(c.batch_size, 500);
        assert_eq!(c.seed, Some(42));
        assert_eq!(c.min_dataset_size, 120);
        assert_eq!(c.max_cluster_edge_length, 0.5);
    }

    #[test]
    fn with_defaults_replaces_zeros() {
        let c = AnalyzerConfig {
            min_dataset_size: 0,
            min_cluster_separation: 0.0,
            anchor_budget: 0,
            max_leaf_size: 0,
            batch_size: 0,
            ..Default::default()
        }
        .with_defaults();
        assert_eq!(c, AnalyzerConfig::default());
    }

    #[test]
    fn validate_rejects_inverted_ranges() {
        let c = AnalyzerConfig {
            max_overlap_new_cluster: 0.8,
            min_overlap_existing_cluster: 0.5,
            ..Default::default()
        };
        assert!(matches!(c.validate(), Err(FaceClusterError::Config(_))));

        let c = AnalyzerConfig {
            min_anchors_per_cluster: 60,
            ..Default::default()
        };
        assert!(c.validate().is_err());

        let c = AnalyzerConfig {
            max_cluster_edge_length: f64::NAN,
            ..Default::default()
        };
        assert!(c.validate().is_err());

        assert!(AnalyzerConfig::default().validate().is_ok());
    }

    #[test]
    fn anchors_shrink_as_clusters_grow() {
        let c = AnalyzerConfig::default();
        assert_eq!(c.anchors_per_cluster(0), 0);
        assert_eq!(c.anchors_per_cluster(2), 50);
        assert_eq!(c.anchors_per_cluster(40), 25);
        assert_eq!(c.anchors_per_cluster(1000), 5);
    }
}
