use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `cluster_id` of a detection that a run looked at and left out.
pub const REJECTED: i64 = -1;

/// Face bounding box, relative to the image (0..1).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// One detected face and its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: u64,
    pub user_id: String,
    pub file_id: u64,
    #[serde(default)]
    pub bbox: BoundingBox,
    pub vector: Vec<f32>,
    /// Exclusion radius around the centroid of the detection's cluster.
    /// 0 means unset.
    #[serde(default)]
    pub threshold: f32,
    /// `None` until clustered, [`REJECTED`] for noise.
    #[serde(default)]
    pub cluster_id: Option<i64>,
}

impl Detection {
    pub fn is_unclustered(&self) -> bool {
        self.cluster_id.is_none()
    }

    pub fn is_rejected(&self) -> bool {
        self.cluster_id == Some(REJECTED)
    }

    /// The cluster the detection belongs to, if any.
    pub fn cluster(&self) -> Option<i64> {
        self.cluster_id.filter(|&id| id != REJECTED)
    }
}

/// A person, as far as clustering is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: i64,
    pub user_id: String,
    #[serde(default)]
    pub title: String,
}

/// Outcome of one clustering pass for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: bool,
    /// Set when the pass ended early without writing anything.
    pub aborted: Option<String>,
    pub error: Option<String>,
    pub dataset_size: usize,
    pub anchors: usize,
    pub clusters_found: usize,
    pub assigned: usize,
    pub rejected: usize,
    pub created_clusters: usize,
    /// Clusters whose overlap fell between the new and existing thresholds.
    pub ambiguous_clusters: usize,
}

impl RunStatus {
    pub fn started(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            success: false,
            aborted: None,
            error: None,
            dataset_size: 0,
            anchors: 0,
            clusters_found: 0,
            assigned: 0,
            rejected: 0,
            created_clusters: 0,
            ambiguous_clusters: 0,
        }
    }
}
