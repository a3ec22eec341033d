use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::FaceClusterError;
use crate::types::{Cluster, Detection, REJECTED, RunStatus};

/// Persistence the analyzer reads detections from and writes assignments to.
///
/// Implementations must be safe for concurrent use. Every `assign` is an
/// independent write. Use [`MemoryStore`] for tests and one-shot runs.
pub trait FaceStore: Send + Sync {
    /// Clusters owned by `user_id`, ordered by id.
    fn clusters_by_user(&self, user_id: &str) -> Result<Vec<Cluster>, FaceClusterError>;

    /// Detections currently assigned to `cluster_id`, ordered by id.
    fn detections_by_cluster(&self, cluster_id: i64) -> Result<Vec<Detection>, FaceClusterError>;

    /// Detections of `user_id` that were never clustered, ordered by id.
    /// A `limit` of 0 means no limit.
    fn unclustered_by_user(&self, user_id: &str, limit: usize) -> Result<Vec<Detection>, FaceClusterError>;

    /// Detections of `user_id` previously rejected as noise, ordered by id.
    fn rejected_by_user(&self, user_id: &str) -> Result<Vec<Detection>, FaceClusterError>;

    /// Creates an empty cluster for `user_id`.
    fn create_cluster(&self, user_id: &str) -> Result<Cluster, FaceClusterError>;

    /// Sets a detection's cluster id. `Some(REJECTED)` marks it as noise.
    fn assign(&self, detection_id: u64, cluster_id: Option<i64>) -> Result<(), FaceClusterError>;

    /// Persists the outcome of a run.
    fn record_status(&self, status: &RunStatus) -> Result<(), FaceClusterError>;
}

/// In-memory [`FaceStore`] implementation.
/// Data is lost on restart. Suitable for testing or one-shot CLI runs.
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

struct MemoryStoreInner {
    detections: BTreeMap<u64, Detection>,
    clusters: BTreeMap<i64, Cluster>,
    next_cluster: i64,
    statuses: Vec<RunStatus>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryStoreInner {
                detections: BTreeMap::new(),
                clusters: BTreeMap::new(),
                next_cluster: 1,
                statuses: Vec::new(),
            }),
        }
    }

    /// Builds a store from existing records. New cluster ids continue after
    /// the largest one given.
    pub fn from_parts(
        detections: impl IntoIterator<Item = Detection>,
        clusters: impl IntoIterator<Item = Cluster>,
    ) -> Self {
        let clusters: BTreeMap<i64, Cluster> = clusters.into_iter().map(|c| (c.id, c)).collect();
        let next_cluster = clusters.keys().next_back().map_or(1, |&id| (id + 1).max(1));
        Self {
            inner: Mutex::new(MemoryStoreInner {
                detections: detections.into_iter().map(|d| (d.id, d)).collect(),
                clusters,
                next_cluster,
                statuses: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryStoreInner>, FaceClusterError> {
        self.inner
            .lock()
            .map_err(|_| FaceClusterError::Store("memory store lock poisoned".into()))
    }

    /// Inserts or replaces a detection.
    pub fn upsert_detection(&self, detection: Detection) -> Result<(), FaceClusterError> {
        self.lock()?.detections.insert(detection.id, detection);
        Ok(())
    }

    pub fn detection(&self, id: u64) -> Result<Option<Detection>, FaceClusterError> {
        Ok(self.lock()?.detections.get(&id).cloned())
    }

    /// Snapshot of every detection, ordered by id.
    pub fn detections(&self) -> Result<Vec<Detection>, FaceClusterError> {
        Ok(self.lock()?.detections.values().cloned().collect())
    }

    /// Snapshot of every cluster, ordered by id.
    pub fn clusters(&self) -> Result<Vec<Cluster>, FaceClusterError> {
        Ok(self.lock()?.clusters.values().cloned().collect())
    }

    /// Run statuses in the order they were recorded.
    pub fn statuses(&self) -> Result<Vec<RunStatus>, FaceClusterError> {
        Ok(self.lock()?.statuses.clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FaceStore for MemoryStore {
    fn clusters_by_user(&self, user_id: &str) -> Result<Vec<Cluster>, FaceClusterError> {
        let inner = self.lock()?;
        Ok(inner
            .clusters
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    fn detections_by_cluster(&self, cluster_id: i64) -> Result<Vec<Detection>, FaceClusterError> {
        let inner = self.lock()?;
        if !inner.clusters.contains_key(&cluster_id) {
            return Err(FaceClusterError::UnknownCluster(cluster_id));
        }
        Ok(inner
            .detections
            .values()
            .filter(|d| d.cluster_id == Some(cluster_id))
            .cloned()
            .collect())
    }

    fn unclustered_by_user(&self, user_id: &str, limit: usize) -> Result<Vec<Detection>, FaceClusterError> {
        let inner = self.lock()?;
        let limit = if limit == 0 { usize::MAX } else { limit };
        Ok(inner
            .detections
            .values()
            .filter(|d| d.user_id == user_id && d.is_unclustered())
            .take(limit)
            .cloned()
            .collect())
    }

    fn rejected_by_user(&self, user_id: &str) -> Result<Vec<Detection>, FaceClusterError> {
        let inner = self.lock()?;
        Ok(inner
            .detections
            .values()
            .filter(|d| d.user_id == user_id && d.is_rejected())
            .cloned()
            .collect())
    }

    fn create_cluster(&self, user_id: &str) -> Result<Cluster, FaceClusterError> {
        let mut inner = self.lock()?;
        let cluster = Cluster {
            id: inner.next_cluster,
            user_id: user_id.to_string(),
            title: String::new(),
        };
        inner.next_cluster += 1;
        inner.clusters.insert(cluster.id, cluster.clone());
        Ok(cluster)
    }

    fn assign(&self, detection_id: u64, cluster_id: Option<i64>) -> Result<(), FaceClusterError> {
        let mut inner = self.lock()?;
        if let Some(id) = cluster_id {
            if id != REJECTED && !inner.clusters.contains_key(&id) {
                return Err(FaceClusterError::UnknownCluster(id));
            }
        }
        let detection = inner
            .detections
            .get_mut(&detection_id)
            .ok_or_else(|| FaceClusterError::Store(format!("unknown detection {detection_id}")))?;
        detection.cluster_id = cluster_id;
        Ok(())
    }

    fn record_status(&self, status: &RunStatus) -> Result<(), FaceClusterError> {
        self.lock()?.statuses.push(status.clone());
        Ok(())
    }
}
