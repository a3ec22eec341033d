use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use facetag_hdbscan::{CoreNeighborTable, Dataset, Hdbscan, HdbscanConfig};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::config::AnalyzerConfig;
use crate::error::FaceClusterError;
use crate::store::FaceStore;
use crate::types::{Detection, REJECTED, RunStatus};

/// Per-user clustering driver.
///
/// Each [`run`](FaceClusterAnalyzer::run) samples anchors from the user's
/// existing clusters, adds a batch of new (and some previously rejected)
/// detections, clusters them together and maps every flat cluster back onto
/// a persistent cluster id by anchor vote. Callers must not run two passes
/// for the same user at once.
///
/// Core-neighbour tables are kept per user between runs so points seen
/// before are not searched again. Detection vectors are assumed immutable.
pub struct FaceClusterAnalyzer {
    config: AnalyzerConfig,
    store: Arc<dyn FaceStore>,
    rng: Mutex<StdRng>,
    statuses: Mutex<HashMap<String, RunStatus>>,
    neighbors: Mutex<HashMap<String, CoreNeighborTable>>,
}

enum Vote {
    Keep(i64),
    New,
    Ambiguous,
}

impl FaceClusterAnalyzer {
    /// Creates an analyzer. Zero config values fall back to defaults.
    pub fn new(config: AnalyzerConfig, store: Arc<dyn FaceStore>) -> Result<Self, FaceClusterError> {
        let config = config.with_defaults();
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            config,
            store,
            rng: Mutex::new(rng),
            statuses: Mutex::new(HashMap::new()),
            neighbors: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Status of the last run for `user_id`.
    pub fn status(&self, user_id: &str) -> Option<RunStatus> {
        self.statuses.lock().ok()?.get(user_id).cloned()
    }

    /// Runs one clustering pass for `user_id`.
    ///
    /// A pass with nothing to do ends successfully with
    /// [`RunStatus::aborted`] set. A store failure stops the pass where it
    /// happened; writes already made stay.
    pub fn run(&self, user_id: &str) -> Result<RunStatus, FaceClusterError> {
        let mut status = RunStatus::started(user_id);
        let result = self.cluster_user(user_id, &mut status);
        status.finished_at = Some(Utc::now());
        status.success = result.is_ok();

        match &result {
            Ok(()) if status.aborted.is_none() => info!(
                "facecluster: user {}: {} points ({} anchors), {} clusters, {} assigned, {} rejected, {} new, {} ambiguous",
                user_id,
                status.dataset_size,
                status.anchors,
                status.clusters_found,
                status.assigned,
                status.rejected,
                status.created_clusters,
                status.ambiguous_clusters
            ),
            Ok(()) => {}
            Err(e) => {
                warn!("facecluster: user {}: run failed: {}", user_id, e);
                status.error = Some(e.to_string());
            }
        }

        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.insert(user_id.to_string(), status.clone());
        }
        if let Err(e) = self.store.record_status(&status) {
            warn!("facecluster: user {}: record status: {}", user_id, e);
        }
        result.map(|()| status)
    }

    fn cluster_user(&self, user_id: &str, status: &mut RunStatus) -> Result<(), FaceClusterError> {
        let config = &self.config;
        let mut rng = lock(&self.rng)?;

        // Anchors carry the identity of existing clusters into this run.
        let clusters = self.store.clusters_by_user(user_id)?;
        let per_cluster = config.anchors_per_cluster(clusters.len());
        let mut anchors: Vec<Detection> = Vec::new();
        let mut sampled: HashMap<i64, usize> = HashMap::new();
        for cluster in &clusters {
            let members = self.store.detections_by_cluster(cluster.id)?;
            let before = anchors.len();
            anchors.extend(members.choose_multiple(&mut *rng, per_cluster).cloned());
            if anchors.len() > before {
                sampled.insert(cluster.id, anchors.len() - before);
            }
        }

        let big_enough = |d: &Detection| {
            d.bbox.width >= config.min_detection_size && d.bbox.height >= config.min_detection_size
        };
        let mut fresh: Vec<Detection> = self
            .store
            .unclustered_by_user(user_id, config.batch_size)?
            .into_iter()
            .filter(|d| big_enough(d))
            .collect();
        if fresh.is_empty() {
            return abort(user_id, status, "no unclustered detections".into());
        }

        let capacity = match config.batch_size {
            0 => usize::MAX,
            batch => batch.saturating_sub(fresh.len()),
        };
        if capacity > 0 {
            let rejected = self.store.rejected_by_user(user_id)?;
            let take = capacity.min(rejected.len());
            fresh.extend(
                rejected
                    .choose_multiple(&mut *rng, take)
                    .filter(|d| big_enough(*d))
                    .cloned(),
            );
        }
        drop(rng);

        let n = anchors.len() + fresh.len();
        status.dataset_size = n;
        status.anchors = anchors.len();
        if n < config.min_dataset_size {
            return abort(
                user_id,
                status,
                format!("dataset too small: {} < {}", n, config.min_dataset_size),
            );
        }

        let mut dataset = Dataset::new();
        for d in anchors.iter().chain(&fresh) {
            dataset.push(d.id, d.vector.clone())?;
        }
        let hdbscan_config = HdbscanConfig {
            min_cluster_size: scaled(n, 4.7),
            sample_size: scaled(n, 5.6),
            max_leaf_size: config.max_leaf_size,
            approximate: config.approximate_mst,
            cache_distances: true,
        };
        debug!(
            "facecluster: user {}: {} anchors from {} clusters, {} new, {:?}",
            user_id,
            anchors.len(),
            sampled.len(),
            fresh.len(),
            hdbscan_config
        );

        let prior = lock(&self.neighbors)?.remove(user_id);
        let mut hdbscan = match &prior {
            Some(table) => Hdbscan::with_core_neighbors(dataset, hdbscan_config, table)?,
            None => Hdbscan::new(dataset, hdbscan_config)?,
        };
        let flat = hdbscan.predict(config.min_cluster_separation, config.max_cluster_edge_length);
        lock(&self.neighbors)?.insert(user_id.to_string(), hdbscan.core_neighbor_table());
        status.clusters_found = flat.len();

        let by_id: HashMap<u64, &Detection> = anchors.iter().chain(&fresh).map(|d| (d.id, d)).collect();
        let mut assigned: HashSet<u64> = HashSet::new();
        for cluster in &flat {
            let members: Vec<&Detection> = cluster
                .labels()
                .filter_map(|label| by_id.get(&label).copied())
                .collect();
            let center = centroid(&members);
            let eligible: Vec<&Detection> = members
                .iter()
                .copied()
                .filter(|d| !excluded(d, &center))
                .collect();
            if eligible.is_empty() {
                continue;
            }

            let target = match self.vote(&members, &sampled) {
                Vote::Keep(id) => id,
                Vote::New => {
                    status.created_clusters += 1;
                    self.store.create_cluster(user_id)?.id
                }
                Vote::Ambiguous => {
                    debug!(
                        "facecluster: user {}: skipping ambiguous cluster of {}",
                        user_id,
                        members.len()
                    );
                    status.ambiguous_clusters += 1;
                    continue;
                }
            };

            for d in eligible {
                if d.cluster_id != Some(target) {
                    self.store.assign(d.id, Some(target))?;
                }
                if d.cluster().is_none() {
                    status.assigned += 1;
                }
                assigned.insert(d.id);
            }
        }

        for d in &fresh {
            if assigned.contains(&d.id) {
                continue;
            }
            if !d.is_rejected() {
                self.store.assign(d.id, Some(REJECTED))?;
            }
            status.rejected += 1;
        }
        Ok(())
    }

    /// Anchors vote for the cluster they were sampled from; the winner's
    /// share of its own sampled anchors decides the identity.
    fn vote(&self, members: &[&Detection], sampled: &HashMap<i64, usize>) -> Vote {
        let mut votes: BTreeMap<i64, usize> = BTreeMap::new();
        for d in members {
            if let Some(id) = d.cluster().filter(|id| sampled.contains_key(id)) {
                *votes.entry(id).or_default() += 1;
            }
        }

        // Ascending ids, so ties go to the smallest.
        let mut winner: Option<(i64, usize)> = None;
        for (&id, &count) in &votes {
            match winner {
                Some((_, best)) if count <= best => {}
                _ => winner = Some((id, count)),
            }
        }

        let overlap = winner.map_or(0.0, |(id, count)| {
            count as f64 / sampled.get(&id).copied().unwrap_or(1) as f64
        });
        match winner {
            Some((id, _)) if overlap > self.config.min_overlap_existing_cluster => Vote::Keep(id),
            _ if overlap < self.config.max_overlap_new_cluster => Vote::New,
            _ => Vote::Ambiguous,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, FaceClusterError> {
    mutex
        .lock()
        .map_err(|_| FaceClusterError::Store("analyzer state lock poisoned".into()))
}

fn abort(user_id: &str, status: &mut RunStatus, reason: String) -> Result<(), FaceClusterError> {
    info!("facecluster: user {}: skipped: {}", user_id, reason);
    status.aborted = Some(reason);
    Ok(())
}

/// `max(2, round(n^(1/root)))`.
fn scaled(n: usize, root: f64) -> usize {
    ((n as f64).powf(1.0 / root).round() as usize).max(2)
}

fn centroid(members: &[&Detection]) -> Vec<f32> {
    let dim = members.first().map_or(0, |d| d.vector.len());
    let mut sum = vec![0.0f64; dim];
    for d in members {
        for (s, &x) in sum.iter_mut().zip(&d.vector) {
            *s += x as f64;
        }
    }
    let n = members.len().max(1) as f64;
    sum.into_iter().map(|s| (s / n) as f32).collect()
}

/// A manual threshold keeps a detection out of a cluster whose centroid is
/// at least that far away.
fn excluded(d: &Detection, centroid: &[f32]) -> bool {
    if d.threshold <= 0.0 || centroid.iter().all(|&x| x == 0.0) {
        return false;
    }
    let distance: f64 = d
        .vector
        .iter()
        .zip(centroid)
        .map(|(&a, &b)| {
            let diff = a as f64 - b as f64;
            diff * diff
        })
        .sum::<f64>()
        .sqrt();
    distance >= d.threshold as f64
}
