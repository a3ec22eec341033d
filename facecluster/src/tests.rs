use std::sync::Arc;

use crate::analyzer::FaceClusterAnalyzer;
use crate::config::AnalyzerConfig;
use crate::error::FaceClusterError;
use crate::store::{FaceStore, MemoryStore};
use crate::types::{BoundingBox, Cluster, Detection, REJECTED, RunStatus};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const DIM: usize = 128;
const USER: &str = "alice";

/// A face whose embedding is constant except for its first component.
fn face(id: u64, x: f32) -> Detection {
    let mut vector = vec![0.5; DIM];
    vector[0] = x;
    Detection {
        id,
        user_id: USER.into(),
        file_id: id / 10,
        bbox: BoundingBox {
            x: 0.2,
            y: 0.2,
            width: 0.1,
            height: 0.12,
        },
        vector,
        threshold: 0.0,
        cluster_id: None,
    }
}

/// `count` faces with ids from `first`, spread `step` apart from `base`.
fn line(first: u64, count: u64, base: f32, step: f32) -> Vec<Detection> {
    (0..count).map(|i| face(first + i, base + i as f32 * step)).collect()
}

/// 50 faces with ids `first..first+50`, spread 0.002 apart from `base`.
fn group(first: u64, base: f32) -> Vec<Detection> {
    line(first, 50, base, 0.002)
}

fn assigned_to(cluster_id: i64, detections: Vec<Detection>) -> Vec<Detection> {
    detections
        .into_iter()
        .map(|d| Detection {
            cluster_id: Some(cluster_id),
            ..d
        })
        .collect()
}

fn person(id: i64) -> Cluster {
    Cluster {
        id,
        user_id: USER.into(),
        title: String::new(),
    }
}

fn two_groups() -> Vec<Detection> {
    let mut all = group(1, 1.0);
    all.extend(group(101, 51.0));
    all
}

fn config() -> AnalyzerConfig {
    AnalyzerConfig {
        min_dataset_size: 50,
        seed: Some(7),
        ..Default::default()
    }
}

fn setup(detections: Vec<Detection>) -> (Arc<MemoryStore>, FaceClusterAnalyzer) {
    setup_with(detections, Vec::new(), config())
}

fn setup_with(
    detections: Vec<Detection>,
    clusters: Vec<Cluster>,
    config: AnalyzerConfig,
) -> (Arc<MemoryStore>, FaceClusterAnalyzer) {
    let store = Arc::new(MemoryStore::from_parts(detections, clusters));
    let analyzer = FaceClusterAnalyzer::new(config, store.clone()).unwrap();
    (store, analyzer)
}

fn cluster_of(store: &MemoryStore, id: u64) -> Option<i64> {
    store.detection(id).unwrap().unwrap().cluster_id
}

fn member_ids(store: &MemoryStore, cluster: i64) -> Vec<u64> {
    store
        .detections_by_cluster(cluster)
        .unwrap()
        .into_iter()
        .map(|d| d.id)
        .collect()
}

fn assert_same_cluster(store: &MemoryStore, ids: impl IntoIterator<Item = u64>) -> i64 {
    let mut ids = ids.into_iter();
    let first = ids.next().unwrap();
    let cluster = cluster_of(store, first).unwrap();
    assert!(cluster > 0, "detection {first} not clustered: {cluster}");
    for id in ids {
        assert_eq!(cluster_of(store, id), Some(cluster), "detection {id}");
    }
    cluster
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn two_groups_become_two_clusters() {
    let (store, analyzer) = setup(two_groups());
    let status = analyzer.run(USER).unwrap();

    assert!(status.success);
    assert!(status.aborted.is_none());
    assert_eq!(status.dataset_size, 100);
    assert_eq!(status.clusters_found, 2);
    assert_eq!(status.created_clusters, 2);
    assert_eq!(status.assigned, 100);
    assert_eq!(status.rejected, 0);

    let a = assert_same_cluster(&store, 1..=50);
    let b = assert_same_cluster(&store, 101..=150);
    assert_ne!(a, b);
    assert_eq!(member_ids(&store, a).len(), 50);
    assert_eq!(member_ids(&store, b).len(), 50);
    assert_eq!(store.clusters_by_user(USER).unwrap().len(), 2);
}

#[test]
fn rerun_without_new_detections_changes_nothing() {
    let (store, analyzer) = setup(two_groups());
    analyzer.run(USER).unwrap();
    let before = store.detections().unwrap();

    let status = analyzer.run(USER).unwrap();
    assert!(status.success);
    assert!(status.aborted.is_some());
    assert_eq!(store.detections().unwrap(), before);
    assert_eq!(store.statuses().unwrap().len(), 2);
    assert_eq!(analyzer.status(USER), Some(status));
}

#[test]
fn same_seed_gives_same_assignments() {
    let mut input = two_groups();
    input.extend(group(201, 101.0));
    let (first, a1) = setup(input.clone());
    let (second, a2) = setup(input);
    a1.run(USER).unwrap();
    a2.run(USER).unwrap();
    assert_eq!(first.detections().unwrap(), second.detections().unwrap());
    assert_eq!(first.clusters().unwrap(), second.clusters().unwrap());
}

#[test]
fn single_person_becomes_one_cluster() {
    let (store, analyzer) = setup(line(1, 100, 1.0, 0.002));
    let status = analyzer.run(USER).unwrap();

    assert_eq!(status.clusters_found, 1);
    assert_eq!(status.created_clusters, 1);
    assert_eq!(status.assigned, 100);
    assert_eq!(status.rejected, 0);
    let c = assert_same_cluster(&store, 1..=100);
    assert_eq!(member_ids(&store, c).len(), 100);
}

#[test]
fn new_faces_join_the_only_existing_cluster() {
    let mut input = assigned_to(1, line(1, 100, 1.0, 0.002));
    input.extend(line(201, 50, 1.2, 0.002));
    let (store, analyzer) = setup_with(input, vec![person(1)], config());

    let status = analyzer.run(USER).unwrap();
    assert_eq!(status.anchors, 50);
    assert_eq!(status.clusters_found, 1);
    assert_eq!(status.created_clusters, 0);
    assert_eq!(status.assigned, 50);
    assert_eq!(status.rejected, 0);
    assert_same_cluster(&store, (1..=100).chain(201..=250));
    assert_eq!(cluster_of(&store, 1), Some(1));
    assert_eq!(store.clusters().unwrap().len(), 1);
}

#[test]
fn threshold_at_centroid_distance_rejects_member() {
    // Binary-exact spacing so the centroid and distances are exact in f32.
    const STEP: f32 = 1.0 / 128.0;
    let mut input = line(1, 50, 1.0, STEP);
    input.extend(line(101, 50, 51.0, STEP));
    let (store, analyzer) = setup(input);
    analyzer.run(USER).unwrap();
    let a = cluster_of(&store, 1).unwrap();
    let b = cluster_of(&store, 101).unwrap();

    // Centroid x is 1 + 24.5 * STEP; everything else is constant.
    let mut first = store.detection(1).unwrap().unwrap();
    first.threshold = 24.5 * STEP;
    first.cluster_id = None;
    store.upsert_detection(first).unwrap();
    // Just outside its own distance of 23.5 * STEP: stays.
    let mut second = store.detection(2).unwrap().unwrap();
    second.threshold = 23.5 * STEP + 0.0001;
    second.cluster_id = None;
    store.upsert_detection(second).unwrap();

    let status = analyzer.run(USER).unwrap();
    assert!(status.success);
    assert_eq!(status.anchors, 98);
    assert_eq!(status.assigned, 1);
    assert_eq!(status.rejected, 1);
    assert_eq!(status.created_clusters, 0);

    assert_eq!(cluster_of(&store, 1), Some(REJECTED));
    assert_eq!(cluster_of(&store, 2), Some(a));
    assert_eq!(member_ids(&store, a), (2..=50).collect::<Vec<_>>());
    assert_eq!(member_ids(&store, b).len(), 50);
}

#[test]
fn merged_cluster_stays_whole_when_both_halves_vote_for_it() {
    let config = AnalyzerConfig {
        min_overlap_existing_cluster: 0.3,
        ..config()
    };
    let store = Arc::new(MemoryStore::from_parts(two_groups(), Vec::new()));
    let analyzer = FaceClusterAnalyzer::new(config, store.clone()).unwrap();
    analyzer.run(USER).unwrap();
    let a = cluster_of(&store, 1).unwrap();
    let b = cluster_of(&store, 101).unwrap();
    for id in 101..=150 {
        store.assign(id, Some(a)).unwrap();
    }
    store.upsert_detection(face(999, 51.05)).unwrap();

    // 50 anchors from 100 members: each half holds well over 30% of them.
    let status = analyzer.run(USER).unwrap();
    assert!(status.success);
    assert_eq!(status.anchors, 50);
    assert_eq!(status.clusters_found, 2);
    assert_eq!(status.ambiguous_clusters, 0);
    assert_eq!(status.created_clusters, 0);
    assert_eq!(status.assigned, 1);

    assert_eq!(cluster_of(&store, 999), Some(a));
    let members = member_ids(&store, a);
    assert_eq!(members.len(), 101);
    for id in (1..=50).chain(101..=150) {
        assert!(members.contains(&id), "detection {id} left the merged cluster");
    }
    assert!(member_ids(&store, b).is_empty());
}

#[test]
fn ambiguous_overlap_discards_the_round() {
    // Every anchor is sampled: 30 of the cluster's 100 sit apart from the rest.
    let config = AnalyzerConfig {
        max_anchors_per_cluster: 100,
        ..config()
    };
    let mut input = assigned_to(1, line(1, 30, 1.0, 0.002));
    input.extend(assigned_to(1, line(101, 70, 51.0, 0.002)));
    input.extend(line(501, 20, 1.06, 0.002));
    let (store, analyzer) = setup_with(input, vec![person(1)], config);

    let status = analyzer.run(USER).unwrap();
    assert!(status.success);
    assert_eq!(status.anchors, 100);
    assert_eq!(status.clusters_found, 2);
    assert_eq!(status.ambiguous_clusters, 1);
    assert_eq!(status.created_clusters, 0);
    assert_eq!(status.assigned, 0);
    assert_eq!(status.rejected, 20);

    for id in (1..=30).chain(101..=170) {
        assert_eq!(cluster_of(&store, id), Some(1), "anchor {id}");
    }
    for id in 501..=520 {
        assert_eq!(cluster_of(&store, id), Some(REJECTED), "detection {id}");
    }
    assert_eq!(store.clusters().unwrap().len(), 1);
}

#[test]
fn bridge_points_do_not_merge_groups() {
    let mut input = group(1, 1.0);
    input.extend(group(101, 51.0));
    input.extend(group(201, 101.0));
    // Sparse chain from the end of the first group towards the second.
    input.extend((0..50).map(|j| face(301 + j, 1.098 + 0.976 * (j as f32 + 1.0))));
    let (store, analyzer) = setup(input);

    let status = analyzer.run(USER).unwrap();
    assert_eq!(status.dataset_size, 200);

    let g1 = assert_same_cluster(&store, 1..=50);
    let g2 = assert_same_cluster(&store, 101..=150);
    let g3 = assert_same_cluster(&store, 201..=250);
    assert_ne!(g1, g2);
    assert_ne!(g2, g3);
    assert_ne!(g1, g3);
    for id in 301..=350 {
        assert_eq!(cluster_of(&store, id), Some(REJECTED), "bridge point {id}");
    }
    assert_eq!(status.rejected, 50);
}

#[test]
fn too_few_points_abort_without_writes() {
    let (store, analyzer) = setup(group(1, 1.0).into_iter().take(20).collect());
    let status = analyzer.run(USER).unwrap();
    assert!(status.success);
    assert!(status.aborted.as_deref().unwrap_or_default().contains("too small"));
    assert!(store.detections().unwrap().iter().all(Detection::is_unclustered));
    assert!(store.clusters().unwrap().is_empty());

    let recorded = store.statuses().unwrap();
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].finished_at.is_some());
}

#[test]
fn small_faces_are_left_untouched() {
    let mut input = two_groups();
    let mut tiny = face(500, 1.05);
    tiny.bbox.width = 0.01;
    input.push(tiny);
    let (store, analyzer) = setup(input);

    let status = analyzer.run(USER).unwrap();
    assert_eq!(status.dataset_size, 100);
    assert_eq!(cluster_of(&store, 500), None);
}

#[test]
fn batch_size_bounds_new_detections() {
    let (store, analyzer) = {
        let store = Arc::new(MemoryStore::from_parts(two_groups(), Vec::new()));
        let config = AnalyzerConfig {
            batch_size: 60,
            ..config()
        };
        let analyzer = FaceClusterAnalyzer::new(config, store.clone()).unwrap();
        (store, analyzer)
    };

    let status = analyzer.run(USER).unwrap();
    assert_eq!(status.dataset_size, 60);
    assert_same_cluster(&store, 1..=50);
    assert_same_cluster(&store, 101..=110);
    assert_eq!(store.unclustered_by_user(USER, 0).unwrap().len(), 40);
}

#[test]
fn rejected_detections_are_resampled() {
    let mut input = two_groups();
    input.extend([face(401, 500.0), face(402, 700.0), face(403, 900.0)]);
    let (store, analyzer) = setup(input);

    let first = analyzer.run(USER).unwrap();
    assert_eq!(first.rejected, 3);
    let a = cluster_of(&store, 1).unwrap();
    for id in 401..=403 {
        assert_eq!(cluster_of(&store, id), Some(REJECTED));
    }

    store.upsert_detection(face(60, 1.1)).unwrap();
    let second = analyzer.run(USER).unwrap();
    assert_eq!(second.dataset_size, 104);
    assert_eq!(second.assigned, 1);
    assert_eq!(second.rejected, 3);
    assert_eq!(cluster_of(&store, 60), Some(a));
    for id in 401..=403 {
        assert_eq!(cluster_of(&store, id), Some(REJECTED));
    }
}

// ---------------------------------------------------------------------------
// Store failures
// ---------------------------------------------------------------------------

/// Delegates to a [`MemoryStore`] but cannot create clusters.
struct FailingStore {
    inner: MemoryStore,
}

impl FaceStore for FailingStore {
    fn clusters_by_user(&self, user_id: &str) -> Result<Vec<Cluster>, FaceClusterError> {
        self.inner.clusters_by_user(user_id)
    }

    fn detections_by_cluster(&self, cluster_id: i64) -> Result<Vec<Detection>, FaceClusterError> {
        self.inner.detections_by_cluster(cluster_id)
    }

    fn unclustered_by_user(&self, user_id: &str, limit: usize) -> Result<Vec<Detection>, FaceClusterError> {
        self.inner.unclustered_by_user(user_id, limit)
    }

    fn rejected_by_user(&self, user_id: &str) -> Result<Vec<Detection>, FaceClusterError> {
        self.inner.rejected_by_user(user_id)
    }

    fn create_cluster(&self, _user_id: &str) -> Result<Cluster, FaceClusterError> {
        Err(FaceClusterError::Store("disk full".into()))
    }

    fn assign(&self, detection_id: u64, cluster_id: Option<i64>) -> Result<(), FaceClusterError> {
        self.inner.assign(detection_id, cluster_id)
    }

    fn record_status(&self, status: &RunStatus) -> Result<(), FaceClusterError> {
        self.inner.record_status(status)
    }
}

#[test]
fn store_failure_is_returned_and_recorded() {
    let store = Arc::new(FailingStore {
        inner: MemoryStore::from_parts(two_groups(), Vec::new()),
    });
    let analyzer = FaceClusterAnalyzer::new(config(), store.clone()).unwrap();

    let err = analyzer.run(USER).unwrap_err();
    assert!(matches!(err, FaceClusterError::Store(_)), "{err}");

    let status = analyzer.status(USER).unwrap();
    assert!(!status.success);
    assert!(status.error.unwrap().contains("disk full"));
    let recorded = store.inner.statuses().unwrap();
    assert_eq!(recorded.len(), 1);
    assert!(!recorded[0].success);
}

#[test]
fn invalid_config_is_rejected_up_front() {
    let config = AnalyzerConfig {
        min_anchors_per_cluster: 80,
        ..config()
    };
    let store: Arc<dyn FaceStore> = Arc::new(MemoryStore::new());
    assert!(matches!(
        FaceClusterAnalyzer::new(config, store),
        Err(FaceClusterError::Config(_))
    ));
}
