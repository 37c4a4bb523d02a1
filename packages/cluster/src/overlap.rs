//! Overlap detection and atomic cluster merging.
//!
//! Two clusters overlap when their centers lie within a threshold distance.
//! Detection never mutates the store; merging folds a group of clusters
//! into one new named cluster inside a single store transaction.

use camsite_cluster_models::{
    BatchMergeResult, Cluster, GeoPoint, MergeFailure, MergeOutcome, MergeRequest, OverlapGroup,
    OverlapMember, OverlapStrategy,
};
use rstar::primitives::GeomWithData;
use rstar::{AABB, RTree};

use crate::store::Reader;
use crate::{ClusterError, ClusterStore};

type CenterEntry = GeomWithData<[f64; 2], usize>;

/// Disjoint-set forest over cluster positions in store order.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Smaller index wins so roots stay at the earliest member.
            let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[child] = root;
        }
    }
}

fn center_distance(a: &Cluster, b: &Cluster) -> f64 {
    camsite_geometry::distance(a.center(), b.center())
}

/// Seed-based grouping: the first unprocessed cluster seeds a group and
/// absorbs every later unprocessed cluster within `threshold` of the seed.
fn greedy_groups(clusters: &[Cluster], threshold: f64) -> Vec<Vec<usize>> {
    let mut processed = vec![false; clusters.len()];
    let mut groups = Vec::new();

    for (i, seed) in clusters.iter().enumerate() {
        if processed[i] {
            continue;
        }
        processed[i] = true;

        let mut members = vec![i];
        for (j, other) in clusters.iter().enumerate().skip(i + 1) {
            if !processed[j] && center_distance(seed, other) <= threshold {
                processed[j] = true;
                members.push(j);
            }
        }

        if members.len() > 1 {
            groups.push(members);
        }
    }

    groups
}

/// Connected components of the graph linking every pair of clusters within
/// `threshold`, found with an R-tree over `[lon, lat]` centers.
fn transitive_groups(clusters: &[Cluster], threshold: f64) -> Vec<Vec<usize>> {
    let tree: RTree<CenterEntry> = RTree::bulk_load(
        clusters
            .iter()
            .enumerate()
            .map(|(i, c)| GeomWithData::new([c.center_longitude, c.center_latitude], i))
            .collect(),
    );

    let mut uf = UnionFind::new(clusters.len());

    for (i, cluster) in clusters.iter().enumerate() {
        let center = cluster.center();
        let neighbours: Vec<usize> = match camsite_geometry::degree_envelope(center, threshold) {
            Some((d_lat, d_lon)) => {
                let envelope = AABB::from_corners(
                    [center.longitude - d_lon, center.latitude - d_lat],
                    [center.longitude + d_lon, center.latitude + d_lat],
                );
                tree.locate_in_envelope_intersecting(&envelope).map(|e| e.data).collect()
            }
            None => (0..clusters.len()).collect(),
        };

        for j in neighbours {
            if j > i && center_distance(cluster, &clusters[j]) <= threshold {
                uf.union(i, j);
            }
        }
    }

    let mut components: Vec<Vec<usize>> = vec![Vec::new(); clusters.len()];
    for i in 0..clusters.len() {
        let root = uf.find(i);
        components[root].push(i);
    }

    // Roots are each component's earliest member, so index order is
    // discovery order.
    components.into_iter().filter(|c| c.len() > 1).collect()
}

fn min_pairwise_distance(clusters: &[Cluster], members: &[usize]) -> f64 {
    let mut min = f64::INFINITY;
    for (k, &a) in members.iter().enumerate() {
        for &b in &members[k + 1..] {
            min = min.min(center_distance(&clusters[a], &clusters[b]));
        }
    }
    min
}

/// Groups `clusters` (given in store order) whose centers lie within
/// `threshold_meters` of each other.
///
/// Groups are labelled `overlap_<n>` in discovery order and list their
/// members in store order. Singletons are not reported.
#[must_use]
pub fn group_overlaps(
    clusters: &[Cluster],
    threshold_meters: f64,
    strategy: OverlapStrategy,
) -> Vec<OverlapGroup> {
    let groups = match strategy {
        OverlapStrategy::Greedy => greedy_groups(clusters, threshold_meters),
        OverlapStrategy::Transitive => transitive_groups(clusters, threshold_meters),
    };

    groups
        .into_iter()
        .enumerate()
        .map(|(n, members)| OverlapGroup {
            group_id: format!("overlap_{n}"),
            overlap_distance: min_pairwise_distance(clusters, &members),
            clusters: members
                .iter()
                .map(|&i| OverlapMember::from(&clusters[i]))
                .collect(),
        })
        .collect()
}

pub(crate) fn overlaps_in(
    reader: &Reader<'_>,
    threshold_meters: f64,
    strategy: OverlapStrategy,
) -> Result<Vec<OverlapGroup>, ClusterError> {
    let clusters = reader.clusters_in_store_order()?;
    Ok(group_overlaps(&clusters, threshold_meters, strategy))
}

/// Runs overlap detection over every stored cluster.
///
/// # Errors
///
/// Returns [`ClusterError`] if the store cannot be read.
pub fn detect_overlaps(
    store: &ClusterStore,
    threshold_meters: f64,
    strategy: OverlapStrategy,
) -> Result<Vec<OverlapGroup>, ClusterError> {
    let groups = store.read(|r| overlaps_in(r, threshold_meters, strategy))?;
    log::debug!(
        "Found {} overlap groups within {threshold_meters} m ({strategy})",
        groups.len()
    );
    Ok(groups)
}

fn invalid_merge(message: impl Into<String>) -> ClusterError {
    ClusterError::InvalidMergeRequest {
        message: message.into(),
    }
}

/// Merges clusters into one new named cluster.
///
/// The merged cluster is centered on the mean of every assignment of the
/// inputs and takes over all of them; the input clusters are deleted.
/// Creation, reassignment, deletion and naming happen in one transaction,
/// so a failure leaves the store untouched.
///
/// Duplicate ids are ignored.
///
/// # Errors
///
/// * [`ClusterError::InvalidMergeRequest`] for fewer than two distinct ids,
///   an empty name, or an input cluster with no assignments
/// * [`ClusterError::NotFound`] if any id does not exist
pub fn merge(
    store: &ClusterStore,
    cluster_ids: &[String],
    new_name: &str,
    new_description: Option<&str>,
    radius_meters: f64,
) -> Result<Cluster, ClusterError> {
    let mut ids: Vec<&str> = Vec::with_capacity(cluster_ids.len());
    for id in cluster_ids {
        if !ids.contains(&id.as_str()) {
            ids.push(id);
        }
    }

    if ids.len() < 2 {
        return Err(invalid_merge(format!(
            "need at least 2 distinct clusters, got {}",
            ids.len()
        )));
    }
    if new_name.trim().is_empty() {
        return Err(invalid_merge("merged cluster name is empty"));
    }

    let merged = store.write(|w| {
        let mut points: Vec<GeoPoint> = Vec::new();
        for id in &ids {
            w.get_cluster(id)?;
            let assignments = w.assignments_for(id)?;
            if assignments.is_empty() {
                return Err(invalid_merge(format!("cluster {id} has no assignments")));
            }
            points.extend(assignments.iter().map(|a| a.point()));
        }

        let Some(center) = camsite_geometry::centroid(&points) else {
            return Err(invalid_merge("no assignments to merge"));
        };

        let merged = w.create_cluster(center, radius_meters)?;
        for id in &ids {
            w.reassign_assignments(id, &merged.cluster_id)?;
            w.delete_cluster(id)?;
        }
        w.rename(&merged.cluster_id, new_name, new_description)?;
        w.recompute_centroid(&merged.cluster_id)
    })?;

    log::info!(
        "Merged {} clusters into {} ('{new_name}', {} points)",
        ids.len(),
        merged.cluster_id,
        merged.point_count
    );

    Ok(merged)
}

/// Applies several merges, each as its own unit. A failed request is
/// reported and does not affect the others.
#[must_use]
pub fn merge_many(
    store: &ClusterStore,
    requests: &[MergeRequest],
    radius_meters: f64,
) -> BatchMergeResult {
    let mut result = BatchMergeResult::default();

    for request in requests {
        match merge(
            store,
            &request.cluster_ids,
            &request.new_name,
            request.new_description.as_deref(),
            radius_meters,
        ) {
            Ok(merged) => result.succeeded.push(MergeOutcome {
                cluster_ids: request.cluster_ids.clone(),
                merged_cluster_id: merged.cluster_id,
            }),
            Err(e) => {
                log::warn!("Merge of {:?} failed: {e}", request.cluster_ids);
                result.failed.push(MergeFailure {
                    cluster_ids: request.cluster_ids.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    result
}
