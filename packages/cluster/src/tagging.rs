//! Tagging workflow: surface unnamed clusters for review, apply names in
//! bulk, and report what changed since a caller-supplied instant.

use std::collections::BTreeMap;

use camsite_cluster_models::{
    BatchNameResult, ChangeFeed, ClusterFilter, NameRequest, OverlapStrategy, UnknownCluster,
    WorkflowRequest, WorkflowResult, WorkflowSnapshot,
};
use chrono::{DateTime, Utc};

use crate::config::{OverlapConfig, TaggingConfig};
use crate::overlap::{merge_many, overlaps_in};
use crate::store::Reader;
use crate::{ClusterError, ClusterStore};

fn unknown_in(
    reader: &Reader<'_>,
    limit: usize,
    min_points: u64,
    sample_size: usize,
) -> Result<Vec<UnknownCluster>, ClusterError> {
    reader
        .list_clusters(ClusterFilter::Unknown)?
        .iter()
        .filter(|cluster| cluster.point_count >= min_points)
        .take(limit)
        .map(|cluster| reader.unknown_projection(cluster, sample_size))
        .collect()
}

/// Unnamed clusters with at least `min_points` assignments, most evidence
/// first, capped at `limit`. Each carries up to `sample_size` of its
/// earliest observation ids.
///
/// # Errors
///
/// Returns [`ClusterError`] if the store cannot be read or an unnamed
/// cluster has no assignments.
pub fn request_unknown(
    store: &ClusterStore,
    limit: usize,
    min_points: u64,
    sample_size: usize,
) -> Result<Vec<UnknownCluster>, ClusterError> {
    store.read(|r| unknown_in(r, limit, min_points, sample_size))
}

/// Names each cluster in `requests`. Each rename is its own unit; a
/// missing id or empty name is recorded in `failed` and the rest still
/// apply.
#[must_use]
pub fn batch_name(
    store: &ClusterStore,
    requests: &BTreeMap<String, NameRequest>,
) -> BatchNameResult {
    let mut result = BatchNameResult::default();

    for (cluster_id, request) in requests {
        match store.rename(cluster_id, &request.name, request.description.as_deref()) {
            Ok(_) => result.succeeded.push(cluster_id.clone()),
            Err(e) => {
                log::warn!("Failed to name cluster {cluster_id}: {e}");
                result.failed.insert(cluster_id.clone(), e.to_string());
            }
        }
    }

    log::info!(
        "Batch naming: {} succeeded, {} failed",
        result.succeeded.len(),
        result.failed.len()
    );

    result
}

/// Named clusters updated strictly after `since` (newest first), plus a
/// fresh overlap pass, both read from the same snapshot.
///
/// # Errors
///
/// Returns [`ClusterError`] if the store cannot be read.
pub fn changes_since(
    store: &ClusterStore,
    since: DateTime<Utc>,
    overlap_threshold_meters: f64,
    strategy: OverlapStrategy,
) -> Result<ChangeFeed, ClusterError> {
    store.read(|r| {
        Ok(ChangeFeed {
            since,
            generated_at: crate::store::now(),
            newly_named: r.named_since(since)?,
            overlapping_groups: overlaps_in(r, overlap_threshold_meters, strategy)?,
        })
    })
}

/// Everything a reviewer needs for one tagging session, read from a single
/// snapshot: unnamed clusters (per `tagging`), overlap groups (per
/// `overlap`), and store statistics.
///
/// # Errors
///
/// Returns [`ClusterError`] if the store cannot be read.
pub fn export_workflow(
    store: &ClusterStore,
    tagging: &TaggingConfig,
    overlap: &OverlapConfig,
) -> Result<WorkflowSnapshot, ClusterError> {
    let snapshot = store.read(|r| {
        Ok(WorkflowSnapshot {
            exported_at: crate::store::now(),
            unknown_clusters: unknown_in(
                r,
                tagging.unknown_limit,
                tagging.min_points,
                tagging.sample_size,
            )?,
            overlapping_groups: overlaps_in(r, overlap.threshold_meters, overlap.strategy)?,
            statistics: r.statistics()?,
        })
    })?;

    log::info!(
        "Exported workflow: {} unknown clusters, {} overlap groups",
        snapshot.unknown_clusters.len(),
        snapshot.overlapping_groups.len()
    );

    Ok(snapshot)
}

/// Applies a reviewer's decisions: names first, then merges. Each rename
/// and each merge is its own unit, so one bad entry does not block the
/// rest.
#[must_use]
pub fn apply_workflow(
    store: &ClusterStore,
    request: &WorkflowRequest,
    radius_meters: f64,
) -> WorkflowResult {
    let names = batch_name(store, &request.cluster_names);
    let merges = merge_many(store, &request.merge_requests, radius_meters);
    let applied_changes = names.succeeded.len() + merges.succeeded.len();

    log::info!("Applied workflow with {applied_changes} changes");

    WorkflowResult {
        applied_at: crate::store::now(),
        applied_changes,
        names,
        merges,
    }
}
