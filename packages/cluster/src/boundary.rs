//! Boundary geometry for mapping: bounding box, extreme points, convex
//! hull, area and perimeter of a cluster's current assignments.

use camsite_cluster_models::{Assignment, Cluster, ClusterBoundary, ClusterDetails, GeoPoint};

use crate::store::Reader;
use crate::{ClusterError, ClusterStore};

/// Builds the boundary of `cluster` from its assignments.
///
/// # Errors
///
/// Returns [`ClusterError::InconsistentState`] if `assignments` is empty,
/// since a stored cluster always owns at least one assignment.
pub fn boundary_from(
    cluster: &Cluster,
    assignments: &[Assignment],
) -> Result<ClusterBoundary, ClusterError> {
    let points: Vec<GeoPoint> = assignments.iter().map(Assignment::point).collect();

    let Some(bounding_box) = camsite_geometry::bounding_box(&points) else {
        return Err(ClusterError::inconsistent(format!(
            "cluster {} has no assignments",
            cluster.cluster_id
        )));
    };

    let convex_hull = camsite_geometry::convex_hull(&points);

    Ok(ClusterBoundary {
        cluster_id: cluster.cluster_id.clone(),
        boundary_points: camsite_geometry::extreme_points(&points, &bounding_box),
        bounding_box,
        center: cluster.center(),
        area_square_meters: camsite_geometry::polygon_area(&convex_hull),
        perimeter_meters: camsite_geometry::polygon_perimeter(&convex_hull),
        convex_hull,
    })
}

pub(crate) fn boundary_in(
    reader: &Reader<'_>,
    cluster: &Cluster,
) -> Result<ClusterBoundary, ClusterError> {
    let assignments = reader.assignments_for(&cluster.cluster_id)?;
    boundary_from(cluster, &assignments)
}

/// Every cluster paired with its boundary, in store order, from one
/// consistent snapshot.
pub(crate) fn clusters_with_boundaries(
    reader: &Reader<'_>,
) -> Result<Vec<(Cluster, ClusterBoundary)>, ClusterError> {
    reader
        .clusters_in_store_order()?
        .into_iter()
        .map(|cluster| {
            let boundary = boundary_in(reader, &cluster)?;
            Ok((cluster, boundary))
        })
        .collect()
}

/// Boundary of one cluster.
///
/// # Errors
///
/// Returns [`ClusterError::NotFound`] if the cluster does not exist.
pub fn cluster_boundary(
    store: &ClusterStore,
    cluster_id: &str,
) -> Result<ClusterBoundary, ClusterError> {
    store.read(|r| {
        let cluster = r.get_cluster(cluster_id)?;
        boundary_in(r, &cluster)
    })
}

/// Boundaries of every cluster, in store order.
///
/// # Errors
///
/// Returns [`ClusterError`] if the store cannot be read or is
/// inconsistent.
pub fn all_boundaries(store: &ClusterStore) -> Result<Vec<ClusterBoundary>, ClusterError> {
    let boundaries = store.read(clusters_with_boundaries)?;
    Ok(boundaries.into_iter().map(|(_, boundary)| boundary).collect())
}

/// A cluster together with its assignments and boundary.
///
/// # Errors
///
/// Returns [`ClusterError::NotFound`] if the cluster does not exist.
pub fn cluster_details(
    store: &ClusterStore,
    cluster_id: &str,
) -> Result<ClusterDetails, ClusterError> {
    store.read(|r| {
        let cluster = r.get_cluster(cluster_id)?;
        let assignments = r.assignments_for(cluster_id)?;
        let boundary = boundary_from(&cluster, &assignments)?;

        Ok(ClusterDetails {
            cluster,
            assignments,
            boundary,
        })
    })
}
