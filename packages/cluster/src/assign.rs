//! Assignment engine: places each observation into the first cluster within
//! the join radius, or starts a new cluster.

use camsite_cluster_models::{AssignmentOutcome, IngestStats, Observation};

use crate::{ClusterError, ClusterStore};

fn validate(observation: &Observation) -> Result<(), ClusterError> {
    let reason = if observation.observation_id.trim().is_empty() {
        Some("observation id is empty")
    } else if !observation.point().is_valid() {
        Some("coordinates are not finite or out of range")
    } else {
        None
    };

    match reason {
        Some(message) => Err(ClusterError::InvalidObservation {
            observation_id: observation.observation_id.clone(),
            message: message.to_string(),
        }),
        None => Ok(()),
    }
}

/// Assigns one observation.
///
/// Runs in a single store transaction: the idempotency check, the
/// candidate scan, cluster creation (if needed), the assignment insert and
/// the centroid recomputation commit together or not at all.
///
/// The recorded `distance_to_center` is measured against the cluster
/// center before this point moved it (zero for a new cluster).
///
/// # Errors
///
/// * [`ClusterError::InvalidObservation`] for an empty id or unusable
///   coordinates
/// * [`ClusterError::StoreUnavailable`] if the store cannot be written
pub fn assign_observation(
    store: &ClusterStore,
    radius_meters: f64,
    observation: &Observation,
) -> Result<AssignmentOutcome, ClusterError> {
    validate(observation)?;
    let point = observation.point();

    store.write(|w| {
        if let Some(existing) = w.assignment_for_observation(&observation.observation_id)? {
            log::debug!(
                "Observation {} already assigned to {}",
                observation.observation_id,
                existing.cluster_id
            );
            return Ok(AssignmentOutcome::AlreadyAssigned(existing));
        }

        let nearest = w
            .candidate_clusters(point, radius_meters)?
            .into_iter()
            .map(|cluster| {
                let distance = camsite_geometry::distance(point, cluster.center());
                (cluster, distance)
            })
            .find(|(_, distance)| *distance <= radius_meters);

        let outcome = if let Some((cluster, distance)) = nearest {
            let assignment = w.insert_assignment(
                &cluster.cluster_id,
                &observation.observation_id,
                point,
                distance,
            )?;
            w.recompute_centroid(&cluster.cluster_id)?;

            log::debug!(
                "Assigned {} to cluster {} ({distance:.2} m from center)",
                observation.observation_id,
                cluster.cluster_id
            );
            AssignmentOutcome::AssignedToExisting(assignment)
        } else {
            let cluster = w.create_cluster(point, radius_meters)?;
            let assignment = w.insert_assignment(
                &cluster.cluster_id,
                &observation.observation_id,
                point,
                0.0,
            )?;
            w.recompute_centroid(&cluster.cluster_id)?;

            log::debug!(
                "Assigned {} to new cluster {}",
                observation.observation_id,
                cluster.cluster_id
            );
            AssignmentOutcome::AssignedToNew(assignment)
        };

        Ok(outcome)
    })
}

/// Assigns a batch of observations one by one.
///
/// Invalid observations and per-item store failures are logged and
/// counted; they do not stop the batch. An inconsistent store does, since
/// every later assignment would build on it.
///
/// # Errors
///
/// Returns [`ClusterError::InconsistentState`] if the store is found to be
/// inconsistent part way through.
pub fn ingest_batch(
    store: &ClusterStore,
    radius_meters: f64,
    observations: &[Observation],
) -> Result<IngestStats, ClusterError> {
    let mut stats = IngestStats::default();

    for observation in observations {
        match assign_observation(store, radius_meters, observation) {
            Ok(AssignmentOutcome::AlreadyAssigned(_)) => stats.already_assigned += 1,
            Ok(AssignmentOutcome::AssignedToExisting(_)) => {
                stats.processed += 1;
                stats.assigned_existing += 1;
            }
            Ok(AssignmentOutcome::AssignedToNew(_)) => {
                stats.processed += 1;
                stats.new_clusters += 1;
            }
            Err(e @ ClusterError::InconsistentState { .. }) => return Err(e),
            Err(e) => {
                log::warn!(
                    "Skipping observation '{}': {e}",
                    observation.observation_id
                );
                stats.errors += 1;
            }
        }
    }

    log::info!(
        "Ingested {} observations: {} joined existing clusters, {} new clusters, \
         {} already assigned, {} errors",
        observations.len(),
        stats.assigned_existing,
        stats.new_clusters,
        stats.already_assigned,
        stats.errors
    );

    Ok(stats)
}
