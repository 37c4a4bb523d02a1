#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! GPS proximity clustering engine for wildlife-camera observations.
//!
//! Observations are assigned to the first cluster whose center lies within
//! the join radius, or start a new cluster. The [`store::ClusterStore`]
//! owns every mutation and keeps each cluster's centroid and point count
//! equal to the mean and count of its assignments. The service modules
//! ([`assign`], [`boundary`], [`overlap`], [`tagging`]) are stateless
//! functions over the store; each mutating call runs inside a single
//! store transaction, so readers never see a half-applied merge.

pub mod assign;
pub mod boundary;
pub mod config;
pub mod export;
pub mod observations;
pub mod overlap;
pub mod store;
pub mod tagging;

pub use store::ClusterStore;

/// Errors that can occur while clustering, querying, or mutating clusters.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// A cluster or observation id does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was being looked up (`cluster`, `observation`).
        kind: &'static str,
        /// The id that was not found.
        id: String,
    },

    /// A merge request was rejected before touching the store.
    #[error("Invalid merge request: {message}")]
    InvalidMergeRequest {
        /// Why the request was rejected.
        message: String,
    },

    /// A cluster name was empty or whitespace.
    #[error("Invalid name for cluster {cluster_id}: name is empty")]
    EmptyName {
        /// The cluster being named.
        cluster_id: String,
    },

    /// An observation had an empty id or unusable coordinates.
    #[error("Invalid observation {observation_id}: {message}")]
    InvalidObservation {
        /// The offending observation.
        observation_id: String,
        /// What was wrong with it.
        message: String,
    },

    /// The underlying `DuckDB` store could not be read or written.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] duckdb::Error),

    /// The store's directory could not be created.
    #[error("Store unavailable: {0}")]
    Io(#[from] std::io::Error),

    /// A previous writer panicked while holding the store lock.
    #[error("Store unavailable: connection lock poisoned")]
    LockPoisoned,

    /// Persisted clusters and assignments disagree.
    #[error("Inconsistent store state: {message}")]
    InconsistentState {
        /// Description of the inconsistency.
        message: String,
    },

    /// A stored value could not be decoded.
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },
}

impl ClusterError {
    /// Shorthand for a missing cluster.
    #[must_use]
    pub fn cluster_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "cluster",
            id: id.to_string(),
        }
    }

    /// Builds an [`ClusterError::InconsistentState`] and logs it at error
    /// level. Nothing is repaired.
    #[must_use]
    pub fn inconsistent(message: impl Into<String>) -> Self {
        let message = message.into();
        log::error!("Inconsistent cluster store: {message}");
        Self::InconsistentState { message }
    }

    /// Whether retrying the operation may succeed.
    ///
    /// Only store availability failures are transient. Ingestion is safe to
    /// retry; a merge should be checked for completion first.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Io(_) | Self::LockPoisoned)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use camsite_cluster_models::Observation;

    use crate::ClusterStore;

    pub fn store() -> ClusterStore {
        ClusterStore::open_in_memory().unwrap()
    }

    pub fn obs(id: &str, lat: f64, lon: f64) -> Observation {
        Observation::new(id, lat, lon)
    }

    pub fn approx(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    /// Meters north of `lat` expressed in degrees of latitude.
    pub fn meters_north(meters: f64) -> f64 {
        (meters / camsite_geometry::EARTH_RADIUS_METERS).to_degrees()
    }
}
