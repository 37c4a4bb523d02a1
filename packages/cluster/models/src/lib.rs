#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Cluster, assignment, and review payload types.
//!
//! These types describe camera locations ("clusters") built from GPS-tagged
//! observations, the binding of each observation to exactly one cluster,
//! and the derived read projections handed to mapping and tagging UIs.
//! Field names follow the persisted column names so payloads translate
//! directly into JSON for downstream reporting.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Default join radius for assigning a point to an existing cluster.
pub const DEFAULT_RADIUS_METERS: f64 = 5.0;

/// Default center-to-center distance below which two clusters overlap.
pub const DEFAULT_OVERLAP_THRESHOLD_METERS: f64 = 10.0;

/// Maximum number of sample observation ids in an unknown-cluster payload.
pub const DEFAULT_SAMPLE_SIZE: usize = 5;

/// A WGS84 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

impl GeoPoint {
    /// Creates a new point from latitude and longitude degrees.
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Returns `true` if both coordinates are finite and within the valid
    /// WGS84 ranges.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A physical camera location built from nearby observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Opaque unique identifier (random UUID).
    pub cluster_id: String,
    /// Human-assigned name, once tagged.
    pub name: Option<String>,
    /// Free-form description.
    pub description: Option<String>,
    /// Mean latitude of all assignments.
    pub center_latitude: f64,
    /// Mean longitude of all assignments.
    pub center_longitude: f64,
    /// Join radius used when the cluster was created.
    pub radius_meters: f64,
    /// Number of assignments currently owned by this cluster.
    pub point_count: u64,
    /// Whether a name has been applied.
    pub is_named: bool,
    /// When the cluster was created.
    pub created_at: DateTime<Utc>,
    /// Last change to the centroid, membership, or name.
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    /// Returns the cluster centroid as a [`GeoPoint`].
    #[must_use]
    pub const fn center(&self) -> GeoPoint {
        GeoPoint::new(self.center_latitude, self.center_longitude)
    }
}

/// The binding of one observation's GPS point to a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    /// Opaque unique identifier.
    pub assignment_id: String,
    /// Owning cluster.
    pub cluster_id: String,
    /// Observation natural key, unique across the store.
    pub observation_id: String,
    /// Latitude of the original point.
    pub latitude: f64,
    /// Longitude of the original point.
    pub longitude: f64,
    /// Distance to the cluster center at assignment time. Not revalidated
    /// as the centroid drifts.
    pub distance_to_center: f64,
    /// When the assignment was made.
    pub assigned_at: DateTime<Utc>,
}

impl Assignment {
    /// Returns the assigned point as a [`GeoPoint`].
    #[must_use]
    pub const fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// A GPS-tagged observation coming from the detection pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Idempotency key.
    pub observation_id: String,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Capture time, if known.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Camera identifier, if known.
    #[serde(default)]
    pub camera_id: Option<String>,
}

impl Observation {
    /// Creates an observation without timestamp or camera metadata.
    #[must_use]
    pub fn new(observation_id: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            observation_id: observation_id.into(),
            latitude,
            longitude,
            timestamp: None,
            camera_id: None,
        }
    }

    /// Returns the observation location as a [`GeoPoint`].
    #[must_use]
    pub const fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// Which clusters a listing should include, and in which order.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ClusterFilter {
    /// Every cluster, ordered by creation time.
    #[default]
    All,
    /// Named clusters, ordered by name.
    Named,
    /// Unnamed clusters, most points first, then earliest first-seen.
    Unknown,
}

/// How clusters within the overlap threshold are grouped.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OverlapStrategy {
    /// Seed-based grouping in store order: each unprocessed cluster seeds
    /// a group and absorbs later clusters within threshold of the seed.
    #[default]
    Greedy,
    /// Connected components of the threshold graph.
    Transitive,
}

/// Result of feeding one observation to the assignment engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "assignment", rename_all = "snake_case")]
pub enum AssignmentOutcome {
    /// The observation already had an assignment; nothing changed.
    AlreadyAssigned(Assignment),
    /// Joined a cluster within the radius.
    AssignedToExisting(Assignment),
    /// Started a new cluster.
    AssignedToNew(Assignment),
}

impl AssignmentOutcome {
    /// Returns the assignment regardless of outcome.
    #[must_use]
    pub const fn assignment(&self) -> &Assignment {
        match self {
            Self::AlreadyAssigned(a) | Self::AssignedToExisting(a) | Self::AssignedToNew(a) => a,
        }
    }
}

/// Counters from a batch ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    /// Observations that produced a new assignment.
    pub processed: u64,
    /// Of those, how many joined an existing cluster.
    pub assigned_existing: u64,
    /// Of those, how many started a new cluster.
    pub new_clusters: u64,
    /// Observations skipped because they were already assigned.
    pub already_assigned: u64,
    /// Observations rejected or failed.
    pub errors: u64,
}

/// Read projection of an unnamed cluster for the tagging workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnknownCluster {
    /// Cluster identifier.
    pub cluster_id: String,
    /// Center latitude.
    pub center_latitude: f64,
    /// Center longitude.
    pub center_longitude: f64,
    /// Number of assignments.
    pub point_count: u64,
    /// Earliest assignment time.
    pub first_seen: DateTime<Utc>,
    /// Latest assignment time.
    pub last_seen: DateTime<Utc>,
    /// Earliest-assigned observation ids, capped at the sample size.
    pub sample_observations: Vec<String>,
}

/// Latitude/longitude extent of a point set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Southern latitude boundary.
    pub min_latitude: f64,
    /// Northern latitude boundary.
    pub max_latitude: f64,
    /// Western longitude boundary.
    pub min_longitude: f64,
    /// Eastern longitude boundary.
    pub max_longitude: f64,
}

impl BoundingBox {
    /// Creates a new bounding box from the given extents.
    #[must_use]
    pub const fn new(
        min_latitude: f64,
        max_latitude: f64,
        min_longitude: f64,
        max_longitude: f64,
    ) -> Self {
        Self {
            min_latitude,
            max_latitude,
            min_longitude,
            max_longitude,
        }
    }
}

/// Boundary geometry of a cluster, computed from its current assignments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterBoundary {
    /// Cluster identifier.
    pub cluster_id: String,
    /// Extent of all assigned points.
    pub bounding_box: BoundingBox,
    /// Cluster centroid.
    pub center: GeoPoint,
    /// Points lying on an edge of the bounding box.
    pub boundary_points: Vec<GeoPoint>,
    /// Convex hull vertices, counter-clockwise, ring left open.
    pub convex_hull: Vec<GeoPoint>,
    /// Approximate hull area.
    pub area_square_meters: f64,
    /// Hull perimeter.
    pub perimeter_meters: f64,
}

/// Summary of a cluster inside an overlap group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlapMember {
    /// Cluster identifier.
    pub cluster_id: String,
    /// Cluster name, if any.
    pub name: Option<String>,
    /// Center latitude.
    pub center_latitude: f64,
    /// Center longitude.
    pub center_longitude: f64,
    /// Number of assignments.
    pub point_count: u64,
    /// Whether the cluster is named.
    pub is_named: bool,
}

impl From<&Cluster> for OverlapMember {
    fn from(cluster: &Cluster) -> Self {
        Self {
            cluster_id: cluster.cluster_id.clone(),
            name: cluster.name.clone(),
            center_latitude: cluster.center_latitude,
            center_longitude: cluster.center_longitude,
            point_count: cluster.point_count,
            is_named: cluster.is_named,
        }
    }
}

/// A set of clusters whose centers lie within the overlap threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlapGroup {
    /// Group label (`overlap_<n>`), stable only within one detection pass.
    pub group_id: String,
    /// Members in store order.
    pub clusters: Vec<OverlapMember>,
    /// Minimum center-to-center distance over every pair of members.
    ///
    /// For greedy groups this is not the seed-to-member minimum: two
    /// members absorbed by the same seed can lie closer to each other
    /// than either lies to the seed, and that closer pair wins.
    pub overlap_distance: f64,
}

/// Naming changes since an instant, plus the current overlap state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeFeed {
    /// Lower bound (exclusive) that was queried.
    pub since: DateTime<Utc>,
    /// When this feed was produced.
    pub generated_at: DateTime<Utc>,
    /// Named clusters updated after `since`, newest first.
    pub newly_named: Vec<Cluster>,
    /// Fresh overlap detection pass.
    pub overlapping_groups: Vec<OverlapGroup>,
}

/// A name (and optional description) to apply to a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRequest {
    /// New name.
    pub name: String,
    /// New description.
    #[serde(default)]
    pub description: Option<String>,
}

/// Per-id results of a batch naming run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchNameResult {
    /// Cluster ids that were renamed.
    pub succeeded: Vec<String>,
    /// Cluster ids that failed, with the reason.
    pub failed: BTreeMap<String, String>,
}

/// A request to fold several clusters into one named cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequest {
    /// Clusters to merge.
    pub cluster_ids: Vec<String>,
    /// Name for the merged cluster.
    pub new_name: String,
    /// Description for the merged cluster.
    #[serde(default)]
    pub new_description: Option<String>,
}

/// A merge that completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// Clusters that were folded (and deleted).
    pub cluster_ids: Vec<String>,
    /// The cluster that now owns their assignments.
    pub merged_cluster_id: String,
}

/// A merge that was rejected or failed as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeFailure {
    /// Clusters named in the request.
    pub cluster_ids: Vec<String>,
    /// Why the merge did not happen.
    pub reason: String,
}

/// Per-request results of a batch merge run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMergeResult {
    /// Merges that completed.
    pub succeeded: Vec<MergeOutcome>,
    /// Merges that did not happen.
    pub failed: Vec<MergeFailure>,
}

/// A cluster found by a radius search, with its distance to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyCluster {
    /// The cluster.
    pub cluster: Cluster,
    /// Distance from the query point to the cluster center.
    pub distance_meters: f64,
}

/// A cluster with its assignments and boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterDetails {
    /// The cluster.
    pub cluster: Cluster,
    /// Assignments in assignment order.
    pub assignments: Vec<Assignment>,
    /// Boundary geometry.
    pub boundary: ClusterBoundary,
}

/// Cluster counts bucketed by point count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeDistribution {
    /// Fewer than 5 points.
    pub small: u64,
    /// 5 to 19 points.
    pub medium: u64,
    /// 20 or more points.
    pub large: u64,
}

/// Store-wide clustering statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatistics {
    /// Number of clusters.
    pub total_clusters: u64,
    /// Number of named clusters.
    pub named_clusters: u64,
    /// Number of unnamed clusters.
    pub unknown_clusters: u64,
    /// Number of assignments.
    pub total_assignments: u64,
    /// Mean points per cluster, rounded to two decimals.
    pub avg_points_per_cluster: f64,
    /// Largest cluster by point count.
    pub max_points: u64,
    /// Smallest cluster by point count.
    pub min_points: u64,
    /// Fraction of clusters that are named.
    pub naming_rate: f64,
    /// Clusters bucketed by size.
    pub size_distribution: SizeDistribution,
}

/// Review state handed to a tagging session: what still needs a name,
/// what looks like a duplicate, and how far naming has progressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// When the snapshot was taken.
    pub exported_at: DateTime<Utc>,
    /// Unnamed clusters awaiting review, most points first.
    pub unknown_clusters: Vec<UnknownCluster>,
    /// Current overlap groups.
    pub overlapping_groups: Vec<OverlapGroup>,
    /// Store-wide statistics.
    pub statistics: ClusterStatistics,
}

/// Decisions returned from a tagging session. Either part may be omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRequest {
    /// Names keyed by cluster id.
    #[serde(default)]
    pub cluster_names: BTreeMap<String, NameRequest>,
    /// Merges to apply after naming.
    #[serde(default)]
    pub merge_requests: Vec<MergeRequest>,
}

/// Combined outcome of applying a [`WorkflowRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// When the request was applied.
    pub applied_at: DateTime<Utc>,
    /// Successful renames plus successful merges.
    pub applied_changes: usize,
    /// Per-id naming results.
    pub names: BatchNameResult,
    /// Per-request merge results.
    pub merges: BatchMergeResult,
}
