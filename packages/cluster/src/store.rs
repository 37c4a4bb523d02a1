//! `DuckDB`-backed cluster store.
//!
//! Two relations hold all persistent state: `clusters` and `assignments`.
//! Timestamps are stored as microseconds since the Unix epoch, and each
//! table carries a `seq` column drawn from a sequence so "store order"
//! (insertion order) is total even when timestamps collide.
//!
//! All access goes through [`ClusterStore::read`] or
//! [`ClusterStore::write`]. A single connection sits behind a `Mutex`
//! (`duckdb::Connection` is `Send` but not `Sync`), so every operation is
//! serialized, and each write closure runs in one transaction that is
//! committed only if the closure returns `Ok`.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use camsite_cluster_models::{
    Assignment, Cluster, ClusterFilter, ClusterStatistics, GeoPoint, NearbyCluster,
    SizeDistribution, UnknownCluster,
};
use chrono::{DateTime, Utc};
use duckdb::{Connection, Row, ToSql};

use crate::ClusterError;

const SCHEMA: &str = "
    CREATE SEQUENCE IF NOT EXISTS cluster_seq START 1;
    CREATE SEQUENCE IF NOT EXISTS assignment_seq START 1;

    CREATE TABLE IF NOT EXISTS clusters (
        cluster_id TEXT PRIMARY KEY,
        seq BIGINT NOT NULL,
        name TEXT,
        description TEXT,
        center_lat DOUBLE NOT NULL,
        center_lon DOUBLE NOT NULL,
        radius_m DOUBLE NOT NULL,
        point_count BIGINT NOT NULL DEFAULT 0,
        is_named BOOLEAN NOT NULL DEFAULT FALSE,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS assignments (
        assignment_id TEXT PRIMARY KEY,
        seq BIGINT NOT NULL,
        cluster_id TEXT NOT NULL,
        observation_id TEXT NOT NULL UNIQUE,
        lat DOUBLE NOT NULL,
        lon DOUBLE NOT NULL,
        distance_to_center DOUBLE NOT NULL,
        assigned_at BIGINT NOT NULL
    );
";

const CLUSTER_COLUMNS: &str = "cluster_id, name, description, center_lat, center_lon, radius_m, \
                               point_count, is_named, created_at, updated_at";

const ASSIGNMENT_COLUMNS: &str =
    "assignment_id, cluster_id, observation_id, lat, lon, distance_to_center, assigned_at";

/// Current time truncated to the microsecond precision the store keeps, so
/// values handed back to callers compare equal to what is read later.
pub(crate) fn now() -> DateTime<Utc> {
    let micros = Utc::now().timestamp_micros();
    DateTime::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
}

fn from_micros(value: i64, column: &str) -> Result<DateTime<Utc>, ClusterError> {
    DateTime::from_timestamp_micros(value).ok_or_else(|| ClusterError::Conversion {
        message: format!("{column} out of range: {value}"),
    })
}

fn to_count(value: i64, column: &str) -> Result<u64, ClusterError> {
    u64::try_from(value).map_err(|_| ClusterError::Conversion {
        message: format!("{column} is negative: {value}"),
    })
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Raw `clusters` row before timestamp and count decoding.
struct ClusterRow {
    cluster_id: String,
    name: Option<String>,
    description: Option<String>,
    center_lat: f64,
    center_lon: f64,
    radius_m: f64,
    point_count: i64,
    is_named: bool,
    created_at: i64,
    updated_at: i64,
}

impl ClusterRow {
    fn from_row(row: &Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            cluster_id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            center_lat: row.get(3)?,
            center_lon: row.get(4)?,
            radius_m: row.get(5)?,
            point_count: row.get(6)?,
            is_named: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }
}

impl TryFrom<ClusterRow> for Cluster {
    type Error = ClusterError;

    fn try_from(row: ClusterRow) -> Result<Self, Self::Error> {
        Ok(Self {
            point_count: to_count(row.point_count, "point_count")?,
            created_at: from_micros(row.created_at, "created_at")?,
            updated_at: from_micros(row.updated_at, "updated_at")?,
            cluster_id: row.cluster_id,
            name: row.name,
            description: row.description,
            center_latitude: row.center_lat,
            center_longitude: row.center_lon,
            radius_meters: row.radius_m,
            is_named: row.is_named,
        })
    }
}

/// Raw `assignments` row before timestamp decoding.
struct AssignmentRow {
    assignment_id: String,
    cluster_id: String,
    observation_id: String,
    lat: f64,
    lon: f64,
    distance_to_center: f64,
    assigned_at: i64,
}

impl AssignmentRow {
    fn from_row(row: &Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            assignment_id: row.get(0)?,
            cluster_id: row.get(1)?,
            observation_id: row.get(2)?,
            lat: row.get(3)?,
            lon: row.get(4)?,
            distance_to_center: row.get(5)?,
            assigned_at: row.get(6)?,
        })
    }
}

impl TryFrom<AssignmentRow> for Assignment {
    type Error = ClusterError;

    fn try_from(row: AssignmentRow) -> Result<Self, Self::Error> {
        Ok(Self {
            assigned_at: from_micros(row.assigned_at, "assigned_at")?,
            assignment_id: row.assignment_id,
            cluster_id: row.cluster_id,
            observation_id: row.observation_id,
            latitude: row.lat,
            longitude: row.lon,
            distance_to_center: row.distance_to_center,
        })
    }
}

/// Persistent record of clusters and their assignments.
pub struct ClusterStore {
    conn: Mutex<Connection>,
}

impl ClusterStore {
    /// Opens (or creates) a store at `path` and ensures the schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] if the directory, connection, or schema
    /// cannot be created.
    pub fn open(path: &Path) -> Result<Self, ClusterError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self::from_connection(Connection::open(path)?)?;
        log::info!("Opened cluster store at {}", path.display());
        Ok(store)
    }

    /// Opens a transient in-memory store.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] if the connection or schema cannot be
    /// created.
    pub fn open_in_memory() -> Result<Self, ClusterError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, ClusterError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, ClusterError> {
        self.conn.lock().map_err(|_| ClusterError::LockPoisoned)
    }

    /// Runs `f` against a consistent view of the store.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns, or [`ClusterError::LockPoisoned`].
    pub fn read<T>(
        &self,
        f: impl FnOnce(&Reader<'_>) -> Result<T, ClusterError>,
    ) -> Result<T, ClusterError> {
        let conn = self.lock()?;
        f(&Reader { conn: &conn })
    }

    /// Runs `f` inside a single transaction. The transaction commits if
    /// `f` returns `Ok` and rolls back otherwise, so no partial mutation is
    /// ever visible.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns, or a store error if the transaction
    /// cannot be started or committed.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&Writer<'_>) -> Result<T, ClusterError>,
    ) -> Result<T, ClusterError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let result = f(&Writer {
            reader: Reader { conn: &tx },
        });

        match result {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    log::error!("Rollback failed after {e}: {rollback}");
                }
                Err(e)
            }
        }
    }

    /// Fetches a cluster by id.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::NotFound`] if no such cluster exists.
    pub fn get_cluster(&self, cluster_id: &str) -> Result<Cluster, ClusterError> {
        self.read(|r| r.get_cluster(cluster_id))
    }

    /// Lists clusters matching `filter` in that filter's order.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] if the query fails.
    pub fn list_clusters(&self, filter: ClusterFilter) -> Result<Vec<Cluster>, ClusterError> {
        self.read(|r| r.list_clusters(filter))
    }

    /// Finds the first cluster (in store order) with exactly this name.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] if the query fails.
    pub fn find_cluster_by_name(&self, name: &str) -> Result<Option<Cluster>, ClusterError> {
        self.read(|r| r.find_cluster_by_name(name))
    }

    /// Assignments of a cluster, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::NotFound`] if the cluster does not exist.
    pub fn assignments_for(&self, cluster_id: &str) -> Result<Vec<Assignment>, ClusterError> {
        self.read(|r| {
            r.get_cluster(cluster_id)?;
            r.assignments_for(cluster_id)
        })
    }

    /// The assignment for an observation, if it has one.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] if the query fails.
    pub fn assignment_for_observation(
        &self,
        observation_id: &str,
    ) -> Result<Option<Assignment>, ClusterError> {
        self.read(|r| r.assignment_for_observation(observation_id))
    }

    /// Recalculates a cluster's center and point count from its current
    /// assignments.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::NotFound`] for an unknown cluster, or
    /// [`ClusterError::InconsistentState`] if it has no assignments.
    pub fn recompute_centroid(&self, cluster_id: &str) -> Result<Cluster, ClusterError> {
        self.write(|w| w.recompute_centroid(cluster_id))
    }

    /// Names a cluster and marks it as named.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::EmptyName`] for a blank name, or
    /// [`ClusterError::NotFound`] if the cluster does not exist.
    pub fn rename(
        &self,
        cluster_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<Cluster, ClusterError> {
        let cluster = self.write(|w| w.rename(cluster_id, name, description))?;
        log::info!("Named cluster {cluster_id} as '{name}'");
        Ok(cluster)
    }

    /// Clusters whose centers lie within `radius_meters` of a point,
    /// nearest first.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] if the query fails.
    pub fn search_by_location(
        &self,
        point: GeoPoint,
        radius_meters: f64,
    ) -> Result<Vec<NearbyCluster>, ClusterError> {
        self.read(|r| r.search_by_location(point, radius_meters))
    }

    /// Store-wide counts and naming progress.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] if the query fails.
    pub fn statistics(&self) -> Result<ClusterStatistics, ClusterError> {
        self.read(|r| r.statistics())
    }

    /// Checks every cluster against its assignments.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::InconsistentState`] describing the first
    /// problems found (each is also logged).
    pub fn verify_integrity(&self) -> Result<(), ClusterError> {
        self.read(|r| r.verify_integrity())
    }
}

/// Read-only operations over a locked connection.
pub struct Reader<'a> {
    conn: &'a Connection,
}

impl Reader<'_> {
    fn query_clusters(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<Cluster>, ClusterError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, ClusterRow::from_row)?;
        rows.map(|row| Cluster::try_from(row?)).collect()
    }

    fn query_assignments(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<Assignment>, ClusterError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, AssignmentRow::from_row)?;
        rows.map(|row| Assignment::try_from(row?)).collect()
    }

    /// Fetches a cluster by id, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] if the query fails.
    pub fn find_cluster(&self, cluster_id: &str) -> Result<Option<Cluster>, ClusterError> {
        let sql = format!("SELECT {CLUSTER_COLUMNS} FROM clusters WHERE cluster_id = ?");
        Ok(self
            .query_clusters(&sql, duckdb::params![cluster_id])?
            .into_iter()
            .next())
    }

    /// Fetches a cluster by id.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::NotFound`] if no such cluster exists.
    pub fn get_cluster(&self, cluster_id: &str) -> Result<Cluster, ClusterError> {
        self.find_cluster(cluster_id)?
            .ok_or_else(|| ClusterError::cluster_not_found(cluster_id))
    }

    /// Lists clusters matching `filter`.
    ///
    /// * `All` — creation order.
    /// * `Named` — by name.
    /// * `Unknown` — most points first, then earliest first-seen.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] if the query fails.
    pub fn list_clusters(&self, filter: ClusterFilter) -> Result<Vec<Cluster>, ClusterError> {
        let sql = match filter {
            ClusterFilter::All => {
                format!("SELECT {CLUSTER_COLUMNS} FROM clusters ORDER BY created_at, seq")
            }
            ClusterFilter::Named => {
                format!("SELECT {CLUSTER_COLUMNS} FROM clusters WHERE is_named ORDER BY name, seq")
            }
            ClusterFilter::Unknown => format!(
                "SELECT {CLUSTER_COLUMNS},
                    (SELECT MIN(a.assigned_at) FROM assignments a
                     WHERE a.cluster_id = c.cluster_id) AS first_seen_at
                 FROM clusters c
                 WHERE NOT is_named
                 ORDER BY point_count DESC, first_seen_at ASC NULLS LAST, seq"
            ),
        };

        self.query_clusters(&sql, &[])
    }

    /// Every cluster in store (insertion) order.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] if the query fails.
    pub fn clusters_in_store_order(&self) -> Result<Vec<Cluster>, ClusterError> {
        let sql = format!("SELECT {CLUSTER_COLUMNS} FROM clusters ORDER BY seq");
        self.query_clusters(&sql, &[])
    }

    /// Clusters whose centers could lie within `radius_meters` of `point`,
    /// in store order.
    ///
    /// Prunes with a latitude/longitude window when one exists; otherwise
    /// returns every cluster. The result is a superset of the clusters
    /// actually within range, in the same relative order as a full scan.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] if the query fails.
    pub fn candidate_clusters(
        &self,
        point: GeoPoint,
        radius_meters: f64,
    ) -> Result<Vec<Cluster>, ClusterError> {
        let Some((d_lat, d_lon)) = camsite_geometry::degree_envelope(point, radius_meters) else {
            return self.clusters_in_store_order();
        };

        let sql = format!(
            "SELECT {CLUSTER_COLUMNS} FROM clusters
             WHERE center_lat BETWEEN ? AND ? AND center_lon BETWEEN ? AND ?
             ORDER BY seq"
        );

        self.query_clusters(
            &sql,
            duckdb::params![
                point.latitude - d_lat,
                point.latitude + d_lat,
                point.longitude - d_lon,
                point.longitude + d_lon,
            ],
        )
    }

    /// Clusters whose centers lie within `radius_meters` of `point`,
    /// nearest first.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] if the query fails.
    pub fn search_by_location(
        &self,
        point: GeoPoint,
        radius_meters: f64,
    ) -> Result<Vec<NearbyCluster>, ClusterError> {
        let mut nearby: Vec<NearbyCluster> = self
            .candidate_clusters(point, radius_meters)?
            .into_iter()
            .filter_map(|cluster| {
                let distance_meters = camsite_geometry::distance(point, cluster.center());
                (distance_meters <= radius_meters).then_some(NearbyCluster {
                    cluster,
                    distance_meters,
                })
            })
            .collect();

        nearby.sort_by(|a, b| a.distance_meters.total_cmp(&b.distance_meters));
        Ok(nearby)
    }

    /// Finds the first cluster (in store order) with exactly this name.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] if the query fails.
    pub fn find_cluster_by_name(&self, name: &str) -> Result<Option<Cluster>, ClusterError> {
        let sql = format!("SELECT {CLUSTER_COLUMNS} FROM clusters WHERE name = ? ORDER BY seq");
        Ok(self
            .query_clusters(&sql, duckdb::params![name])?
            .into_iter()
            .next())
    }

    /// Named clusters updated strictly after `since`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] if the query fails.
    pub fn named_since(&self, since: DateTime<Utc>) -> Result<Vec<Cluster>, ClusterError> {
        let sql = format!(
            "SELECT {CLUSTER_COLUMNS} FROM clusters
             WHERE is_named AND updated_at > ?
             ORDER BY updated_at DESC, seq DESC"
        );
        self.query_clusters(&sql, duckdb::params![since.timestamp_micros()])
    }

    /// Assignments of a cluster, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] if the query fails.
    pub fn assignments_for(&self, cluster_id: &str) -> Result<Vec<Assignment>, ClusterError> {
        let sql = format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignments
             WHERE cluster_id = ?
             ORDER BY assigned_at, seq"
        );
        self.query_assignments(&sql, duckdb::params![cluster_id])
    }

    /// The assignment for an observation, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] if the query fails.
    pub fn assignment_for_observation(
        &self,
        observation_id: &str,
    ) -> Result<Option<Assignment>, ClusterError> {
        let sql = format!("SELECT {ASSIGNMENT_COLUMNS} FROM assignments WHERE observation_id = ?");
        Ok(self
            .query_assignments(&sql, duckdb::params![observation_id])?
            .into_iter()
            .next())
    }

    fn assignment_count(&self, cluster_id: &str) -> Result<u64, ClusterError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM assignments WHERE cluster_id = ?",
            duckdb::params![cluster_id],
            |row| row.get(0),
        )?;
        to_count(count, "assignment count")
    }

    /// Builds the tagging projection of an unnamed cluster.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::InconsistentState`] if the cluster has no
    /// assignments.
    pub fn unknown_projection(
        &self,
        cluster: &Cluster,
        sample_size: usize,
    ) -> Result<UnknownCluster, ClusterError> {
        let (first, last): (Option<i64>, Option<i64>) = self.conn.query_row(
            "SELECT MIN(assigned_at), MAX(assigned_at) FROM assignments WHERE cluster_id = ?",
            duckdb::params![cluster.cluster_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let (Some(first), Some(last)) = (first, last) else {
            return Err(ClusterError::inconsistent(format!(
                "cluster {} has no assignments",
                cluster.cluster_id
            )));
        };

        let mut stmt = self.conn.prepare(&format!(
            "SELECT observation_id FROM assignments
             WHERE cluster_id = ?
             ORDER BY assigned_at, seq
             LIMIT {sample_size}"
        ))?;
        let sample_observations = stmt
            .query_map(duckdb::params![cluster.cluster_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        Ok(UnknownCluster {
            cluster_id: cluster.cluster_id.clone(),
            center_latitude: cluster.center_latitude,
            center_longitude: cluster.center_longitude,
            point_count: cluster.point_count,
            first_seen: from_micros(first, "first_seen")?,
            last_seen: from_micros(last, "last_seen")?,
            sample_observations,
        })
    }

    /// Store-wide counts and naming progress.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] if the query fails.
    pub fn statistics(&self) -> Result<ClusterStatistics, ClusterError> {
        let (total, named, min_points, max_points, avg_points, small, medium, large): (
            i64,
            i64,
            Option<i64>,
            Option<i64>,
            Option<f64>,
            i64,
            i64,
            i64,
        ) = self.conn.query_row(
            "SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE is_named),
                MIN(point_count),
                MAX(point_count),
                AVG(point_count),
                COUNT(*) FILTER (WHERE point_count < 5),
                COUNT(*) FILTER (WHERE point_count >= 5 AND point_count < 20),
                COUNT(*) FILTER (WHERE point_count >= 20)
             FROM clusters",
            [],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            },
        )?;

        let total_assignments: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM assignments", [], |row| row.get(0))?;

        let total_clusters = to_count(total, "cluster count")?;
        let named_clusters = to_count(named, "named count")?;

        #[allow(clippy::cast_precision_loss)]
        let naming_rate = if total_clusters == 0 {
            0.0
        } else {
            named_clusters as f64 / total_clusters as f64
        };

        Ok(ClusterStatistics {
            total_clusters,
            named_clusters,
            unknown_clusters: total_clusters - named_clusters,
            total_assignments: to_count(total_assignments, "assignment count")?,
            avg_points_per_cluster: (avg_points.unwrap_or(0.0) * 100.0).round() / 100.0,
            max_points: to_count(max_points.unwrap_or(0), "max_points")?,
            min_points: to_count(min_points.unwrap_or(0), "min_points")?,
            naming_rate,
            size_distribution: SizeDistribution {
                small: to_count(small, "small")?,
                medium: to_count(medium, "medium")?,
                large: to_count(large, "large")?,
            },
        })
    }

    /// Checks every cluster against its assignments: no orphaned
    /// assignments, no empty clusters, and cached center/point count equal
    /// to recomputation.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::InconsistentState`] listing the problems.
    pub fn verify_integrity(&self) -> Result<(), ClusterError> {
        const MAX_REPORTED: usize = 10;
        const CENTER_TOLERANCE_DEG: f64 = 1e-9;

        let mut points: BTreeMap<String, Vec<GeoPoint>> = BTreeMap::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT cluster_id, lat, lon FROM assignments
                 ORDER BY cluster_id, assigned_at, seq",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    GeoPoint::new(row.get(1)?, row.get(2)?),
                ))
            })?;
            for row in rows {
                let (cluster_id, point) = row?;
                points.entry(cluster_id).or_default().push(point);
            }
        }

        let mut problems = Vec::new();

        for cluster in self.clusters_in_store_order()? {
            let Some(members) = points.remove(&cluster.cluster_id) else {
                problems.push(format!("cluster {} has no assignments", cluster.cluster_id));
                continue;
            };

            if members.len() as u64 != cluster.point_count {
                problems.push(format!(
                    "cluster {} caches point_count {} but owns {} assignments",
                    cluster.cluster_id,
                    cluster.point_count,
                    members.len()
                ));
            }

            if let Some(center) = camsite_geometry::centroid(&members)
                && ((center.latitude - cluster.center_latitude).abs() > CENTER_TOLERANCE_DEG
                    || (center.longitude - cluster.center_longitude).abs() > CENTER_TOLERANCE_DEG)
            {
                problems.push(format!(
                    "cluster {} center ({}, {}) differs from assignment mean ({}, {})",
                    cluster.cluster_id,
                    cluster.center_latitude,
                    cluster.center_longitude,
                    center.latitude,
                    center.longitude
                ));
            }
        }

        for (cluster_id, members) in &points {
            problems.push(format!(
                "{} assignments reference missing cluster {cluster_id}",
                members.len()
            ));
        }

        if problems.is_empty() {
            return Ok(());
        }

        let total = problems.len();
        problems.truncate(MAX_REPORTED);
        Err(ClusterError::inconsistent(format!(
            "{total} problem(s): {}",
            problems.join("; ")
        )))
    }
}

/// Mutating operations inside a store transaction. Dereferences to
/// [`Reader`] so reads see the transaction's own writes.
pub struct Writer<'a> {
    reader: Reader<'a>,
}

impl<'a> Deref for Writer<'a> {
    type Target = Reader<'a>;

    fn deref(&self) -> &Self::Target {
        &self.reader
    }
}

impl Writer<'_> {
    /// Inserts an unnamed cluster centered on `center` with no points yet.
    /// The caller must add the triggering assignment in the same write.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] if the insert fails.
    pub fn create_cluster(
        &self,
        center: GeoPoint,
        radius_meters: f64,
    ) -> Result<Cluster, ClusterError> {
        let now = now();
        let cluster = Cluster {
            cluster_id: uuid::Uuid::new_v4().to_string(),
            name: None,
            description: None,
            center_latitude: center.latitude,
            center_longitude: center.longitude,
            radius_meters,
            point_count: 0,
            is_named: false,
            created_at: now,
            updated_at: now,
        };

        self.conn.execute(
            "INSERT INTO clusters (
                cluster_id, seq, name, description, center_lat, center_lon,
                radius_m, point_count, is_named, created_at, updated_at
            ) VALUES (?, nextval('cluster_seq'), NULL, NULL, ?, ?, ?, 0, FALSE, ?, ?)",
            duckdb::params![
                cluster.cluster_id,
                cluster.center_latitude,
                cluster.center_longitude,
                cluster.radius_meters,
                now.timestamp_micros(),
                now.timestamp_micros(),
            ],
        )?;

        log::info!(
            "Created cluster {} at ({:.6}, {:.6})",
            cluster.cluster_id,
            center.latitude,
            center.longitude
        );

        Ok(cluster)
    }

    /// Records that `observation_id` belongs to `cluster_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] if the insert fails (including a duplicate
    /// observation id).
    pub fn insert_assignment(
        &self,
        cluster_id: &str,
        observation_id: &str,
        point: GeoPoint,
        distance_to_center: f64,
    ) -> Result<Assignment, ClusterError> {
        let assignment = Assignment {
            assignment_id: uuid::Uuid::new_v4().to_string(),
            cluster_id: cluster_id.to_string(),
            observation_id: observation_id.to_string(),
            latitude: point.latitude,
            longitude: point.longitude,
            distance_to_center,
            assigned_at: now(),
        };

        self.conn.execute(
            "INSERT INTO assignments (
                assignment_id, seq, cluster_id, observation_id, lat, lon,
                distance_to_center, assigned_at
            ) VALUES (?, nextval('assignment_seq'), ?, ?, ?, ?, ?, ?)",
            duckdb::params![
                assignment.assignment_id,
                assignment.cluster_id,
                assignment.observation_id,
                assignment.latitude,
                assignment.longitude,
                assignment.distance_to_center,
                assignment.assigned_at.timestamp_micros(),
            ],
        )?;

        Ok(assignment)
    }

    /// Recalculates center and point count from all current assignments
    /// and bumps `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::NotFound`] for an unknown cluster, or
    /// [`ClusterError::InconsistentState`] if it has no assignments.
    pub fn recompute_centroid(&self, cluster_id: &str) -> Result<Cluster, ClusterError> {
        self.get_cluster(cluster_id)?;

        let points: Vec<GeoPoint> = self
            .assignments_for(cluster_id)?
            .iter()
            .map(Assignment::point)
            .collect();

        let Some(center) = camsite_geometry::centroid(&points) else {
            return Err(ClusterError::inconsistent(format!(
                "cluster {cluster_id} has no assignments"
            )));
        };

        self.conn.execute(
            "UPDATE clusters
             SET center_lat = ?, center_lon = ?, point_count = ?, updated_at = ?
             WHERE cluster_id = ?",
            duckdb::params![
                center.latitude,
                center.longitude,
                to_i64(points.len() as u64),
                now().timestamp_micros(),
                cluster_id,
            ],
        )?;

        self.get_cluster(cluster_id)
    }

    /// Sets name and description, marks the cluster named, and bumps
    /// `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::EmptyName`] for a blank name, or
    /// [`ClusterError::NotFound`] if the cluster does not exist.
    pub fn rename(
        &self,
        cluster_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<Cluster, ClusterError> {
        if name.trim().is_empty() {
            return Err(ClusterError::EmptyName {
                cluster_id: cluster_id.to_string(),
            });
        }

        let updated = self.conn.execute(
            "UPDATE clusters
             SET name = ?, description = ?, is_named = TRUE, updated_at = ?
             WHERE cluster_id = ?",
            duckdb::params![name, description, now().timestamp_micros(), cluster_id],
        )?;

        if updated == 0 {
            return Err(ClusterError::cluster_not_found(cluster_id));
        }

        self.get_cluster(cluster_id)
    }

    /// Re-points every assignment of `from` to `to`. Returns how many
    /// assignments moved.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] if the update fails.
    pub fn reassign_assignments(&self, from: &str, to: &str) -> Result<u64, ClusterError> {
        let moved = self.conn.execute(
            "UPDATE assignments SET cluster_id = ? WHERE cluster_id = ?",
            duckdb::params![to, from],
        )?;
        Ok(moved as u64)
    }

    /// Deletes a cluster row. Refuses while any assignment still points at
    /// it, since that would leave a dangling back-reference.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::InconsistentState`] if assignments remain,
    /// or [`ClusterError::NotFound`] if the cluster does not exist.
    pub fn delete_cluster(&self, cluster_id: &str) -> Result<(), ClusterError> {
        let remaining = self.assignment_count(cluster_id)?;
        if remaining > 0 {
            return Err(ClusterError::inconsistent(format!(
                "refusing to delete cluster {cluster_id}: \
                 {remaining} assignments still reference it"
            )));
        }

        let deleted = self.conn.execute(
            "DELETE FROM clusters WHERE cluster_id = ?",
            duckdb::params![cluster_id],
        )?;

        if deleted == 0 {
            return Err(ClusterError::cluster_not_found(cluster_id));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{approx, store};

    fn seed(store: &ClusterStore, id: &str, lat: f64, lon: f64) -> Cluster {
        store
            .write(|w| {
                let cluster = w.create_cluster(GeoPoint::new(lat, lon), 5.0)?;
                w.insert_assignment(&cluster.cluster_id, id, GeoPoint::new(lat, lon), 0.0)?;
                w.recompute_centroid(&cluster.cluster_id)
            })
            .unwrap()
    }

    #[test]
    fn created_cluster_round_trips() {
        let store = store();
        let cluster = seed(&store, "obs-1", 59.0, 10.0);

        let fetched = store.get_cluster(&cluster.cluster_id).unwrap();
        assert_eq!(fetched, cluster);
        assert_eq!(fetched.point_count, 1);
        assert!(!fetched.is_named);
        assert!(approx(fetched.radius_meters, 5.0, f64::EPSILON));
    }

    #[test]
    fn get_missing_cluster_is_not_found() {
        let store = store();
        assert!(matches!(
            store.get_cluster("nope"),
            Err(ClusterError::NotFound { kind: "cluster", .. })
        ));
    }

    #[test]
    fn failed_write_rolls_back() {
        let store = store();
        let result: Result<(), _> = store.write(|w| {
            w.create_cluster(GeoPoint::new(1.0, 1.0), 5.0)?;
            Err(ClusterError::InvalidMergeRequest {
                message: "abort".to_string(),
            })
        });

        assert!(result.is_err());
        assert!(store.list_clusters(ClusterFilter::All).unwrap().is_empty());
    }

    #[test]
    fn recompute_matches_mean_of_assignments() {
        let store = store();
        let cluster = seed(&store, "a", 10.0, 20.0);

        let updated = store
            .write(|w| {
                let id = &cluster.cluster_id;
                w.insert_assignment(id, "b", GeoPoint::new(10.00002, 20.00004), 1.0)?;
                w.insert_assignment(id, "c", GeoPoint::new(10.00004, 20.00002), 1.0)?;
                w.recompute_centroid(&cluster.cluster_id)
            })
            .unwrap();

        assert_eq!(updated.point_count, 3);
        assert!(approx(updated.center_latitude, 10.00002, 1e-12));
        assert!(approx(updated.center_longitude, 20.00002, 1e-12));
        store.verify_integrity().unwrap();
    }

    #[test]
    fn recompute_of_empty_cluster_is_inconsistent() {
        let store = store();
        let result = store.write(|w| {
            let cluster = w.create_cluster(GeoPoint::new(1.0, 1.0), 5.0)?;
            w.recompute_centroid(&cluster.cluster_id)
        });
        assert!(matches!(result, Err(ClusterError::InconsistentState { .. })));
        assert!(store.list_clusters(ClusterFilter::All).unwrap().is_empty());
    }

    #[test]
    fn rename_marks_named_and_bumps_updated_at() {
        let store = store();
        let cluster = seed(&store, "a", 1.0, 1.0);

        let named = store
            .rename(&cluster.cluster_id, "North Ridge Feeder", Some("salt lick"))
            .unwrap();

        assert!(named.is_named);
        assert_eq!(named.name.as_deref(), Some("North Ridge Feeder"));
        assert_eq!(named.description.as_deref(), Some("salt lick"));
        assert!(named.updated_at >= cluster.updated_at);
        assert!(matches!(
            store.rename("missing", "x", None),
            Err(ClusterError::NotFound { .. })
        ));
    }

    #[test]
    fn rename_rejects_blank_names() {
        let store = store();
        let cluster = seed(&store, "a", 1.0, 1.0);

        for blank in ["", "   ", "\t\n"] {
            assert!(matches!(
                store.rename(&cluster.cluster_id, blank, Some("ignored")),
                Err(ClusterError::EmptyName { .. })
            ));
        }

        let unchanged = store.get_cluster(&cluster.cluster_id).unwrap();
        assert!(!unchanged.is_named);
        assert!(unchanged.name.is_none());
        assert!(unchanged.description.is_none());
    }

    #[test]
    fn list_orders_follow_filter() {
        let store = store();
        let first = seed(&store, "a", 1.0, 1.0);
        let second = seed(&store, "b", 2.0, 2.0);
        let third = seed(&store, "c", 3.0, 3.0);

        // Give the third cluster more evidence than the others.
        store
            .write(|w| {
                w.insert_assignment(&third.cluster_id, "c2", GeoPoint::new(3.0, 3.0), 0.0)?;
                w.recompute_centroid(&third.cluster_id)
            })
            .unwrap();

        store.rename(&second.cluster_id, "Zulu", None).unwrap();
        store.rename(&first.cluster_id, "Alpha", None).unwrap();

        let all: Vec<String> = store
            .list_clusters(ClusterFilter::All)
            .unwrap()
            .into_iter()
            .map(|c| c.cluster_id)
            .collect();
        assert_eq!(
            all,
            vec![
                first.cluster_id.clone(),
                second.cluster_id.clone(),
                third.cluster_id.clone()
            ]
        );

        let named: Vec<Option<String>> = store
            .list_clusters(ClusterFilter::Named)
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(named, vec![Some("Alpha".to_string()), Some("Zulu".to_string())]);

        let unknown = store.list_clusters(ClusterFilter::Unknown).unwrap();
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].cluster_id, third.cluster_id);
    }

    #[test]
    fn unknown_orders_ties_by_first_seen() {
        let store = store();
        let older = seed(&store, "a", 1.0, 1.0);
        let newer = seed(&store, "b", 2.0, 2.0);

        let unknown = store.list_clusters(ClusterFilter::Unknown).unwrap();
        let ids: Vec<&str> = unknown.iter().map(|c| c.cluster_id.as_str()).collect();
        assert_eq!(ids, vec![older.cluster_id.as_str(), newer.cluster_id.as_str()]);
    }

    #[test]
    fn unknown_projection_caps_samples() {
        let store = store();
        let cluster = seed(&store, "obs-0", 1.0, 1.0);
        let cluster = store
            .write(|w| {
                for i in 1..8 {
                    w.insert_assignment(
                        &cluster.cluster_id,
                        &format!("obs-{i}"),
                        GeoPoint::new(1.0, 1.0),
                        0.0,
                    )?;
                }
                w.recompute_centroid(&cluster.cluster_id)
            })
            .unwrap();

        let projection = store
            .read(|r| r.unknown_projection(&cluster, 5))
            .unwrap();
        assert_eq!(projection.point_count, 8);
        assert_eq!(
            projection.sample_observations,
            vec!["obs-0", "obs-1", "obs-2", "obs-3", "obs-4"]
        );
        assert!(projection.first_seen <= projection.last_seen);
    }

    #[test]
    fn delete_refuses_clusters_with_assignments() {
        let store = store();
        let cluster = seed(&store, "a", 1.0, 1.0);

        let result = store.write(|w| w.delete_cluster(&cluster.cluster_id));
        assert!(matches!(result, Err(ClusterError::InconsistentState { .. })));
        assert!(store.get_cluster(&cluster.cluster_id).is_ok());
    }

    #[test]
    fn verify_integrity_reports_orphans() {
        let store = store();
        seed(&store, "a", 1.0, 1.0);

        store
            .write(|w| {
                w.insert_assignment("ghost", "b", GeoPoint::new(1.0, 1.0), 0.0)
                    .map(|_| ())
            })
            .unwrap();

        let err = store.verify_integrity().unwrap_err();
        assert!(matches!(err, ClusterError::InconsistentState { .. }));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn verify_integrity_reports_stale_point_count() {
        let store = store();
        let cluster = seed(&store, "a", 1.0, 1.0);

        store
            .write(|w| {
                w.insert_assignment(&cluster.cluster_id, "b", GeoPoint::new(1.0, 1.0), 0.0)
                    .map(|_| ())
            })
            .unwrap();

        assert!(store.verify_integrity().is_err());
        store.recompute_centroid(&cluster.cluster_id).unwrap();
        store.verify_integrity().unwrap();
    }

    #[test]
    fn candidate_window_keeps_store_order() {
        let store = store();
        let a = seed(&store, "a", 59.0, 10.0);
        seed(&store, "far", 60.0, 11.0);
        let b = seed(&store, "b", 59.00001, 10.0);

        let candidates = store
            .read(|r| r.candidate_clusters(GeoPoint::new(59.000005, 10.0), 5.0))
            .unwrap();
        let ids: Vec<&str> = candidates.iter().map(|c| c.cluster_id.as_str()).collect();
        assert_eq!(ids, vec![a.cluster_id.as_str(), b.cluster_id.as_str()]);
    }

    #[test]
    fn search_by_location_sorts_by_distance() {
        let store = store();
        let far = seed(&store, "far", 59.0005, 10.0);
        let near = seed(&store, "near", 59.0001, 10.0);
        seed(&store, "outside", 59.01, 10.0);

        let found = store
            .search_by_location(GeoPoint::new(59.0, 10.0), 100.0)
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|n| n.cluster.cluster_id.as_str()).collect();
        assert_eq!(ids, vec![near.cluster_id.as_str(), far.cluster_id.as_str()]);
        assert!(found[0].distance_meters < found[1].distance_meters);
    }

    #[test]
    fn find_by_name_and_statistics() {
        let store = store();
        let a = seed(&store, "a", 1.0, 1.0);
        seed(&store, "b", 2.0, 2.0);
        store.rename(&a.cluster_id, "Creek Crossing", None).unwrap();

        let found = store.find_cluster_by_name("Creek Crossing").unwrap().unwrap();
        assert_eq!(found.cluster_id, a.cluster_id);
        assert!(store.find_cluster_by_name("Nowhere").unwrap().is_none());

        let stats = store.statistics().unwrap();
        assert_eq!(stats.total_clusters, 2);
        assert_eq!(stats.named_clusters, 1);
        assert_eq!(stats.unknown_clusters, 1);
        assert_eq!(stats.total_assignments, 2);
        assert!(approx(stats.avg_points_per_cluster, 1.0, 1e-9));
        assert!(approx(stats.naming_rate, 0.5, 1e-9));
        assert_eq!(stats.size_distribution.small, 2);
    }

    #[test]
    fn empty_store_statistics() {
        let stats = store().statistics().unwrap();
        assert_eq!(stats, ClusterStatistics::default());
    }

    #[test]
    fn named_since_is_strict_and_newest_first() {
        let store = store();
        let a = seed(&store, "a", 1.0, 1.0);
        let b = seed(&store, "b", 2.0, 2.0);
        let before = Utc::now() - chrono::Duration::seconds(1);

        store.rename(&a.cluster_id, "A", None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.rename(&b.cluster_id, "B", None).unwrap();

        let changed = store.read(|r| r.named_since(before)).unwrap();
        let names: Vec<&str> = changed.iter().filter_map(|c| c.name.as_deref()).collect();
        assert_eq!(names, vec!["B", "A"]);

        let latest = changed[0].updated_at;
        assert!(store.read(|r| r.named_since(latest)).unwrap().is_empty());
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = std::env::temp_dir().join(format!("camsite-store-{}", uuid::Uuid::new_v4()));
        let path = dir.join("clusters.duckdb");

        let id = {
            let store = ClusterStore::open(&path).unwrap();
            seed(&store, "a", 1.0, 1.0).cluster_id
        };

        let reopened = ClusterStore::open(&path).unwrap();
        assert_eq!(reopened.get_cluster(&id).unwrap().point_count, 1);

        drop(reopened);
        let _ = std::fs::remove_dir_all(dir);
    }
}
