#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Command-line driver for the camsite clustering engine.
//!
//! Ingests observation files into a `DuckDB` cluster store and exposes the
//! review workflow: listing unknown clusters, naming them, detecting and
//! merging overlaps, exporting boundaries, and checking store integrity.
//! Structured results are printed as JSON on stdout; logs go to stderr
//! (`RUST_LOG=info` for progress).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use camsite_cluster::config::EngineConfig;
use camsite_cluster::{ClusterStore, assign, boundary, export, observations, overlap, tagging};
use camsite_cluster_models::{
    ClusterFilter, GeoPoint, MergeRequest, NameRequest, OverlapStrategy, WorkflowRequest,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

/// Environment variable that overrides the configured store path.
const DB_ENV_VAR: &str = "CAMSITE_DB";

/// Cluster wildlife-camera observations into named places.
#[derive(Parser)]
#[command(name = "camsite")]
#[command(about = "Cluster wildlife-camera observations into named places")]
struct Cli {
    /// Engine config file (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// `DuckDB` store path. Overrides `CAMSITE_DB` and the config file.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Assign observations from a `.json` or `.csv` file.
    Ingest {
        /// Observation file.
        file: PathBuf,

        /// Join radius in meters (default from config).
        #[arg(long)]
        radius: Option<f64>,
    },

    /// List clusters.
    List {
        /// `all`, `named`, or `unknown`.
        #[arg(long, default_value = "all")]
        filter: ClusterFilter,
    },

    /// Show one cluster with its assignments and boundary.
    Show {
        /// Cluster id.
        cluster_id: String,
    },

    /// Unnamed clusters awaiting review.
    Unknown {
        /// Maximum clusters to return.
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum points per cluster.
        #[arg(long)]
        min_points: Option<u64>,

        /// Sample observation ids per cluster.
        #[arg(long)]
        samples: Option<usize>,
    },

    /// Name a single cluster.
    Name {
        /// Cluster id.
        cluster_id: String,

        /// New name.
        name: String,

        /// Optional description.
        #[arg(long)]
        description: Option<String>,
    },

    /// Name clusters from a JSON object of `{cluster_id: {name, description}}`.
    NameBatch {
        /// JSON file.
        file: PathBuf,
    },

    /// Merge clusters into one named cluster.
    Merge {
        /// Clusters to merge (at least two).
        #[arg(required = true, num_args = 2..)]
        cluster_ids: Vec<String>,

        /// Name for the merged cluster.
        #[arg(long)]
        name: String,

        /// Description for the merged cluster.
        #[arg(long)]
        description: Option<String>,
    },

    /// Apply merges from a JSON array of `{cluster_ids, new_name, new_description}`.
    MergeBatch {
        /// JSON file.
        file: PathBuf,
    },

    /// Detect clusters whose centers lie close together.
    Overlaps {
        /// Threshold in meters (default from config).
        #[arg(long)]
        threshold: Option<f64>,

        /// `greedy` or `transitive` (default from config).
        #[arg(long)]
        strategy: Option<OverlapStrategy>,
    },

    /// Clusters named since an instant, plus current overlaps.
    Changes {
        /// RFC 3339 instant, e.g. `2024-05-01T00:00:00Z`.
        #[arg(long)]
        since: DateTime<Utc>,
    },

    /// Boundary of one cluster, or of every cluster.
    Boundary {
        /// Cluster id (default: all clusters).
        cluster_id: Option<String>,
    },

    /// Clusters within a radius of a point, nearest first.
    Search {
        /// Latitude in degrees.
        #[arg(allow_negative_numbers = true)]
        latitude: f64,

        /// Longitude in degrees.
        #[arg(allow_negative_numbers = true)]
        longitude: f64,

        /// Search radius in meters.
        #[arg(long, default_value_t = 100.0)]
        radius: f64,
    },

    /// Snapshot the review state (unknown clusters, overlaps, statistics).
    WorkflowExport {
        /// Write the snapshot here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Apply names and merges from a JSON file of
    /// `{cluster_names: {...}, merge_requests: [...]}`.
    WorkflowApply {
        /// JSON file.
        file: PathBuf,
    },

    /// Export boundaries as `GeoJSON`, or as KML for a `.kml` output file.
    Export {
        /// Output file.
        output: PathBuf,
    },

    /// Show store statistics.
    Stats,

    /// Verify that every cluster agrees with its assignments.
    Check,
}

fn load_config(cli: &Cli) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    if let Some(db) = &cli.db {
        config.store.path = Some(db.clone());
    } else if let Ok(db) = std::env::var(DB_ENV_VAR) {
        config.store.path = Some(PathBuf::from(db));
    }

    Ok(config)
}

fn print_json(value: &impl serde::Serialize) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<T, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    match &config.store.path {
        Some(path) => log::info!("Opening cluster store at {}", path.display()),
        None => log::info!("Opening in-memory cluster store"),
    }
    let store = config.open_store()?;

    match cli.command {
        Commands::Ingest { file, radius } => cmd_ingest(&store, &config, &file, radius),
        Commands::List { filter } => cmd_list(&store, filter),
        Commands::Show { cluster_id } => {
            print_json(&boundary::cluster_details(&store, &cluster_id)?)
        }
        Commands::Unknown {
            limit,
            min_points,
            samples,
        } => print_json(&tagging::request_unknown(
            &store,
            limit.unwrap_or(config.tagging.unknown_limit),
            min_points.unwrap_or(config.tagging.min_points),
            samples.unwrap_or(config.tagging.sample_size),
        )?),
        Commands::Name {
            cluster_id,
            name,
            description,
        } => print_json(&store.rename(&cluster_id, &name, description.as_deref())?),
        Commands::NameBatch { file } => {
            let requests: BTreeMap<String, NameRequest> = read_json(&file)?;
            print_json(&tagging::batch_name(&store, &requests))
        }
        Commands::Merge {
            cluster_ids,
            name,
            description,
        } => print_json(&overlap::merge(
            &store,
            &cluster_ids,
            &name,
            description.as_deref(),
            config.clustering.radius_meters,
        )?),
        Commands::MergeBatch { file } => {
            let requests: Vec<MergeRequest> = read_json(&file)?;
            print_json(&overlap::merge_many(
                &store,
                &requests,
                config.clustering.radius_meters,
            ))
        }
        Commands::Overlaps {
            threshold,
            strategy,
        } => print_json(&overlap::detect_overlaps(
            &store,
            threshold.unwrap_or(config.overlap.threshold_meters),
            strategy.unwrap_or(config.overlap.strategy),
        )?),
        Commands::Changes { since } => print_json(&tagging::changes_since(
            &store,
            since,
            config.overlap.threshold_meters,
            config.overlap.strategy,
        )?),
        Commands::Boundary { cluster_id } => match cluster_id {
            Some(id) => print_json(&boundary::cluster_boundary(&store, &id)?),
            None => print_json(&boundary::all_boundaries(&store)?),
        },
        Commands::Search {
            latitude,
            longitude,
            radius,
        } => print_json(&store.search_by_location(GeoPoint::new(latitude, longitude), radius)?),
        Commands::WorkflowExport { output } => cmd_workflow_export(&store, &config, output),
        Commands::WorkflowApply { file } => {
            let request: WorkflowRequest = read_json(&file)?;
            log::info!(
                "Applying {} names and {} merges from {}",
                request.cluster_names.len(),
                request.merge_requests.len(),
                file.display()
            );
            print_json(&tagging::apply_workflow(
                &store,
                &request,
                config.clustering.radius_meters,
            ))
        }
        Commands::Export { output } => {
            let is_kml = output
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("kml"));
            let count = if is_kml {
                export::write_kml(&store, &output)?
            } else {
                export::write_geojson(&store, &output)?
            };
            println!("Wrote {count} features to {}", output.display());
            Ok(())
        }
        Commands::Stats => cmd_stats(&store),
        Commands::Check => {
            store.verify_integrity()?;
            println!("Store is consistent");
            Ok(())
        }
    }
}

fn cmd_ingest(
    store: &ClusterStore,
    config: &EngineConfig,
    file: &Path,
    radius: Option<f64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let radius = radius.unwrap_or(config.clustering.radius_meters);
    if !(radius.is_finite() && radius > 0.0) {
        return Err(format!("radius must be a positive number, got {radius}").into());
    }

    let batch = observations::read_observations(file)?;
    log::info!("Ingesting {} observations with a {radius} m radius", batch.len());
    let stats = assign::ingest_batch(store, radius, &batch)?;
    print_json(&stats)
}

fn cmd_workflow_export(
    store: &ClusterStore,
    config: &EngineConfig,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = tagging::export_workflow(store, &config.tagging, &config.overlap)?;

    let Some(path) = output else {
        return print_json(&snapshot);
    };

    std::fs::write(&path, serde_json::to_string_pretty(&snapshot)?)?;
    log::info!("Wrote workflow snapshot to {}", path.display());
    println!(
        "Wrote {} unknown clusters and {} overlap groups to {}",
        snapshot.unknown_clusters.len(),
        snapshot.overlapping_groups.len(),
        path.display()
    );
    Ok(())
}

fn cmd_list(
    store: &ClusterStore,
    filter: ClusterFilter,
) -> Result<(), Box<dyn std::error::Error>> {
    let clusters = store.list_clusters(filter)?;

    println!("{} {filter} clusters", clusters.len());
    for cluster in &clusters {
        println!(
            "  {}  {:>5} pts  ({:.6}, {:.6})  {}",
            cluster.cluster_id,
            cluster.point_count,
            cluster.center_latitude,
            cluster.center_longitude,
            cluster.name.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}

fn cmd_stats(store: &ClusterStore) -> Result<(), Box<dyn std::error::Error>> {
    let stats = store.statistics()?;

    println!("=== Cluster Statistics ===");
    println!();
    println!("Clusters:     {}", stats.total_clusters);
    println!("  named:      {}", stats.named_clusters);
    println!("  unknown:    {}", stats.unknown_clusters);
    println!("Assignments:  {}", stats.total_assignments);
    println!();
    println!(
        "Points per cluster: avg {:.2}, min {}, max {}",
        stats.avg_points_per_cluster, stats.min_points, stats.max_points
    );
    println!("Naming rate:  {:.1}%", stats.naming_rate * 100.0);
    println!(
        "Sizes:        {} small (<5), {} medium (5-19), {} large (20+)",
        stats.size_distribution.small,
        stats.size_distribution.medium,
        stats.size_distribution.large
    );

    Ok(())
}
