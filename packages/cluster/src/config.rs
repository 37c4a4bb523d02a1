//! Engine configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file at all) gives
//! a working in-memory engine with a 5 m join radius.

use std::path::{Path, PathBuf};

use camsite_cluster_models::{
    DEFAULT_OVERLAP_THRESHOLD_METERS, DEFAULT_RADIUS_METERS, DEFAULT_SAMPLE_SIZE, OverlapStrategy,
};
use serde::{Deserialize, Serialize};

use crate::{ClusterError, ClusterStore};

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read {path}: {source}")]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`EngineConfig`].
    #[error("Invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("Invalid config value: {message}")]
    Invalid {
        /// Which value and why.
        message: String,
    },
}

/// Where the cluster store lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `DuckDB` file. `None` keeps everything in memory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Assignment settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Join radius for new points.
    #[serde(default = "default_radius")]
    pub radius_meters: f64,
}

/// Overlap detection settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverlapConfig {
    /// Maximum center distance for two clusters to overlap.
    #[serde(default = "default_threshold")]
    pub threshold_meters: f64,
    /// Grouping strategy.
    #[serde(default)]
    pub strategy: OverlapStrategy,
}

/// Tagging workflow settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggingConfig {
    /// Maximum unknown clusters per review request.
    #[serde(default = "default_unknown_limit")]
    pub unknown_limit: usize,
    /// Minimum points for an unknown cluster to be offered for review.
    #[serde(default = "default_min_points")]
    pub min_points: u64,
    /// Sample observation ids per unknown cluster.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Store location.
    #[serde(default)]
    pub store: StoreConfig,
    /// Assignment settings.
    #[serde(default)]
    pub clustering: ClusteringConfig,
    /// Overlap settings.
    #[serde(default)]
    pub overlap: OverlapConfig,
    /// Tagging settings.
    #[serde(default)]
    pub tagging: TaggingConfig,
}

const fn default_radius() -> f64 {
    DEFAULT_RADIUS_METERS
}

const fn default_threshold() -> f64 {
    DEFAULT_OVERLAP_THRESHOLD_METERS
}

const fn default_unknown_limit() -> usize {
    50
}

const fn default_min_points() -> u64 {
    1
}

const fn default_sample_size() -> usize {
    DEFAULT_SAMPLE_SIZE
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            radius_meters: default_radius(),
        }
    }
}

impl Default for OverlapConfig {
    fn default() -> Self {
        Self {
            threshold_meters: default_threshold(),
            strategy: OverlapStrategy::default(),
        }
    }
}

impl Default for TaggingConfig {
    fn default() -> Self {
        Self {
            unknown_limit: default_unknown_limit(),
            min_points: default_min_points(),
            sample_size: default_sample_size(),
        }
    }
}

impl EngineConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::de::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or
    /// validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&contents)?;
        log::debug!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Checks that every distance is positive and finite and every count
    /// non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |value: f64, name: &str| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::Invalid {
                    message: format!("{name} must be a positive number, got {value}"),
                })
            }
        };

        positive(self.clustering.radius_meters, "clustering.radius_meters")?;
        positive(self.overlap.threshold_meters, "overlap.threshold_meters")?;

        if self.tagging.sample_size == 0 {
            return Err(ConfigError::Invalid {
                message: "tagging.sample_size must be at least 1".to_string(),
            });
        }
        if self.tagging.unknown_limit == 0 {
            return Err(ConfigError::Invalid {
                message: "tagging.unknown_limit must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// Opens the configured store: the `DuckDB` file at `store.path`, or
    /// an in-memory store when no path is set.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] if the store cannot be opened.
    pub fn open_store(&self) -> Result<ClusterStore, ClusterError> {
        match &self.store.path {
            Some(path) => ClusterStore::open(path),
            None => {
                log::warn!("No store path configured; clusters will not be persisted");
                ClusterStore::open_in_memory()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(config.store.path.is_none());
        assert!((config.clustering.radius_meters - 5.0).abs() < f64::EPSILON);
        assert!((config.overlap.threshold_meters - 10.0).abs() < f64::EPSILON);
        assert_eq!(config.overlap.strategy, OverlapStrategy::Greedy);
        assert_eq!(config.tagging.unknown_limit, 50);
        assert_eq!(config.tagging.min_points, 1);
        assert_eq!(config.tagging.sample_size, 5);
    }

    #[test]
    fn parses_full_document() {
        let config = EngineConfig::from_toml_str(
            r#"
            [store]
            path = "data/clusters.duckdb"

            [clustering]
            radius_meters = 7.5

            [overlap]
            threshold_meters = 12.0
            strategy = "transitive"

            [tagging]
            unknown_limit = 20
            min_points = 3
            sample_size = 2
            "#,
        )
        .unwrap();

        assert_eq!(
            config.store.path.as_deref(),
            Some(Path::new("data/clusters.duckdb"))
        );
        assert!((config.clustering.radius_meters - 7.5).abs() < f64::EPSILON);
        assert_eq!(config.overlap.strategy, OverlapStrategy::Transitive);
        assert_eq!(config.tagging.min_points, 3);
        assert_eq!(config.tagging.sample_size, 2);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config = EngineConfig::from_toml_str("[overlap]\nstrategy = \"transitive\"\n").unwrap();
        assert!((config.overlap.threshold_meters - 10.0).abs() < f64::EPSILON);
        assert_eq!(config.overlap.strategy, OverlapStrategy::Transitive);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            EngineConfig::from_toml_str("[clustering]\nradius_meters = 0.0\n"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[overlap]\nthreshold_meters = -1.0\n"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[tagging]\nsample_size = 0\n"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[overlap]\nstrategy = \"nearest\"\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let path = std::env::temp_dir().join("camsite-no-such-config.toml");
        assert!(matches!(
            EngineConfig::load(&path),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn in_memory_store_without_path() {
        let store = EngineConfig::default().open_store().unwrap();
        assert!(store.statistics().unwrap().total_clusters == 0);
    }
}
