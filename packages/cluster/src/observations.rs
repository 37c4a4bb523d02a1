//! Reading observation records from JSON or CSV files.
//!
//! JSON files hold an array of objects; CSV files carry a header row
//! `observation_id,latitude,longitude[,timestamp][,camera_id]`. Timestamps
//! are RFC 3339.

use std::io::Read;
use std::path::Path;

use camsite_cluster_models::Observation;

/// Errors from reading observation files.
#[derive(Debug, thiserror::Error)]
pub enum ObservationError {
    /// The file could not be opened or read.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path that caused the error.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The JSON document is not an array of observations.
    #[error("JSON error in {path}: {source}")]
    Json {
        /// Path to the JSON file.
        path: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// The CSV header could not be read.
    #[error("CSV error in {path}: {source}")]
    Csv {
        /// Path to the CSV file.
        path: String,
        /// Underlying CSV error.
        source: csv::Error,
    },

    /// Neither `.json` nor `.csv`.
    #[error("Unsupported observation file extension: {path}")]
    UnsupportedFormat {
        /// The offending path.
        path: String,
    },
}

/// Parses observations from CSV. Malformed rows are logged and skipped.
///
/// # Errors
///
/// Returns [`csv::Error`] if the header row cannot be read.
pub fn parse_csv(reader: impl Read) -> Result<Vec<Observation>, csv::Error> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    csv_reader.headers()?;

    let mut observations = Vec::new();
    for (row, result) in csv_reader.deserialize::<Observation>().enumerate() {
        match result {
            Ok(observation) => observations.push(observation),
            Err(e) => log::warn!("Skipping malformed observation row {}: {e}", row + 1),
        }
    }

    Ok(observations)
}

/// Reads observations from a `.json` or `.csv` file.
///
/// # Errors
///
/// Returns [`ObservationError`] if the file cannot be read, is not valid
/// for its format, or has an unknown extension.
pub fn read_observations(path: &Path) -> Result<Vec<Observation>, ObservationError> {
    let display = path.display().to_string();
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    let open = || {
        std::fs::File::open(path).map_err(|source| ObservationError::Io {
            path: display.clone(),
            source,
        })
    };

    let observations = match extension.as_deref() {
        Some("json") => {
            let reader = std::io::BufReader::new(open()?);
            serde_json::from_reader(reader).map_err(|source| ObservationError::Json {
                path: display.clone(),
                source,
            })?
        }
        Some("csv") => parse_csv(open()?).map_err(|source| ObservationError::Csv {
            path: display.clone(),
            source,
        })?,
        _ => return Err(ObservationError::UnsupportedFormat { path: display }),
    };

    log::info!("Read {} observations from {display}", observations.len());
    Ok(observations)
}
