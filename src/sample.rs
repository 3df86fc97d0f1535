//! Dataset sampling for analysis.
//!
//! The optimizer never reads whole datasets: each step starts from a bounded
//! random sample of its input dataset, drawn without replacement, and the
//! sample is advanced through emitted operations as the step is optimized.

use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

use crate::config::{ConfigError, DatasetConfig, PipelineConfig};

/// One input record: a mapping of field name to value.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Default bound on sample size.
pub const DEFAULT_SAMPLE_SIZE: usize = 5;

#[derive(Debug, Error)]
pub enum SampleError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("io error reading dataset {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("dataset {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("dataset {path} is not a JSON array of objects")]
    NotRecords { path: PathBuf },
}

/// Draw a bounded random sample from a named dataset.
///
/// Returns an empty sequence when no dataset is designated. Only file-backed
/// JSON arrays are supported.
pub fn sample_dataset<R: Rng + ?Sized>(
    config: &PipelineConfig,
    dataset_name: Option<&str>,
    bound: usize,
    rng: &mut R,
) -> Result<Vec<Record>, SampleError> {
    let Some(dataset_name) = dataset_name else {
        return Ok(Vec::new());
    };

    let DatasetConfig::File { path } = config.dataset(dataset_name)?;
    let records = load_records(path)?;

    let count = bound.min(records.len());
    Ok(records
        .choose_multiple(rng, count)
        .cloned()
        .collect())
}

fn load_records(path: &Path) -> Result<Vec<Record>, SampleError> {
    let text = std::fs::read_to_string(path).map_err(|source| SampleError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: serde_json::Value =
        serde_json::from_str(&text).map_err(|source| SampleError::Json {
            path: path.to_path_buf(),
            source,
        })?;

    let serde_json::Value::Array(items) = value else {
        return Err(SampleError::NotRecords {
            path: path.to_path_buf(),
        });
    };

    items
        .into_iter()
        .map(|item| match item {
            serde_json::Value::Object(record) => Ok(record),
            _ => Err(SampleError::NotRecords {
                path: path.to_path_buf(),
            }),
        })
        .collect()
}
