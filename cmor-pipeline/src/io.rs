// Data I/O
// Input and storage collaborators used by the load and save steps

use crate::chunking::ChunkEncoding;
use crate::data::Dataset;
use crate::steps::StepError;
use crate::target::Target;

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Supplies a target's input data
#[async_trait::async_trait]
pub trait DataSource: Send + Sync {
    async fn load(&self, target: &Target) -> Result<Dataset, StepError>;
}

/// Persists a dataset with its chunk layout and compression setting
#[async_trait::async_trait]
pub trait StorageWriter: Send + Sync {
    /// Write `data` to `path` and return the path actually written
    async fn write(
        &self,
        data: &Dataset,
        encoding: &ChunkEncoding,
        path: &Path,
    ) -> Result<PathBuf, StepError>;
}

/// Datasets held in memory, keyed by output variable name
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    datasets: HashMap<String, Dataset>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(mut self, dataset: Dataset) -> Self {
        self.insert(dataset);
        self
    }

    pub fn insert(&mut self, dataset: Dataset) {
        self.datasets.insert(dataset.variable.clone(), dataset);
    }
}

#[async_trait::async_trait]
impl DataSource for MemorySource {
    async fn load(&self, target: &Target) -> Result<Dataset, StepError> {
        self.datasets
            .get(&target.output_variable)
            .cloned()
            .ok_or_else(|| {
                StepError::NotFound(format!(
                    "no input data for variable '{}'",
                    target.output_variable
                ))
            })
    }
}

#[derive(Serialize)]
struct StoredDataset<'a> {
    dataset: &'a Dataset,
    encoding: &'a ChunkEncoding,
}

/// Writes each dataset and its encoding as a JSON document next to the
/// requested archival path
#[derive(Debug, Clone, Default)]
pub struct JsonFileWriter {
    pretty: bool,
}

impl JsonFileWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pretty(mut self) -> Self {
        self.pretty = true;
        self
    }
}

#[async_trait::async_trait]
impl StorageWriter for JsonFileWriter {
    async fn write(
        &self,
        data: &Dataset,
        encoding: &ChunkEncoding,
        path: &Path,
    ) -> Result<PathBuf, StepError> {
        let stored = StoredDataset {
            dataset: data,
            encoding,
        };
        let content = if self.pretty {
            serde_json::to_vec_pretty(&stored)
        } else {
            serde_json::to_vec(&stored)
        }
        .map_err(|e| StepError::Write(e.to_string()))?;

        let path = path.with_extension("json");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StepError::Write(format!("{}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| StepError::Write(format!("{}: {}", path.display(), e)))?;
        Ok(path)
    }
}

/// Archival file name for a target:
/// `{cmor_variable}_{table_id}_{source_id}_{experiment_id}_{variant_label}_{grid_label}[_{time_range}].nc`
pub fn output_file_name(target: &Target) -> Result<String, StepError> {
    let mut parts = Vec::with_capacity(7);
    for key in [
        "cmor_variable",
        "table_id",
        "source_id",
        "experiment_id",
        "variant_label",
        "grid_label",
    ] {
        parts.push(target.require(key)?);
    }
    if let Some(range) = target.attribute("time_range") {
        parts.push(range);
    }
    Ok(format!("{}.nc", parts.join("_")))
}
