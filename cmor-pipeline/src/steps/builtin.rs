// Built-in Steps
// Minimal step catalog: load, attribute stamping, inspection and the terminal write

use super::{Step, StepError};
use crate::chunking::ChunkingSettings;
use crate::data::Dataset;
use crate::io::{output_file_name, DataSource, StorageWriter};
use crate::target::Target;

use std::path::PathBuf;
use std::sync::Arc;

/// Name of the preset that expands to [`DEFAULT_STEPS`]
pub const DEFAULT_PRESET: &str = "default";

/// Steps of the `default` preset, in order
pub const DEFAULT_STEPS: &[&str] = &[
    "load_data",
    "set_variable_attributes",
    "set_global_attributes",
    "show_data",
    "save_dataset",
];

/// Variable-level attributes copied from the target onto the data
const VARIABLE_ATTRIBUTES: &[(&str, &str)] = &[
    ("cmor_unit", "units"),
    ("standard_name", "standard_name"),
    ("long_name", "long_name"),
    ("positive", "positive"),
];

/// Global attributes stamped onto every output
const GLOBAL_ATTRIBUTES: &[&str] = &[
    "activity_id",
    "experiment_id",
    "frequency",
    "grid_label",
    "institution_id",
    "realm",
    "source_id",
    "table_id",
    "variant_label",
];

/// Every built-in step, ready for registration
pub fn catalog(source: Arc<dyn DataSource>, writer: Arc<dyn StorageWriter>) -> Vec<Arc<dyn Step>> {
    vec![
        Arc::new(LoadData::new(source)),
        Arc::new(SetVariableAttributes::new()),
        Arc::new(SetGlobalAttributes::new()),
        Arc::new(ShowData),
        Arc::new(SaveDataset::new(writer)),
    ]
}

fn names(list: impl IntoIterator<Item = impl Into<String>>) -> Vec<String> {
    list.into_iter().map(Into::into).collect()
}

/// Reads the target's input data through a [`DataSource`]
pub struct LoadData {
    source: Arc<dyn DataSource>,
    relevant: Vec<String>,
}

impl LoadData {
    pub fn new(source: Arc<dyn DataSource>) -> Self {
        Self {
            source,
            relevant: names(["inputs", "cmor_variable"]),
        }
    }
}

#[async_trait::async_trait]
impl Step for LoadData {
    fn name(&self) -> &str {
        "load_data"
    }

    fn relevant_attributes(&self) -> &[String] {
        &self.relevant
    }

    async fn apply(&self, _data: Dataset, target: &mut Target) -> Result<Dataset, StepError> {
        let data = self.source.load(target).await?;
        tracing::debug!(
            target_id = %target.id,
            variable = %data.variable,
            elements = data.values.len(),
            "loaded input data"
        );
        Ok(data)
    }
}

/// Renames the variable and copies unit and naming attributes onto it
pub struct SetVariableAttributes {
    relevant: Vec<String>,
}

impl SetVariableAttributes {
    pub fn new() -> Self {
        let mut relevant = names(VARIABLE_ATTRIBUTES.iter().map(|(from, _)| *from));
        relevant.push("cmor_variable".to_string());
        Self { relevant }
    }
}

impl Default for SetVariableAttributes {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Step for SetVariableAttributes {
    fn name(&self) -> &str {
        "set_variable_attributes"
    }

    fn relevant_attributes(&self) -> &[String] {
        &self.relevant
    }

    async fn apply(&self, mut data: Dataset, target: &mut Target) -> Result<Dataset, StepError> {
        data.variable = target.require("cmor_variable")?.to_string();
        for (from, to) in VARIABLE_ATTRIBUTES {
            if let Some(value) = target.attribute(from) {
                data.attrs.insert((*to).to_string(), value.to_string());
            }
        }
        Ok(data)
    }
}

/// Stamps the global metadata attributes required of every archival file
pub struct SetGlobalAttributes {
    relevant: Vec<String>,
}

impl SetGlobalAttributes {
    pub fn new() -> Self {
        Self {
            relevant: names(GLOBAL_ATTRIBUTES.iter().copied()),
        }
    }
}

impl Default for SetGlobalAttributes {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Step for SetGlobalAttributes {
    fn name(&self) -> &str {
        "set_global_attributes"
    }

    fn relevant_attributes(&self) -> &[String] {
        &self.relevant
    }

    async fn apply(&self, mut data: Dataset, target: &mut Target) -> Result<Dataset, StepError> {
        for key in GLOBAL_ATTRIBUTES {
            if let Some(value) = target.attribute(key) {
                data.attrs.insert((*key).to_string(), value.to_string());
            }
        }
        Ok(data)
    }
}

/// Logs a one-line summary of the data
pub struct ShowData;

#[async_trait::async_trait]
impl Step for ShowData {
    fn name(&self) -> &str {
        "show_data"
    }

    fn cacheable(&self) -> bool {
        false
    }

    async fn apply(&self, data: Dataset, target: &mut Target) -> Result<Dataset, StepError> {
        let dims: Vec<String> = data
            .dims
            .iter()
            .map(|d| format!("{}={}", d.name, d.len))
            .collect();
        tracing::info!(
            target_id = %target.id,
            variable = %data.variable,
            dims = %dims.join(","),
            attributes = data.attrs.len(),
            "dataset summary"
        );
        Ok(data)
    }
}

/// Terminal step: selects the chunk layout and hands the data to the writer.
///
/// Records the written path as the `output_path` annotation.
pub struct SaveDataset {
    writer: Arc<dyn StorageWriter>,
}

impl SaveDataset {
    pub fn new(writer: Arc<dyn StorageWriter>) -> Self {
        Self { writer }
    }
}

#[async_trait::async_trait]
impl Step for SaveDataset {
    fn name(&self) -> &str {
        "save_dataset"
    }

    fn cacheable(&self) -> bool {
        false
    }

    async fn apply(&self, data: Dataset, target: &mut Target) -> Result<Dataset, StepError> {
        let settings = ChunkingSettings::from_attributes(target.attributes())?;
        let encoding = settings.encoding(&data.chunk_dimensions(), data.element_size)?;

        let directory = PathBuf::from(target.require("output_directory")?);
        let path = directory.join(output_file_name(target)?);
        let written = self.writer.write(&data, &encoding, &path).await?;

        tracing::info!(
            target_id = %target.id,
            path = %written.display(),
            chunks = ?encoding.chunk_shape,
            "saved dataset"
        );
        target.annotate("output_path", written.display().to_string());
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{JsonFileWriter, MemorySource};
    use std::collections::BTreeMap;

    fn target(output_directory: &str) -> Target {
        let attributes: BTreeMap<String, String> = [
            ("cmor_variable", "tas"),
            ("cmor_unit", "K"),
            ("table_id", "Amon"),
            ("source_id", "AWI-CM-1-1-HR"),
            ("experiment_id", "historical"),
            ("variant_label", "r1i1p1f1"),
            ("grid_label", "gn"),
            ("output_directory", output_directory),
            ("chunk_size", "64"),
            ("chunk_tolerance", "0"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Target::new("tas", "tas", attributes)
    }

    fn sample() -> Dataset {
        Dataset::new("temp2")
            .with_dims([("time", 16), ("lat", 2)])
            .with_values((0..32).map(f64::from).collect())
    }

    #[tokio::test]
    async fn test_attribute_steps() {
        let mut target = target("/unused");
        let data = SetVariableAttributes::new()
            .apply(sample(), &mut target)
            .await
            .unwrap();
        assert_eq!(data.variable, "tas");
        assert_eq!(data.attrs.get("units").map(String::as_str), Some("K"));

        let data = SetGlobalAttributes::new()
            .apply(data, &mut target)
            .await
            .unwrap();
        assert_eq!(
            data.attrs.get("source_id").map(String::as_str),
            Some("AWI-CM-1-1-HR")
        );
        assert!(!data.attrs.contains_key("realm"));
    }

    #[tokio::test]
    async fn test_load_data_missing_variable() {
        let step = LoadData::new(Arc::new(MemorySource::new()));
        let mut target = target("/unused");
        let err = step.apply(Dataset::default(), &mut target).await.unwrap_err();
        assert!(matches!(err, StepError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_save_dataset_records_output_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut target = target(dir.path().to_str().unwrap());
        let step = SaveDataset::new(Arc::new(JsonFileWriter::new()));

        step.apply(sample(), &mut target).await.unwrap();

        let path = PathBuf::from(target.attribute("output_path").unwrap());
        assert!(path.exists());
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        // 64 bytes of f64 with lat kept whole
        assert_eq!(written["encoding"]["chunk_shape"], serde_json::json!([4, 2]));
        assert_eq!(written["encoding"]["compression_level"], serde_json::json!(4));
    }

    #[tokio::test]
    async fn test_save_dataset_surfaces_chunking_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut target = target(dir.path().to_str().unwrap());
        let mut attributes = target.attributes().clone();
        attributes.insert("chunk_algorithm".to_string(), "even_divisor".to_string());
        attributes.insert("chunk_size".to_string(), "24".to_string());
        target = Target::new(target.id.clone(), "tas", attributes);

        let step = SaveDataset::new(Arc::new(JsonFileWriter::new()));
        let err = step.apply(sample(), &mut target).await.unwrap_err();
        assert!(matches!(
            err,
            StepError::Chunking(crate::chunking::ChunkingError::NoMatchingChunks { .. })
        ));
        assert!(target.attribute("output_path").is_none());
    }
}
