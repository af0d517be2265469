// Target
// A fully resolved output quantity and its per-execution scratch state

use crate::steps::StepError;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Where a target reads its input files from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSource {
    /// Root directory searched for input files
    pub path: PathBuf,
    /// File-name pattern matched under the root
    pub pattern: String,
}

/// One segment of a target's pipeline, before compilation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineSpec {
    /// Explicit ordered step names
    Steps(Vec<String>),
    /// A named preset registered with the step registry
    Preset(String),
}

/// A resolved target. Attributes are fixed once resolution finishes; only the
/// scratch map changes while its chain runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Stable identifier used in logs and the run report
    pub id: String,
    /// Position of the rule in the configuration
    pub index: usize,
    pub inputs: Vec<InputSource>,
    /// Name of the output quantity
    pub output_variable: String,
    pub pipeline: Vec<PipelineSpec>,
    /// Maximum wall-clock time for one attempt of this target's chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<std::time::Duration>,
    attributes: BTreeMap<String, String>,
    #[serde(default)]
    scratch: BTreeMap<String, String>,
}

impl Target {
    pub fn new(
        id: impl Into<String>,
        output_variable: impl Into<String>,
        attributes: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: id.into(),
            index: 0,
            inputs: Vec::new(),
            output_variable: output_variable.into(),
            pipeline: Vec::new(),
            timeout: None,
            attributes,
            scratch: BTreeMap::new(),
        }
    }

    pub fn with_pipeline(mut self, pipeline: Vec<PipelineSpec>) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<InputSource>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Resolved metadata attributes
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// Annotations written by steps during the current execution
    pub fn scratch(&self) -> &BTreeMap<String, String> {
        &self.scratch
    }

    /// Look up a value, resolved attributes first, then scratch annotations
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .or_else(|| self.scratch.get(key))
            .map(String::as_str)
    }

    /// Like [`Target::attribute`], but a missing key is a step failure
    pub fn require(&self, key: &str) -> Result<&str, StepError> {
        self.attribute(key).ok_or_else(|| {
            StepError::failed(format!(
                "target '{}' has no attribute '{}'",
                self.id, key
            ))
        })
    }

    /// Record a value for later steps of the same chain
    pub fn annotate(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.scratch.insert(key.into(), value.into());
    }

    pub(crate) fn clear_scratch(&mut self) {
        self.scratch.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Target {
        let mut attributes = BTreeMap::new();
        attributes.insert("source_id".to_string(), "AWI-CM-1-1-HR".to_string());
        Target::new("tas", "tas", attributes)
    }

    #[test]
    fn test_attributes_take_precedence_over_scratch() {
        let mut target = sample();
        target.annotate("source_id", "other");
        target.annotate("output_path", "/tmp/tas.nc");

        assert_eq!(target.attribute("source_id"), Some("AWI-CM-1-1-HR"));
        assert_eq!(target.attribute("output_path"), Some("/tmp/tas.nc"));
        assert_eq!(target.scratch().len(), 2);
    }

    #[test]
    fn test_require_missing_attribute() {
        let target = sample();
        let err = target.require("grid_label").unwrap_err();
        assert!(err.to_string().contains("grid_label"));
    }

    #[test]
    fn test_clear_scratch() {
        let mut target = sample();
        target.annotate("n", "1");
        target.clear_scratch();
        assert!(target.scratch().is_empty());
        assert_eq!(target.attribute("source_id"), Some("AWI-CM-1-1-HR"));
    }
}
