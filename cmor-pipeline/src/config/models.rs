// Run Configuration Models
// Serde types for the run document: engine settings, inherited block, pipelines and rules

use crate::coordinator::RetryPolicy;
use crate::execution::ClusterDescriptor;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Attributes every target must carry after resolution
pub const DEFAULT_REQUIRED_ATTRIBUTES: &[&str] = &[
    "cmor_variable",
    "source_id",
    "experiment_id",
    "variant_label",
    "grid_label",
    "output_directory",
];

/// Errors that can occur while loading a run document
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid run configuration at line {line}, column {column}: {message}")]
    Yaml {
        message: String,
        line: usize,
        column: usize,
    },
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        let (line, column) = e
            .location()
            .map(|l| (l.line(), l.column()))
            .unwrap_or((0, 0));
        ConfigError::Yaml {
            message: e.to_string(),
            line,
            column,
        }
    }
}

/// Complete run document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub engine: EngineSettings,

    /// Attributes inherited by every rule
    #[serde(default)]
    pub inherit: BTreeMap<String, serde_yaml::Value>,

    #[serde(default)]
    pub pipelines: Vec<PipelineDefinition>,

    #[serde(default)]
    pub rules: Vec<RawTarget>,
}

impl RunConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }
}

/// Engine-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub cluster: ClusterDescriptor,

    /// Default wall-clock limit per chain attempt, in seconds
    #[serde(default)]
    pub chain_timeout: Option<f64>,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default = "default_required_attributes")]
    pub required_attributes: Vec<String>,
}

fn default_required_attributes() -> Vec<String> {
    DEFAULT_REQUIRED_ATTRIBUTES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            cluster: ClusterDescriptor::default(),
            chain_timeout: None,
            retry: RetryPolicy::default(),
            required_attributes: default_required_attributes(),
        }
    }
}

impl EngineSettings {
    pub fn chain_timeout(&self) -> Option<Duration> {
        seconds(self.chain_timeout)
    }
}

/// One input location of a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub path: String,
    #[serde(default = "default_pattern")]
    pub pattern: String,
}

fn default_pattern() -> String {
    "*".to_string()
}

/// Named pipeline: either explicit steps or a registered preset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub uses: Option<String>,
    #[serde(default)]
    pub steps: Option<Vec<String>>,
}

/// A rule as written in the run document, before resolution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTarget {
    #[serde(default)]
    pub name: Option<String>,

    /// `realm.variable.branding.frequency.region`
    #[serde(default)]
    pub compound_name: Option<String>,

    #[serde(default)]
    pub inputs: Vec<InputSpec>,

    #[serde(default = "default_pipelines")]
    pub pipelines: Vec<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Wall-clock limit for this rule's chain, in seconds
    #[serde(default)]
    pub timeout: Option<f64>,

    /// Every other key is a target attribute
    #[serde(flatten)]
    pub attributes: BTreeMap<String, serde_yaml::Value>,
}

fn default_pipelines() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_enabled() -> bool {
    true
}

impl RawTarget {
    pub fn new() -> Self {
        Self {
            pipelines: default_pipelines(),
            enabled: true,
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes
            .insert(key.into(), serde_yaml::Value::String(value.into()));
        self
    }

    pub fn with_input(mut self, path: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.inputs.push(InputSpec {
            path: path.into(),
            pattern: pattern.into(),
        });
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        seconds(self.timeout)
    }
}

/// Positive second counts only; values too large for a `Duration` are dropped
fn seconds(value: Option<f64>) -> Option<Duration> {
    value
        .filter(|s| *s > 0.0)
        .and_then(|s| Duration::try_from_secs_f64(s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ScalingMode;

    const RUN: &str = r#"
engine:
  cluster:
    kind: local
    scaling:
      mode: fixed
      count: 2
  chain_timeout: 30
  retry:
    max_attempts: 2
inherit:
  source_id: AWI-CM-1-1-HR
  experiment_id: historical
  chunk_size: 50MB
pipelines:
  - name: custom
    steps: [load_data, save_dataset]
rules:
  - name: sst
    compound_name: ocean.tos.tavg-u-hxy-sea.mon.GLB
    inputs:
      - path: /data/fesom
        pattern: "sst_*.nc"
    pipelines: [custom]
    grid_label: gn
    levels: 47
  - name: off
    enabled: false
"#;

    #[test]
    fn test_parse_run_document() {
        let config = RunConfig::from_yaml_str(RUN).unwrap();
        assert_eq!(config.engine.cluster.scaling, ScalingMode::Fixed { count: 2 });
        assert_eq!(config.engine.chain_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.engine.retry.max_attempts, 2);
        assert_eq!(config.engine.required_attributes.len(), 6);
        assert_eq!(config.inherit.len(), 3);
        assert_eq!(config.pipelines[0].steps.as_ref().unwrap().len(), 2);

        let rule = &config.rules[0];
        assert_eq!(rule.name.as_deref(), Some("sst"));
        assert_eq!(rule.inputs[0].pattern, "sst_*.nc");
        assert_eq!(rule.pipelines, vec!["custom".to_string()]);
        assert!(rule.enabled);
        assert!(rule.attributes.contains_key("grid_label"));
        assert!(rule.attributes.contains_key("levels"));
        assert!(!rule.attributes.contains_key("inputs"));

        let off = &config.rules[1];
        assert!(!off.enabled);
        assert_eq!(off.pipelines, vec!["default".to_string()]);
    }

    #[test]
    fn test_timeout_seconds() {
        let rule = |timeout: f64| RawTarget {
            timeout: Some(timeout),
            ..RawTarget::new()
        };
        assert_eq!(rule(1.5).timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(rule(0.0).timeout(), None);
        assert_eq!(rule(-3.0).timeout(), None);
        assert_eq!(rule(f64::NAN).timeout(), None);
        assert_eq!(rule(f64::INFINITY).timeout(), None);

        let engine: EngineSettings = serde_yaml::from_str("chain_timeout: 1e30").unwrap();
        assert_eq!(engine.chain_timeout(), None);
    }

    #[test]
    fn test_yaml_error() {
        let err = RunConfig::from_yaml_str("rules: [unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml { .. }));
        assert!(err.to_string().starts_with("invalid run configuration"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.yaml");
        std::fs::write(&path, RUN).unwrap();
        assert_eq!(RunConfig::from_file(&path).unwrap().rules.len(), 2);
        assert!(matches!(
            RunConfig::from_file(dir.path().join("missing.yaml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
