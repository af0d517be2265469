// Configuration Resolver
// Merges inherited attributes, compound-name derivations, table lookups and
// per-rule overrides into immutable targets

use super::compound::{CompoundName, CompoundNameError};
use super::models::{PipelineDefinition, RawTarget, RunConfig};
use crate::error::PipelineError;
use crate::metadata::{LookupError, MetadataLookup};
use crate::target::{InputSource, PipelineSpec, Target};

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of resolving one rule
#[derive(Debug, Clone)]
pub enum Resolution {
    /// A target ready for compilation
    Ready(Target),
    /// The rule is disabled and is reported as skipped
    Disabled { target_id: String },
    /// The rule could not be resolved
    Invalid {
        target_id: String,
        error: PipelineError,
    },
}

impl Resolution {
    pub fn target_id(&self) -> &str {
        match self {
            Resolution::Ready(target) => &target.id,
            Resolution::Disabled { target_id } | Resolution::Invalid { target_id, .. } => {
                target_id
            }
        }
    }
}

/// Turns raw rules into resolved targets.
///
/// Attribute precedence, lowest first: inherited block, compound-name
/// derivations, metadata table lookup, keys written on the rule itself.
pub struct ConfigurationResolver {
    inherited: BTreeMap<String, String>,
    pipelines: HashMap<String, PipelineDefinition>,
    required: Vec<String>,
    default_timeout: Option<Duration>,
    lookup: Option<Arc<dyn MetadataLookup>>,
}

impl ConfigurationResolver {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            inherited: stringify(&config.inherit),
            pipelines: config
                .pipelines
                .iter()
                .map(|p| (p.name.clone(), p.clone()))
                .collect(),
            required: config.engine.required_attributes.clone(),
            default_timeout: config.engine.chain_timeout(),
            lookup: None,
        }
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn MetadataLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Resolve every rule, in configuration order
    pub fn resolve_all(&self, rules: &[RawTarget]) -> Vec<Resolution> {
        rules
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                let target_id = target_id(index, raw);
                if !raw.enabled {
                    tracing::info!(target_id = %target_id, "rule disabled, skipping");
                    return Resolution::Disabled { target_id };
                }
                match self.resolve(index, raw) {
                    Ok(target) => Resolution::Ready(target),
                    Err(error) => {
                        tracing::warn!(target_id = %target_id, error = %error, "rule failed to resolve");
                        Resolution::Invalid { target_id, error }
                    }
                }
            })
            .collect()
    }

    /// Resolve a single rule into a target
    pub fn resolve(&self, index: usize, raw: &RawTarget) -> Result<Target, PipelineError> {
        let id = target_id(index, raw);
        let mut attributes = self.inherited.clone();

        let mut parsed_compound = None;
        if let Some(compound) = &raw.compound_name {
            let parsed: CompoundName = compound
                .parse()
                .map_err(|e: CompoundNameError| PipelineError::configuration(&id, e.to_string()))?;
            attributes.extend(parsed.derived_attributes());
            attributes.insert("compound_name".to_string(), compound.clone());

            if let Some(lookup) = &self.lookup {
                match lookup.lookup(compound) {
                    Ok(derived) => attributes.extend(derived),
                    Err(LookupError::NotFound(name)) => {
                        tracing::warn!(target_id = %id, compound_name = %name, "no metadata table entry");
                    }
                    Err(e) => return Err(PipelineError::configuration(&id, e.to_string())),
                }
            }
            parsed_compound = Some(parsed);
        }

        attributes.extend(stringify(&raw.attributes));
        if let Some(parsed) = &parsed_compound {
            for conflict in parsed.conflicts(&attributes) {
                tracing::warn!(target_id = %id, conflict = %conflict, "attribute disagrees with compound name");
            }
        }

        let inputs: Vec<InputSource> = raw
            .inputs
            .iter()
            .map(|input| InputSource {
                path: PathBuf::from(&input.path),
                pattern: input.pattern.clone(),
            })
            .collect();
        if inputs.is_empty() {
            return Err(PipelineError::configuration(&id, "no input sources configured"));
        }
        attributes.insert(
            "inputs".to_string(),
            raw.inputs
                .iter()
                .map(|i| format!("{}/{}", i.path.trim_end_matches('/'), i.pattern))
                .collect::<Vec<_>>()
                .join(";"),
        );

        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|key| attributes.get(*key).map_or(true, |v| v.trim().is_empty()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::configuration(
                &id,
                format!("missing required attribute(s): {}", missing.join(", ")),
            ));
        }

        let output_variable = attributes
            .get("cmor_variable")
            .cloned()
            .unwrap_or_else(|| id.clone());
        let pipeline = self.pipeline_for(&id, &raw.pipelines)?;

        let mut target = Target::new(id, output_variable, attributes)
            .with_inputs(inputs)
            .with_pipeline(pipeline);
        target.index = index;
        target.timeout = raw.timeout().or(self.default_timeout);

        tracing::debug!(
            target_id = %target.id,
            attributes = target.attributes().len(),
            "resolved target"
        );
        Ok(target)
    }

    fn pipeline_for(&self, id: &str, names: &[String]) -> Result<Vec<PipelineSpec>, PipelineError> {
        if names.is_empty() {
            return Err(PipelineError::configuration(id, "rule lists no pipelines"));
        }
        names
            .iter()
            .map(|name| match self.pipelines.get(name) {
                Some(definition) => pipeline_spec(id, definition),
                None if name == crate::steps::builtin::DEFAULT_PRESET => {
                    Ok(PipelineSpec::Preset(name.clone()))
                }
                None => Err(PipelineError::configuration(
                    id,
                    format!("unknown pipeline '{}'", name),
                )),
            })
            .collect()
    }
}

fn pipeline_spec(id: &str, definition: &PipelineDefinition) -> Result<PipelineSpec, PipelineError> {
    match (&definition.uses, &definition.steps) {
        (Some(preset), None) => Ok(PipelineSpec::Preset(preset.clone())),
        (None, Some(steps)) if !steps.is_empty() => Ok(PipelineSpec::Steps(steps.clone())),
        (None, Some(_)) => Err(PipelineError::configuration(
            id,
            format!("pipeline '{}' has no steps", definition.name),
        )),
        _ => Err(PipelineError::configuration(
            id,
            format!(
                "pipeline '{}' must define exactly one of 'uses' or 'steps'",
                definition.name
            ),
        )),
    }
}

/// Report identifier of a rule: its name, compound name, variable or position
fn target_id(index: usize, raw: &RawTarget) -> String {
    raw.name
        .clone()
        .or_else(|| raw.compound_name.clone())
        .or_else(|| {
            raw.attributes
                .get("cmor_variable")
                .and_then(scalar_to_string)
        })
        .unwrap_or_else(|| format!("rule_{}", index))
}

fn stringify(values: &BTreeMap<String, serde_yaml::Value>) -> BTreeMap<String, String> {
    values
        .iter()
        .filter_map(|(k, v)| scalar_to_string(v).map(|s| (k.clone(), s)))
        .collect()
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::Null => None,
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        other => serde_json::to_string(other).ok(),
    }
}
