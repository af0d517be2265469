// Step Registry
// Name-keyed table of steps and presets, validated when entries are added

use super::{builtin, Step};
use crate::io::{DataSource, StorageWriter};

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while populating the registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("invalid step name '{0}'")]
    InvalidName(String),

    #[error("step '{0}' is already registered")]
    DuplicateStep(String),

    #[error("preset '{0}' is already registered")]
    DuplicatePreset(String),

    #[error("preset '{preset}' references unknown step '{step}'")]
    UnknownStepInPreset { preset: String, step: String },

    #[error("preset '{0}' has no steps")]
    EmptyPreset(String),
}

/// Registry of steps and named presets
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
    presets: HashMap<String, Vec<String>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in step catalog and the `default` preset
    pub fn with_builtins(source: Arc<dyn DataSource>, writer: Arc<dyn StorageWriter>) -> Self {
        let mut registry = Self::new();
        for step in builtin::catalog(source, writer) {
            // built-in names are unique and well-formed
            if let Err(e) = registry.register_arc(step) {
                tracing::error!(error = %e, "failed to register built-in step");
            }
        }
        if let Err(e) = registry.register_preset(builtin::DEFAULT_PRESET, builtin::DEFAULT_STEPS) {
            tracing::error!(error = %e, "failed to register default preset");
        }
        registry
    }

    pub fn register(&mut self, step: impl Step + 'static) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(step))
    }

    pub fn register_arc(&mut self, step: Arc<dyn Step>) -> Result<(), RegistryError> {
        let name = step.name().to_string();
        validate_name(&name)?;
        if self.steps.contains_key(&name) {
            return Err(RegistryError::DuplicateStep(name));
        }
        tracing::debug!(step = %name, "registered step");
        self.steps.insert(name, step);
        Ok(())
    }

    /// Register a preset. Every referenced step must already be registered.
    pub fn register_preset<S: AsRef<str>>(
        &mut self,
        name: &str,
        steps: impl IntoIterator<Item = S>,
    ) -> Result<(), RegistryError> {
        validate_name(name)?;
        if self.presets.contains_key(name) {
            return Err(RegistryError::DuplicatePreset(name.to_string()));
        }
        let steps: Vec<String> = steps.into_iter().map(|s| s.as_ref().to_string()).collect();
        if steps.is_empty() {
            return Err(RegistryError::EmptyPreset(name.to_string()));
        }
        if let Some(missing) = steps.iter().find(|s| !self.steps.contains_key(s.as_str())) {
            return Err(RegistryError::UnknownStepInPreset {
                preset: name.to_string(),
                step: missing.clone(),
            });
        }
        self.presets.insert(name.to_string(), steps);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(name).cloned()
    }

    pub fn preset(&self, name: &str) -> Option<&[String]> {
        self.presets.get(name).map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    /// Registered step names, sorted
    pub fn step_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.steps.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.step_names())
            .field("presets", &self.presets)
            .finish()
    }
}

fn validate_name(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(RegistryError::InvalidName(name.to_string()));
    }
    Ok(())
}
