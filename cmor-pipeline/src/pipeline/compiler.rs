// Pipeline Compiler
// Binds a target's step references to registered steps, producing a task chain

use super::key::CacheKey;
use crate::data::Dataset;
use crate::error::PipelineError;
use crate::steps::{Step, StepRegistry};
use crate::target::{PipelineSpec, Target};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A step bound to its position in a chain
#[derive(Clone)]
pub struct BoundStep {
    step: Arc<dyn Step>,
    index: usize,
}

impl BoundStep {
    pub fn name(&self) -> &str {
        self.step.name()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn step(&self) -> &Arc<dyn Step> {
        &self.step
    }

    pub fn cacheable(&self) -> bool {
        self.step.cacheable()
    }

    /// Key for running this step on `input` for `target`
    pub fn cache_key(&self, input: &Dataset, target: &Target) -> CacheKey {
        let fingerprint = input.fingerprint();
        CacheKey::derive(
            self.name(),
            &fingerprint,
            self.step
                .relevant_attributes()
                .iter()
                .map(|name| (name.as_str(), target.attribute(name))),
        )
    }
}

impl fmt::Debug for BoundStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundStep")
            .field("name", &self.name())
            .field("index", &self.index)
            .finish()
    }
}

/// Compiled, ordered step sequence for one target
#[derive(Debug, Clone)]
pub struct TaskChain {
    target: Target,
    steps: Arc<[BoundStep]>,
}

impl TaskChain {
    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn target_id(&self) -> &str {
        &self.target.id
    }

    pub fn steps(&self) -> &[BoundStep] {
        &self.steps
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(BoundStep::name).collect()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.target.timeout
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.target.timeout = timeout;
        self
    }
}

/// Compiles targets against a step registry. Compilation runs nothing, so a
/// target can be recompiled for every retry.
#[derive(Debug, Clone)]
pub struct PipelineCompiler {
    registry: Arc<StepRegistry>,
}

impl PipelineCompiler {
    pub fn new(registry: Arc<StepRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn compile(&self, target: &Target) -> Result<TaskChain, PipelineError> {
        let mut names: Vec<&str> = Vec::new();
        for spec in &target.pipeline {
            match spec {
                PipelineSpec::Steps(steps) => names.extend(steps.iter().map(String::as_str)),
                PipelineSpec::Preset(preset) => {
                    let steps = self
                        .registry
                        .preset(preset)
                        .ok_or_else(|| PipelineError::unknown_step(&target.id, preset))?;
                    names.extend(steps.iter().map(String::as_str));
                }
            }
        }

        if names.is_empty() {
            return Err(PipelineError::configuration(&target.id, "pipeline has no steps"));
        }

        let steps = names
            .into_iter()
            .enumerate()
            .map(|(index, name)| {
                self.registry
                    .get(name)
                    .map(|step| BoundStep { step, index })
                    .ok_or_else(|| PipelineError::unknown_step(&target.id, name))
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(target_id = %target.id, steps = steps.len(), "compiled task chain");

        Ok(TaskChain {
            target: target.clone(),
            steps: steps.into(),
        })
    }
}
