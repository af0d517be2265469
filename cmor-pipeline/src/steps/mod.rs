// Steps Module
// Step contract, closure adapter and the name-keyed step registry

pub mod builtin;
pub mod registry;

pub use registry::{RegistryError, StepRegistry};

use crate::chunking::ChunkingError;
use crate::data::Dataset;
use crate::target::Target;

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by a step while transforming data
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    #[error("{0}")]
    Failed(String),

    /// A failure the step expects to clear up on retry
    #[error("transient failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Chunking(#[from] ChunkingError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("write failed: {0}")]
    Write(String),
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StepError::Transient(_))
    }
}

/// A named transformation `(data, target) -> data`.
///
/// Steps hold no per-run state. The target may be annotated but its resolved
/// attributes are read-only.
#[async_trait::async_trait]
pub trait Step: Send + Sync {
    /// Stable name, part of every cache key this step produces
    fn name(&self) -> &str;

    /// Target attributes whose values influence this step's output
    fn relevant_attributes(&self) -> &[String] {
        &[]
    }

    /// Whether outputs may be memoized in the step cache
    fn cacheable(&self) -> bool {
        true
    }

    async fn apply(&self, data: Dataset, target: &mut Target) -> Result<Dataset, StepError>;
}

type StepFn = dyn Fn(Dataset, &mut Target) -> Result<Dataset, StepError> + Send + Sync;

/// Adapts a synchronous closure into a [`Step`]
pub struct FnStep {
    name: String,
    relevant: Vec<String>,
    cacheable: bool,
    func: Arc<StepFn>,
}

impl FnStep {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Dataset, &mut Target) -> Result<Dataset, StepError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            relevant: Vec::new(),
            cacheable: true,
            func: Arc::new(func),
        }
    }

    pub fn with_relevant_attributes<S: Into<String>>(
        mut self,
        attributes: impl IntoIterator<Item = S>,
    ) -> Self {
        self.relevant = attributes.into_iter().map(Into::into).collect();
        self
    }

    pub fn uncached(mut self) -> Self {
        self.cacheable = false;
        self
    }
}

impl fmt::Debug for FnStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStep")
            .field("name", &self.name)
            .field("relevant", &self.relevant)
            .field("cacheable", &self.cacheable)
            .finish()
    }
}

#[async_trait::async_trait]
impl Step for FnStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn relevant_attributes(&self) -> &[String] {
        &self.relevant
    }

    fn cacheable(&self) -> bool {
        self.cacheable
    }

    /// Runs the closure on the blocking pool so a slow or stuck closure never
    /// holds a runtime worker, and an abandoned chain can be dropped at once
    async fn apply(&self, data: Dataset, target: &mut Target) -> Result<Dataset, StepError> {
        let func = Arc::clone(&self.func);
        let mut working = target.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let result = func(data, &mut working);
            (result, working)
        })
        .await;

        match joined {
            Ok((result, working)) => {
                *target = working;
                result
            }
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(StepError::failed(format!("step '{}' did not complete: {}", self.name, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_fn_step_applies_closure() {
        let step = FnStep::new("scale", |mut data: Dataset, target: &mut Target| {
            let factor: f64 = target
                .require("scale_factor")?
                .parse()
                .map_err(|_| StepError::failed("bad scale_factor"))?;
            data.values.iter_mut().for_each(|v| *v *= factor);
            target.annotate("scaled", "yes");
            Ok(data)
        })
        .with_relevant_attributes(["scale_factor"]);

        let mut attributes = BTreeMap::new();
        attributes.insert("scale_factor".to_string(), "2".to_string());
        let mut target = Target::new("pr", "pr", attributes);

        let out = step
            .apply(Dataset::new("pr").with_values(vec![1.0, 3.0]), &mut target)
            .await
            .unwrap();

        assert_eq!(out.values, vec![2.0, 6.0]);
        assert_eq!(target.attribute("scaled"), Some("yes"));
        assert_eq!(step.relevant_attributes(), &["scale_factor".to_string()]);
        assert!(step.cacheable());
    }

    #[tokio::test]
    async fn test_blocking_closure_leaves_runtime_free() {
        let step = Arc::new(FnStep::new("slow", |data, _| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(data)
        }));
        let task = tokio::spawn({
            let step = Arc::clone(&step);
            async move {
                let mut target = Target::new("tas", "tas", BTreeMap::new());
                step.apply(Dataset::default(), &mut target).await
            }
        });

        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_closure_panic_reaches_caller() {
        let step = FnStep::new("boom", |_, _| panic!("closure failed"));
        let joined = tokio::spawn(async move {
            let mut target = Target::new("tas", "tas", BTreeMap::new());
            step.apply(Dataset::default(), &mut target).await
        })
        .await;

        let err = joined.unwrap_err();
        assert!(err.is_panic());
        assert_eq!(err.into_panic().downcast_ref::<&str>(), Some(&"closure failed"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(StepError::transient("busy").is_transient());
        assert!(!StepError::failed("broken").is_transient());
        assert!(!StepError::from(ChunkingError::InvalidByteSize("x".into())).is_transient());
    }
}
