// Chain Execution
// Runs a compiled chain's steps in order, consulting the step cache

use super::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::cache::{CacheSource, StepCache, StepOutput};
use crate::data::Dataset;
use crate::error::PipelineError;
use crate::pipeline::TaskChain;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Record of one executed step
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub name: String,
    pub cache: CacheSource,
    pub duration: Duration,
}

/// Result of a chain that ran to completion
#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub target_id: String,
    /// Output of the last step
    pub data: Dataset,
    /// Scratch annotations left by the chain's steps
    pub annotations: BTreeMap<String, String>,
    pub steps: Vec<StepRecord>,
    pub duration: Duration,
}

impl ChainOutcome {
    /// Path recorded by the terminal write step, if it ran
    pub fn output_path(&self) -> Option<&str> {
        self.annotations.get("output_path").map(String::as_str)
    }
}

/// Execute every step of `chain` in declared order.
///
/// The first failing step ends the chain. `cancelled` is checked before each
/// step so an abandoned chain starts no further steps.
pub async fn run_chain(
    chain: &TaskChain,
    cache: &StepCache,
    progress: &Option<ProgressSender>,
    cancelled: &AtomicBool,
) -> Result<ChainOutcome, PipelineError> {
    let started = Instant::now();
    let mut target = chain.target().clone();
    target.clear_scratch();
    let target_id = target.id.clone();

    progress.send_event(ExecutionEvent::TargetStarted {
        target_id: target_id.clone(),
        total_steps: chain.steps().len(),
    });

    let mut data = Dataset::default();
    let mut records = Vec::with_capacity(chain.steps().len());

    for bound in chain.steps() {
        if cancelled.load(Ordering::SeqCst) {
            return Err(PipelineError::Cancelled {
                target: target_id.clone(),
            });
        }

        progress.send_event(ExecutionEvent::step_started(
            &target_id,
            bound.name(),
            bound.index(),
        ));
        let step_started = Instant::now();
        let input = std::mem::take(&mut data);

        let result = if bound.cacheable() {
            let key = bound.cache_key(&input, &target);
            let step = bound.step().clone();
            let mut working = target.clone();
            cache
                .get_or_compute(&key, || async move {
                    let before = working.scratch().clone();
                    let data = step
                        .apply(input, &mut working)
                        .await
                        .map_err(|e| PipelineError::step(step.name(), e))?;
                    let annotations = working
                        .scratch()
                        .iter()
                        .filter(|(k, v)| before.get(*k) != Some(*v))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    Ok(StepOutput { data, annotations })
                })
                .await
                .map(|(entry, source)| {
                    for (key, value) in &entry.output.annotations {
                        target.annotate(key.clone(), value.clone());
                    }
                    (entry.output.data.clone(), source)
                })
        } else {
            bound
                .step()
                .apply(input, &mut target)
                .await
                .map(|data| (data, CacheSource::Bypassed))
                .map_err(|e| PipelineError::step(bound.name(), e))
        };

        match result {
            Ok((output, source)) => {
                let duration = step_started.elapsed();
                tracing::debug!(
                    step = %bound.name(),
                    cache = ?source,
                    duration_ms = duration.as_millis() as u64,
                    "step completed"
                );
                progress.send_event(ExecutionEvent::step_completed(
                    &target_id,
                    bound.name(),
                    bound.index(),
                    source,
                    duration,
                ));
                records.push(StepRecord {
                    name: bound.name().to_string(),
                    cache: source,
                    duration,
                });
                data = output;
            }
            Err(e) => {
                tracing::warn!(step = %bound.name(), error = %e, "step failed");
                progress.send_event(ExecutionEvent::StepFailed {
                    target_id: target_id.clone(),
                    step_name: bound.name().to_string(),
                    step_index: bound.index(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        }
    }

    Ok(ChainOutcome {
        target_id,
        data,
        annotations: target.scratch().clone(),
        steps: records,
        duration: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::events::progress_channel;
    use crate::pipeline::PipelineCompiler;
    use crate::steps::{FnStep, StepError, StepRegistry};
    use crate::target::{PipelineSpec, Target};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn registry(calls: Arc<AtomicUsize>) -> Arc<StepRegistry> {
        let mut registry = StepRegistry::new();
        registry
            .register(FnStep::new("seed", |_, target: &mut Target| {
                target.annotate("seeded", "yes");
                Ok(Dataset::new("tas").with_values(vec![1.0, 2.0]))
            }))
            .unwrap();
        registry
            .register(FnStep::new("double", move |mut data: Dataset, _: &mut Target| {
                calls.fetch_add(1, Ordering::SeqCst);
                data.values.iter_mut().for_each(|v| *v *= 2.0);
                Ok(data)
            }))
            .unwrap();
        registry
            .register(FnStep::new("explode", |_, _| Err(StepError::failed("bad input"))))
            .unwrap();
        registry
            .register(
                FnStep::new("mark", |data, target: &mut Target| {
                    let seeded = target.require("seeded")?.to_string();
                    target.annotate("mark", seeded);
                    Ok(data)
                })
                .uncached(),
            )
            .unwrap();
        Arc::new(registry)
    }

    fn chain(registry: Arc<StepRegistry>, steps: &[&str]) -> TaskChain {
        let target = Target::new("tas", "tas", BTreeMap::new()).with_pipeline(vec![
            PipelineSpec::Steps(steps.iter().map(|s| s.to_string()).collect()),
        ]);
        PipelineCompiler::new(registry).compile(&target).unwrap()
    }

    #[tokio::test]
    async fn test_runs_steps_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = chain(registry(calls.clone()), &["seed", "double", "double", "mark"]);
        let cache = StepCache::new();
        let (tx, mut rx) = progress_channel();

        let outcome = run_chain(&chain, &cache, &Some(tx), &AtomicBool::new(false))
            .await
            .unwrap();

        assert_eq!(outcome.data.values, vec![4.0, 8.0]);
        assert_eq!(outcome.annotations.get("mark").map(String::as_str), Some("yes"));
        assert_eq!(outcome.steps.len(), 4);
        assert_eq!(outcome.steps[3].cache, CacheSource::Bypassed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(matches!(
            rx.recv().await.unwrap(),
            ExecutionEvent::TargetStarted { total_steps: 4, .. }
        ));
    }

    #[tokio::test]
    async fn test_cache_hit_replays_annotations() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = chain(registry(calls.clone()), &["seed", "double", "mark"]);
        let cache = StepCache::new();
        let flag = AtomicBool::new(false);

        run_chain(&chain, &cache, &None, &flag).await.unwrap();
        let second = run_chain(&chain, &cache, &None, &flag).await.unwrap();

        assert_eq!(second.steps[0].cache, CacheSource::Hit);
        assert_eq!(second.steps[1].cache, CacheSource::Hit);
        // `mark` reads the annotation `seed` made on the first run
        assert_eq!(second.annotations.get("mark").map(String::as_str), Some("yes"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_stops_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = chain(registry(calls.clone()), &["seed", "explode", "double"]);
        let cache = StepCache::new();

        let err = run_chain(&chain, &cache, &None, &AtomicBool::new(false))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StepExecution { ref step, .. } if step == "explode"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_chain_runs_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = chain(registry(calls.clone()), &["double"]);
        let err = run_chain(&chain, &StepCache::new(), &None, &AtomicBool::new(true))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
