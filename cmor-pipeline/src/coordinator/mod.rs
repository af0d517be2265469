// Run Coordinator
// Resolves every rule, dispatches the resulting chains and aggregates the run report

pub mod report;
pub mod retry;

pub use report::{RunReport, TargetReport, TargetStatus};
pub use retry::RetryPolicy;

use crate::cache::StepCache;
use crate::config::{ConfigurationResolver, Resolution, RunConfig};
use crate::error::{ErrorKind, PipelineError};
use crate::execution::{
    ClusterKind, EventSender, ExecutionEvent, LocalWorkerPool, ProgressSender, WorkerPool,
};
use crate::metadata::MetadataLookup;
use crate::pipeline::PipelineCompiler;
use crate::steps::StepRegistry;
use crate::target::Target;

use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Top-level driver of a standardization run.
///
/// Every configured rule contributes exactly one entry to the report. A
/// failing target never aborts another target or the run.
pub struct RunCoordinator {
    registry: Arc<StepRegistry>,
    lookup: Option<Arc<dyn MetadataLookup>>,
    progress: Option<ProgressSender>,
    cache: Arc<StepCache>,
    pool: Option<Arc<dyn WorkerPool>>,
}

impl RunCoordinator {
    pub fn new(registry: Arc<StepRegistry>) -> Self {
        Self {
            registry,
            lookup: None,
            progress: None,
            cache: Arc::new(StepCache::new()),
            pool: None,
        }
    }

    /// Metadata table consulted while resolving rules
    pub fn with_lookup(mut self, lookup: Arc<dyn MetadataLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Share a step cache across runs
    pub fn with_cache(mut self, cache: Arc<StepCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Run chains on an externally managed pool instead of a local one.
    /// The coordinator does not shut an external pool down.
    pub fn with_pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn cache(&self) -> &Arc<StepCache> {
        &self.cache
    }

    /// Execute every rule of `config` and report the outcome of each
    pub async fn run(&self, config: &RunConfig) -> RunReport {
        let started = Instant::now();

        let mut resolver = ConfigurationResolver::new(config);
        if let Some(lookup) = &self.lookup {
            resolver = resolver.with_lookup(Arc::clone(lookup));
        }
        let resolutions = resolver.resolve_all(&config.rules);

        tracing::info!(targets = resolutions.len(), "starting run");
        self.progress.send_event(ExecutionEvent::RunStarted {
            total_targets: resolutions.len(),
        });

        let (pool, owned) = match &self.pool {
            Some(pool) => (Some(Arc::clone(pool)), false),
            None => match config.engine.cluster.kind {
                ClusterKind::Local => {
                    let pool = match &self.progress {
                        Some(tx) => LocalWorkerPool::with_progress(
                            &config.engine.cluster,
                            Arc::clone(&self.cache),
                            tx.clone(),
                        ),
                        None => LocalWorkerPool::new(&config.engine.cluster, Arc::clone(&self.cache)),
                    };
                    (Some(Arc::new(pool) as Arc<dyn WorkerPool>), true)
                }
                kind => {
                    tracing::error!(?kind, "no worker pool available for cluster kind");
                    (None, false)
                }
            },
        };

        let compiler = PipelineCompiler::new(Arc::clone(&self.registry));
        let policy = &config.engine.retry;

        let drivers = resolutions.into_iter().map(|resolution| {
            let pool = pool.clone();
            let compiler = &compiler;
            async move {
                let entry = match resolution {
                    Resolution::Disabled { target_id } => TargetReport::skipped(target_id),
                    Resolution::Invalid { target_id, error } => {
                        TargetReport::failed(target_id, &error, Duration::ZERO, 1)
                    }
                    Resolution::Ready(target) => match pool {
                        Some(pool) => self.drive(pool.as_ref(), compiler, policy, target).await,
                        None => {
                            let error = PipelineError::configuration(
                                &target.id,
                                format!(
                                    "cluster kind '{:?}' requires an externally provided worker pool",
                                    config.engine.cluster.kind
                                ),
                            );
                            TargetReport::failed(target.id.clone(), &error, Duration::ZERO, 1)
                        }
                    },
                };
                self.progress.send_event(ExecutionEvent::target_completed(
                    &entry.target_id,
                    entry.status,
                    entry.duration,
                ));
                entry
            }
        });
        let entries = join_all(drivers).await;

        if owned {
            if let Some(pool) = &pool {
                pool.shutdown().await;
            }
        }

        let report = RunReport {
            entries,
            duration: started.elapsed(),
            cache: self.cache.stats(),
        };
        tracing::info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            skipped = report.skipped(),
            duration_ms = report.duration.as_millis() as u64,
            "run completed"
        );
        self.progress.send_event(ExecutionEvent::RunCompleted {
            success: report.success(),
            duration: report.duration,
        });
        report
    }

    /// Submit one target, resubmitting a freshly compiled chain while the
    /// retry policy allows it
    async fn drive(
        &self,
        pool: &dyn WorkerPool,
        compiler: &PipelineCompiler,
        policy: &RetryPolicy,
        target: Target,
    ) -> TargetReport {
        let started = Instant::now();
        let mut attempt = 0;
        let mut timeouts = 0;

        loop {
            attempt += 1;
            let chain = match compiler.compile(&target) {
                Ok(chain) => chain,
                Err(error) => {
                    tracing::warn!(target_id = %target.id, error = %error, "target failed to compile");
                    return TargetReport::failed(&target.id, &error, started.elapsed(), attempt);
                }
            };

            self.progress.send_event(ExecutionEvent::TargetQueued {
                target_id: target.id.clone(),
                attempt,
            });
            let handle = pool.submit(chain);
            let error = match handle.await {
                Ok(outcome) => {
                    tracing::info!(
                        target_id = %target.id,
                        attempt,
                        duration_ms = outcome.duration.as_millis() as u64,
                        "target succeeded"
                    );
                    return TargetReport::succeeded(
                        &target.id,
                        started.elapsed(),
                        attempt,
                        outcome.output_path().map(str::to_string),
                    );
                }
                Err(error) => error,
            };

            if error.kind() == ErrorKind::Timeout {
                timeouts += 1;
            }
            if !policy.should_retry(&error, attempt, timeouts) {
                tracing::error!(target_id = %target.id, attempt, error = %error, "target failed");
                return TargetReport::failed(&target.id, &error, started.elapsed(), attempt);
            }

            let delay = policy.backoff(attempt);
            tracing::warn!(
                target_id = %target.id,
                attempt,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "attempt failed, retrying"
            );
            self.progress.send_event(ExecutionEvent::TargetRetrying {
                target_id: target.id.clone(),
                attempt,
                error_kind: error.kind(),
                delay,
            });
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawTarget;
    use crate::data::Dataset;
    use crate::execution::ClusterDescriptor;
    use crate::steps::{FnStep, StepError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rule(name: &str) -> RawTarget {
        let mut rule = RawTarget::new()
            .with_attribute("cmor_variable", name)
            .with_input("/data/in", "*.nc");
        rule.name = Some(name.to_string());
        rule
    }

    fn config(pipeline: &[&str], rules: Vec<RawTarget>) -> RunConfig {
        let mut config = RunConfig::from_yaml_str(&format!(
            "engine:\n  required_attributes: [cmor_variable]\n  retry:\n    initial_backoff_ms: 1\n    max_backoff_ms: 2\n  cluster:\n    scaling:\n      mode: fixed\n      count: 2\npipelines:\n  - name: default\n    steps: [{}]\n",
            pipeline.join(", ")
        ))
        .unwrap();
        config.rules = rules;
        config
    }

    fn registry(flaky_failures: usize) -> Arc<StepRegistry> {
        let remaining = Arc::new(AtomicUsize::new(flaky_failures));
        let mut registry = StepRegistry::new();
        registry
            .register(FnStep::new("emit", |_, target: &mut Target| {
                Ok(Dataset::new(target.output_variable.clone()).with_values(vec![1.0]))
            }))
            .unwrap();
        registry
            .register(
                FnStep::new("flaky", move |data, _| {
                    if remaining
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                    {
                        return Err(StepError::transient("storage busy"));
                    }
                    Ok(data)
                })
                .uncached(),
            )
            .unwrap();
        registry
            .register(FnStep::new("broken", |_, _| Err(StepError::failed("corrupt input"))))
            .unwrap();
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_report_in_configuration_order() {
        let mut disabled = rule("hus");
        disabled.enabled = false;
        let config = config(&["emit"], vec![rule("tas"), disabled, RawTarget::new(), rule("pr")]);

        let report = RunCoordinator::new(registry(0)).run(&config).await;
        let ids: Vec<_> = report.entries.iter().map(|e| e.target_id.as_str()).collect();
        assert_eq!(ids, vec!["tas", "hus", "rule_2", "pr"]);
        assert_eq!(report.entries[0].status, TargetStatus::Succeeded);
        assert_eq!(report.entries[1].status, TargetStatus::Skipped);
        assert_eq!(report.entries[2].error_kind, Some(ErrorKind::Configuration));
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let config = config(&["emit", "flaky"], vec![rule("tas")]);
        let (tx, mut rx) = crate::execution::progress_channel();

        let report = RunCoordinator::new(registry(2))
            .with_progress(tx)
            .run(&config)
            .await;
        let entry = report.get("tas").unwrap();
        assert_eq!(entry.status, TargetStatus::Succeeded);
        assert_eq!(entry.attempts, 3);

        let mut retries = 0;
        while let Ok(event) = rx.try_recv() {
            if let ExecutionEvent::TargetRetrying { error_kind, .. } = event {
                assert_eq!(error_kind, ErrorKind::StepExecution);
                retries += 1;
            }
        }
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let config = config(&["emit", "broken"], vec![rule("tas"), rule("pr")]);
        let report = RunCoordinator::new(registry(0)).run(&config).await;
        for entry in &report.entries {
            assert_eq!(entry.status, TargetStatus::Failed);
            assert_eq!(entry.error_kind, Some(ErrorKind::StepExecution));
            assert_eq!(entry.attempts, 1);
        }
        assert!(!report.success());
    }

    #[tokio::test]
    async fn test_unknown_step_fails_target() {
        let config = config(&["emit", "regrid"], vec![rule("tas")]);
        let report = RunCoordinator::new(registry(0)).run(&config).await;
        assert_eq!(report.entries[0].error_kind, Some(ErrorKind::UnknownStep));
    }

    #[tokio::test]
    async fn test_remote_cluster_without_pool() {
        let mut config = config(&["emit"], vec![rule("tas")]);
        config.engine.cluster = ClusterDescriptor {
            kind: ClusterKind::BatchQueue,
            ..Default::default()
        };
        let report = RunCoordinator::new(registry(0)).run(&config).await;
        assert_eq!(report.entries[0].error_kind, Some(ErrorKind::Configuration));
    }

    #[tokio::test]
    async fn test_external_pool_stays_open() {
        let cache = Arc::new(StepCache::new());
        let pool = Arc::new(LocalWorkerPool::new(&ClusterDescriptor::local_fixed(1), cache.clone()));
        let config = config(&["emit"], vec![rule("tas")]);

        let coordinator = RunCoordinator::new(registry(0))
            .with_cache(cache)
            .with_pool(pool.clone());
        assert!(coordinator.run(&config).await.success());

        // a second run hits the shared cache through the same pool
        let report = coordinator.run(&config).await;
        assert!(report.success());
        assert_eq!(report.cache.hits, 1);
        assert_eq!(pool.stats().succeeded, 2);
        assert!(report.entries[0].duration < Duration::from_secs(5));
    }
}
