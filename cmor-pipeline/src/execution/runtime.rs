// Worker Pool
// Schedules one task chain per target on a fixed or adaptively sized pool

use super::chain::{run_chain, ChainOutcome};
use super::cluster::{ClusterDescriptor, ScalingMode};
use super::events::{EventSender, ExecutionEvent, ProgressSender};
use super::state::ChainState;
use crate::cache::StepCache;
use crate::error::PipelineError;
use crate::pipeline::TaskChain;

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::Instrument;

/// Identifier assigned to a submitted chain
pub type ChainId = u64;

type ChainResult = Result<ChainOutcome, PipelineError>;

/// Execution backend for task chains
#[async_trait::async_trait]
pub trait WorkerPool: Send + Sync {
    /// Queue a chain for execution. Never blocks; await the handle for the result.
    fn submit(&self, chain: TaskChain) -> ChainHandle;

    /// Apply new scaling bounds. Returns the resulting worker count.
    fn scale(&self, descriptor: &ClusterDescriptor) -> usize;

    /// Best-effort cancellation of a pending or running chain
    fn cancel(&self, id: ChainId) -> bool;

    fn state(&self, id: ChainId) -> Option<ChainState>;

    fn stats(&self) -> PoolStats;

    /// Stop accepting chains and wait for the submitted ones to finish
    async fn shutdown(&self);
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub running: usize,
    pub queued: usize,
    pub peak_workers: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Awaitable result of a submitted chain
#[derive(Debug)]
pub struct ChainHandle {
    id: ChainId,
    target_id: String,
    rx: oneshot::Receiver<ChainResult>,
}

impl ChainHandle {
    pub fn id(&self) -> ChainId {
        self.id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub async fn wait(self) -> ChainResult {
        self.await
    }
}

impl Future for ChainHandle {
    type Output = ChainResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let target_id = self.target_id.clone();
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(PipelineError::worker_lost(
                    target_id,
                    "worker dropped the chain without reporting a result",
                ))
            })
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Timeout(Duration),
    Cancelled,
}

struct Job {
    id: ChainId,
    chain: TaskChain,
    reply: oneshot::Sender<ChainResult>,
}

struct RunningChain {
    abort: AbortHandle,
    cancelled: Arc<AtomicBool>,
    stop: Option<StopReason>,
    /// Result already delivered; the slot stays held until the task ends
    settled: bool,
}

struct PoolState {
    scaling: ScalingMode,
    workers: usize,
    peak_workers: usize,
    queue: VecDeque<Job>,
    running: HashMap<ChainId, RunningChain>,
    states: HashMap<ChainId, ChainState>,
    next_id: ChainId,
    succeeded: usize,
    failed: usize,
    shutting_down: bool,
}

impl PoolState {
    fn transition(&mut self, id: ChainId, next: ChainState) {
        let current = self.states.entry(id).or_insert(ChainState::Pending);
        if current.can_transition_to(next) {
            *current = next;
        } else {
            tracing::warn!(chain = id, from = %current, to = %next, "ignored invalid chain transition");
        }
    }

    /// No queued chain and no running chain still owing its caller a result
    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.running.values().all(|running| running.settled)
    }

    fn record(&mut self, id: ChainId, succeeded: bool) {
        if succeeded {
            self.succeeded += 1;
            self.transition(id, ChainState::Succeeded);
        } else {
            self.failed += 1;
            self.transition(id, ChainState::Failed);
        }
    }
}

struct Shared {
    state: Mutex<PoolState>,
    cache: Arc<StepCache>,
    progress: Option<ProgressSender>,
    idle: Notify,
}

/// Worker pool running chains as tasks on the current tokio runtime.
///
/// Under adaptive scaling the worker count follows the backlog and never
/// drops below the number of chains holding a worker.
#[derive(Clone)]
pub struct LocalWorkerPool {
    shared: Arc<Shared>,
}

impl LocalWorkerPool {
    pub fn new(descriptor: &ClusterDescriptor, cache: Arc<StepCache>) -> Self {
        Self::build(descriptor, cache, None)
    }

    pub fn with_progress(
        descriptor: &ClusterDescriptor,
        cache: Arc<StepCache>,
        progress: ProgressSender,
    ) -> Self {
        Self::build(descriptor, cache, Some(progress))
    }

    fn build(
        descriptor: &ClusterDescriptor,
        cache: Arc<StepCache>,
        progress: Option<ProgressSender>,
    ) -> Self {
        let workers = descriptor.scaling.initial_workers();
        tracing::info!(kind = ?descriptor.kind, scaling = ?descriptor.scaling, workers, "starting worker pool");
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    scaling: descriptor.scaling,
                    workers,
                    peak_workers: workers,
                    queue: VecDeque::new(),
                    running: HashMap::new(),
                    states: HashMap::new(),
                    next_id: 1,
                    succeeded: 0,
                    failed: 0,
                    shutting_down: false,
                }),
                cache,
                progress,
                idle: Notify::new(),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<StepCache> {
        &self.shared.cache
    }
}

impl Shared {
    /// Resize an adaptive pool to the current load
    fn autoscale(&self, state: &mut PoolState) {
        if !state.scaling.is_adaptive() {
            return;
        }
        let desired = state
            .scaling
            .desired_workers(state.running.len(), state.queue.len());
        if desired != state.workers {
            tracing::info!(
                from = state.workers,
                to = desired,
                running = state.running.len(),
                queued = state.queue.len(),
                "scaling worker pool"
            );
            state.workers = desired;
            state.peak_workers = state.peak_workers.max(desired);
            self.progress.send_event(ExecutionEvent::PoolScaled {
                workers: desired,
                running: state.running.len(),
                queued: state.queue.len(),
            });
        }
    }

    /// Start queued chains while worker slots are free, in submission order
    fn dispatch(self: &Arc<Self>, state: &mut PoolState) {
        while state.running.len() < state.workers {
            let Some(job) = state.queue.pop_front() else {
                break;
            };
            self.start(state, job);
        }
    }

    fn start(self: &Arc<Self>, state: &mut PoolState, job: Job) {
        let Job { id, chain, reply } = job;
        state.transition(id, ChainState::Scheduled);

        let cancelled = Arc::new(AtomicBool::new(false));
        let span = tracing::info_span!("chain", chain = id, target_id = %chain.target_id());
        let timeout = chain.timeout();
        let target_id = chain.target_id().to_string();

        let inner: JoinHandle<ChainResult> = {
            let shared = Arc::clone(self);
            let cancelled = Arc::clone(&cancelled);
            tokio::spawn(
                async move {
                    shared.state.lock().transition(id, ChainState::Running);
                    run_chain(&chain, &shared.cache, &shared.progress, &cancelled).await
                }
                .instrument(span),
            )
        };

        state.running.insert(
            id,
            RunningChain {
                abort: inner.abort_handle(),
                cancelled,
                stop: None,
                settled: false,
            },
        );

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            shared.supervise(id, &target_id, inner, timeout, reply).await;
        });
    }

    /// Deliver the chain's result and free its slot.
    ///
    /// On timeout the caller is answered at once. A step blocking its thread
    /// cannot be interrupted, so the slot is only released once the task ends.
    async fn supervise(
        self: &Arc<Self>,
        id: ChainId,
        target_id: &str,
        mut inner: JoinHandle<ChainResult>,
        timeout: Option<Duration>,
        reply: oneshot::Sender<ChainResult>,
    ) {
        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut inner).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::warn!(chain = id, target_id, ?limit, "chain timed out, abandoning");
                    self.stop(id, StopReason::Timeout(limit));
                    self.settle(
                        id,
                        Err(PipelineError::Timeout {
                            target: target_id.to_string(),
                            limit,
                        }),
                        reply,
                    );
                    let _ = inner.await;
                    tracing::debug!(chain = id, target_id, "abandoned chain ended");
                    self.release(id);
                    return;
                }
            },
            None => inner.await,
        };

        let stop = self
            .state
            .lock()
            .running
            .get(&id)
            .and_then(|running| running.stop);

        let result = match (joined, stop) {
            (Ok(result), _) => result,
            (Err(_), Some(StopReason::Timeout(limit))) => Err(PipelineError::Timeout {
                target: target_id.to_string(),
                limit,
            }),
            (Err(_), Some(StopReason::Cancelled)) => Err(PipelineError::Cancelled {
                target: target_id.to_string(),
            }),
            (Err(e), None) => Err(worker_lost(target_id, e)),
        };
        self.finish(id, result, reply);
    }

    fn stop(&self, id: ChainId, reason: StopReason) -> bool {
        let mut state = self.state.lock();
        match state.running.get_mut(&id) {
            Some(running) => {
                running.stop.get_or_insert(reason);
                running.cancelled.store(true, Ordering::SeqCst);
                running.abort.abort();
                true
            }
            None => false,
        }
    }

    /// Record a completed chain, free its slot and answer the caller
    fn finish(self: &Arc<Self>, id: ChainId, result: ChainResult, reply: oneshot::Sender<ChainResult>) {
        {
            let mut state = self.state.lock();
            state.running.remove(&id);
            state.record(id, result.is_ok());
            self.free_slot(&mut state);
        }
        let _ = reply.send(result);
    }

    /// Answer the caller of an abandoned chain while it keeps its slot
    fn settle(&self, id: ChainId, result: ChainResult, reply: oneshot::Sender<ChainResult>) {
        {
            let mut state = self.state.lock();
            if let Some(running) = state.running.get_mut(&id) {
                running.settled = true;
            }
            state.record(id, result.is_ok());
            if state.is_idle() {
                self.idle.notify_waiters();
            }
        }
        let _ = reply.send(result);
    }

    /// Free the slot of an abandoned chain whose task has ended
    fn release(self: &Arc<Self>, id: ChainId) {
        let mut state = self.state.lock();
        state.running.remove(&id);
        self.free_slot(&mut state);
    }

    fn free_slot(self: &Arc<Self>, state: &mut PoolState) {
        self.autoscale(state);
        self.dispatch(state);
        if state.is_idle() {
            self.idle.notify_waiters();
        }
    }
}

fn worker_lost(target_id: &str, error: JoinError) -> PipelineError {
    let reason = if error.is_panic() {
        let panic = error.into_panic();
        panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .map(|message| format!("worker panicked: {}", message))
            .unwrap_or_else(|| "worker panicked".to_string())
    } else {
        "worker task was aborted".to_string()
    };
    PipelineError::worker_lost(target_id, reason)
}

#[async_trait::async_trait]
impl WorkerPool for LocalWorkerPool {
    fn submit(&self, chain: TaskChain) -> ChainHandle {
        let (reply, rx) = oneshot::channel();
        let target_id = chain.target_id().to_string();
        let mut state = self.shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        if state.shutting_down {
            state.states.insert(id, ChainState::Failed);
            state.failed += 1;
            let _ = reply.send(Err(PipelineError::worker_lost(
                &target_id,
                "worker pool is shutting down",
            )));
        } else {
            state.states.insert(id, ChainState::Pending);
            state.queue.push_back(Job { id, chain, reply });
            tracing::debug!(chain = id, target_id = %target_id, queued = state.queue.len(), "chain submitted");
            self.shared.autoscale(&mut state);
            self.shared.dispatch(&mut state);
        }

        ChainHandle { id, target_id, rx }
    }

    fn scale(&self, descriptor: &ClusterDescriptor) -> usize {
        let mut state = self.shared.state.lock();
        if let ScalingMode::Adaptive { .. } = descriptor.scaling {
            if state.scaling.is_adaptive() {
                state.scaling = descriptor.scaling;
                self.shared.autoscale(&mut state);
                self.shared.dispatch(&mut state);
            }
        }
        state.workers
    }

    fn cancel(&self, id: ChainId) -> bool {
        let queued = {
            let mut state = self.shared.state.lock();
            let position = state.queue.iter().position(|job| job.id == id);
            match position.and_then(|i| state.queue.remove(i)) {
                Some(job) => {
                    state.transition(id, ChainState::Failed);
                    state.failed += 1;
                    self.shared.autoscale(&mut state);
                    if state.is_idle() {
                        self.shared.idle.notify_waiters();
                    }
                    Some(job)
                }
                None => None,
            }
        };

        match queued {
            Some(job) => {
                tracing::info!(chain = id, "cancelled queued chain");
                let target = job.chain.target_id().to_string();
                let _ = job.reply.send(Err(PipelineError::Cancelled { target }));
                true
            }
            None => self.shared.stop(id, StopReason::Cancelled),
        }
    }

    fn state(&self, id: ChainId) -> Option<ChainState> {
        self.shared.state.lock().states.get(&id).copied()
    }

    fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            workers: state.workers,
            running: state.running.len(),
            queued: state.queue.len(),
            peak_workers: state.peak_workers,
            succeeded: state.succeeded,
            failed: state.failed,
        }
    }

    async fn shutdown(&self) {
        self.shared.state.lock().shutting_down = true;
        loop {
            let notified = self.shared.idle.notified();
            if self.shared.state.lock().is_idle() {
                break;
            }
            notified.await;
        }
        let stats = self.stats();
        tracing::info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            peak_workers = stats.peak_workers,
            "worker pool shut down"
        );
    }
}
