// Execution Events
// Progress reporting and event types for a standardization run

use crate::cache::CacheSource;
use crate::coordinator::TargetStatus;
use crate::error::ErrorKind;

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during a run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Run started
    RunStarted { total_targets: usize },

    /// Run completed, report assembled
    RunCompleted { success: bool, duration: Duration },

    /// Target chain submitted to the worker pool
    TargetQueued { target_id: String, attempt: u32 },

    /// Target chain picked up by a worker
    TargetStarted {
        target_id: String,
        total_steps: usize,
    },

    /// Target reached its terminal state
    TargetCompleted {
        target_id: String,
        status: TargetStatus,
        duration: Duration,
    },

    /// Target will be resubmitted after a failed attempt
    TargetRetrying {
        target_id: String,
        attempt: u32,
        error_kind: ErrorKind,
        delay: Duration,
    },

    /// Step execution started
    StepStarted {
        target_id: String,
        step_name: String,
        step_index: usize,
    },

    /// Step execution completed
    StepCompleted {
        target_id: String,
        step_name: String,
        step_index: usize,
        cache: CacheSource,
        duration: Duration,
    },

    /// Step raised an error; no later step of the chain runs
    StepFailed {
        target_id: String,
        step_name: String,
        step_index: usize,
        error: String,
    },

    /// Worker pool size changed
    PoolScaled {
        workers: usize,
        running: usize,
        queued: usize,
    },
}

impl ExecutionEvent {
    /// Create a step started event
    pub fn step_started(
        target_id: impl Into<String>,
        step_name: impl Into<String>,
        step_index: usize,
    ) -> Self {
        Self::StepStarted {
            target_id: target_id.into(),
            step_name: step_name.into(),
            step_index,
        }
    }

    /// Create a step completed event
    pub fn step_completed(
        target_id: impl Into<String>,
        step_name: impl Into<String>,
        step_index: usize,
        cache: CacheSource,
        duration: Duration,
    ) -> Self {
        Self::StepCompleted {
            target_id: target_id.into(),
            step_name: step_name.into(),
            step_index,
            cache,
            duration,
        }
    }

    /// Create a target completed event
    pub fn target_completed(
        target_id: impl Into<String>,
        status: TargetStatus,
        duration: Duration,
    ) -> Self {
        Self::TargetCompleted {
            target_id: target_id.into(),
            status,
            duration,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
