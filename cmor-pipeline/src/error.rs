// Error Types
// Target-level error taxonomy shared by the resolver, compiler, runtime and coordinator

use crate::chunking::ChunkingError;
use crate::steps::StepError;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification of a target failure, as recorded in the run report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or malformed resolved attribute
    Configuration,
    /// Pipeline references a step or preset that is not registered
    UnknownStep,
    /// A step raised an error while running
    StepExecution,
    /// The worker running the chain went away
    WorkerLost,
    /// The chain exceeded its wall-clock budget
    Timeout,
    /// Chunk layout selection failed under the given tolerance
    NoMatchingChunks,
    /// The chain was cancelled through the runtime
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::UnknownStep => "UnknownStepError",
            ErrorKind::StepExecution => "StepExecutionError",
            ErrorKind::WorkerLost => "WorkerLostError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::NoMatchingChunks => "NoMatchingChunksError",
            ErrorKind::Cancelled => "CancelledError",
        };
        f.write_str(name)
    }
}

/// Errors that end a target's chain
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("configuration error in target '{target}': {message}")]
    Configuration { target: String, message: String },

    #[error("unknown step '{step}' referenced by target '{target}'")]
    UnknownStep { target: String, step: String },

    #[error("step '{step}' failed: {source}")]
    StepExecution {
        step: String,
        #[source]
        source: StepError,
    },

    #[error("worker lost while running target '{target}': {reason}")]
    WorkerLost { target: String, reason: String },

    #[error("target '{target}' exceeded its wall-clock budget of {limit:?}")]
    Timeout { target: String, limit: Duration },

    #[error("target '{target}' was cancelled")]
    Cancelled { target: String },
}

impl PipelineError {
    pub fn configuration(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn unknown_step(target: impl Into<String>, step: impl Into<String>) -> Self {
        Self::UnknownStep {
            target: target.into(),
            step: step.into(),
        }
    }

    pub fn step(step: impl Into<String>, source: StepError) -> Self {
        Self::StepExecution {
            step: step.into(),
            source,
        }
    }

    pub fn worker_lost(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::WorkerLost {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Report classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Configuration { .. } => ErrorKind::Configuration,
            PipelineError::UnknownStep { .. } => ErrorKind::UnknownStep,
            PipelineError::StepExecution {
                source: StepError::Chunking(ChunkingError::NoMatchingChunks { .. }),
                ..
            } => ErrorKind::NoMatchingChunks,
            PipelineError::StepExecution { .. } => ErrorKind::StepExecution,
            PipelineError::WorkerLost { .. } => ErrorKind::WorkerLost,
            PipelineError::Timeout { .. } => ErrorKind::Timeout,
            PipelineError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Whether the step that raised this error marked it as transient
    pub fn is_transient_step_failure(&self) -> bool {
        matches!(self, PipelineError::StepExecution { source, .. } if source.is_transient())
    }
}
