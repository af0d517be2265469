// Retry Policy
// Bounded per-target retry, driven by error classification

use crate::error::{ErrorKind, PipelineError};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// When and how often a failed target is resubmitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per target, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Retries granted after a timeout
    #[serde(default = "default_timeout_retries")]
    pub timeout_retries: u32,

    /// Retry step failures the step marked as transient
    #[serde(default = "default_true")]
    pub retry_transient_steps: bool,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_timeout_retries() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            timeout_retries: default_timeout_retries(),
            retry_transient_steps: true,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            timeout_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff_ms = initial.as_millis() as u64;
        self.max_backoff_ms = max.as_millis() as u64;
        self
    }

    /// Decide whether `error` earns another attempt.
    ///
    /// `attempt` is the number of attempts made so far and `timeouts` how many
    /// of them ended in a timeout, including this one.
    pub fn should_retry(&self, error: &PipelineError, attempt: u32, timeouts: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match error.kind() {
            ErrorKind::WorkerLost => true,
            ErrorKind::Timeout => timeouts <= self.timeout_retries,
            ErrorKind::StepExecution => {
                self.retry_transient_steps && error.is_transient_step_failure()
            }
            ErrorKind::Configuration
            | ErrorKind::UnknownStep
            | ErrorKind::NoMatchingChunks
            | ErrorKind::Cancelled => false,
        }
    }

    /// Delay before the given retry, doubling from the initial backoff
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(20);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}
