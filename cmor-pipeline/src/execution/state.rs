// Chain State
// Per-chain lifecycle tracked by the worker pool

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one submitted chain:
/// `Pending -> Scheduled -> Running -> {Succeeded, Failed}`.
/// A pending or scheduled chain can also fail directly when cancelled or
/// when the pool shuts down under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainState {
    /// Submitted, waiting for a worker slot
    Pending,
    /// Assigned a worker slot
    Scheduled,
    /// Executing its steps
    Running,
    Succeeded,
    Failed,
}

impl ChainState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChainState::Succeeded | ChainState::Failed)
    }

    pub fn can_transition_to(&self, next: ChainState) -> bool {
        use ChainState::*;
        matches!(
            (self, next),
            (Pending, Scheduled)
                | (Scheduled, Running)
                | (Running, Succeeded)
                | (Pending | Scheduled | Running, Failed)
        )
    }
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChainState::Pending => "pending",
            ChainState::Scheduled => "scheduled",
            ChainState::Running => "running",
            ChainState::Succeeded => "succeeded",
            ChainState::Failed => "failed",
        };
        f.write_str(name)
    }
}
