// Cluster Descriptor
// Worker-pool backend kind and scaling discipline

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default lower bound of an adaptive pool
pub const DEFAULT_MINIMUM_WORKERS: usize = 1;

/// Default upper bound of an adaptive pool
pub const DEFAULT_MAXIMUM_WORKERS: usize = 10;

/// Default worker count of a fixed pool
pub const DEFAULT_FIXED_WORKERS: usize = 5;

/// Backend that hosts the workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterKind {
    /// Workers are tasks on this machine
    #[default]
    Local,
    /// Workers are jobs on a batch-queue system
    BatchQueue,
    /// Workers are reached through a tunnel to a remote scheduler
    Tunnel,
}

/// How the number of workers is decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ScalingMode {
    /// A constant number of workers
    Fixed {
        #[serde(default = "default_fixed_workers")]
        count: usize,
    },
    /// Worker count follows the backlog within `[minimum, maximum]`
    Adaptive {
        #[serde(default = "default_minimum_workers")]
        minimum: usize,
        #[serde(default = "default_maximum_workers")]
        maximum: usize,
    },
}

impl Default for ScalingMode {
    fn default() -> Self {
        ScalingMode::Adaptive {
            minimum: DEFAULT_MINIMUM_WORKERS,
            maximum: DEFAULT_MAXIMUM_WORKERS,
        }
    }
}

fn default_fixed_workers() -> usize {
    DEFAULT_FIXED_WORKERS
}

fn default_minimum_workers() -> usize {
    DEFAULT_MINIMUM_WORKERS
}

fn default_maximum_workers() -> usize {
    DEFAULT_MAXIMUM_WORKERS
}

impl ScalingMode {
    /// Worker count a pool starts with
    pub fn initial_workers(&self) -> usize {
        match *self {
            ScalingMode::Fixed { count } => count.max(1),
            ScalingMode::Adaptive { minimum, .. } => minimum.max(1),
        }
    }

    /// Worker count wanted for the given load.
    ///
    /// Never below `running`, so a scale-down cannot strand an executing chain.
    pub fn desired_workers(&self, running: usize, queued: usize) -> usize {
        match *self {
            ScalingMode::Fixed { count } => count.max(1),
            ScalingMode::Adaptive { minimum, maximum } => {
                let minimum = minimum.max(1);
                let maximum = maximum.max(minimum);
                (running + queued).clamp(minimum, maximum).max(running)
            }
        }
    }

    pub fn is_adaptive(&self) -> bool {
        matches!(self, ScalingMode::Adaptive { .. })
    }
}

/// Worker-pool configuration for one run
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    #[serde(default)]
    pub kind: ClusterKind,
    #[serde(default)]
    pub scaling: ScalingMode,
    /// Backend-specific settings such as queue name or tunnel endpoint
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl ClusterDescriptor {
    pub fn local_fixed(count: usize) -> Self {
        Self {
            kind: ClusterKind::Local,
            scaling: ScalingMode::Fixed { count },
            parameters: BTreeMap::new(),
        }
    }

    pub fn local_adaptive(minimum: usize, maximum: usize) -> Self {
        Self {
            kind: ClusterKind::Local,
            scaling: ScalingMode::Adaptive { minimum, maximum },
            parameters: BTreeMap::new(),
        }
    }
}
