// Execution Runtime Module
// Worker pool, chain lifecycle, cluster descriptors and progress events

pub mod chain;
pub mod cluster;
pub mod events;
pub mod runtime;
pub mod state;

// Re-export key types
pub use chain::{run_chain, ChainOutcome, StepRecord};
pub use cluster::{ClusterDescriptor, ClusterKind, ScalingMode};
pub use events::{progress_channel, EventSender, ExecutionEvent, ProgressReceiver, ProgressSender};
pub use runtime::{ChainHandle, ChainId, LocalWorkerPool, PoolStats, WorkerPool};
pub use state::ChainState;
