// CMOR Pipeline Library
// Rule-to-pipeline execution engine for standardizing model output

pub mod cache;
pub mod chunking;
pub mod config;
pub mod coordinator;
pub mod data;
pub mod error;
pub mod execution;
pub mod io;
pub mod metadata;
pub mod pipeline;
pub mod steps;
pub mod target;

// Re-export commonly used types
pub use error::{ErrorKind, PipelineError};

// Re-export configuration types
pub use config::{
    CompoundName, ConfigError, ConfigurationResolver, EngineSettings, InputSpec,
    PipelineDefinition, RawTarget, Resolution, RunConfig,
};

// Re-export model types
pub use data::{Dataset, Dimension};
pub use target::{InputSource, PipelineSpec, Target};

// Re-export chunking types
pub use chunking::{
    parse_byte_size, select_chunk_shape, ChunkAlgorithm, ChunkEncoding, ChunkRequest,
    ChunkingError, ChunkingSettings,
};

// Re-export step and compilation types
pub use pipeline::{BoundStep, CacheKey, PipelineCompiler, TaskChain};
pub use steps::{FnStep, RegistryError, Step, StepError, StepRegistry};

// Re-export cache types
pub use cache::{CacheSource, CacheStats, DirectoryStore, DurableStore, StepCache};

// Re-export execution types
pub use execution::{
    progress_channel, ChainHandle, ChainOutcome, ChainState, ClusterDescriptor, ClusterKind,
    ExecutionEvent, LocalWorkerPool, ProgressSender, ScalingMode, WorkerPool,
};

// Re-export coordinator types
pub use coordinator::{RetryPolicy, RunCoordinator, RunReport, TargetReport, TargetStatus};

// Re-export I/O and metadata types
pub use io::{output_file_name, DataSource, JsonFileWriter, MemorySource, StorageWriter};
pub use metadata::{LookupError, MetadataLookup, TableLookup};
