// Pipeline Module
// Compilation of targets into task chains and derivation of step cache keys

pub mod compiler;
pub mod key;

pub use compiler::{BoundStep, PipelineCompiler, TaskChain};
pub use key::CacheKey;
