// Configuration Module
// Run document models and resolution of rules into targets

pub mod compound;
pub mod models;
pub mod resolver;

pub use compound::{CompoundName, CompoundNameError, DerivationConflict};
pub use models::{
    ConfigError, EngineSettings, InputSpec, PipelineDefinition, RawTarget, RunConfig,
    DEFAULT_REQUIRED_ATTRIBUTES,
};
pub use resolver::{ConfigurationResolver, Resolution};
