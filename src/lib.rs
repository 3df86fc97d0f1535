#![forbid(unsafe_code)]

//! # lapidary
//!
//! A self-tuning optimizer for declarative LLM data pipelines.
//!
//! Pipelines are YAML documents: datasets, named operations (map, filter,
//! reduce, split, resolve) and ordered steps. Long documents routinely break
//! single-prompt operations; lapidary samples the pipeline's data, judges
//! each operation's output with a synthesized validation rubric, and rewrites
//! the ones that fall short. A struggling operation is either given an
//! improved prompt (constrained to its existing template variables) or
//! decomposed into a metadata / split / sub-map / sub-reduce chain sized by
//! empirical chunk probing. The optimized document is written back as plain
//! YAML.
//!
//! All model access goes through one structured-completion gateway that
//! forces a single tool call against a JSON schema.

pub mod config;
pub mod events;
pub mod gateway;
pub mod ops;
pub mod optimize;
pub mod sample;

pub use config::{OpType, OperationConfig, PipelineConfig};
pub use events::{NoopSink, ObserverSink, ProgressEvent, StderrSink, VecSink};
pub use gateway::{
    Attribution, OpenRouterAdapter, ProviderGateway, StructuredGateway, UsageSink,
};
pub use ops::{build_operator, ExecutionService, OperatorDeps, OperatorExecutor};
pub use optimize::{OptimizeError, OptimizeOptions, Optimizer};
pub use sample::Record;
