//! The closed operation vocabulary and its uniform execution capability.
//!
//! Operation types are a fixed enum, not an open string registry: every type
//! implements `Operator::execute(records) -> (records, cost)`, and
//! `build_operator` is the single closed dispatch point. Constructing an
//! operator compiles its templates, so a throwaway construction doubles as
//! template-syntax validation for generated prompts.

pub mod map;
pub mod reduce;
pub mod resolve;
pub mod split;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{OpType, OperationConfig};
use crate::gateway::{ProviderError, StructuredGateway};
use crate::sample::Record;

pub use map::MapOperator;
pub use reduce::ReduceOperator;
pub use resolve::{KeyResolver, LlmListResolver, LlmPairwiseResolver, ResolveOperator};
pub use split::SplitOperator;

#[derive(Debug, Error)]
pub enum OpError {
    /// Template source failed to parse. Distinct so the synthesizer can
    /// retry on exactly this class of failure.
    #[error("invalid template: {0}")]
    Template(String),

    #[error("operation {name}: missing required field `{field}`")]
    MissingField { name: String, field: &'static str },

    #[error("operation {name}: {message}")]
    InvalidConfig { name: String, message: String },

    #[error("operation {name}: record missing field `{field}`")]
    MissingRecordField { name: String, field: String },

    #[error("template render failed: {0}")]
    Render(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("structured output did not match the operation schema: {0}")]
    BadOutput(String),
}

impl OpError {
    fn missing_field(config: &OperationConfig, field: &'static str) -> Self {
        OpError::MissingField {
            name: config.name.clone(),
            field,
        }
    }
}

// =============================================================================
// TEMPLATE HELPERS
// =============================================================================

/// Check that a template source parses. This is the validation a dry-run
/// construction performs on generated prompts.
pub fn validate_template(source: &str) -> Result<(), OpError> {
    let env = minijinja::Environment::new();
    env.template_from_str(source)
        .map(|_| ())
        .map_err(|e| OpError::Template(e.to_string()))
}

/// The set of variables a template references, including nested paths
/// (e.g. `input.text`).
pub fn template_variables(source: &str) -> Result<HashSet<String>, OpError> {
    let env = minijinja::Environment::new();
    let template = env
        .template_from_str(source)
        .map_err(|e| OpError::Template(e.to_string()))?;
    Ok(template.undeclared_variables(true))
}

/// Render a template against a serializable context.
pub fn render_template(source: &str, ctx: impl serde::Serialize) -> Result<String, OpError> {
    let env = minijinja::Environment::new();
    let template = env
        .template_from_str(source)
        .map_err(|e| OpError::Template(e.to_string()))?;
    template.render(ctx).map_err(|e| OpError::Render(e.to_string()))
}

// =============================================================================
// OPERATOR CAPABILITY
// =============================================================================

/// Uniform execution capability over the closed operation vocabulary.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Run the operation over the given records, returning the output records
    /// and the cost incurred in nanodollars.
    async fn execute(&self, records: Vec<Record>) -> Result<(Vec<Record>, i64), OpError>;
}

/// Shared dependencies for building operators.
#[derive(Clone)]
pub struct OperatorDeps {
    pub gateway: Arc<dyn StructuredGateway>,
    pub default_model: String,
    pub max_threads: usize,
}

/// Closed dispatch from config to operator. Construction compiles all
/// templates the operation declares.
pub fn build_operator(
    config: &OperationConfig,
    deps: &OperatorDeps,
) -> Result<Box<dyn Operator>, OpError> {
    match config.op_type {
        OpType::Map => Ok(Box::new(MapOperator::from_config(config, deps, false)?)),
        OpType::Filter => Ok(Box::new(MapOperator::from_config(config, deps, true)?)),
        OpType::Reduce => Ok(Box::new(ReduceOperator::from_config(config, deps)?)),
        OpType::Split => Ok(Box::new(SplitOperator::from_config(config)?)),
        OpType::Resolve => Ok(Box::new(ResolveOperator::from_config(config, deps)?)),
    }
}

// =============================================================================
// EXECUTION SERVICE SEAM
// =============================================================================

/// The execution seam the optimizer depends on: run one configured operation
/// over a set of records.
#[async_trait]
pub trait ExecutionService: Send + Sync {
    async fn execute(
        &self,
        config: &OperationConfig,
        records: Vec<Record>,
    ) -> Result<(Vec<Record>, i64), OpError>;
}

/// Default execution service backed by `build_operator`.
pub struct OperatorExecutor {
    deps: OperatorDeps,
}

impl OperatorExecutor {
    pub fn new(deps: OperatorDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl ExecutionService for OperatorExecutor {
    async fn execute(
        &self,
        config: &OperationConfig,
        records: Vec<Record>,
    ) -> Result<(Vec<Record>, i64), OpError> {
        let operator = build_operator(config, &self.deps)?;
        operator.execute(records).await
    }
}
