//! The self-tuning optimizer: assess each declared operation on sampled
//! data, keep the ones that perform well, and decompose or rewrite the rest.
//!
//! Control flow per pipeline step: draw a sample from the step's input
//! dataset, then for each declared operation in order
//!
//! 1. run it over the sample (failure keeps the operation unchanged),
//! 2. assess the output quality with a synthesized validation rubric,
//! 3. if improvement is needed, either rewrite the prompt in place or
//!    decompose it into a metadata/split/submap/subreduce chain,
//! 4. advance the sample through the first emitted operation and move on.
//!
//! The optimized document (all emitted operations plus rewritten step lists)
//! is assembled in memory and persisted once at the end.

pub mod assemble;
pub mod assess;
pub mod chunks;
pub mod context;
pub mod plan;
pub mod synth;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{
    ConfigError, OperationConfig, OperationRef, PipelineConfig, Step,
};
use crate::events::{ObserverSink, ProgressEvent};
use crate::gateway::{
    Attribution, ChatModel, ProviderError, StructuredGateway, StructuredRequest,
};
use crate::ops::{ExecutionService, OperatorDeps};
use crate::sample::{sample_dataset, Record, SampleError, DEFAULT_SAMPLE_SIZE};

pub use assess::Assessment;
pub use chunks::ChunkSizeEstimate;
pub use context::{ContextNeeds, MetadataNeeds};
pub use plan::SplitDecision;
pub use synth::{SynthesisError, MAX_SYNTH_ATTEMPTS};

#[derive(Debug, Error)]
pub enum OptimizeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sample(#[from] SampleError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    /// All chunk-size probes were discarded; there is nothing to aggregate.
    #[error("chunk-size probes produced no usable signal")]
    InsufficientChunkSignal,

    #[error("analysis payload did not match its schema: {0}")]
    BadPayload(String),
}

impl OptimizeError {
    /// Fatal errors abort the whole run. Everything else is recovered per
    /// operation: the original config is kept and the run continues.
    pub fn is_fatal(&self) -> bool {
        match self {
            OptimizeError::Config(_) | OptimizeError::Sample(_) | OptimizeError::Provider(_) => {
                true
            }
            OptimizeError::Synthesis(SynthesisError::Provider(_)) => true,
            OptimizeError::Synthesis(_)
            | OptimizeError::InsufficientChunkSignal
            | OptimizeError::BadPayload(_) => false,
        }
    }
}

/// One structured analysis call: system + single user turn against a JSON
/// schema, payload deserialized into the caller's shape.
pub(crate) async fn analysis_call<T: DeserializeOwned>(
    gateway: &dyn StructuredGateway,
    model: &str,
    system: &str,
    user: String,
    schema: serde_json::Value,
) -> Result<T, OptimizeError> {
    let req = StructuredRequest::single(
        ChatModel::openrouter(model),
        system,
        user,
        schema,
        Attribution::new("optimize"),
    );
    let resp = gateway.complete(req).await?;
    resp.parse()
        .map_err(|e| OptimizeError::BadPayload(e.to_string()))
}

pub struct OptimizeOptions {
    pub sample_size: usize,
    pub max_threads: usize,
    /// Model used for the optimizer's own analysis calls (assessment, split
    /// decisions, synthesis). Operation execution keeps each operation's own
    /// model.
    pub model: String,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            sample_size: DEFAULT_SAMPLE_SIZE,
            max_threads: parallelism * 4,
            model: "openai/gpt-4o".to_string(),
        }
    }
}

pub struct Optimizer {
    config: PipelineConfig,
    gateway: Arc<dyn StructuredGateway>,
    executor: Arc<dyn ExecutionService>,
    events: Arc<dyn ObserverSink>,
    options: OptimizeOptions,
}

struct OptimizedOp {
    emitted: Vec<OperationConfig>,
    /// Sample records after the first emitted operation, when it ran.
    advanced_sample: Option<Vec<Record>>,
}

impl Optimizer {
    pub fn new(
        config: PipelineConfig,
        gateway: Arc<dyn StructuredGateway>,
        executor: Arc<dyn ExecutionService>,
        events: Arc<dyn ObserverSink>,
        options: OptimizeOptions,
    ) -> Self {
        Self {
            config,
            gateway,
            executor,
            events,
            options,
        }
    }

    /// Optimize every pipeline step and return the rewritten document.
    pub async fn optimize(&self) -> Result<PipelineConfig, OptimizeError> {
        let mut operations: BTreeMap<String, OperationConfig> = BTreeMap::new();
        let mut steps = Vec::with_capacity(self.config.pipeline.steps.len());

        for step in &self.config.pipeline.steps {
            let (optimized_step, step_ops) = self.optimize_step(step).await?;
            steps.push(optimized_step);
            operations.extend(step_ops);
        }

        let mut optimized = self.config.clone();
        optimized.operations = operations;
        optimized.pipeline.steps = steps;
        Ok(optimized)
    }

    /// Optimize and persist the document in one go.
    pub async fn optimize_to_path(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<PipelineConfig, OptimizeError> {
        let optimized = self.optimize().await?;
        optimized.save(&path)?;
        self.events.emit(ProgressEvent::ConfigSaved {
            path: path.as_ref().display().to_string(),
        });
        Ok(optimized)
    }

    async fn optimize_step(
        &self,
        step: &Step,
    ) -> Result<(Step, BTreeMap<String, OperationConfig>), OptimizeError> {
        info!(step = %step.name, "optimizing step");
        let mut sample = {
            let mut rng = rand::thread_rng();
            sample_dataset(
                &self.config,
                step.input.as_deref(),
                self.options.sample_size,
                &mut rng,
            )?
        };

        let mut step_ops: BTreeMap<String, OperationConfig> = BTreeMap::new();
        let mut names: Vec<String> = Vec::new();

        for reference in &step.operations {
            let op = self.config.resolve_operation(reference)?;
            let result = self.optimize_operation(&op, &sample).await?;
            if let Some(advanced) = result.advanced_sample {
                sample = advanced;
            }
            for emitted in result.emitted {
                names.push(emitted.name.clone());
                step_ops.insert(emitted.name.clone(), emitted);
            }
        }

        let mut optimized_step = step.clone();
        optimized_step.operations = names.into_iter().map(OperationRef::Name).collect();
        Ok((optimized_step, step_ops))
    }

    async fn optimize_operation(
        &self,
        op: &OperationConfig,
        sample: &[Record],
    ) -> Result<OptimizedOp, OptimizeError> {
        debug!(operation = %op.name, op_type = op.op_type.as_str(), "analyzing operation");

        // Run the operation over the sample. Failure is recovered: the
        // operation is kept unchanged and the sample does not advance.
        let output = match self.executor.execute(op, sample.to_vec()).await {
            Ok((output, cost)) => {
                self.events.emit(ProgressEvent::OperationCost {
                    operation: op.name.clone(),
                    cost_nanodollars: cost,
                });
                output
            }
            Err(e) => {
                warn!(operation = %op.name, error = %e, "execution failed; keeping unchanged");
                self.events.emit(ProgressEvent::ExecutionFailed {
                    operation: op.name.clone(),
                    error: e.to_string(),
                });
                return Ok(OptimizedOp {
                    emitted: vec![op.clone()],
                    advanced_sample: None,
                });
            }
        };

        // Assessment transport errors are fatal for the run.
        let assessment = assess::assess(
            self.gateway.as_ref(),
            self.events.as_ref(),
            &self.options.model,
            op,
            sample,
            &output,
        )
        .await?;

        if !assessment.needs_improvement {
            self.events.emit(ProgressEvent::OperationKept {
                operation: op.name.clone(),
            });
            return Ok(OptimizedOp {
                emitted: vec![op.clone()],
                advanced_sample: Some(output),
            });
        }

        let planner = plan::Planner {
            gateway: self.gateway.clone(),
            events: self.events.clone(),
            deps: self.operator_deps(),
            model: self.options.model.clone(),
            max_threads: self.options.max_threads,
        };
        let emitted = match planner.remediate(op, &assessment, sample).await {
            Ok(emitted) => emitted,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                self.events.emit(ProgressEvent::AnalysisFailed {
                    operation: op.name.clone(),
                    error: e.to_string(),
                });
                return Ok(OptimizedOp {
                    emitted: vec![op.clone()],
                    advanced_sample: Some(output),
                });
            }
        };

        if emitted.len() > 1 {
            self.events.emit(ProgressEvent::OperationDecomposed {
                operation: op.name.clone(),
                emitted: emitted.iter().map(|e| e.name.clone()).collect(),
            });
        }

        // Advance the sample through the first emitted operation only; the
        // next declared operation is analyzed against that output.
        let advanced_sample = match emitted.first() {
            Some(first) => match self.executor.execute(first, sample.to_vec()).await {
                Ok((output, cost)) => {
                    self.events.emit(ProgressEvent::OperationCost {
                        operation: first.name.clone(),
                        cost_nanodollars: cost,
                    });
                    Some(output)
                }
                Err(e) => {
                    self.events.emit(ProgressEvent::ExecutionFailed {
                        operation: first.name.clone(),
                        error: e.to_string(),
                    });
                    None
                }
            },
            None => None,
        };

        Ok(OptimizedOp {
            emitted,
            advanced_sample,
        })
    }

    fn operator_deps(&self) -> OperatorDeps {
        OperatorDeps {
            gateway: self.gateway.clone(),
            default_model: self.config.default_model.clone(),
            max_threads: self.options.max_threads,
        }
    }
}
