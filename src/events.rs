//! Typed progress events for the optimizer.
//!
//! The optimizer streams intermediate decisions (assessments, split
//! decisions, chunk sizes, synthesized prompts) as they are produced. Instead
//! of writing to a process-wide console, every component takes an
//! `ObserverSink` and emits typed events through it:
//! - The CLI uses StderrSink
//! - Tests use VecSink to assert on the decision stream
//! - Embedders can forward events anywhere they like

use std::sync::Mutex;

use crate::optimize::assess::Assessment;
use crate::optimize::chunks::ChunkSizeEstimate;
use crate::optimize::context::{ContextNeeds, MetadataNeeds};
use crate::optimize::plan::SplitDecision;

/// One intermediate decision or outcome, emitted as it happens.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// The synthesized validation rubric for an operation.
    ValidatorPrompt { operation: String, prompt: String },
    /// The structured quality assessment for an operation.
    AssessmentProduced {
        operation: String,
        assessment: Assessment,
    },
    /// An operation performs well and is kept unchanged.
    OperationKept { operation: String },
    /// Running an operation on the sample failed; it is kept unchanged.
    ExecutionFailed { operation: String, error: String },
    /// The split/no-split remediation decision.
    SplitDecisionMade {
        operation: String,
        decision: SplitDecision,
    },
    /// The non-split path produced a rewritten prompt.
    PromptRewritten {
        operation: String,
        new_prompt: String,
    },
    /// Chunk-size probes finished.
    ChunkSizesIdentified {
        operation: String,
        probe_sizes: Vec<usize>,
        estimate: ChunkSizeEstimate,
    },
    /// The peripheral-context judgment for chunk processing.
    ContextNeedsIdentified {
        operation: String,
        needs: ContextNeeds,
    },
    /// The document-metadata judgment for chunk processing.
    MetadataNeedsIdentified {
        operation: String,
        needs: MetadataNeeds,
    },
    /// The synthesized combine prompt for the sub-reduce operation.
    CombinePromptReady { operation: String, prompt: String },
    /// A generated template failed validation and is being retried.
    TemplateRejected {
        operation: String,
        attempt: u32,
        error: String,
    },
    /// Analysis of an operation failed; it is kept unchanged.
    AnalysisFailed { operation: String, error: String },
    /// An operation was decomposed into a chain of new operations.
    OperationDecomposed {
        operation: String,
        emitted: Vec<String>,
    },
    /// Cost incurred running an operation over the sample.
    OperationCost {
        operation: String,
        cost_nanodollars: i64,
    },
    /// The optimized configuration document was written.
    ConfigSaved { path: String },
}

/// Sink for progress events. Emission is fire-and-forget: sinks must not
/// fail the optimization.
pub trait ObserverSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Discards all events. Useful for tests that don't inspect progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ObserverSink for NoopSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Collects events in memory. Useful for asserting on the decision stream.
#[derive(Debug, Default)]
pub struct VecSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ObserverSink for VecSink {
    fn emit(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Human-readable progress on stderr, for the CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrSink;

impl ObserverSink for StderrSink {
    fn emit(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::ValidatorPrompt { operation, prompt } => {
                eprintln!("[{operation}] validator prompt:\n{prompt}\n");
            }
            ProgressEvent::AssessmentProduced {
                operation,
                assessment,
            } => {
                eprintln!(
                    "[{operation}] assessment: needs_improvement={} reasons={:?}",
                    assessment.needs_improvement, assessment.reasons
                );
            }
            ProgressEvent::OperationKept { operation } => {
                eprintln!("[{operation}] performs well, no changes needed");
            }
            ProgressEvent::ExecutionFailed { operation, error } => {
                eprintln!("[{operation}] execution failed, keeping unchanged: {error}");
            }
            ProgressEvent::SplitDecisionMade {
                operation,
                decision,
            } => {
                eprintln!(
                    "[{operation}] should split: {} ({})",
                    decision.should_split, decision.reason
                );
            }
            ProgressEvent::PromptRewritten { operation, .. } => {
                eprintln!("[{operation}] prompt rewritten without splitting");
            }
            ProgressEvent::ChunkSizesIdentified {
                operation,
                probe_sizes,
                estimate,
            } => {
                let sizes = probe_sizes
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                eprintln!(
                    "[{operation}] chunk sizes: {sizes} words (min {}, max {}, avg {:.2})",
                    estimate.min_chunk_size, estimate.max_chunk_size, estimate.avg_chunk_size
                );
            }
            ProgressEvent::ContextNeedsIdentified { operation, needs } => {
                eprintln!(
                    "[{operation}] needs peripherals: {} (prev {}, next {}): {}",
                    needs.needs_peripherals,
                    needs.previous_context,
                    needs.next_context,
                    needs.reason
                );
            }
            ProgressEvent::MetadataNeedsIdentified { operation, needs } => {
                eprintln!(
                    "[{operation}] needs metadata: {} ({})",
                    needs.needs_metadata, needs.reason
                );
            }
            ProgressEvent::CombinePromptReady { operation, prompt } => {
                eprintln!("[{operation}] combine prompt:\n{prompt}\n");
            }
            ProgressEvent::TemplateRejected {
                operation,
                attempt,
                error,
            } => {
                eprintln!("[{operation}] template attempt {attempt} rejected: {error}");
            }
            ProgressEvent::AnalysisFailed { operation, error } => {
                eprintln!("[{operation}] analysis failed, keeping unchanged: {error}");
            }
            ProgressEvent::OperationDecomposed { operation, emitted } => {
                eprintln!("[{operation}] decomposed into: {}", emitted.join(" -> "));
            }
            ProgressEvent::OperationCost {
                operation,
                cost_nanodollars,
            } => {
                eprintln!(
                    "[{operation}] cost: ${:.4}",
                    cost_nanodollars as f64 / 1_000_000_000.0
                );
            }
            ProgressEvent::ConfigSaved { path } => {
                eprintln!("optimized config saved to {path}");
            }
        }
    }
}
