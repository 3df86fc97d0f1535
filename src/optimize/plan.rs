//! Remediation planning for operations that need improvement.
//!
//! One structured call decides between the two remediation paths. The
//! no-split path rewrites the prompt in place, constrained to the current
//! prompt's template variables. The split path runs the full decomposition
//! analysis (chunk sizing, context, metadata, combine synthesis) and emits
//! the assembled operation chain.

use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::info;

use crate::config::OperationConfig;
use crate::events::{ObserverSink, ProgressEvent};
use crate::gateway::StructuredGateway;
use crate::ops::{template_variables, OperatorDeps};
use crate::sample::Record;

use super::synth::{SynthKind, Synthesizer};
use super::{analysis_call, assemble, chunks, context, Assessment, OptimizeError};

#[derive(Debug, Clone, Deserialize)]
pub struct SplitDecision {
    pub should_split: bool,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
struct SplitDirectives {
    split_key: String,
    subprompt: String,
}

#[derive(Deserialize)]
struct RewritePayload {
    new_prompt: String,
}

pub struct Planner {
    pub gateway: Arc<dyn StructuredGateway>,
    pub events: Arc<dyn ObserverSink>,
    pub deps: OperatorDeps,
    /// Analysis model, not the operation's execution model.
    pub model: String,
    pub max_threads: usize,
}

impl Planner {
    /// Produce the replacement operation chain for an operation whose
    /// assessment demands improvement.
    pub async fn remediate(
        &self,
        op: &OperationConfig,
        assessment: &Assessment,
        sample: &[Record],
    ) -> Result<Vec<OperationConfig>, OptimizeError> {
        let decision = self.decide_split(op, assessment, sample).await?;
        self.events.emit(ProgressEvent::SplitDecisionMade {
            operation: op.name.clone(),
            decision: decision.clone(),
        });

        if decision.should_split {
            self.split_pipeline(op, sample).await
        } else {
            self.rewrite_prompt(op, sample).await
        }
    }

    async fn decide_split(
        &self,
        op: &OperationConfig,
        assessment: &Assessment,
        sample: &[Record],
    ) -> Result<SplitDecision, OptimizeError> {
        let system = "You are an AI assistant tasked with determining if a data processing \
                      operation should be split into smaller chunks.";

        let user = format!(
            "Operation Name: {name}\n\
             Operation Type: {op_type}\n\
             Current Prompt: {prompt}\n\
             Assessment:\n\
             Needs Improvement: {needs_improvement}\n\
             Reasons: {reasons}\n\
             Suggested Improvements: {improvements}\n\n\
             Input Data Sample:\n{record}\n\n\
             Based on this assessment and the input data sample, determine if we should \
             split the input into chunks and process each chunk separately.\n\n\
             Provide your response in the following format:",
            name = op.name,
            op_type = op.op_type.as_str(),
            prompt = op.prompt.as_deref().unwrap_or("N/A"),
            needs_improvement = assessment.needs_improvement,
            reasons = pretty_json(&assessment.reasons),
            improvements = pretty_json(&assessment.suggested_improvements),
            record = random_record_json(sample),
        );

        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "should_split": {"type": "boolean"},
                "reason": {"type": "string"},
            },
            "required": ["should_split", "reason"],
        });

        analysis_call(self.gateway.as_ref(), &self.model, system, user, schema).await
    }

    /// No-split path: a rewritten prompt restricted to the variables the
    /// current prompt already uses, enforced through the synthesis machine.
    async fn rewrite_prompt(
        &self,
        op: &OperationConfig,
        sample: &[Record],
    ) -> Result<Vec<OperationConfig>, OptimizeError> {
        info!(operation = %op.name, "improving prompt without splitting");
        let current_prompt = op.prompt.as_deref().unwrap_or("N/A");
        let allowed_variables = template_variables(current_prompt)
            .map_err(|e| OptimizeError::BadPayload(e.to_string()))?;

        let system =
            "You are an AI assistant tasked with improving prompts for data processing \
             operations.";
        let base_prompt = format!(
            "Operation Name: {name}\n\
             Operation Type: {op_type}\n\
             Current Prompt: {current_prompt}\n\n\
             Input Data Sample:\n{record}\n\n\
             Improve the current prompt to better handle the input data and produce more \
             accurate results.\n\
             Note: The new prompt should only include the variables present in the current \
             prompt verbatim. Do not introduce any new variables.\n\n\
             Provide your response in the following format:",
            name = op.name,
            op_type = op.op_type.as_str(),
            record = random_record_json(sample),
        );
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"new_prompt": {"type": "string"}},
            "required": ["new_prompt"],
        });

        let payload = self
            .synthesizer(op)
            .synthesize(
                &SynthKind::Rewrite { allowed_variables },
                op,
                system,
                base_prompt,
                schema,
            )
            .await?;
        let rewrite: RewritePayload = serde_json::from_value(payload)
            .map_err(|e| OptimizeError::BadPayload(e.to_string()))?;

        self.events.emit(ProgressEvent::PromptRewritten {
            operation: op.name.clone(),
            new_prompt: rewrite.new_prompt.clone(),
        });
        Ok(vec![op.with_prompt(rewrite.new_prompt)])
    }

    /// Split path: directives, chunk sizing, context and metadata analysis,
    /// combine synthesis, assembly.
    async fn split_pipeline(
        &self,
        op: &OperationConfig,
        sample: &[Record],
    ) -> Result<Vec<OperationConfig>, OptimizeError> {
        info!(operation = %op.name, "breaking down operation");
        let directives = self.split_directives(op, sample).await?;
        let split_key = assemble::normalize_split_key(&directives.split_key).to_string();
        let subprompt = directives.subprompt;

        // Pre-draw everything random before fanning out; probe texts are one
        // random document each.
        let (probe_texts, context_record, metadata_record) = {
            let mut rng = rand::thread_rng();
            let texts: Vec<String> = (0..chunks::NUM_PROBES)
                .filter_map(|_| {
                    sample
                        .choose(&mut rng)
                        .and_then(|r| r.get(&split_key))
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                })
                .collect();
            let context_record = sample.choose(&mut rng).cloned();
            let metadata_record = sample.choose(&mut rng).cloned();
            (texts, context_record, metadata_record)
        };

        let (probe_sizes, estimate) = chunks::estimate_chunk_sizes(
            self.gateway.as_ref(),
            &self.model,
            &subprompt,
            probe_texts,
            self.max_threads,
        )
        .await?;
        self.events.emit(ProgressEvent::ChunkSizesIdentified {
            operation: op.name.clone(),
            probe_sizes,
            estimate: estimate.clone(),
        });
        let chunk_size = estimate.operative_chunk_size();

        let context_needs = {
            let record = context_record
                .ok_or(OptimizeError::InsufficientChunkSignal)?;
            let text = record
                .get(&split_key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let window = {
                let mut rng = rand::thread_rng();
                let total = text.split_whitespace().count();
                let start = context::context_window_start(total, chunk_size, &mut rng);
                context::window_at(&text, start, chunk_size)
            };
            context::analyze_context(
                self.gateway.as_ref(),
                &self.model,
                &subprompt,
                chunk_size,
                &window,
            )
            .await?
        };
        self.events.emit(ProgressEvent::ContextNeedsIdentified {
            operation: op.name.clone(),
            needs: context_needs.clone(),
        });

        let metadata_needs = {
            let record = metadata_record
                .ok_or(OptimizeError::InsufficientChunkSignal)?;
            let text = record
                .get(&split_key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let window = {
                let mut rng = rand::thread_rng();
                let total = text.split_whitespace().count();
                let start = context::metadata_window_start(total, chunk_size, &mut rng);
                context::window_at(&text, start, chunk_size)
            };
            context::analyze_metadata(
                self.gateway.as_ref(),
                &self.synthesizer(op),
                &self.model,
                op,
                &subprompt,
                chunk_size,
                &split_key,
                &window,
                &record,
            )
            .await?
        };
        self.events.emit(ProgressEvent::MetadataNeedsIdentified {
            operation: op.name.clone(),
            needs: metadata_needs.clone(),
        });

        let combine_prompt = self.combine_prompt(op, &subprompt, chunk_size).await?;
        self.events.emit(ProgressEvent::CombinePromptReady {
            operation: op.name.clone(),
            prompt: combine_prompt.clone(),
        });

        let mut emitted = Vec::with_capacity(4);
        if let (Some(metadata_prompt), Some(output_schema)) = (
            metadata_needs.metadata_prompt.clone(),
            metadata_needs.output_schema.clone(),
        ) {
            emitted.push(assemble::metadata_operation(
                op,
                &self.deps.default_model,
                metadata_prompt,
                output_schema,
            ));
        }
        emitted.push(assemble::split_operation(
            op,
            &estimate,
            &context_needs,
            &split_key,
        ));
        emitted.push(assemble::submap_operation(op, subprompt));
        emitted.push(assemble::subreduce_operation(op, combine_prompt));
        Ok(emitted)
    }

    async fn split_directives(
        &self,
        op: &OperationConfig,
        sample: &[Record],
    ) -> Result<SplitDirectives, OptimizeError> {
        let system = "You are an AI assistant tasked with configuring split operations for \
                      data processing.";

        let output_schema = op
            .schema()
            .map(|s| serde_json::to_string_pretty(s).unwrap_or_else(|_| "{}".to_string()))
            .unwrap_or_else(|| "{}".to_string());
        let user = format!(
            "Operation Name: {name}\n\
             Operation Type: {op_type}\n\
             Current Prompt: {prompt}\n\n\
             Input Data Sample:\n{record}\n\n\
             Determine the split key and subprompt for processing chunks of the input \
             data.\n\
             The split key should be a key in the input data that contains a string to be \
             split.\n\
             The subprompt should be designed to process individual chunks of the split \
             data.\n\
             Note that the subprompt's output schema will be: {output_schema}.\n\n\
             Provide your response in the following format:\n\
             - split_key: The key in the input data to be used for splitting\n\
             - subprompt: The prompt to be applied to each chunk",
            name = op.name,
            op_type = op.op_type.as_str(),
            prompt = op.prompt.as_deref().unwrap_or("N/A"),
            record = random_record_json(sample),
        );

        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "split_key": {"type": "string"},
                "subprompt": {"type": "string"},
            },
            "required": ["split_key", "subprompt"],
        });

        analysis_call(self.gateway.as_ref(), &self.model, system, user, schema).await
    }

    async fn combine_prompt(
        &self,
        op: &OperationConfig,
        subprompt: &str,
        chunk_size: usize,
    ) -> Result<String, OptimizeError> {
        let system = "You are an expert data processing assistant.";

        let output_schema = op
            .schema()
            .map(|s| serde_json::to_string_pretty(s).unwrap_or_else(|_| "{}".to_string()))
            .unwrap_or_else(|| "{}".to_string());
        let base_prompt = format!(
            "Given the following subtask prompt that will be applied to document chunks:\n\
             {subprompt}\n\n\
             Create a prompt that will be used to combine the results of these subtasks \
             applied to various chunks of size {chunk_size} words of a document.\n\
             This combine prompt should synthesize the information from all chunks into a \
             coherent final result. The final result's schema is:\n{output_schema}\n\n\
             The reduce prompt will be a Jinja template that only takes in the variable \
             `values`, which is a list of results from all chunks. You can use loops and \
             if statements, but don't use any Jinja filters.\n\n\
             Provide your response as a single string containing the combine prompt."
        );
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"combine_prompt": {"type": "string"}},
            "required": ["combine_prompt"],
        });

        let payload = self
            .synthesizer(op)
            .synthesize(&SynthKind::Combine, op, system, base_prompt, schema)
            .await?;
        payload["combine_prompt"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| OptimizeError::BadPayload("missing combine_prompt".into()))
    }

    fn synthesizer<'a>(&'a self, op: &'a OperationConfig) -> Synthesizer<'a> {
        Synthesizer {
            gateway: self.gateway.as_ref(),
            events: self.events.as_ref(),
            deps: &self.deps,
            model: &self.model,
            operation: &op.name,
        }
    }
}

fn pretty_json(value: &impl serde::Serialize) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "[]".to_string())
}

fn random_record_json(sample: &[Record]) -> String {
    let record = {
        let mut rng = rand::thread_rng();
        sample.choose(&mut rng).cloned()
    };
    record
        .map(|r| serde_json::to_string_pretty(&r).unwrap_or_else(|_| "{}".to_string()))
        .unwrap_or_else(|| "{}".to_string())
}
