//! Quality assessment: synthesize a validation rubric for an operation, then
//! judge the operation's sampled output against it.

use serde::{Deserialize, Serialize};

use crate::config::OperationConfig;
use crate::events::{ObserverSink, ProgressEvent};
use crate::gateway::StructuredGateway;
use crate::sample::Record;

use super::{analysis_call, OptimizeError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assessment {
    pub needs_improvement: bool,
    pub reasons: Vec<String>,
    pub suggested_improvements: Vec<String>,
}

#[derive(Deserialize)]
struct ValidatorPayload {
    validator_prompt: String,
}

fn pretty(value: &(impl Serialize + ?Sized)) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

fn first_or_empty(records: &[Record]) -> String {
    records
        .first()
        .map(|r| pretty(r))
        .unwrap_or_else(|| "{}".to_string())
}

fn head(records: &[Record], n: usize) -> String {
    pretty(&records[..records.len().min(n)])
}

/// Generate a validation rubric tailored to the operation, then use it to
/// judge the sampled output. Both results are emitted as events. Transport
/// errors propagate; they are fatal for the run.
pub async fn assess(
    gateway: &dyn StructuredGateway,
    events: &dyn ObserverSink,
    model: &str,
    op: &OperationConfig,
    inputs: &[Record],
    outputs: &[Record],
) -> Result<Assessment, OptimizeError> {
    let validator_prompt = generate_validator_prompt(gateway, model, op, inputs, outputs).await?;
    events.emit(ProgressEvent::ValidatorPrompt {
        operation: op.name.clone(),
        prompt: validator_prompt.clone(),
    });

    let assessment = judge(gateway, model, op, inputs, outputs, &validator_prompt).await?;
    events.emit(ProgressEvent::AssessmentProduced {
        operation: op.name.clone(),
        assessment: assessment.clone(),
    });
    Ok(assessment)
}

async fn generate_validator_prompt(
    gateway: &dyn StructuredGateway,
    model: &str,
    op: &OperationConfig,
    inputs: &[Record],
    outputs: &[Record],
) -> Result<String, OptimizeError> {
    let system = "You are an AI assistant tasked with creating custom validation prompts for \
                  data processing operations. Your goal is to create a prompt that will assess \
                  how well the operation performed its intended task.";

    let user = format!(
        "Analyze the following operation and its input/output:\n\n\
         Operation Name: {name}\n\
         Operation Type: {op_type}\n\
         Input Schema: {input}\n\
         Output Schema: {output}\n\
         Current Prompt: {prompt}\n\n\
         Based on this information, create a custom validator prompt that will assess how \
         well the original task was performed. The prompt should ask specific questions \
         about the quality and completeness of the output, such as:\n\
         1. Are there any instances of the target information missed?\n\
         2. Would the output improve if the input was analyzed more carefully?\n\
         3. Is the output format correct and consistent?\n\
         4. Are there any errors or inconsistencies in the extracted information?\n\n\
         Provide your response as a single string containing the custom validator prompt.",
        name = op.name,
        op_type = op.op_type.as_str(),
        input = first_or_empty(inputs),
        output = first_or_empty(outputs),
        prompt = op.prompt.as_deref().unwrap_or("N/A"),
    );

    let schema = serde_json::json!({
        "type": "object",
        "properties": {"validator_prompt": {"type": "string"}},
        "required": ["validator_prompt"],
    });

    let payload: ValidatorPayload = analysis_call(gateway, model, system, user, schema).await?;
    Ok(payload.validator_prompt)
}

async fn judge(
    gateway: &dyn StructuredGateway,
    model: &str,
    op: &OperationConfig,
    inputs: &[Record],
    outputs: &[Record],
    validator_prompt: &str,
) -> Result<Assessment, OptimizeError> {
    let system = "You are an AI assistant tasked with assessing the performance of data \
                  processing operations. Use the provided validator prompt to evaluate the \
                  operation's output.";

    let user = format!(
        "{validator_prompt}\n\n\
         Operation Name: {name}\n\
         Operation Type: {op_type}\n\
         Input Data (sample): {input}\n\
         Output Data (sample): {output}\n\
         Current Prompt: {prompt}\n\n\
         Based on this information and the validator prompt, assess the operation's \
         performance. Provide your assessment in the following format:",
        name = op.name,
        op_type = op.op_type.as_str(),
        input = head(inputs, 2),
        output = head(outputs, 2),
        prompt = op.prompt.as_deref().unwrap_or("N/A"),
    );

    let schema = serde_json::json!({
        "type": "object",
        "properties": {
            "needs_improvement": {"type": "boolean"},
            "reasons": {"type": "array", "items": {"type": "string"}},
            "suggested_improvements": {"type": "array", "items": {"type": "string"}},
        },
        "required": ["needs_improvement", "reasons", "suggested_improvements"],
    });

    analysis_call(gateway, model, system, user, schema).await
}
