//! Template synthesis with bounded validation retries.
//!
//! Generated prompts are never trusted as written: each draft is dry-run
//! through a throwaway operator construction, which compiles the template.
//! Template errors (and, for rewrites, variable-set violations) are fed back
//! to the model as a new conversation turn and redrafted, up to
//! [`MAX_SYNTH_ATTEMPTS`] times. The flow is a small state machine:
//!
//! ```text
//! Drafting -> Validating -> Succeeded
//!                 |             ^
//!                 v             |
//!             Retrying ---> Drafting      (attempts remaining)
//!                 |
//!                 v
//!           ExhaustedFailed
//! ```

use std::collections::HashSet;

use thiserror::Error;
use tracing::debug;

use crate::config::{OpType, OperationConfig, OutputSchema, OutputSpec};
use crate::events::{ObserverSink, ProgressEvent};
use crate::gateway::{Attribution, ChatModel, Message, ProviderError, StructuredGateway, StructuredRequest};
use crate::ops::{build_operator, template_variables, OpError, OperatorDeps};

pub const MAX_SYNTH_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum SynthesisError {
    /// Every attempt produced an invalid template. Fatal for the enclosing
    /// operation's optimization.
    #[error("template synthesis exhausted {MAX_SYNTH_ATTEMPTS} attempts; last error: {last_error}")]
    ExhaustedRetries { last_error: String },

    /// The dry-run construction failed for a non-template reason. Retrying
    /// the draft cannot fix this.
    #[error("dry-run construction failed: {0}")]
    DryRunFailed(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("synthesis payload did not match its schema: {0}")]
    BadPayload(String),
}

/// What kind of template is being synthesized. The kind decides which
/// payload field holds the template and what throwaway operation validates
/// it.
pub enum SynthKind {
    /// `{metadata_prompt, output_schema}`, validated as a map operation.
    Metadata,
    /// `{combine_prompt}`, validated as a reduce operation over
    /// `document_id`.
    Combine,
    /// `{new_prompt}`, validated as the original operation with only the
    /// prompt replaced. The new template may only use variables the current
    /// prompt already uses.
    Rewrite { allowed_variables: HashSet<String> },
}

enum SynthState {
    Drafting,
    Validating(serde_json::Value),
    Retrying { feedback: String },
    Succeeded(serde_json::Value),
    ExhaustedFailed { last_error: String },
}

/// Why a draft was rejected.
enum Rejection {
    /// Template-class failure: feed back and redraft.
    Retry(String),
    /// Unfixable by redrafting: surface immediately.
    Fatal(SynthesisError),
}

pub struct Synthesizer<'a> {
    pub gateway: &'a dyn StructuredGateway,
    pub events: &'a dyn ObserverSink,
    pub deps: &'a OperatorDeps,
    pub model: &'a str,
    /// Name of the operation being optimized, for events.
    pub operation: &'a str,
}

impl Synthesizer<'_> {
    /// Drive the draft/validate/retry machine to a validated payload.
    pub async fn synthesize(
        &self,
        kind: &SynthKind,
        base: &OperationConfig,
        system: &str,
        base_prompt: String,
        schema: serde_json::Value,
    ) -> Result<serde_json::Value, SynthesisError> {
        let mut turns = vec![Message::user(base_prompt)];
        let mut attempt = 0u32;
        let mut state = SynthState::Drafting;

        loop {
            state = match state {
                SynthState::Drafting => {
                    attempt += 1;
                    let req = StructuredRequest::new(
                        ChatModel::openrouter(self.model),
                        system,
                        turns.clone(),
                        schema.clone(),
                        Attribution::new("optimize::synth"),
                    );
                    let resp = self.gateway.complete(req).await?;
                    turns.push(Message::assistant(resp.payload.to_string()));
                    SynthState::Validating(resp.payload)
                }

                SynthState::Validating(payload) => match self.validate(kind, base, &payload) {
                    Ok(()) => SynthState::Succeeded(payload),
                    Err(Rejection::Retry(feedback)) => {
                        debug!(operation = %self.operation, attempt, %feedback, "draft rejected");
                        self.events.emit(ProgressEvent::TemplateRejected {
                            operation: self.operation.to_string(),
                            attempt,
                            error: feedback.clone(),
                        });
                        SynthState::Retrying { feedback }
                    }
                    Err(Rejection::Fatal(e)) => return Err(e),
                },

                SynthState::Retrying { feedback } => {
                    if attempt >= MAX_SYNTH_ATTEMPTS {
                        SynthState::ExhaustedFailed {
                            last_error: feedback,
                        }
                    } else {
                        turns.push(Message::user(format!(
                            "The previous attempt failed. Error: {feedback}\n\nPlease try \
                             again, ensuring the prompt is a valid Jinja template and meets \
                             all requirements."
                        )));
                        SynthState::Drafting
                    }
                }

                SynthState::Succeeded(payload) => return Ok(payload),

                SynthState::ExhaustedFailed { last_error } => {
                    return Err(SynthesisError::ExhaustedRetries { last_error })
                }
            };
        }
    }

    fn validate(
        &self,
        kind: &SynthKind,
        base: &OperationConfig,
        payload: &serde_json::Value,
    ) -> Result<(), Rejection> {
        let dry_config = match kind {
            SynthKind::Metadata => {
                let prompt = required_str(payload, "metadata_prompt")?;
                let schema: OutputSchema =
                    serde_json::from_value(payload["output_schema"].clone()).map_err(|e| {
                        Rejection::Fatal(SynthesisError::BadPayload(format!(
                            "output_schema: {e}"
                        )))
                    })?;
                let mut dry = OperationConfig::new(format!("dry_run_{}", base.name), OpType::Map);
                dry.prompt = Some(prompt.to_string());
                dry.model = base.model.clone();
                dry.output = Some(OutputSpec { schema });
                dry
            }
            SynthKind::Combine => {
                let prompt = required_str(payload, "combine_prompt")?;
                let mut dry =
                    OperationConfig::new(format!("dry_run_{}", base.name), OpType::Reduce);
                dry.prompt = Some(prompt.to_string());
                dry.model = base.model.clone();
                dry.reduce_key = Some(super::assemble::SUB_REDUCE_KEY.to_string());
                dry.output = base.output.clone();
                dry
            }
            SynthKind::Rewrite { allowed_variables } => {
                let prompt = required_str(payload, "new_prompt")?;
                let used = match template_variables(prompt) {
                    Ok(used) => used,
                    Err(OpError::Template(e)) => {
                        return Err(Rejection::Retry(format!("invalid Jinja template: {e}")))
                    }
                    Err(e) => {
                        return Err(Rejection::Fatal(SynthesisError::DryRunFailed(e.to_string())))
                    }
                };
                let mut introduced: Vec<&str> = used
                    .iter()
                    .filter(|v| !allowed_variables.contains(*v))
                    .map(String::as_str)
                    .collect();
                if !introduced.is_empty() {
                    introduced.sort_unstable();
                    return Err(Rejection::Retry(format!(
                        "the new prompt introduces variables not present in the current \
                         prompt: {}",
                        introduced.join(", ")
                    )));
                }
                base.with_prompt(prompt)
            }
        };

        match build_operator(&dry_config, self.deps) {
            Ok(_) => Ok(()),
            Err(OpError::Template(e)) => {
                Err(Rejection::Retry(format!("invalid Jinja template: {e}")))
            }
            Err(e) => Err(Rejection::Fatal(SynthesisError::DryRunFailed(e.to_string()))),
        }
    }
}

fn required_str<'p>(payload: &'p serde_json::Value, field: &str) -> Result<&'p str, Rejection> {
    payload[field].as_str().ok_or_else(|| {
        Rejection::Fatal(SynthesisError::BadPayload(format!(
            "missing string field `{field}`"
        )))
    })
}
