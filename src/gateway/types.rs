//! Core types for the structured completion gateway.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Attribution for cost tracking and debugging.
///
/// Every request through the gateway carries attribution so we know:
/// - What optimization run it's part of (run_id)
/// - Which code path triggered it (caller)
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    /// Optimization run this request is part of (if known).
    pub run_id: Option<Uuid>,
    /// Which code path made this call, for debugging.
    /// Use a static string like "assess::rubric" or "chunks::probe".
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

// =============================================================================
// MESSAGES
// =============================================================================

/// Chat message role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Chat model specification.
#[derive(Debug, Clone)]
pub enum ChatModel {
    /// OpenRouter model, e.g. "openai/gpt-4o"
    OpenRouter(String),
}

impl ChatModel {
    pub fn openrouter(model_id: impl Into<String>) -> Self {
        ChatModel::OpenRouter(model_id.into())
    }

    pub fn model_id(&self) -> &str {
        match self {
            ChatModel::OpenRouter(id) => id,
        }
    }

    pub fn provider(&self) -> &'static str {
        match self {
            ChatModel::OpenRouter(_) => "openrouter",
        }
    }
}

// =============================================================================
// STRUCTURED COMPLETION
// =============================================================================

/// Request for a structured completion.
///
/// The model is constrained to answer with a single forced call to a function
/// named `write_output` whose parameters equal `schema`. The gateway returns
/// the call's arguments parsed as that schema's JSON shape.
#[derive(Debug, Clone)]
pub struct StructuredRequest {
    /// Model to use.
    pub model: ChatModel,
    /// System prompt, sent as the first message.
    pub system: String,
    /// User/assistant turns following the system message.
    pub turns: Vec<Message>,
    /// JSON schema the function call arguments must conform to.
    pub schema: serde_json::Value,
    /// Attribution for cost tracking.
    pub attribution: Attribution,
}

impl StructuredRequest {
    pub fn new(
        model: ChatModel,
        system: impl Into<String>,
        turns: Vec<Message>,
        schema: serde_json::Value,
        attribution: Attribution,
    ) -> Self {
        Self {
            model,
            system: system.into(),
            turns,
            schema,
            attribution,
        }
    }

    /// Single user turn convenience constructor.
    pub fn single(
        model: ChatModel,
        system: impl Into<String>,
        user: impl Into<String>,
        schema: serde_json::Value,
        attribution: Attribution,
    ) -> Self {
        Self::new(
            model,
            system,
            vec![Message::user(user)],
            schema,
            attribution,
        )
    }
}

/// Response from a structured completion.
#[derive(Debug, Clone)]
pub struct StructuredResponse {
    /// The forced function call's arguments, parsed as JSON.
    pub payload: serde_json::Value,
    /// Input tokens consumed.
    pub input_tokens: u32,
    /// Output tokens generated.
    pub output_tokens: u32,
    /// Cost in nanodollars (1e-9 USD).
    pub cost_nanodollars: i64,
    /// Time taken for the request.
    pub latency: Duration,
}

impl StructuredResponse {
    /// Deserialize the payload into a typed value.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}
