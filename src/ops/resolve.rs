//! Resolve operator: canonicalize near-duplicate key values before a reduce.
//!
//! One `KeyResolver` capability with two variants chosen at configuration
//! time. `Pairwise` asks whether two keys denote the same thing and grows a
//! canonical label set by comparison; `List` shows the model the existing
//! labels and asks it to assign the key to one of them or mint it as new.
//! Both are LLM-backed through the structured gateway; there is no runtime
//! inheritance hierarchy behind the seam.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::{OperationConfig, ResolverKind};
use crate::gateway::{Attribution, ChatModel, StructuredGateway, StructuredRequest};
use crate::sample::Record;

use super::{OpError, Operator, OperatorDeps};

const RESOLVER_SYSTEM_PROMPT: &str =
    "You are a key resolver. Your task is to determine whether keys that are \
     written differently refer to the same thing.";

/// Pairwise capability: are two keys the same?
#[async_trait]
pub trait PairwiseResolver: Send + Sync {
    async fn are_equal(&self, a: &str, b: &str) -> Result<(bool, i64), OpError>;
}

/// List capability: which existing label does this key belong to?
/// Returns the chosen label, or the key itself when it matches none.
#[async_trait]
pub trait ListResolver: Send + Sync {
    async fn assign(&self, key: &str, labels: &[String]) -> Result<(String, i64), OpError>;
}

/// The configured resolver variant.
pub enum KeyResolver {
    Pairwise(Arc<dyn PairwiseResolver>),
    List(Arc<dyn ListResolver>),
}

// =============================================================================
// LLM-BACKED IMPLEMENTATIONS
// =============================================================================

pub struct LlmPairwiseResolver {
    model: String,
    gateway: Arc<dyn StructuredGateway>,
}

impl LlmPairwiseResolver {
    pub fn new(model: impl Into<String>, gateway: Arc<dyn StructuredGateway>) -> Self {
        Self { model: model.into(), gateway }
    }
}

#[derive(Deserialize)]
struct EqualPayload {
    equal: bool,
}

#[async_trait]
impl PairwiseResolver for LlmPairwiseResolver {
    async fn are_equal(&self, a: &str, b: &str) -> Result<(bool, i64), OpError> {
        let req = StructuredRequest::single(
            ChatModel::openrouter(&self.model),
            RESOLVER_SYSTEM_PROMPT,
            format!("Are these two keys equal? Key 1: {a}, Key 2: {b}."),
            json!({
                "type": "object",
                "properties": {"equal": {"type": "boolean"}},
                "required": ["equal"],
                "additionalProperties": false,
            }),
            Attribution::new("ops::resolve"),
        );
        let resp = self.gateway.complete(req).await?;
        let payload: EqualPayload =
            resp.parse().map_err(|e| OpError::BadOutput(e.to_string()))?;
        Ok((payload.equal, resp.cost_nanodollars))
    }
}

pub struct LlmListResolver {
    model: String,
    gateway: Arc<dyn StructuredGateway>,
}

impl LlmListResolver {
    pub fn new(model: impl Into<String>, gateway: Arc<dyn StructuredGateway>) -> Self {
        Self { model: model.into(), gateway }
    }
}

#[derive(Deserialize)]
struct AssignPayload {
    label: String,
}

#[async_trait]
impl ListResolver for LlmListResolver {
    async fn assign(&self, key: &str, labels: &[String]) -> Result<(String, i64), OpError> {
        let req = StructuredRequest::single(
            ChatModel::openrouter(&self.model),
            RESOLVER_SYSTEM_PROMPT,
            format!(
                "Given the key '{key}' and the existing label keys {labels:?}, which \
                 label key should it be assigned to? If it does not match any \
                 existing label key, answer with the literal word NEW."
            ),
            json!({
                "type": "object",
                "properties": {"label": {"type": "string"}},
                "required": ["label"],
                "additionalProperties": false,
            }),
            Attribution::new("ops::resolve"),
        );
        let resp = self.gateway.complete(req).await?;
        let payload: AssignPayload =
            resp.parse().map_err(|e| OpError::BadOutput(e.to_string()))?;
        let label = if payload.label == "NEW" {
            key.to_string()
        } else {
            payload.label
        };
        Ok((label, resp.cost_nanodollars))
    }
}

// =============================================================================
// RESOLVE OPERATOR
// =============================================================================

pub struct ResolveOperator {
    name: String,
    reduce_key: String,
    resolver: KeyResolver,
}

impl ResolveOperator {
    pub fn from_config(config: &OperationConfig, deps: &OperatorDeps) -> Result<Self, OpError> {
        let reduce_key = config
            .reduce_key
            .clone()
            .ok_or_else(|| OpError::missing_field(config, "reduce_key"))?;
        let kind = config
            .resolver
            .ok_or_else(|| OpError::missing_field(config, "resolver"))?;
        let model = config.model_or(&deps.default_model).to_string();

        let resolver = match kind {
            ResolverKind::Pairwise => KeyResolver::Pairwise(Arc::new(LlmPairwiseResolver::new(
                model,
                deps.gateway.clone(),
            ))),
            ResolverKind::List => {
                KeyResolver::List(Arc::new(LlmListResolver::new(model, deps.gateway.clone())))
            }
        };

        Ok(Self {
            name: config.name.clone(),
            reduce_key,
            resolver,
        })
    }

    pub fn with_resolver(
        name: impl Into<String>,
        reduce_key: impl Into<String>,
        resolver: KeyResolver,
    ) -> Self {
        Self {
            name: name.into(),
            reduce_key: reduce_key.into(),
            resolver,
        }
    }

    /// Map each distinct key (first-seen order) to its canonical label.
    async fn canonical_map(
        &self,
        keys: &[String],
    ) -> Result<(BTreeMap<String, String>, i64), OpError> {
        let mut labels: Vec<String> = Vec::new();
        let mut mapping: BTreeMap<String, String> = BTreeMap::new();
        let mut total_cost = 0i64;

        for key in keys {
            if mapping.contains_key(key) {
                continue;
            }
            let label = match &self.resolver {
                KeyResolver::Pairwise(resolver) => {
                    let mut found = None;
                    for label in &labels {
                        let (equal, cost) = resolver.are_equal(key, label).await?;
                        total_cost = total_cost.saturating_add(cost);
                        if equal {
                            found = Some(label.clone());
                            break;
                        }
                    }
                    found
                }
                KeyResolver::List(resolver) => {
                    if labels.is_empty() {
                        None
                    } else {
                        let (label, cost) = resolver.assign(key, &labels).await?;
                        total_cost = total_cost.saturating_add(cost);
                        labels.contains(&label).then_some(label)
                    }
                }
            };
            let label = match label {
                Some(label) => label,
                None => {
                    labels.push(key.clone());
                    key.clone()
                }
            };
            mapping.insert(key.clone(), label);
        }

        Ok((mapping, total_cost))
    }
}

#[async_trait]
impl Operator for ResolveOperator {
    async fn execute(&self, records: Vec<Record>) -> Result<(Vec<Record>, i64), OpError> {
        let mut keys = Vec::with_capacity(records.len());
        for record in &records {
            let key = record
                .get(&self.reduce_key)
                .and_then(|v| v.as_str())
                .ok_or_else(|| OpError::MissingRecordField {
                    name: self.name.clone(),
                    field: self.reduce_key.clone(),
                })?;
            keys.push(key.to_string());
        }

        let (mapping, cost) = self.canonical_map(&keys).await?;

        let out = records
            .into_iter()
            .zip(keys)
            .map(|(mut record, key)| {
                if let Some(label) = mapping.get(&key) {
                    record.insert(self.reduce_key.clone(), json!(label));
                }
                record
            })
            .collect();
        Ok((out, cost))
    }
}
