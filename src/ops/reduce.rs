//! Reduce operator: fold each group of records sharing a key into one.
//!
//! Records are grouped by the configured `reduce_key` in first-seen order,
//! the prompt is rendered once per group with the group's records bound as
//! `values`, and the structured payload becomes the group's output record
//! with the key field carried through.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;

use crate::config::{output_json_schema, OperationConfig, OutputSchema};
use crate::gateway::{Attribution, ChatModel, StructuredGateway, StructuredRequest};
use crate::sample::Record;

use super::{render_template, validate_template, OpError, Operator, OperatorDeps};

const REDUCE_SYSTEM_PROMPT: &str =
    "You are a data processing assistant. Combine the given group of inputs \
     according to the instruction and write the structured output.";

pub struct ReduceOperator {
    name: String,
    prompt: String,
    model: String,
    schema: OutputSchema,
    reduce_key: String,
    max_threads: usize,
    gateway: Arc<dyn StructuredGateway>,
}

impl std::fmt::Debug for ReduceOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReduceOperator")
            .field("name", &self.name)
            .field("prompt", &self.prompt)
            .field("model", &self.model)
            .field("schema", &self.schema)
            .field("reduce_key", &self.reduce_key)
            .field("max_threads", &self.max_threads)
            .finish_non_exhaustive()
    }
}

impl ReduceOperator {
    pub fn from_config(config: &OperationConfig, deps: &OperatorDeps) -> Result<Self, OpError> {
        let prompt = config
            .prompt
            .clone()
            .ok_or_else(|| OpError::missing_field(config, "prompt"))?;
        validate_template(&prompt)?;

        let schema = config
            .schema()
            .cloned()
            .ok_or_else(|| OpError::missing_field(config, "output.schema"))?;

        let reduce_key = config
            .reduce_key
            .clone()
            .ok_or_else(|| OpError::missing_field(config, "reduce_key"))?;

        Ok(Self {
            name: config.name.clone(),
            prompt,
            model: config.model_or(&deps.default_model).to_string(),
            schema,
            reduce_key,
            max_threads: deps.max_threads.max(1),
            gateway: deps.gateway.clone(),
        })
    }

    /// Partition records by the reduce key, preserving the order in which
    /// each key first appears.
    fn group(&self, records: Vec<Record>) -> Result<Vec<(Value, Vec<Record>)>, OpError> {
        let mut order: Vec<Value> = Vec::new();
        let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();

        for record in records {
            let key = record
                .get(&self.reduce_key)
                .cloned()
                .ok_or_else(|| OpError::MissingRecordField {
                    name: self.name.clone(),
                    field: self.reduce_key.clone(),
                })?;
            let slot = key.to_string();
            if !groups.contains_key(&slot) {
                order.push(key);
            }
            groups.entry(slot).or_default().push(record);
        }

        Ok(order
            .into_iter()
            .map(|key| {
                let members = groups.remove(&key.to_string()).unwrap_or_default();
                (key, members)
            })
            .collect())
    }

    async fn fold(&self, key: Value, members: Vec<Record>) -> Result<(Record, i64), OpError> {
        let rendered = render_template(
            &self.prompt,
            minijinja::context! {
                reduce_key => minijinja::Value::from_serialize(&key),
                values => minijinja::Value::from_serialize(&members),
            },
        )?;

        let req = StructuredRequest::single(
            ChatModel::openrouter(&self.model),
            REDUCE_SYSTEM_PROMPT,
            rendered,
            output_json_schema(&self.schema),
            Attribution::new("ops::reduce"),
        );
        let resp = self.gateway.complete(req).await?;

        let Value::Object(payload) = resp.payload else {
            return Err(OpError::BadOutput("payload is not an object".into()));
        };

        let mut out = Record::new();
        out.insert(self.reduce_key.clone(), key);
        for (field, value) in payload {
            out.insert(field, value);
        }
        Ok((out, resp.cost_nanodollars))
    }
}

#[async_trait]
impl Operator for ReduceOperator {
    async fn execute(&self, records: Vec<Record>) -> Result<(Vec<Record>, i64), OpError> {
        let groups = self.group(records)?;

        let results: Vec<Result<(Record, i64), OpError>> =
            stream::iter(groups.into_iter().map(|(key, members)| self.fold(key, members)))
                .buffered(self.max_threads)
                .collect()
                .await;

        let mut out = Vec::with_capacity(results.len());
        let mut total_cost = 0i64;
        for result in results {
            let (record, cost) = result?;
            total_cost = total_cost.saturating_add(cost);
            out.push(record);
        }
        Ok((out, total_cost))
    }
}
