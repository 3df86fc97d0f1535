//! Map and filter operators.
//!
//! A map renders its prompt once per record and asks for a structured
//! completion conforming to the declared output schema; the payload is merged
//! over the input record. A filter is a map whose single boolean output field
//! decides whether the record survives.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::config::{output_json_schema, OperationConfig, OutputSchema, SchemaType};
use crate::gateway::{Attribution, ChatModel, StructuredGateway, StructuredRequest};
use crate::sample::Record;

use super::{render_template, validate_template, OpError, Operator, OperatorDeps};

const MAP_SYSTEM_PROMPT: &str =
    "You are a data processing assistant. Apply the given instruction to the \
     input and write the structured output.";

pub struct MapOperator {
    name: String,
    prompt: String,
    model: String,
    schema: OutputSchema,
    max_threads: usize,
    gateway: Arc<dyn StructuredGateway>,
    /// When set, the single boolean output field gates record survival.
    filter_field: Option<String>,
}

impl std::fmt::Debug for MapOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapOperator")
            .field("name", &self.name)
            .field("prompt", &self.prompt)
            .field("model", &self.model)
            .field("schema", &self.schema)
            .field("max_threads", &self.max_threads)
            .field("filter_field", &self.filter_field)
            .finish_non_exhaustive()
    }
}

impl MapOperator {
    pub fn from_config(
        config: &OperationConfig,
        deps: &OperatorDeps,
        filter: bool,
    ) -> Result<Self, OpError> {
        let prompt = config
            .prompt
            .clone()
            .ok_or_else(|| OpError::missing_field(config, "prompt"))?;
        validate_template(&prompt)?;

        let schema = config
            .schema()
            .cloned()
            .ok_or_else(|| OpError::missing_field(config, "output.schema"))?;

        let filter_field = if filter {
            let mut booleans = schema
                .iter()
                .filter(|(_, ty)| **ty == SchemaType::Boolean)
                .map(|(field, _)| field.clone());
            let field = booleans.next();
            match (field, booleans.next(), schema.len()) {
                (Some(field), None, 1) => Some(field),
                _ => {
                    return Err(OpError::InvalidConfig {
                        name: config.name.clone(),
                        message: "filter requires exactly one boolean output field".into(),
                    })
                }
            }
        } else {
            None
        };

        Ok(Self {
            name: config.name.clone(),
            prompt,
            model: config.model_or(&deps.default_model).to_string(),
            schema,
            max_threads: deps.max_threads.max(1),
            gateway: deps.gateway.clone(),
            filter_field,
        })
    }

    async fn apply(&self, record: Record) -> Result<(Record, i64), OpError> {
        let rendered = render_template(
            &self.prompt,
            minijinja::context! { input => minijinja::Value::from_serialize(&record) },
        )?;

        let req = StructuredRequest::single(
            ChatModel::openrouter(&self.model),
            MAP_SYSTEM_PROMPT,
            rendered,
            output_json_schema(&self.schema),
            Attribution::new("ops::map"),
        );
        let resp = self.gateway.complete(req).await?;

        let serde_json::Value::Object(payload) = resp.payload else {
            return Err(OpError::BadOutput("payload is not an object".into()));
        };

        let mut out = record;
        for (field, value) in payload {
            out.insert(field, value);
        }
        Ok((out, resp.cost_nanodollars))
    }
}

#[async_trait]
impl Operator for MapOperator {
    async fn execute(&self, records: Vec<Record>) -> Result<(Vec<Record>, i64), OpError> {
        // Buffered, not buffer_unordered: output order must match input order.
        let results: Vec<Result<(Record, i64), OpError>> =
            stream::iter(records.into_iter().map(|record| self.apply(record)))
                .buffered(self.max_threads)
                .collect()
                .await;

        let mut out = Vec::with_capacity(results.len());
        let mut total_cost = 0i64;
        for result in results {
            let (record, cost) = result?;
            total_cost = total_cost.saturating_add(cost);

            if let Some(field) = &self.filter_field {
                let keep = record.get(field).and_then(|v| v.as_bool()).ok_or_else(|| {
                    OpError::MissingRecordField {
                        name: self.name.clone(),
                        field: field.clone(),
                    }
                })?;
                if !keep {
                    continue;
                }
            }
            out.push(record);
        }
        Ok((out, total_cost))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OpType, OutputSpec};
    use crate::gateway::{ProviderError, StructuredResponse};
    use std::collections::BTreeMap;

    struct NoGateway;

    #[async_trait]
    impl StructuredGateway for NoGateway {
        async fn complete(
            &self,
            _req: StructuredRequest,
        ) -> Result<StructuredResponse, ProviderError> {
            Err(ProviderError::config("no gateway in construction tests"))
        }
    }

    fn deps() -> OperatorDeps {
        OperatorDeps {
            gateway: Arc::new(NoGateway),
            default_model: "openai/gpt-4o".into(),
            max_threads: 2,
        }
    }

    fn map_config(prompt: &str) -> OperationConfig {
        let mut schema = OutputSchema::new();
        schema.insert("topic".into(), SchemaType::String);
        let mut config = OperationConfig::new("extract_topic", OpType::Map);
        config.prompt = Some(prompt.into());
        config.output = Some(OutputSpec { schema });
        config
    }

    #[test]
    fn test_construction_validates_template() {
        MapOperator::from_config(&map_config("{{ input.text }}"), &deps(), false).unwrap();

        let err =
            MapOperator::from_config(&map_config("{% for x in %}"), &deps(), false).unwrap_err();
        assert!(matches!(err, OpError::Template(_)));
    }

    #[test]
    fn test_construction_requires_prompt() {
        let mut config = map_config("{{ input.text }}");
        config.prompt = None;
        let err = MapOperator::from_config(&config, &deps(), false).unwrap_err();
        assert!(matches!(err, OpError::MissingField { field: "prompt", .. }));
    }

    #[test]
    fn test_filter_requires_single_boolean_field() {
        let err = MapOperator::from_config(&map_config("{{ input.text }}"), &deps(), true)
            .unwrap_err();
        assert!(matches!(err, OpError::InvalidConfig { .. }));

        let mut schema = BTreeMap::new();
        schema.insert("keep".to_string(), SchemaType::Boolean);
        let mut config = map_config("{{ input.text }}");
        config.output = Some(OutputSpec { schema });
        let op = MapOperator::from_config(&config, &deps(), true).unwrap();
        assert_eq!(op.filter_field.as_deref(), Some("keep"));
    }
}
