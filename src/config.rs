//! Pipeline configuration documents.
//!
//! The optimizer consumes and produces one YAML document shape: named
//! `datasets`, named `operations`, a `default_model`, and ordered
//! `pipeline.steps` referencing operations by name (optionally with inline
//! overrides). Configs are immutable values; derived configs are built fresh
//! from a parent plus explicit overrides, never mutated in place.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("no such operation: {0}")]
    UnknownOperation(String),
    #[error("no such dataset: {0}")]
    UnknownDataset(String),
    #[error("invalid operation reference: expected a name or a single-key mapping")]
    InvalidOperationRef,
}

// =============================================================================
// SCHEMA TYPES
// =============================================================================

/// Primitive type tags for operation output schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
}

impl SchemaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaType::String => "string",
            SchemaType::Integer => "integer",
            SchemaType::Number => "number",
            SchemaType::Boolean => "boolean",
            SchemaType::Array => "array",
        }
    }
}

/// Ordered mapping of output field name to primitive type tag.
pub type OutputSchema = BTreeMap<String, SchemaType>;

/// The `output` block of an operation config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub schema: OutputSchema,
}

/// Build the JSON Schema for a structured completion constrained to an
/// operation's output schema.
pub fn output_json_schema(schema: &OutputSchema) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for (field, ty) in schema {
        let prop = match ty {
            SchemaType::Array => serde_json::json!({"type": "array", "items": {}}),
            other => serde_json::json!({"type": other.as_str()}),
        };
        properties.insert(field.clone(), prop);
        required.push(serde_json::Value::String(field.clone()));
    }
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

// =============================================================================
// OPERATIONS
// =============================================================================

/// Closed operation-type vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Map,
    Filter,
    Reduce,
    Split,
    Resolve,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Map => "map",
            OpType::Filter => "filter",
            OpType::Reduce => "reduce",
            OpType::Split => "split",
            OpType::Resolve => "resolve",
        }
    }
}

/// Fractional chunk-count window, e.g. `{count: 1.5}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub count: f64,
}

/// Peripheral windows on one side of a chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeripheralWindow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<WindowSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tail: Option<WindowSpec>,
}

/// Peripheral context configuration for a split operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeripheralChunks {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<PeripheralWindow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<PeripheralWindow>,
}

impl PeripheralChunks {
    pub fn is_empty(&self) -> bool {
        self.previous.is_none() && self.next.is_none()
    }
}

/// Which key-resolution capability a resolve operation uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverKind {
    /// Pairwise equality: `compare(a, b) -> bool`.
    Pairwise,
    /// List-based assignment: `assign(key, label_keys) -> key`.
    List,
}

/// One configured unit of work in the pipeline.
///
/// Identity is by `name`. The name lives in the surrounding `operations`
/// mapping and is not serialized inside the config body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationConfig {
    #[serde(default, skip_serializing)]
    pub name: String,
    #[serde(rename = "type")]
    pub op_type: OpType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduce_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peripheral_chunks: Option<PeripheralChunks>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolver: Option<ResolverKind>,
}

impl OperationConfig {
    /// Minimal config of the given type; callers fill in the rest.
    pub fn new(name: impl Into<String>, op_type: OpType) -> Self {
        Self {
            name: name.into(),
            op_type,
            prompt: None,
            model: None,
            output: None,
            reduce_key: None,
            split_key: None,
            chunk_size: None,
            peripheral_chunks: None,
            resolver: None,
        }
    }

    /// A copy of this config with a different name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// A copy of this config with only the prompt replaced.
    pub fn with_prompt(&self, prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..self.clone()
        }
    }

    /// The model for this operation, falling back to the pipeline default.
    pub fn model_or<'a>(&'a self, default_model: &'a str) -> &'a str {
        self.model.as_deref().unwrap_or(default_model)
    }

    /// The output schema, if declared.
    pub fn schema(&self) -> Option<&OutputSchema> {
        self.output.as_ref().map(|o| &o.schema)
    }
}

// =============================================================================
// DATASETS AND STEPS
// =============================================================================

/// Named dataset declaration. Only file-backed JSON arrays are supported by
/// the sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DatasetConfig {
    File { path: PathBuf },
}

/// An operation reference inside a step: a bare name, or a single-key mapping
/// carrying inline overrides merged over the named config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OperationRef {
    Name(String),
    Inline(BTreeMap<String, serde_yaml::Value>),
}

impl OperationRef {
    /// The referenced operation's name.
    pub fn name(&self) -> Result<&str, ConfigError> {
        match self {
            OperationRef::Name(name) => Ok(name),
            OperationRef::Inline(map) => {
                if map.len() != 1 {
                    return Err(ConfigError::InvalidOperationRef);
                }
                Ok(map.keys().next().map(|k| k.as_str()).unwrap_or_default())
            }
        }
    }
}

/// One step of the pipeline: an input dataset and an ordered operation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    pub operations: Vec<OperationRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub steps: Vec<Step>,
}

// =============================================================================
// THE DOCUMENT
// =============================================================================

/// The full pipeline configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub datasets: BTreeMap<String, DatasetConfig>,
    pub default_model: String,
    pub operations: BTreeMap<String, OperationConfig>,
    pub pipeline: PipelineSpec,
}

impl PipelineConfig {
    pub fn from_yaml(s: &str) -> Result<Self, ConfigError> {
        let mut config: PipelineConfig = serde_yaml::from_str(s)?;
        for (name, op) in config.operations.iter_mut() {
            op.name = name.clone();
        }
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Write the document as YAML. serde_yaml emits no anchors or aliases, so
    /// the artifact is fully resolved by construction.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = serde_yaml::to_string(self)?;
        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolve an operation reference to a fresh config value: the named
    /// config with any inline overrides merged over its top-level fields.
    pub fn resolve_operation(&self, reference: &OperationRef) -> Result<OperationConfig, ConfigError> {
        let name = reference.name()?;
        let base = self
            .operations
            .get(name)
            .ok_or_else(|| ConfigError::UnknownOperation(name.to_string()))?;

        let overrides = match reference {
            OperationRef::Name(_) => return Ok(base.renamed(name)),
            OperationRef::Inline(map) => map.values().next().cloned().unwrap_or_default(),
        };

        // Shallow merge at the YAML level, then re-type.
        let mut value = serde_yaml::to_value(base)?;
        if let (Some(base_map), Some(over_map)) = (value.as_mapping_mut(), overrides.as_mapping()) {
            for (k, v) in over_map {
                base_map.insert(k.clone(), v.clone());
            }
        }
        let mut merged: OperationConfig = serde_yaml::from_value(value)?;
        merged.name = name.to_string();
        Ok(merged)
    }

    pub fn dataset(&self, name: &str) -> Result<&DatasetConfig, ConfigError> {
        self.datasets
            .get(name)
            .ok_or_else(|| ConfigError::UnknownDataset(name.to_string()))
    }
}
