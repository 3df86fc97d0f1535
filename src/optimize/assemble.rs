//! Assembly of the decomposed operation chain.
//!
//! A split decomposition always emits, in order: an optional metadata map,
//! the split itself, a per-chunk sub-map, and a sub-reduce that combines the
//! chunk results per source document. Every derived config is constructed
//! fresh from explicit values.

use crate::config::{
    OpType, OperationConfig, OutputSchema, OutputSpec, PeripheralChunks, PeripheralWindow,
    WindowSpec,
};

use super::chunks::ChunkSizeEstimate;
use super::context::ContextNeeds;

/// Chunks of one source document are recombined under this key.
pub const SUB_REDUCE_KEY: &str = "document_id";

/// Split keys generated by the model sometimes arrive qualified as a
/// template variable. Stripping is idempotent.
pub fn normalize_split_key(split_key: &str) -> &str {
    split_key.strip_prefix("input.").unwrap_or(split_key)
}

pub fn metadata_operation(
    original: &OperationConfig,
    default_model: &str,
    metadata_prompt: String,
    output_schema: OutputSchema,
) -> OperationConfig {
    let mut op = OperationConfig::new(format!("extract_metadata_{}", original.name), OpType::Map);
    op.prompt = Some(metadata_prompt);
    op.model = Some(default_model.to_string());
    op.output = Some(OutputSpec {
        schema: output_schema,
    });
    op
}

pub fn split_operation(
    original: &OperationConfig,
    estimate: &ChunkSizeEstimate,
    context: &ContextNeeds,
    split_key: &str,
) -> OperationConfig {
    let mut op = OperationConfig::new(format!("split_{}", original.name), OpType::Split);
    op.split_key = Some(normalize_split_key(split_key).to_string());
    op.chunk_size = Some(estimate.split_chunk_size());

    let mut peripheral = PeripheralChunks::default();
    if context.previous_context {
        peripheral.previous = Some(PeripheralWindow {
            head: Some(WindowSpec { count: 2.0 }),
            tail: Some(WindowSpec { count: 1.5 }),
        });
    }
    if context.next_context {
        peripheral.next = Some(PeripheralWindow {
            head: Some(WindowSpec { count: 1.0 }),
            tail: None,
        });
    }
    if !peripheral.is_empty() {
        op.peripheral_chunks = Some(peripheral);
    }
    op
}

pub fn submap_operation(original: &OperationConfig, subprompt: String) -> OperationConfig {
    let mut op = OperationConfig::new(format!("submap_{}", original.name), OpType::Map);
    op.prompt = Some(subprompt);
    op.model = original.model.clone();
    op.output = original.output.clone();
    op
}

pub fn subreduce_operation(original: &OperationConfig, combine_prompt: String) -> OperationConfig {
    let mut op = OperationConfig::new(format!("subreduce_{}", original.name), OpType::Reduce);
    op.prompt = Some(combine_prompt);
    op.model = original.model.clone();
    op.reduce_key = Some(SUB_REDUCE_KEY.to_string());
    op.output = original.output.clone();
    op
}
