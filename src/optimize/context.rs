//! Context and metadata analysis for chunked processing.
//!
//! Both analyses show the model a random contiguous window of the operative
//! chunk size from a sampled document. Context analysis asks whether
//! ambiguous references make peripheral chunks necessary; metadata analysis
//! asks whether document-level metadata (headers and the like) would
//! materially help, and if so synthesizes a validated extraction prompt.

use rand::Rng;
use serde::Deserialize;

use crate::config::{OperationConfig, OutputSchema};
use crate::gateway::StructuredGateway;

use super::synth::{SynthKind, Synthesizer};
use super::{analysis_call, OptimizeError};

#[derive(Debug, Clone, Deserialize)]
pub struct ContextNeeds {
    pub needs_peripherals: bool,
    pub previous_context: bool,
    pub next_context: bool,
    pub needs_document_head: bool,
    pub needs_document_tail: bool,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct MetadataNeeds {
    pub needs_metadata: bool,
    pub reason: String,
    /// Present only when metadata is needed: a template over the split key.
    pub metadata_prompt: Option<String>,
    pub output_schema: Option<OutputSchema>,
}

#[derive(Deserialize)]
struct NecessityPayload {
    needs_metadata: bool,
    reason: String,
}

/// Uniform window start for context analysis, clamped so the window fits.
pub fn context_window_start<R: Rng + ?Sized>(
    total_words: usize,
    chunk_size: usize,
    rng: &mut R,
) -> usize {
    let max_start = total_words.saturating_sub(chunk_size);
    rng.gen_range(0..=max_start)
}

/// Window start for metadata analysis: skew away from the document head
/// (start at least `chunk_size` in) when the document is long enough.
pub fn metadata_window_start<R: Rng + ?Sized>(
    total_words: usize,
    chunk_size: usize,
    rng: &mut R,
) -> usize {
    let max_start = total_words.saturating_sub(chunk_size);
    if max_start > chunk_size {
        rng.gen_range(chunk_size..=max_start)
    } else {
        0
    }
}

pub struct DocumentWindow {
    pub chunk: String,
    pub words_before: usize,
    pub words_after: usize,
}

/// Cut a `chunk_size`-word window out of `text` at `start`.
pub fn window_at(text: &str, start: usize, chunk_size: usize) -> DocumentWindow {
    let words: Vec<&str> = text.split_whitespace().collect();
    let end = (start + chunk_size).min(words.len());
    let start = start.min(words.len());
    DocumentWindow {
        chunk: words[start..end].join(" "),
        words_before: start,
        words_after: words.len() - end,
    }
}

/// Judge whether chunks of `chunk_size` words need peripheral context to be
/// processed faithfully.
pub async fn analyze_context(
    gateway: &dyn StructuredGateway,
    model: &str,
    subprompt: &str,
    chunk_size: usize,
    window: &DocumentWindow,
) -> Result<ContextNeeds, OptimizeError> {
    let system = "You are an AI assistant tasked with determining context needs for \
                  document chunk processing.";

    let user = format!(
        "Given the following subtask prompt:\n{subprompt}\n\n\
         And a chunk size of {chunk_size} words, analyze if peripheral chunks or context \
         is necessary.\n\n\
         Here's a random chunk of {chunk_size} words from the input:\n\"{chunk}\"\n\n\
         Number of words before the chunk: {before}\n\
         Number of words after the chunk: {after}\n\n\
         Consider:\n\
         1. Is this chunk sufficient to perform the specific subtask, or are there \
         ambiguous pronouns/phrases that are relevant to the subtask and require \
         peripheral chunks/context for clarity?\n\
         2. If peripherals are necessary, do you need previous context, next context, or \
         both?\n\
         3. Do you need the head/tail of the entire document as well?\n\n\
         Provide your response in the following format:",
        chunk = window.chunk,
        before = window.words_before,
        after = window.words_after,
    );

    let schema = serde_json::json!({
        "type": "object",
        "properties": {
            "needs_peripherals": {"type": "boolean"},
            "previous_context": {"type": "boolean"},
            "next_context": {"type": "boolean"},
            "needs_document_head": {"type": "boolean"},
            "needs_document_tail": {"type": "boolean"},
            "reason": {"type": "string"},
        },
        "required": [
            "needs_peripherals",
            "previous_context",
            "next_context",
            "needs_document_head",
            "needs_document_tail",
            "reason",
        ],
    });

    analysis_call(gateway, model, system, user, schema).await
}

/// Judge whether document-level metadata would materially help the subtask;
/// when it would, synthesize (and validate) the extraction prompt.
#[allow(clippy::too_many_arguments)]
pub async fn analyze_metadata(
    gateway: &dyn StructuredGateway,
    synth: &Synthesizer<'_>,
    model: &str,
    op: &OperationConfig,
    subprompt: &str,
    chunk_size: usize,
    split_key: &str,
    window: &DocumentWindow,
    full_sample: &crate::sample::Record,
) -> Result<MetadataNeeds, OptimizeError> {
    let necessity =
        check_metadata_necessity(gateway, model, subprompt, chunk_size, window, full_sample)
            .await?;
    if !necessity.needs_metadata {
        return Ok(MetadataNeeds {
            needs_metadata: false,
            reason: necessity.reason,
            metadata_prompt: None,
            output_schema: None,
        });
    }

    let full_text = full_sample
        .get(split_key)
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let (metadata_prompt, output_schema) =
        synthesize_metadata_prompt(synth, op, subprompt, chunk_size, split_key, full_text).await?;

    Ok(MetadataNeeds {
        needs_metadata: true,
        reason: necessity.reason,
        metadata_prompt: Some(metadata_prompt),
        output_schema: Some(output_schema),
    })
}

async fn check_metadata_necessity(
    gateway: &dyn StructuredGateway,
    model: &str,
    subprompt: &str,
    chunk_size: usize,
    window: &DocumentWindow,
    full_sample: &crate::sample::Record,
) -> Result<NecessityPayload, OptimizeError> {
    let system = "You are an AI assistant tasked with determining if metadata is needed for \
                  document processing.";

    let full = serde_json::to_string_pretty(full_sample)
        .unwrap_or_else(|_| "{}".to_string());
    let user = format!(
        "Given the following subtask prompt:\n{subprompt}\n\n\
         And a chunk size of {chunk_size} words, analyze if metadata (e.g., headers) is \
         needed to perform the subtask.\n\n\
         Here's a random sample chunk of {chunk_size} words from the input:\n\
         \"{chunk}\"\n\n\
         There are {before} words before this chunk and {after} words after this chunk in \
         the full text.\n\n\
         Full input sample:\n{full}\n\n\
         Determine if metadata is needed to perform the subtask.\n\n\
         Consider:\n\
         1. Does the subtask require information that might be present in metadata?\n\
         2. Is the sample chunk or full input missing any crucial information that could \
         be in metadata?\n\
         3. Would having metadata significantly improve the performance or accuracy of \
         the subtask?\n\n\
         Provide your response in the following format:",
        chunk = window.chunk,
        before = window.words_before,
        after = window.words_after,
    );

    let schema = serde_json::json!({
        "type": "object",
        "properties": {
            "needs_metadata": {"type": "boolean"},
            "reason": {"type": "string"},
        },
        "required": ["needs_metadata", "reason"],
    });

    analysis_call(gateway, model, system, user, schema).await
}

async fn synthesize_metadata_prompt(
    synth: &Synthesizer<'_>,
    op: &OperationConfig,
    subprompt: &str,
    chunk_size: usize,
    split_key: &str,
    full_text: &str,
) -> Result<(String, OutputSchema), OptimizeError> {
    let system = "You are an AI assistant tasked with creating metadata extraction prompts \
                  for document processing.";

    let base_prompt = format!(
        "Given the following subtask prompt:\n{subprompt}\n\n\
         And a chunk size of {chunk_size} words, create a prompt to extract metadata from \
         each document/input.\n\n\
         Full input sample:\n{full_text}\n\n\
         Provide a prompt to extract this metadata from each document/input.\n\n\
         Note: The metadata prompt should be a Jinja template that is only allowed to use \
         the split_key variable like {{{{ input.{split_key} }}}} and nothing else.\n\n\
         Also, provide an output schema for the metadata, which should be a dictionary \
         mapping keys to their respective types.\n\n\
         Provide your response in the following format:"
    );

    let schema = serde_json::json!({
        "type": "object",
        "properties": {
            "metadata_prompt": {"type": "string"},
            "output_schema": {
                "type": "object",
                "additionalProperties": {
                    "type": "string",
                    "enum": ["string", "integer", "number", "boolean", "array"],
                },
            },
        },
        "required": ["metadata_prompt", "output_schema"],
    });

    let payload = synth
        .synthesize(&SynthKind::Metadata, op, system, base_prompt, schema)
        .await?;
    let metadata_prompt = payload["metadata_prompt"]
        .as_str()
        .ok_or_else(|| OptimizeError::BadPayload("missing metadata_prompt".into()))?
        .to_string();
    let output_schema: OutputSchema = serde_json::from_value(payload["output_schema"].clone())
        .map_err(|e| OptimizeError::BadPayload(format!("output_schema: {e}")))?;
    Ok((metadata_prompt, output_schema))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_context_window_start_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let start = context_window_start(100, 30, &mut rng);
            assert!(start <= 70);
        }
        // Window larger than the document clamps to zero.
        assert_eq!(context_window_start(10, 30, &mut rng), 0);
    }

    #[test]
    fn test_metadata_window_start_skips_head_when_long() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let start = metadata_window_start(500, 100, &mut rng);
            assert!((100..=400).contains(&start));
        }
        // Short document: start pinned to zero.
        assert_eq!(metadata_window_start(150, 100, &mut rng), 0);
    }

    #[test]
    fn test_window_at_counts_surroundings() {
        let text = (1..=20).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let window = window_at(&text, 5, 10);
        assert_eq!(window.words_before, 5);
        assert_eq!(window.words_after, 5);
        assert!(window.chunk.starts_with("w6"));
        assert!(window.chunk.ends_with("w15"));

        let tail = window_at(&text, 18, 10);
        assert_eq!(tail.words_after, 0);
        assert_eq!(tail.chunk, "w19 w20");
    }
}
