//! Chunk-size estimation via independent probes.
//!
//! Each probe shows the model a sampled document and asks for the literal
//! first and last words of one small self-contained chunk. The chunk is
//! located verbatim in the source text and measured in words; probes whose
//! markers cannot be found (or whose call fails) are discarded. Statistics
//! over the surviving probes drive the split configuration.

use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tracing::debug;

use crate::gateway::StructuredGateway;

use super::{analysis_call, OptimizeError};

pub const NUM_PROBES: usize = 8;

const PROBE_SYSTEM_PROMPT: &str =
    "You are an AI assistant helping with processing documents, identifying how to split \
     documents into smaller chunks that can be processed one at a time.";

#[derive(Debug, Clone)]
pub struct ChunkSizeEstimate {
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    pub avg_chunk_size: f64,
    pub reason: String,
}

impl ChunkSizeEstimate {
    /// The chunk size the downstream context/metadata analysis works with.
    pub fn operative_chunk_size(&self) -> usize {
        ((self.min_chunk_size + self.max_chunk_size) as f64 / 2.0).round() as usize
    }

    /// The split operation gets headroom above the largest observed chunk.
    pub fn split_chunk_size(&self) -> usize {
        (self.max_chunk_size as f64 * 1.5).round() as usize
    }
}

#[derive(Deserialize)]
struct ProbePayload {
    start_words: String,
    end_words: String,
    #[allow(dead_code)]
    num_words: u64,
}

/// Aggregate surviving probe sizes. The average excludes one occurrence of
/// the minimum and one of the maximum (a plain mean when there are fewer
/// than three probes). `None` only when `sizes` is empty.
pub fn aggregate_probe_sizes(sizes: &[usize]) -> Option<ChunkSizeEstimate> {
    if sizes.is_empty() {
        return None;
    }

    let mut sorted = sizes.to_vec();
    sorted.sort_unstable();
    let min = sorted[0];
    let max = sorted[sorted.len() - 1];

    let trimmed: &[usize] = if sorted.len() < 3 {
        &sorted
    } else {
        &sorted[1..sorted.len() - 1]
    };
    let avg = trimmed.iter().sum::<usize>() as f64 / trimmed.len() as f64;

    Some(ChunkSizeEstimate {
        min_chunk_size: min,
        max_chunk_size: max,
        avg_chunk_size: avg,
        reason: format!(
            "Based on {} sample chunks, sizes ranging from {} to {} words, with an \
             average of {:.2} words.",
            sizes.len(),
            min,
            max,
            avg
        ),
    })
}

/// Run one probe against a document and measure the identified chunk.
/// Returns `None` when the model's markers are not found verbatim.
async fn probe(
    gateway: &dyn StructuredGateway,
    model: &str,
    subprompt: &str,
    text: &str,
) -> Result<Option<usize>, OptimizeError> {
    let total_words = text.split_whitespace().count();
    let user = format!(
        "Given the following subtask prompt:\n{subprompt}\n\n\
         And a sample input (of {total_words} words):\n{text}\n\n\
         Identify a small, cohesive chunk of text that forms a logical unit and can be \
         understood independently for this task.\n\
         Provide the first few words and last few words of this chunk; preserving the \
         exact formatting/punctuation/etc. so we can programmatically extract them. Also \
         provide an estimate for the number of words in this chunk.\n\n\
         Provide your response in the following format:"
    );
    let schema = serde_json::json!({
        "type": "object",
        "properties": {
            "start_words": {"type": "string"},
            "end_words": {"type": "string"},
            "num_words": {"type": "integer"},
        },
        "required": ["start_words", "end_words", "num_words"],
    });

    let payload: ProbePayload =
        analysis_call(gateway, model, PROBE_SYSTEM_PROMPT, user, schema).await?;
    Ok(measure_chunk(text, &payload.start_words, &payload.end_words))
}

/// Locate the marked chunk (first occurrence of each marker) and count its
/// words. `None` when either marker is absent or the markers are inverted.
fn measure_chunk(text: &str, start_words: &str, end_words: &str) -> Option<usize> {
    let start = text.find(start_words)?;
    let end = text.find(end_words)? + end_words.len();
    if end <= start {
        return None;
    }
    Some(text[start..end].split_whitespace().count())
}

/// Dispatch [`NUM_PROBES`] probes concurrently over pre-drawn document
/// texts and aggregate the survivors. Zero survivors is the insufficient
/// chunk-size signal error.
pub async fn estimate_chunk_sizes(
    gateway: &dyn StructuredGateway,
    model: &str,
    subprompt: &str,
    texts: Vec<String>,
    max_threads: usize,
) -> Result<(Vec<usize>, ChunkSizeEstimate), OptimizeError> {
    let results: Vec<Result<Option<usize>, OptimizeError>> =
        stream::iter(
            texts
                .iter()
                .map(|text| probe(gateway, model, subprompt, text)),
        )
        .buffer_unordered(max_threads.max(1))
        .collect()
        .await;

    // A failed probe is a discarded probe, whatever the failure.
    let sizes: Vec<usize> = results
        .into_iter()
        .filter_map(|r| r.ok().flatten())
        .collect();
    debug!(?sizes, "chunk probes finished");

    let estimate = aggregate_probe_sizes(&sizes).ok_or(OptimizeError::InsufficientChunkSignal)?;
    Ok((sizes, estimate))
}
