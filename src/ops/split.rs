//! Split operator: mechanical word-level chunking, no LLM involved.
//!
//! The `split_key` field is whitespace-tokenized and emitted as one record
//! per `chunk_size`-word chunk. Each chunk record carries the source record's
//! fields plus `{split_key}_chunk`, a `document_id` stable across all chunks
//! of one source record, and a 1-based `chunk_id`. When peripheral windows
//! are configured, surrounding document text is rendered into the chunk with
//! elision markers so a downstream prompt sees it in place.

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::config::{OperationConfig, PeripheralChunks, WindowSpec};
use crate::sample::Record;

use super::{OpError, Operator};

const ELISION: &str = "[...]";

pub struct SplitOperator {
    name: String,
    split_key: String,
    chunk_size: usize,
    peripheral: PeripheralChunks,
}

impl SplitOperator {
    pub fn from_config(config: &OperationConfig) -> Result<Self, OpError> {
        let split_key = config
            .split_key
            .clone()
            .ok_or_else(|| OpError::missing_field(config, "split_key"))?;
        let chunk_size = config
            .chunk_size
            .ok_or_else(|| OpError::missing_field(config, "chunk_size"))?;
        if chunk_size == 0 {
            return Err(OpError::InvalidConfig {
                name: config.name.clone(),
                message: "chunk_size must be positive".into(),
            });
        }
        Ok(Self {
            name: config.name.clone(),
            split_key,
            chunk_size,
            peripheral: config.peripheral_chunks.clone().unwrap_or_default(),
        })
    }

    /// Fractional window counts floor to whole words.
    fn window_words(&self, spec: &Option<WindowSpec>) -> usize {
        spec.as_ref()
            .map(|w| (w.count * self.chunk_size as f64).floor() as usize)
            .unwrap_or(0)
    }

    /// Render one chunk with its configured peripheral windows. Ranges are
    /// half-open word indices into the full document.
    fn render_chunk(&self, words: &[&str], start: usize, end: usize) -> String {
        let mut segments: Vec<String> = Vec::new();

        if start > 0 && self.peripheral.previous.is_some() {
            let prev = self.peripheral.previous.clone().unwrap_or_default();
            let head_len = self.window_words(&prev.head).min(start);
            let tail_len = self.window_words(&prev.tail).min(start);
            let tail_start = start - tail_len;

            if head_len > 0 && head_len < tail_start {
                segments.push(words[..head_len].join(" "));
                segments.push(ELISION.to_string());
            } else if head_len >= tail_start {
                // Head window reaches the tail window: one contiguous run.
                segments.push(words[..start].join(" "));
            } else if tail_start > 0 {
                segments.push(ELISION.to_string());
            }
            if head_len < tail_start && tail_len > 0 {
                segments.push(words[tail_start..start].join(" "));
            }
        }

        segments.push(words[start..end].join(" "));

        if end < words.len() && self.peripheral.next.is_some() {
            let next = self.peripheral.next.clone().unwrap_or_default();
            let head_len = self.window_words(&next.head).min(words.len() - end);
            if head_len > 0 {
                segments.push(words[end..end + head_len].join(" "));
            }
            if end + head_len < words.len() {
                segments.push(ELISION.to_string());
            }
        }

        segments.retain(|s| !s.is_empty());
        segments.join(" ")
    }

    fn split_record(&self, record: &Record) -> Result<Vec<Record>, OpError> {
        let text = record
            .get(&self.split_key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| OpError::MissingRecordField {
                name: self.name.clone(),
                field: self.split_key.clone(),
            })?;

        let words: Vec<&str> = text.split_whitespace().collect();
        let document_id = Uuid::new_v4().to_string();
        let chunk_field = format!("{}_chunk", self.split_key);

        let mut out = Vec::new();
        let mut start = 0usize;
        let mut chunk_id = 1u64;
        while start < words.len() {
            let end = (start + self.chunk_size).min(words.len());
            let mut chunk = record.clone();
            chunk.insert(chunk_field.clone(), json!(self.render_chunk(&words, start, end)));
            chunk.insert("document_id".into(), json!(document_id));
            chunk.insert("chunk_id".into(), json!(chunk_id));
            out.push(chunk);
            start = end;
            chunk_id += 1;
        }
        // An empty document still yields one (empty) chunk so downstream
        // operations see the record.
        if out.is_empty() {
            let mut chunk = record.clone();
            chunk.insert(chunk_field, json!(""));
            chunk.insert("document_id".into(), json!(document_id));
            chunk.insert("chunk_id".into(), json!(1));
            out.push(chunk);
        }
        Ok(out)
    }
}

#[async_trait]
impl Operator for SplitOperator {
    async fn execute(&self, records: Vec<Record>) -> Result<(Vec<Record>, i64), OpError> {
        let mut out = Vec::new();
        for record in &records {
            out.extend(self.split_record(record)?);
        }
        Ok((out, 0))
    }
}
