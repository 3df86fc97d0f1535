//! End-to-end optimizer runs against a scripted gateway and a recording
//! executor. The gateway answers each analysis call by matching on its user
//! prompt, so whole optimization paths (keep, rewrite, decompose) run without
//! a network.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use lapidary::config::{OpType, OperationConfig, OperationRef, PipelineConfig};
use lapidary::events::{ProgressEvent, VecSink};
use lapidary::gateway::{ProviderError, StructuredGateway, StructuredRequest, StructuredResponse};
use lapidary::ops::{ExecutionService, OpError};
use lapidary::optimize::{OptimizeOptions, Optimizer};
use lapidary::sample::Record;

// =============================================================================
// HARNESS
// =============================================================================

type Rule = (&'static str, serde_json::Value);

/// Answers each structured call by substring-matching the latest user turn.
struct ScriptedGateway {
    rules: Vec<Rule>,
    unmatched: Mutex<Vec<String>>,
}

impl ScriptedGateway {
    fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules,
            unmatched: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl StructuredGateway for ScriptedGateway {
    async fn complete(&self, req: StructuredRequest) -> Result<StructuredResponse, ProviderError> {
        let user = req
            .turns
            .iter()
            .rev()
            .find(|m| m.role == lapidary::gateway::Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        for (needle, payload) in &self.rules {
            if user.contains(needle) {
                return Ok(StructuredResponse {
                    payload: payload.clone(),
                    input_tokens: 10,
                    output_tokens: 10,
                    cost_nanodollars: 100,
                    latency: Duration::from_millis(1),
                });
            }
        }
        self.unmatched.lock().unwrap().push(user.clone());
        Err(ProviderError::config(format!(
            "no scripted response for: {}",
            &user[..user.len().min(80)]
        )))
    }
}

/// Passes records through untouched and records what it ran.
struct RecordingExecutor {
    ran: Mutex<Vec<String>>,
    fail_ops: Vec<&'static str>,
}

impl RecordingExecutor {
    fn new() -> Self {
        Self {
            ran: Mutex::new(Vec::new()),
            fail_ops: Vec::new(),
        }
    }

    fn failing(fail_ops: Vec<&'static str>) -> Self {
        Self {
            ran: Mutex::new(Vec::new()),
            fail_ops,
        }
    }

    fn ran(&self) -> Vec<String> {
        self.ran.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionService for RecordingExecutor {
    async fn execute(
        &self,
        config: &OperationConfig,
        records: Vec<Record>,
    ) -> Result<(Vec<Record>, i64), OpError> {
        self.ran.lock().unwrap().push(config.name.clone());
        if self.fail_ops.contains(&config.name.as_str()) {
            return Err(OpError::InvalidConfig {
                name: config.name.clone(),
                message: "scripted failure".into(),
            });
        }
        Ok((records, 42))
    }
}

fn document_text() -> String {
    (1..=400)
        .map(|i| format!("word{i}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A one-step pipeline with a single summarize map over a file dataset.
fn pipeline(dir: &tempfile::TempDir) -> PipelineConfig {
    let data_path = dir.path().join("docs.json");
    let records: Vec<serde_json::Value> = (0..5)
        .map(|i| json!({"id": i, "text": document_text()}))
        .collect();
    std::fs::write(&data_path, serde_json::to_string(&records).unwrap()).unwrap();

    let yaml = format!(
        r#"
datasets:
  docs:
    type: file
    path: {}
default_model: openai/gpt-4o-mini
operations:
  summarize:
    type: map
    prompt: "Summarize {{{{ input.text }}}}"
    output:
      schema:
        summary: string
pipeline:
  steps:
    - name: analyze
      input: docs
      operations:
        - summarize
"#,
        data_path.display()
    );
    PipelineConfig::from_yaml(&yaml).unwrap()
}

fn options() -> OptimizeOptions {
    OptimizeOptions {
        sample_size: 3,
        max_threads: 2,
        model: "openai/gpt-4o".into(),
    }
}

fn assessment_rules(needs_improvement: bool) -> Vec<Rule> {
    vec![
        (
            "create a custom validator prompt",
            json!({"validator_prompt": "Check the summaries for completeness."}),
        ),
        (
            "assess the operation's performance",
            json!({
                "needs_improvement": needs_improvement,
                "reasons": ["loses detail on long inputs"],
                "suggested_improvements": ["process smaller pieces"],
            }),
        ),
    ]
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[tokio::test]
async fn acceptable_operation_is_kept_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let config = pipeline(&dir);
    let gateway = Arc::new(ScriptedGateway::new(assessment_rules(false)));
    let executor = Arc::new(RecordingExecutor::new());
    let events = Arc::new(VecSink::new());

    let optimizer = Optimizer::new(
        config,
        gateway,
        executor.clone(),
        events.clone(),
        options(),
    );
    let optimized = optimizer.optimize().await.unwrap();

    assert_eq!(optimized.operations.len(), 1);
    let kept = &optimized.operations["summarize"];
    assert_eq!(kept.prompt.as_deref(), Some("Summarize {{ input.text }}"));

    // Executed once for assessment; the cached output advances the sample.
    assert_eq!(executor.ran(), vec!["summarize"]);
    assert!(events
        .events()
        .iter()
        .any(|e| matches!(e, ProgressEvent::OperationKept { operation } if operation == "summarize")));
}

#[tokio::test]
async fn rewrite_path_replaces_only_the_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let config = pipeline(&dir);

    let mut rules = assessment_rules(true);
    rules.push((
        "determine if we should split",
        json!({"should_split": false, "reason": "prompt quality, not length"}),
    ));
    rules.push((
        "Improve the current prompt",
        json!({"new_prompt": "Write a thorough summary of {{ input.text }}"}),
    ));

    let gateway = Arc::new(ScriptedGateway::new(rules));
    let executor = Arc::new(RecordingExecutor::new());
    let events = Arc::new(VecSink::new());

    let optimizer = Optimizer::new(
        config,
        gateway,
        executor.clone(),
        events.clone(),
        options(),
    );
    let optimized = optimizer.optimize().await.unwrap();

    let rewritten = &optimized.operations["summarize"];
    assert_eq!(
        rewritten.prompt.as_deref(),
        Some("Write a thorough summary of {{ input.text }}")
    );
    assert_eq!(rewritten.op_type, OpType::Map);
    assert_eq!(rewritten.output, pipeline(&dir).operations["summarize"].output);

    assert!(events
        .events()
        .iter()
        .any(|e| matches!(e, ProgressEvent::PromptRewritten { .. })));
}

#[tokio::test]
async fn rewrite_retries_when_new_variables_are_introduced() {
    let dir = tempfile::tempdir().unwrap();
    let config = pipeline(&dir);

    // First draft smuggles in input.title; scripted conversations grow a
    // feedback turn, which matches the retry rule instead.
    let mut rules = assessment_rules(true);
    rules.push((
        "determine if we should split",
        json!({"should_split": false, "reason": "prompt quality"}),
    ));
    rules.push((
        "The previous attempt failed",
        json!({"new_prompt": "Summarize only {{ input.text }}"}),
    ));
    rules.push((
        "Improve the current prompt",
        json!({"new_prompt": "Summarize {{ input.title }} and {{ input.text }}"}),
    ));

    let gateway = Arc::new(ScriptedGateway::new(rules));
    let executor = Arc::new(RecordingExecutor::new());
    let events = Arc::new(VecSink::new());

    let optimizer = Optimizer::new(
        config,
        gateway,
        executor.clone(),
        events.clone(),
        options(),
    );
    let optimized = optimizer.optimize().await.unwrap();

    assert_eq!(
        optimized.operations["summarize"].prompt.as_deref(),
        Some("Summarize only {{ input.text }}")
    );
    let rejections: Vec<_> = events
        .events()
        .into_iter()
        .filter(|e| matches!(e, ProgressEvent::TemplateRejected { .. }))
        .collect();
    assert_eq!(rejections.len(), 1);
}

fn split_rules() -> Vec<Rule> {
    let mut rules = assessment_rules(true);
    rules.push((
        "determine if we should split",
        json!({"should_split": true, "reason": "documents exceed what one prompt handles"}),
    ));
    rules.push((
        "Determine the split key and subprompt",
        json!({
            "split_key": "input.text",
            "subprompt": "Summarize this portion: {{ input.text_chunk }}",
        }),
    ));
    // All 8 probes mark the same verbatim span: word11 .. word30 = 20 words.
    rules.push((
        "Identify a small, cohesive chunk",
        json!({"start_words": "word11 word12", "end_words": "word29 word30", "num_words": 20}),
    ));
    rules.push((
        "analyze if peripheral chunks or context is necessary",
        json!({
            "needs_peripherals": true,
            "previous_context": true,
            "next_context": false,
            "needs_document_head": false,
            "needs_document_tail": false,
            "reason": "pronouns refer backwards",
        }),
    ));
    rules.push((
        "analyze if metadata (e.g., headers) is needed",
        json!({"needs_metadata": false, "reason": "plain prose, no headers"}),
    ));
    rules.push((
        "combine the results of these subtasks",
        json!({"combine_prompt": "Merge: {% for v in values %}{{ v.summary }} {% endfor %}"}),
    ));
    rules
}

#[tokio::test]
async fn split_path_emits_the_decomposed_chain() {
    let dir = tempfile::tempdir().unwrap();
    let config = pipeline(&dir);
    let gateway = Arc::new(ScriptedGateway::new(split_rules()));
    let executor = Arc::new(RecordingExecutor::new());
    let events = Arc::new(VecSink::new());

    let optimizer = Optimizer::new(
        config,
        gateway.clone(),
        executor.clone(),
        events.clone(),
        options(),
    );
    let optimized = optimizer.optimize().await.unwrap();
    assert!(gateway.unmatched.lock().unwrap().is_empty());

    // Chain order in the rewritten step.
    let step_ops: Vec<&str> = optimized.pipeline.steps[0]
        .operations
        .iter()
        .map(|r| match r {
            OperationRef::Name(name) => name.as_str(),
            OperationRef::Inline(_) => panic!("expected bare names"),
        })
        .collect();
    assert_eq!(
        step_ops,
        vec!["split_summarize", "submap_summarize", "subreduce_summarize"]
    );

    let split = &optimized.operations["split_summarize"];
    assert_eq!(split.op_type, OpType::Split);
    assert_eq!(split.split_key.as_deref(), Some("text"));
    // Every probe found a 20-word chunk, so max = 20 and the split gets
    // round(20 * 1.5) = 30.
    assert_eq!(split.chunk_size, Some(30));
    let peripheral = split.peripheral_chunks.as_ref().unwrap();
    assert!(peripheral.previous.is_some());
    assert!(peripheral.next.is_none());

    let submap = &optimized.operations["submap_summarize"];
    assert_eq!(
        submap.prompt.as_deref(),
        Some("Summarize this portion: {{ input.text_chunk }}")
    );
    assert_eq!(submap.output, optimized.operations["subreduce_summarize"].output);

    let subreduce = &optimized.operations["subreduce_summarize"];
    assert_eq!(subreduce.op_type, OpType::Reduce);
    assert_eq!(subreduce.reduce_key.as_deref(), Some("document_id"));

    // Sample advanced through the first emitted operation only.
    assert_eq!(executor.ran(), vec!["summarize", "split_summarize"]);

    // The decision stream covers the whole analysis.
    let events = events.events();
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::SplitDecisionMade { decision, .. } if decision.should_split)));
    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::ChunkSizesIdentified { probe_sizes, estimate, .. }
            if probe_sizes.len() == 8 && estimate.max_chunk_size == 20
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::ContextNeedsIdentified { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::MetadataNeedsIdentified { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::CombinePromptReady { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::OperationDecomposed { emitted, .. } if emitted.len() == 3
    )));
}

#[tokio::test]
async fn split_path_includes_metadata_extraction_when_needed() {
    let dir = tempfile::tempdir().unwrap();
    let config = pipeline(&dir);

    let mut rules = split_rules();
    // Override the metadata rules: necessity says yes, then the synthesized
    // extraction prompt validates against the declared schema.
    rules.retain(|(needle, _)| !needle.starts_with("analyze if metadata"));
    rules.insert(
        0,
        (
            "analyze if metadata (e.g., headers) is needed",
            json!({"needs_metadata": true, "reason": "section headers carry the topic"}),
        ),
    );
    rules.insert(
        0,
        (
            "create a prompt to extract metadata",
            json!({
                "metadata_prompt": "List the section headers of {{ input.text }}",
                "output_schema": {"headers": "array"},
            }),
        ),
    );

    let gateway = Arc::new(ScriptedGateway::new(rules));
    let executor = Arc::new(RecordingExecutor::new());
    let events = Arc::new(VecSink::new());

    let optimizer = Optimizer::new(
        config,
        gateway,
        executor.clone(),
        events,
        options(),
    );
    let optimized = optimizer.optimize().await.unwrap();

    let step_ops: Vec<&str> = optimized.pipeline.steps[0]
        .operations
        .iter()
        .filter_map(|r| match r {
            OperationRef::Name(name) => Some(name.as_str()),
            OperationRef::Inline(_) => None,
        })
        .collect();
    assert_eq!(
        step_ops,
        vec![
            "extract_metadata_summarize",
            "split_summarize",
            "submap_summarize",
            "subreduce_summarize"
        ]
    );

    let metadata = &optimized.operations["extract_metadata_summarize"];
    assert_eq!(metadata.op_type, OpType::Map);
    assert_eq!(
        metadata.prompt.as_deref(),
        Some("List the section headers of {{ input.text }}")
    );
    assert_eq!(metadata.model.as_deref(), Some("openai/gpt-4o-mini"));

    // The sample advances through the metadata map, the first of the chain.
    assert_eq!(executor.ran(), vec!["summarize", "extract_metadata_summarize"]);
}

#[tokio::test]
async fn execution_failure_keeps_operation_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let config = pipeline(&dir);
    // No analysis rules needed: assessment never runs.
    let gateway = Arc::new(ScriptedGateway::new(Vec::new()));
    let executor = Arc::new(RecordingExecutor::failing(vec!["summarize"]));
    let events = Arc::new(VecSink::new());

    let optimizer = Optimizer::new(
        config,
        gateway,
        executor,
        events.clone(),
        options(),
    );
    let optimized = optimizer.optimize().await.unwrap();

    assert_eq!(optimized.operations.len(), 1);
    assert!(optimized.operations.contains_key("summarize"));
    assert!(events
        .events()
        .iter()
        .any(|e| matches!(e, ProgressEvent::ExecutionFailed { .. })));
}

#[tokio::test]
async fn failed_probes_keep_operation_and_report_analysis_failure() {
    let dir = tempfile::tempdir().unwrap();
    let config = pipeline(&dir);

    let mut rules = assessment_rules(true);
    rules.push((
        "determine if we should split",
        json!({"should_split": true, "reason": "too long"}),
    ));
    rules.push((
        "Determine the split key and subprompt",
        json!({"split_key": "text", "subprompt": "Handle {{ input.text_chunk }}"}),
    ));
    // Probe markers that never occur verbatim: every probe is discarded.
    rules.push((
        "Identify a small, cohesive chunk",
        json!({"start_words": "NOT IN DOCUMENT", "end_words": "ALSO ABSENT", "num_words": 10}),
    ));

    let gateway = Arc::new(ScriptedGateway::new(rules));
    let executor = Arc::new(RecordingExecutor::new());
    let events = Arc::new(VecSink::new());

    let optimizer = Optimizer::new(
        config,
        gateway,
        executor,
        events.clone(),
        options(),
    );
    let optimized = optimizer.optimize().await.unwrap();

    // Insufficient chunk signal is recovered per operation.
    assert!(optimized.operations.contains_key("summarize"));
    assert!(events
        .events()
        .iter()
        .any(|e| matches!(e, ProgressEvent::AnalysisFailed { .. })));
}

#[tokio::test]
async fn optimized_config_round_trips_through_yaml() {
    let dir = tempfile::tempdir().unwrap();
    let config = pipeline(&dir);
    let gateway = Arc::new(ScriptedGateway::new(split_rules()));
    let executor = Arc::new(RecordingExecutor::new());
    let events = Arc::new(VecSink::new());

    let out_path = dir.path().join("optimized.yaml");
    let optimizer = Optimizer::new(
        config,
        gateway,
        executor,
        events.clone(),
        options(),
    );
    optimizer.optimize_to_path(&out_path).await.unwrap();

    assert!(events
        .events()
        .iter()
        .any(|e| matches!(e, ProgressEvent::ConfigSaved { .. })));

    let reloaded = PipelineConfig::from_path(&out_path).unwrap();
    assert!(reloaded.operations.contains_key("split_summarize"));
    assert_eq!(
        reloaded.operations["subreduce_summarize"].reduce_key.as_deref(),
        Some("document_id")
    );
    // No YAML anchors or aliases in the persisted document.
    let raw = std::fs::read_to_string(&out_path).unwrap();
    assert!(!raw.contains('&'));
    assert!(!raw.contains('*'));

}
