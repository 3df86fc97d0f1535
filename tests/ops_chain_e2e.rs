//! Runs a decomposed split/submap/subreduce chain through the real operator
//! executor against a wiremock gateway, checking that chunks flow through
//! `document_id` back into one record per source document.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use lapidary::config::{OpType, OperationConfig, OutputSpec, SchemaType};
use lapidary::gateway::openrouter::OpenRouterAdapter;
use lapidary::gateway::{GatewayConfig, NoopUsageSink, ProviderGateway};
use lapidary::ops::{ExecutionService, OperatorDeps, OperatorExecutor};
use lapidary::sample::Record;

/// Answers every structured call with a payload echoing how many words the
/// user turn carried, so chunk-level calls are distinguishable.
struct EchoSummarizer;

impl Respond for EchoSummarizer {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        let user = body["messages"]
            .as_array()
            .and_then(|m| m.last())
            .and_then(|m| m["content"].as_str())
            .unwrap_or("");
        let arguments = json!({"summary": format!("summary of {} words", user.split_whitespace().count())});
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "tool_calls": [{
                        "function": {
                            "name": "write_output",
                            "arguments": arguments.to_string(),
                        }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 5}
        }))
    }
}

fn schema() -> OutputSpec {
    let mut schema = std::collections::BTreeMap::new();
    schema.insert("summary".to_string(), SchemaType::String);
    OutputSpec { schema }
}

fn split_config() -> OperationConfig {
    let mut op = OperationConfig::new("split_summarize", OpType::Split);
    op.split_key = Some("text".into());
    op.chunk_size = Some(10);
    op
}

fn submap_config() -> OperationConfig {
    let mut op = OperationConfig::new("submap_summarize", OpType::Map);
    op.prompt = Some("Summarize this portion: {{ input.text_chunk }}".into());
    op.output = Some(schema());
    op
}

fn subreduce_config() -> OperationConfig {
    let mut op = OperationConfig::new("subreduce_summarize", OpType::Reduce);
    op.prompt = Some("Merge: {% for v in values %}{{ v.summary }}; {% endfor %}".into());
    op.reduce_key = Some("document_id".into());
    op.output = Some(schema());
    op
}

fn document(words: usize) -> Record {
    let text = (1..=words)
        .map(|i| format!("w{i}"))
        .collect::<Vec<_>>()
        .join(" ");
    let mut record = Record::new();
    record.insert("text".into(), json!(text));
    record
}

#[tokio::test]
async fn chain_recombines_chunks_per_source_document() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(EchoSummarizer)
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();
    let gateway = Arc::new(ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        GatewayConfig::default(),
    ));
    let executor = OperatorExecutor::new(OperatorDeps {
        gateway,
        default_model: "openai/gpt-4o-mini".into(),
        max_threads: 4,
    });

    // Two documents: 25 words -> 3 chunks, 8 words -> 1 chunk.
    let records = vec![document(25), document(8)];

    let (chunks, split_cost) = executor
        .execute(&split_config(), records)
        .await
        .unwrap();
    assert_eq!(split_cost, 0);
    assert_eq!(chunks.len(), 4);
    assert!(chunks.iter().all(|c| c.contains_key("document_id")));

    let (mapped, map_cost) = executor.execute(&submap_config(), chunks).await.unwrap();
    assert!(map_cost > 0);
    assert_eq!(mapped.len(), 4);
    assert!(mapped.iter().all(|m| m["summary"].is_string()));

    let (reduced, _) = executor.execute(&subreduce_config(), mapped).await.unwrap();
    assert_eq!(reduced.len(), 2);
    // Groups keep first-seen order, so the 3-chunk document comes first.
    let first = reduced[0]["summary"].as_str().unwrap();
    assert!(first.starts_with("summary of"));
    assert!(reduced[0].contains_key("document_id"));
    assert_ne!(reduced[0]["document_id"], reduced[1]["document_id"]);
}
