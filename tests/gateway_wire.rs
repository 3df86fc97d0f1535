use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lapidary::gateway::openrouter::{OpenRouterAdapter, StructuredProvider};
use lapidary::gateway::{
    Attribution, ChatModel, GatewayConfig, NoopUsageSink, ProviderError, ProviderGateway,
    StructuredRequest,
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn output_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {"topic": {"type": "string"}},
        "required": ["topic"],
    })
}

fn request() -> StructuredRequest {
    StructuredRequest::single(
        ChatModel::openrouter("openai/gpt-4o"),
        "system prompt",
        "find the topic",
        output_schema(),
        Attribution::new("test"),
    )
}

fn tool_call_body(arguments: &str) -> serde_json::Value {
    json!({
        "choices": [{
            "message": {
                "tool_calls": [{
                    "function": {"name": "write_output", "arguments": arguments}
                }]
            },
            "finish_reason": "tool_calls"
        }],
        "usage": {"prompt_tokens": 12, "completion_tokens": 7}
    })
}

#[tokio::test]
async fn request_carries_forced_write_output_tool() {
    let server = MockServer::start().await;

    struct CaptureBody;
    impl Respond for CaptureBody {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();

            assert_eq!(body["model"], json!("openai/gpt-4o"));
            assert_eq!(body["parallel_tool_calls"], json!(false));
            assert_eq!(
                body["tool_choice"],
                json!({"type": "function", "function": {"name": "write_output"}})
            );

            let tools = body["tools"].as_array().unwrap();
            assert_eq!(tools.len(), 1);
            let function = &tools[0]["function"];
            assert_eq!(function["name"], json!("write_output"));
            assert_eq!(
                function["description"],
                json!("Write output to a database")
            );
            assert_eq!(function["parameters"], output_schema());

            let messages = body["messages"].as_array().unwrap();
            assert_eq!(messages[0]["role"], json!("system"));
            assert_eq!(messages[1]["role"], json!("user"));

            ResponseTemplate::new(200).set_body_json(tool_call_body(r#"{"topic": "birds"}"#))
        }
    }

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(CaptureBody)
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();
    let resp = adapter.complete(&request()).await.unwrap();

    assert_eq!(resp.payload, json!({"topic": "birds"}));
    assert_eq!(resp.input_tokens, 12);
    assert_eq!(resp.output_tokens, 7);
    assert_eq!(
        resp.cost_nanodollars,
        lapidary::gateway::chat_cost("openai/gpt-4o", 12, 7)
    );
}

#[tokio::test]
async fn missing_tool_call_is_malformed_output() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {"content": "plain text answer"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1}
        })))
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();
    let err = adapter.complete(&request()).await.unwrap_err();

    assert!(matches!(err, ProviderError::MalformedOutput { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn invalid_arguments_json_is_malformed_output() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(tool_call_body("not json")))
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();
    let err = adapter.complete(&request()).await.unwrap_err();

    assert!(matches!(err, ProviderError::MalformedOutput { .. }));
}

#[tokio::test]
async fn rate_limit_is_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .set_body_json(json!({"error": {"message": "slow down"}})),
        )
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();
    let err = adapter.complete(&request()).await.unwrap_err();

    assert!(matches!(err, ProviderError::RateLimited { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn provider_gateway_retries_transient_errors() {
    let server = MockServer::start().await;

    struct FlakyOnce {
        calls: Arc<AtomicUsize>,
    }
    impl Respond for FlakyOnce {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(500).set_body_json(json!({"error": {"message": "boom"}}))
            } else {
                ResponseTemplate::new(200).set_body_json(tool_call_body(r#"{"topic": "fish"}"#))
            }
        }
    }

    let calls = Arc::new(AtomicUsize::new(0));
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlakyOnce {
            calls: calls.clone(),
        })
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();
    let gateway = ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 2,
            retry_base_delay: Duration::from_millis(1),
        },
    );

    let resp = gateway.complete(request()).await.unwrap();
    assert_eq!(resp.payload, json!({"topic": "fish"}));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn provider_gateway_does_not_retry_malformed_output() {
    let server = MockServer::start().await;

    let calls = Arc::new(AtomicUsize::new(0));
    struct Count {
        calls: Arc<AtomicUsize>,
    }
    impl Respond for Count {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "no tool call"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 1, "completion_tokens": 1}
            }))
        }
    }

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(Count {
            calls: calls.clone(),
        })
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap();
    let gateway = ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 2,
            retry_base_delay: Duration::from_millis(1),
        },
    );

    let err = gateway.complete(request()).await.unwrap_err();
    assert!(matches!(err, ProviderError::MalformedOutput { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
