use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pagesmith::gateway::{
    CatalogSource, GatewayErrorKind, GenerationClient, Message, OpenRouterAdapter, PromptPayload,
    ProviderError, SendOptions,
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn adapter(server: &MockServer) -> OpenRouterAdapter {
    OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
        .unwrap()
}

fn payload() -> PromptPayload {
    PromptPayload::new(vec![Message::user("build a page")]).json()
}

#[tokio::test]
async fn openrouter_returns_content_on_success() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "{\"files\": {}}" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 20 }
        })))
        .mount(&server)
        .await;

    let content = adapter(&server)
        .send("vendor/model:free", &payload(), &SendOptions::default())
        .await
        .unwrap();
    assert_eq!(content, "{\"files\": {}}");
}

#[tokio::test]
async fn openrouter_falls_back_to_tool_call_arguments_when_content_empty() {
    let server = MockServer::start().await;
    let args = r#"{"files": {"index.html": "x"}}"#;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{ "function": { "name": "emit", "arguments": args } }]
                },
                "finish_reason": "tool_calls"
            }]
        })))
        .mount(&server)
        .await;

    let content = adapter(&server)
        .send("vendor/model:free", &payload(), &SendOptions::default())
        .await
        .unwrap();
    assert_eq!(content, args);
}

#[tokio::test]
async fn openrouter_429_is_rate_limited_with_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "7")
                .set_body_json(json!({ "error": { "code": 429, "message": "slow down" } })),
        )
        .mount(&server)
        .await;

    let err = adapter(&server)
        .send("vendor/model:free", &payload(), &SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), GatewayErrorKind::RateLimited);
    match err {
        ProviderError::RateLimited { retry_after, .. } => {
            assert_eq!(retry_after, Duration::from_secs(7))
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
}

#[tokio::test]
async fn openrouter_401_is_auth() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({ "error": { "code": 401, "message": "bad key" } })),
        )
        .mount(&server)
        .await;

    let err = adapter(&server)
        .send("vendor/model:free", &payload(), &SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), GatewayErrorKind::Auth);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn openrouter_5xx_is_transport_and_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
        .mount(&server)
        .await;

    let err = adapter(&server)
        .send("vendor/model:free", &payload(), &SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), GatewayErrorKind::Transport);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn openrouter_blank_content_is_empty_response() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "   " }, "finish_reason": "stop" }]
        })))
        .mount(&server)
        .await;

    let err = adapter(&server)
        .send("vendor/model:free", &payload(), &SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), GatewayErrorKind::EmptyResponse);
}

#[tokio::test]
async fn openrouter_error_inside_200_is_classified() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": { "code": 429, "message": "upstream rate limited" }
        })))
        .mount(&server)
        .await;

    let err = adapter(&server)
        .send("vendor/model:free", &payload(), &SendOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), GatewayErrorKind::RateLimited);
}

#[derive(Clone)]
struct SlowResponder {
    calls: Arc<AtomicUsize>,
}

impl Respond for SlowResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ResponseTemplate::new(200)
            .set_delay(Duration::from_millis(500))
            .set_body_json(json!({
                "choices": [{ "message": { "content": "late" }, "finish_reason": "stop" }]
            }))
    }
}

#[tokio::test]
async fn openrouter_per_call_timeout_is_transport() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(SlowResponder {
            calls: calls.clone(),
        })
        .mount(&server)
        .await;

    let options = SendOptions {
        timeout: Duration::from_millis(50),
        ..SendOptions::default()
    };
    let err = adapter(&server)
        .send("vendor/model:free", &payload(), &options)
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Timeout(_)), "got {err:?}");
    assert_eq!(err.kind(), GatewayErrorKind::Transport);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn openrouter_lists_models() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {
                    "id": "meta-llama/llama-3.3-70b-instruct:free",
                    "name": "Llama 3.3 70B (free)",
                    "context_length": 131072,
                    "pricing": { "prompt": "0", "completion": "0" }
                },
                {
                    "id": "openai/gpt-4o",
                    "context_length": 128000,
                    "pricing": { "prompt": "0.0000025", "completion": "0.00001" }
                }
            ]
        })))
        .mount(&server)
        .await;

    let listings = adapter(&server).list_backends().await.unwrap();
    assert_eq!(listings.len(), 2);
    assert_eq!(listings[0].context_length, Some(131_072));
    assert!(pagesmith::gateway::is_free_listing(&listings[0]));
    assert!(!pagesmith::gateway::is_free_listing(&listings[1]));
}
