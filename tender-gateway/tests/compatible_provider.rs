//! HTTP-level tests for the OpenAI-compatible provider.

use std::time::Duration;
use tender_gateway::{ChatRequest, CompatibleProvider, Provider, ProviderErrorKind};
use wiremock::matchers::{bearer_token, body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider(server: &MockServer) -> CompatibleProvider {
    CompatibleProvider::new("groq", &server.uri(), Some("gsk-test"), Duration::from_secs(5))
}

#[tokio::test]
async fn chat_parses_first_choice_and_usage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(bearer_token("gsk-test"))
        .and(body_partial_json(serde_json::json!({
            "model": "llama-3.3-70b-versatile",
            "max_tokens": 500
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [
                { "message": { "role": "assistant", "content": "Résumé du marché" }, "finish_reason": "stop" }
            ],
            "usage": { "prompt_tokens": 120, "completion_tokens": 30, "total_tokens": 150 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = provider(&server)
        .chat(ChatRequest::user("llama-3.3-70b-versatile", "Résume").with_max_tokens(500))
        .await
        .unwrap();

    assert_eq!(response.content, "Résumé du marché");
    assert_eq!(response.usage.total_tokens, 150);
    assert_eq!(response.finish_reason.as_deref(), Some("stop"));
}

#[tokio::test]
async fn status_429_maps_to_rate_limited() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("Too Many Requests"))
        .mount(&server)
        .await;

    let err = provider(&server)
        .chat(ChatRequest::user("m", "x"))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ProviderErrorKind::RateLimited);
    assert_eq!(err.status_code, Some(429));
}

#[tokio::test]
async fn server_error_maps_to_api() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
        .mount(&server)
        .await;

    let err = provider(&server)
        .chat(ChatRequest::user("m", "x"))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ProviderErrorKind::Api);
    assert!(err.message.contains("internal"));
}

#[tokio::test]
async fn empty_choices_is_invalid_response() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "choices": [] })))
        .mount(&server)
        .await;

    let err = provider(&server)
        .chat(ChatRequest::user("m", "x"))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ProviderErrorKind::InvalidResponse);
}

#[tokio::test]
async fn unreachable_host_is_transport() {
    let provider = CompatibleProvider::new(
        "groq",
        "http://127.0.0.1:9",
        Some("key"),
        Duration::from_secs(2),
    );

    let err = provider
        .chat(ChatRequest::user("m", "x"))
        .await
        .unwrap_err();

    assert_eq!(err.kind, ProviderErrorKind::Transport);
}
