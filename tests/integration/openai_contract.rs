//! Wire contract of the streaming chat backend against a mock server.

use std::sync::Arc;

use futures_util::StreamExt;
use parley::EventBus;
use parley::config::{ApiFlavor, LlmConfig};
use parley::llm::{
    ChatBackend, ChatChunk, ChatRequest, GenerationRequest, GenerationStream, LlmError, Message,
    OpenAiChatBackend,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(server: &MockServer) -> LlmConfig {
    LlmConfig {
        base_url: server.uri(),
        api_key: Some("test-key".into()),
        model: "gpt-test".into(),
        retry_backoff_ms: 1,
        ..LlmConfig::default()
    }
}

fn request() -> ChatRequest {
    ChatRequest {
        messages: vec![Message::system("Be brief."), Message::user("Hello")],
        max_tokens: 50,
        temperature: 0.7,
        top_p: 0.95,
        presence_penalty: 0.0,
        frequency_penalty: 0.0,
    }
}

fn delta(text: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({"choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}]})
    )
}

fn sse(fragments: &[&str]) -> ResponseTemplate {
    let mut body: String = fragments.iter().map(|f| delta(f)).collect();
    body.push_str(&format!(
        "data: {}\n\n",
        json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]})
    ));
    body.push_str("data: [DONE]\n\n");
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body)
}

async fn collect(backend: &OpenAiChatBackend) -> Result<Vec<ChatChunk>, LlmError> {
    let mut stream = backend.stream_chat(&request()).await?;
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk?);
    }
    Ok(chunks)
}

#[tokio::test]
async fn openai_request_shape_and_streamed_deltas() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "gpt-test",
            "stream": true,
            "max_tokens": 50,
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "Hello"}
            ]
        })))
        .respond_with(sse(&["Hi", " there"]))
        .expect(1)
        .mount(&server)
        .await;

    let backend = OpenAiChatBackend::new(&config(&server)).unwrap();
    let chunks = collect(&backend).await.unwrap();

    let text: String = chunks.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(text, "Hi there");
    assert_eq!(chunks.last().unwrap().finish_reason.as_deref(), Some("stop"));
}

#[tokio::test]
async fn azure_uses_deployment_path_and_api_key_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/openai/deployments/support-bot/chat/completions"))
        .and(query_param("api-version", "2024-08-01-preview"))
        .and(header("api-key", "test-key"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(sse(&["Hello from Azure"]))
        .expect(1)
        .mount(&server)
        .await;

    let config = LlmConfig {
        flavor: ApiFlavor::Azure,
        model: "support-bot".into(),
        ..config(&server)
    };
    let backend = OpenAiChatBackend::new(&config).unwrap();
    let chunks = collect(&backend).await.unwrap();

    assert_eq!(chunks[0].text, "Hello from Azure");
}

#[tokio::test]
async fn unauthorized_maps_to_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"message": "Invalid API key", "type": "invalid_request_error"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backend = OpenAiChatBackend::new(&config(&server)).unwrap();
    let err = collect(&backend).await.unwrap_err();

    assert!(matches!(err, LlmError::AuthError(_)));
    assert!(err.message().contains("Invalid API key"));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn rate_limit_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let backend = OpenAiChatBackend::new(&config(&server)).unwrap();
    let err = collect(&backend).await.unwrap_err();

    assert!(matches!(err, LlmError::RequestError(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn generation_retries_a_server_error_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(sse(&["Recovered", "."]))
        .expect(1)
        .mount(&server)
        .await;

    let config = config(&server);
    let backend = Arc::new(OpenAiChatBackend::new(&config).unwrap());
    let generation = GenerationStream::new(EventBus::default(), backend, config);
    let result = generation
        .generate(GenerationRequest::new(vec![Message::user("Hello")]))
        .await
        .unwrap();

    assert_eq!(result.content, "Recovered.");
    assert_eq!(result.tokens_generated, 2);
    assert!(!result.was_cancelled);
}

#[tokio::test]
async fn generation_does_not_retry_bad_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .expect(1)
        .mount(&server)
        .await;

    let config = config(&server);
    let backend = Arc::new(OpenAiChatBackend::new(&config).unwrap());
    let generation = GenerationStream::new(EventBus::default(), backend, config);
    let err = generation
        .generate(GenerationRequest::new(vec![Message::user("Hello")]))
        .await
        .unwrap_err();

    assert!(matches!(err, LlmError::AuthError(_)));
}
