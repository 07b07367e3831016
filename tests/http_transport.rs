use serde_json::json;
use unistream::config::{AppConfig, ProviderConfig, RetryConfig};
use unistream::protocol::canonical::{Api, ErrorKind, Model, StopReason};
use unistream::{Client, StreamOptions, StreamRequest};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ANTHROPIC_SSE: &str = concat!(
    "event: message_start\n",
    "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"usage\":{\"input_tokens\":9,\"output_tokens\":1}}}\n\n",
    "event: content_block_start\n",
    "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
    "event: content_block_delta\n",
    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello from the wire\"}}\n\n",
    "event: content_block_stop\n",
    "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
    "event: message_delta\n",
    "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":5}}\n\n",
    "event: message_stop\n",
    "data: {\"type\":\"message_stop\"}\n\n",
);

fn config(base_url: String) -> AppConfig {
    AppConfig {
        retry: RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 20,
            jitter_ratio: 0.0,
        },
        providers: vec![ProviderConfig {
            name: "anthropic".into(),
            api: Api::AnthropicMessages,
            base_url,
            api_key: Some("sk-ant-test".into()),
            api_key_env: None,
            api_version: Some("2023-06-01".into()),
            headers: Default::default(),
        }],
        ..AppConfig::default()
    }
}

fn request() -> StreamRequest {
    StreamRequest::new(
        Model::new("claude-sonnet", Api::AnthropicMessages, "anthropic"),
        json!({"model": "claude-sonnet", "stream": true, "messages": []}),
    )
}

#[tokio::test]
async fn test_streams_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-ant-test"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_json(json!({"model": "claude-sonnet", "stream": true, "messages": []})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(ANTHROPIC_SSE),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::new(config(format!("{}/v1", server.uri()))).unwrap();
    let message = client.complete(request(), StreamOptions::default()).await;

    assert_eq!(message.stop_reason, StopReason::Stop);
    assert_eq!(message.text(), "Hello from the wire");
    assert_eq!((message.usage.input, message.usage.output), (9, 5));
}

#[tokio::test]
async fn test_overloaded_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(529).set_body_json(
            json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
        ))
        .up_to_n_times(1)
        .expect(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ANTHROPIC_SSE))
        .expect(1)
        .with_priority(2)
        .mount(&server)
        .await;

    let client = Client::new(config(format!("{}/v1", server.uri()))).unwrap();
    let message = client.complete(request(), StreamOptions::default()).await;
    assert_eq!(message.stop_reason, StopReason::Stop);
}

#[tokio::test]
async fn test_auth_rejection_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_json(
            json!({"type": "error", "error": {"type": "authentication_error", "message": "invalid x-api-key"}}),
        ))
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::new(config(format!("{}/v1", server.uri()))).unwrap();
    let message = client.complete(request(), StreamOptions::default()).await;

    assert_eq!(message.stop_reason, StopReason::Error);
    assert_eq!(message.error_message.as_deref(), Some("invalid x-api-key"));
    let details = message.error_details.unwrap();
    assert_eq!(details.kind, ErrorKind::Authentication);
    assert!(!details.retryable);
}

#[tokio::test]
async fn test_connection_refused_is_transport_error() {
    let server = MockServer::start().await;
    let base_url = format!("{}/v1", server.uri());
    drop(server);

    let client = Client::new(config(base_url)).unwrap();
    let message = client.complete(request(), StreamOptions::default()).await;
    assert_eq!(
        message.error_details.map(|d| d.kind),
        Some(ErrorKind::Transport)
    );
}
