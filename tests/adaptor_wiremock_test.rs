//! Exercises `Adaptor::do_request` against a simulated upstream, standing
//! in for the real OpenAI/Anthropic HTTP APIs. This is the one seam in
//! the relay pipeline that genuinely crosses the network, so it is the
//! one worth testing with a real HTTP server instead of a mock trait
//! object.

use bytes::Bytes;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relaymux::adaptor::openai::OpenAiAdaptor;
use relaymux::adaptor::Adaptor;
use relaymux::relay::RelayMeta;
use relaymux::types::{ChannelType, RelayMode};

fn meta(base_url: String, mode: RelayMode) -> RelayMeta {
    RelayMeta {
        channel_id: 1,
        channel_type: ChannelType::OpenAI,
        base_url: Some(base_url),
        api_key: "sk-test-key".to_string(),
        region: None,
        api_version: None,
        project_id: None,
        mode,
        requested_model: "gpt-4o-mini".to_string(),
        actual_model: "gpt-4o-mini".to_string(),
        forced_system_prompt: None,
        is_stream: false,
        prompt_tokens: 3,
        request_id: "req-test".to_string(),
    }
}

#[tokio::test]
async fn do_request_hits_chat_completions_with_bearer_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "choices": [{"message": {"role": "assistant", "content": "hi"}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4},
        })))
        .mount(&server)
        .await;

    let adaptor = OpenAiAdaptor::new(ChannelType::OpenAI);
    let client = reqwest::Client::new();
    let meta = meta(server.uri(), RelayMode::ChatCompletions);
    let body = Bytes::from(json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "hi"}]}).to_string());

    let response = adaptor.do_request(&client, &meta, body).await.unwrap();
    assert!(response.status().is_success());

    let payload: serde_json::Value = response.json().await.unwrap();
    let usage = adaptor.extract_usage(&payload).unwrap();
    assert_eq!(usage.total_tokens, 4);
}

#[tokio::test]
async fn do_request_surfaces_upstream_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": {"message": "rate limited", "type": "rate_limit_error"}
        })))
        .mount(&server)
        .await;

    let adaptor = OpenAiAdaptor::new(ChannelType::OpenAI);
    let client = reqwest::Client::new();
    let meta = meta(server.uri(), RelayMode::ChatCompletions);
    let body = Bytes::from(json!({"model": "gpt-4o-mini", "messages": []}).to_string());

    let response = adaptor.do_request(&client, &meta, body).await.unwrap();
    assert_eq!(response.status(), 429);
}
