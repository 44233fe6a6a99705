//! Anthropic Messages API adaptor. Anthropic's wire format diverges from
//! OpenAI's on three points this adaptor bridges: the endpoint is
//! `/v1/messages` not `/v1/chat/completions`, auth is `x-api-key` plus an
//! `anthropic-version` header rather than a bearer token, and a system
//! prompt is a top-level `system` field rather than a `role: "system"`
//! message.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::Result;
use crate::relay::{RelayMeta, Usage};

use super::Adaptor;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicAdaptor;

#[async_trait]
impl Adaptor for AnthropicAdaptor {
    fn channel_name(&self) -> &'static str {
        "anthropic"
    }

    fn get_request_url(&self, meta: &RelayMeta) -> Result<String> {
        let base = meta.base_url.as_deref().unwrap_or("https://api.anthropic.com");
        Ok(format!("{base}/v1/messages"))
    }

    fn setup_request_headers(
        &self,
        meta: &RelayMeta,
        builder: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", &meta.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    fn convert_request(&self, meta: &RelayMeta, body: Value) -> Result<Value> {
        let messages = body.get("messages").and_then(Value::as_array).cloned().unwrap_or_default();

        let mut system_parts: Vec<String> = meta.forced_system_prompt.clone().into_iter().collect();
        let mut converted_messages = Vec::with_capacity(messages.len());
        for message in messages {
            let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
            if role == "system" {
                if let Some(text) = message.get("content").and_then(Value::as_str) {
                    system_parts.push(text.to_string());
                }
                continue;
            }
            converted_messages.push(json!({
                "role": if role == "assistant" { "assistant" } else { "user" },
                "content": message.get("content").cloned().unwrap_or(Value::Null),
            }));
        }

        let mut out = json!({
            "model": meta.actual_model,
            "messages": converted_messages,
            "max_tokens": body.get("max_tokens").and_then(Value::as_u64).unwrap_or(DEFAULT_MAX_TOKENS as u64),
            "stream": meta.is_stream,
        });
        if !system_parts.is_empty() {
            out["system"] = Value::String(system_parts.join("\n\n"));
        }
        if let Some(temp) = body.get("temperature") {
            out["temperature"] = temp.clone();
        }
        Ok(out)
    }

    fn extract_usage(&self, body: &Value) -> Option<Usage> {
        let usage = body.get("usage")?;
        let input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0) as u32;
        let output = usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0) as u32;
        Some(Usage {
            prompt_tokens: input,
            completion_tokens: output,
            total_tokens: input + output,
        })
    }

    fn extract_completion_text(&self, body: &Value) -> String {
        body.get("content")
            .and_then(Value::as_array)
            .and_then(|parts| parts.first())
            .and_then(|part| part.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelType, RelayMode};

    fn meta() -> RelayMeta {
        RelayMeta {
            channel_id: 1,
            channel_type: ChannelType::Anthropic,
            base_url: None,
            api_key: "sk-ant-test".to_string(),
            region: None,
            api_version: None,
            project_id: None,
            mode: RelayMode::ChatCompletions,
            requested_model: "claude-3-5-sonnet".to_string(),
            actual_model: "claude-3-5-sonnet".to_string(),
            forced_system_prompt: None,
            is_stream: false,
            prompt_tokens: 0,
            request_id: "req-1".to_string(),
        }
    }

    #[test]
    fn hoists_system_message_out_of_the_array() {
        let adaptor = AnthropicAdaptor;
        let body = json!({
            "model": "claude-3-5-sonnet",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"},
            ],
        });
        let converted = adaptor.convert_request(&meta(), body).unwrap();
        assert_eq!(converted["system"], "be terse");
        assert_eq!(converted["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn forced_system_prompt_is_prepended() {
        let adaptor = AnthropicAdaptor;
        let mut m = meta();
        m.forced_system_prompt = Some("always answer in haiku".to_string());
        let body = json!({"model": "claude-3-5-sonnet", "messages": [{"role": "user", "content": "hi"}]});
        let converted = adaptor.convert_request(&m, body).unwrap();
        assert_eq!(converted["system"], "always answer in haiku");
    }

    #[test]
    fn extract_usage_sums_input_and_output() {
        let adaptor = AnthropicAdaptor;
        let body = json!({"usage": {"input_tokens": 10, "output_tokens": 20}});
        let usage = adaptor.extract_usage(&body).unwrap();
        assert_eq!(usage.total_tokens, 30);
    }
}
