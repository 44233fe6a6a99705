//! Google Gemini adaptor: the API key travels as a `key` query parameter
//! rather than a header, messages become a `contents` array of
//! `{role, parts}` with `assistant` renamed to `model`, and a leading
//! system message is hoisted into a top-level `systemInstruction` field.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::Result;
use crate::relay::{RelayMeta, Usage};

use super::Adaptor;

pub struct GeminiAdaptor;

impl GeminiAdaptor {
    fn convert_messages(&self, messages: &[Value]) -> Vec<Value> {
        messages
            .iter()
            .filter(|m| m.get("role").and_then(Value::as_str) != Some("system"))
            .map(|m| {
                let role = match m.get("role").and_then(Value::as_str) {
                    Some("assistant") => "model",
                    _ => "user",
                };
                let text = m.get("content").and_then(Value::as_str).unwrap_or_default();
                json!({"role": role, "parts": [{"text": text}]})
            })
            .collect()
    }

    fn system_instruction(&self, messages: &[Value], forced: Option<&str>) -> Option<Value> {
        let from_messages = messages
            .iter()
            .find(|m| m.get("role").and_then(Value::as_str) == Some("system"))
            .and_then(|m| m.get("content").and_then(Value::as_str));

        let text = match (forced, from_messages) {
            (Some(f), Some(s)) => Some(format!("{f}\n\n{s}")),
            (Some(f), None) => Some(f.to_string()),
            (None, Some(s)) => Some(s.to_string()),
            (None, None) => None,
        }?;
        Some(json!({"parts": [{"text": text}]}))
    }
}

#[async_trait]
impl Adaptor for GeminiAdaptor {
    fn channel_name(&self) -> &'static str {
        "gemini"
    }

    fn get_request_url(&self, meta: &RelayMeta) -> Result<String> {
        let base = meta.base_url.as_deref().unwrap_or("https://generativelanguage.googleapis.com");
        let method = if meta.is_stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        Ok(format!(
            "{base}/v1beta/models/{}:{method}?key={}",
            meta.actual_model, meta.api_key
        ))
    }

    fn setup_request_headers(
        &self,
        _meta: &RelayMeta,
        builder: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        // Auth travels in the URL's `key` query parameter; no header needed.
        builder
    }

    fn convert_request(&self, meta: &RelayMeta, body: Value) -> Result<Value> {
        let messages = body.get("messages").and_then(Value::as_array).cloned().unwrap_or_default();
        let mut out = json!({
            "contents": self.convert_messages(&messages),
            "generationConfig": {},
        });
        if let Some(temp) = body.get("temperature") {
            out["generationConfig"]["temperature"] = temp.clone();
        }
        if let Some(instruction) = self.system_instruction(&messages, meta.forced_system_prompt.as_deref()) {
            out["systemInstruction"] = instruction;
        }
        Ok(out)
    }

    fn extract_usage(&self, body: &Value) -> Option<Usage> {
        let usage = body.get("usageMetadata")?;
        let prompt = usage.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0) as u32;
        let completion = usage.get("candidatesTokenCount").and_then(Value::as_u64).unwrap_or(0) as u32;
        let total = usage
            .get("totalTokenCount")
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .unwrap_or(prompt + completion);
        Some(Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
        })
    }

    fn extract_completion_text(&self, body: &Value) -> String {
        body.get("candidates")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
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
            channel_type: ChannelType::Gemini,
            base_url: None,
            api_key: "gkey".to_string(),
            region: None,
            api_version: None,
            project_id: None,
            mode: RelayMode::ChatCompletions,
            requested_model: "gemini-1.5-pro".to_string(),
            actual_model: "gemini-1.5-pro".to_string(),
            forced_system_prompt: None,
            is_stream: false,
            prompt_tokens: 0,
            request_id: "req-1".to_string(),
        }
    }

    #[test]
    fn url_carries_key_as_query_param_not_header() {
        let adaptor = GeminiAdaptor;
        let url = adaptor.get_request_url(&meta()).unwrap();
        assert!(url.ends_with("gemini-1.5-pro:generateContent?key=gkey"));
    }

    #[test]
    fn stream_mode_uses_stream_method() {
        let adaptor = GeminiAdaptor;
        let mut m = meta();
        m.is_stream = true;
        let url = adaptor.get_request_url(&m).unwrap();
        assert!(url.contains(":streamGenerateContent"));
    }

    #[test]
    fn assistant_role_is_renamed_to_model() {
        let adaptor = GeminiAdaptor;
        let body = json!({"messages": [{"role": "assistant", "content": "hi"}]});
        let converted = adaptor.convert_request(&meta(), body).unwrap();
        assert_eq!(converted["contents"][0]["role"], "model");
    }

    #[test]
    fn system_message_is_hoisted_out_of_contents() {
        let adaptor = GeminiAdaptor;
        let body = json!({"messages": [
            {"role": "system", "content": "be terse"},
            {"role": "user", "content": "hi"},
        ]});
        let converted = adaptor.convert_request(&meta(), body).unwrap();
        assert_eq!(converted["contents"].as_array().unwrap().len(), 1);
        assert_eq!(converted["systemInstruction"]["parts"][0]["text"], "be terse");
    }

    #[test]
    fn extract_usage_reads_usage_metadata() {
        let adaptor = GeminiAdaptor;
        let body = json!({"usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 4, "totalTokenCount": 7}});
        let usage = adaptor.extract_usage(&body).unwrap();
        assert_eq!(usage.total_tokens, 7);
    }
}
