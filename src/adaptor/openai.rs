//! OpenAI-wire-compatible adaptor, shared by every channel type whose API
//! is a drop-in OpenAI clone: OpenAI itself, Azure OpenAI (path/header
//! variant only), DeepSeek, Baidu, Alibaba, Doubao, OpenRouter, Mistral,
//! Groq and Together. One struct parameterised by channel type, rather
//! than one struct per provider, since the ten channel types differ only
//! in base URL and a couple of header/path details.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{RelayError, Result};
use crate::relay::{RelayMeta, Usage};
use crate::types::ChannelType;

use super::Adaptor;

pub struct OpenAiAdaptor {
    channel_type: ChannelType,
}

impl OpenAiAdaptor {
    pub fn new(channel_type: ChannelType) -> Self {
        Self { channel_type }
    }

    fn base(&self, meta: &RelayMeta) -> &str {
        meta.base_url.as_deref().unwrap_or_else(|| match self.channel_type {
            ChannelType::OpenAI => "https://api.openai.com",
            ChannelType::DeepSeek => "https://api.deepseek.com",
            ChannelType::Mistral => "https://api.mistral.ai",
            ChannelType::Groq => "https://api.groq.com/openai",
            ChannelType::Together => "https://api.together.xyz",
            ChannelType::OpenRouter => "https://openrouter.ai/api",
            _ => "https://api.openai.com",
        })
    }
}

#[async_trait]
impl Adaptor for OpenAiAdaptor {
    fn channel_name(&self) -> &'static str {
        match self.channel_type {
            ChannelType::AzureOpenAI => "azure_openai",
            ChannelType::DeepSeek => "deepseek",
            ChannelType::Baidu => "baidu",
            ChannelType::Alibaba => "alibaba",
            ChannelType::Doubao => "doubao",
            ChannelType::OpenRouter => "openrouter",
            ChannelType::Mistral => "mistral",
            ChannelType::Groq => "groq",
            ChannelType::Together => "together",
            _ => "openai",
        }
    }

    fn get_request_url(&self, meta: &RelayMeta) -> Result<String> {
        let base = self.base(meta);
        if self.channel_type == ChannelType::AzureOpenAI {
            let version = meta.api_version.as_deref().unwrap_or("2024-02-01");
            return Ok(format!(
                "{base}/openai/deployments/{}/chat/completions?api-version={version}",
                meta.actual_model
            ));
        }
        let path = match meta.mode {
            crate::types::RelayMode::Embeddings => "/v1/embeddings",
            crate::types::RelayMode::Completions => "/v1/completions",
            crate::types::RelayMode::Edits => "/v1/edits",
            crate::types::RelayMode::Moderations => "/v1/moderations",
            crate::types::RelayMode::ImagesGenerations => "/v1/images/generations",
            crate::types::RelayMode::AudioSpeech => "/v1/audio/speech",
            crate::types::RelayMode::AudioTranscription => "/v1/audio/transcriptions",
            crate::types::RelayMode::AudioTranslation => "/v1/audio/translations",
            crate::types::RelayMode::Responses => "/v1/responses",
            _ => "/v1/chat/completions",
        };
        Ok(format!("{base}{path}"))
    }

    fn setup_request_headers(
        &self,
        meta: &RelayMeta,
        builder: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        if self.channel_type == ChannelType::AzureOpenAI {
            builder.header("api-key", &meta.api_key)
        } else {
            builder.bearer_auth(&meta.api_key)
        }
    }

    fn convert_request(&self, meta: &RelayMeta, mut body: Value) -> Result<Value> {
        if let Value::Object(map) = &mut body {
            map.insert("model".to_string(), Value::String(meta.actual_model.clone()));
        }
        Ok(body)
    }

    fn extract_usage(&self, body: &Value) -> Option<Usage> {
        let usage = body.get("usage")?;
        serde_json::from_value(usage.clone()).ok()
    }

    fn extract_completion_text(&self, body: &Value) -> String {
        body.get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message").or_else(|| choice.get("text")))
            .and_then(|m| m.get("content").or(Some(m)))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RelayMode;

    fn meta(channel_type: ChannelType, actual_model: &str) -> RelayMeta {
        RelayMeta {
            channel_id: 1,
            channel_type,
            base_url: None,
            api_key: "sk-test".to_string(),
            region: None,
            api_version: None,
            project_id: None,
            mode: RelayMode::ChatCompletions,
            requested_model: actual_model.to_string(),
            actual_model: actual_model.to_string(),
            forced_system_prompt: None,
            is_stream: false,
            prompt_tokens: 0,
            request_id: "req-1".to_string(),
        }
    }

    #[test]
    fn azure_url_embeds_deployment_and_api_version() {
        let adaptor = OpenAiAdaptor::new(ChannelType::AzureOpenAI);
        let m = meta(ChannelType::AzureOpenAI, "gpt-4o");
        let url = adaptor.get_request_url(&m).unwrap();
        assert!(url.contains("/openai/deployments/gpt-4o/chat/completions"));
        assert!(url.contains("api-version=2024-02-01"));
    }

    #[test]
    fn openai_url_defaults_to_public_api() {
        let adaptor = OpenAiAdaptor::new(ChannelType::OpenAI);
        let m = meta(ChannelType::OpenAI, "gpt-4o-mini");
        assert_eq!(adaptor.get_request_url(&m).unwrap(), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn responses_mode_targets_responses_endpoint() {
        let adaptor = OpenAiAdaptor::new(ChannelType::OpenAI);
        let mut m = meta(ChannelType::OpenAI, "gpt-4o-mini");
        m.mode = RelayMode::Responses;
        assert_eq!(adaptor.get_request_url(&m).unwrap(), "https://api.openai.com/v1/responses");
    }

    #[test]
    fn convert_request_rewrites_model_to_actual() {
        let adaptor = OpenAiAdaptor::new(ChannelType::OpenAI);
        let m = meta(ChannelType::OpenAI, "gpt-4o-mini-mapped");
        let body = serde_json::json!({"model": "gpt-4o-mini", "messages": []});
        let converted = adaptor.convert_request(&m, body).unwrap();
        assert_eq!(converted["model"], "gpt-4o-mini-mapped");
    }

    #[test]
    fn extract_usage_reads_standard_block() {
        let adaptor = OpenAiAdaptor::new(ChannelType::OpenAI);
        let body = serde_json::json!({"usage": {"prompt_tokens": 5, "completion_tokens": 7, "total_tokens": 12}});
        let usage = adaptor.extract_usage(&body).unwrap();
        assert_eq!(usage.total_tokens, 12);
    }
}
