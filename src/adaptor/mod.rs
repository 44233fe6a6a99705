//! Adaptor Registry: per-provider capability set behind one trait object.
//!
//! Generalised from a single "chat" method into the URL/header/body-rewrite
//! seams the relay pipeline needs to stay provider-agnostic. Every channel
//! type maps to exactly one adaptor value; there is no inheritance, only a
//! map from [`ChannelType`] to `Arc<dyn Adaptor>`.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod stub;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::error::{RelayError, Result};
use crate::relay::{RelayMeta, Usage};
use crate::types::ChannelType;

/// Capability set a channel type must provide. Default method bodies wire
/// `get_request_url` + `setup_request_headers` + `convert_request` into a
/// single dispatch so most adaptors only override the translation seams;
/// stub adaptors instead override `do_request` wholesale to return
/// `NotImplemented` without ever constructing a request.
#[async_trait]
pub trait Adaptor: Send + Sync {
    fn channel_name(&self) -> &'static str;

    fn list_models(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn get_request_url(&self, meta: &RelayMeta) -> Result<String>;

    /// Applies provider-specific auth/headers onto a request builder
    /// already pointed at `get_request_url`'s URL.
    fn setup_request_headers(
        &self,
        meta: &RelayMeta,
        builder: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder;

    /// Rewrites an OpenAI-shaped request body into the provider's dialect.
    /// Passthrough modes (`Proxy`, `Responses`) are never routed through
    /// this; the pipeline forwards their bytes verbatim.
    fn convert_request(&self, meta: &RelayMeta, body: Value) -> Result<Value>;

    /// Pulls a `Usage` block out of a buffered (non-streaming) response
    /// body, if the provider reports one.
    fn extract_usage(&self, body: &Value) -> Option<Usage>;

    /// Extracts the generated text from a buffered response, used to
    /// estimate completion tokens when `extract_usage` returns `None`.
    fn extract_completion_text(&self, body: &Value) -> String;

    async fn do_request(
        &self,
        client: &reqwest::Client,
        meta: &RelayMeta,
        body: Bytes,
    ) -> Result<reqwest::Response> {
        let url = self.get_request_url(meta)?;
        let payload = if meta.mode.is_text_like() {
            let parsed: Value = serde_json::from_slice(&body)
                .map_err(|e| RelayError::InvalidRequest(format!("malformed request body: {e}")))?;
            self.convert_request(meta, parsed)?
        } else {
            serde_json::from_slice(&body).unwrap_or(Value::Null)
        };

        let mut builder = client.post(&url);
        builder = self.setup_request_headers(meta, builder);
        let response = builder
            .json(&payload)
            .send()
            .await
            .map_err(RelayError::Transport)?;
        Ok(response)
    }
}

/// Map from channel type to its adaptor. Built once at startup; adaptors
/// hold no per-request state so the registry is cheaply `Clone`-able via
/// `Arc`.
#[derive(Clone)]
pub struct AdaptorRegistry {
    adaptors: HashMap<ChannelType, Arc<dyn Adaptor>>,
}

impl AdaptorRegistry {
    /// Builds the registry with every channel type bound to a concrete
    /// adaptor: OpenAI-wire-compatible providers share one adaptor
    /// parameterised by channel type (see `openai::OpenAiAdaptor`);
    /// Anthropic and Gemini get their own wire-format translators; the
    /// remainder are stubs satisfying the trait so lookups are total.
    pub fn new() -> Self {
        let mut adaptors: HashMap<ChannelType, Arc<dyn Adaptor>> = HashMap::new();

        for ty in [
            ChannelType::OpenAI,
            ChannelType::AzureOpenAI,
            ChannelType::DeepSeek,
            ChannelType::Baidu,
            ChannelType::Alibaba,
            ChannelType::Doubao,
            ChannelType::OpenRouter,
            ChannelType::Mistral,
            ChannelType::Groq,
            ChannelType::Together,
        ] {
            adaptors.insert(ty, Arc::new(openai::OpenAiAdaptor::new(ty)));
        }

        adaptors.insert(ChannelType::Anthropic, Arc::new(anthropic::AnthropicAdaptor));
        adaptors.insert(ChannelType::Gemini, Arc::new(gemini::GeminiAdaptor));
        adaptors.insert(ChannelType::Cohere, Arc::new(stub::StubAdaptor::new("cohere")));
        adaptors.insert(ChannelType::Bedrock, Arc::new(stub::StubAdaptor::new("bedrock")));
        adaptors.insert(ChannelType::Local, Arc::new(stub::StubAdaptor::new("local")));

        AdaptorRegistry { adaptors }
    }

    pub fn get(&self, channel_type: ChannelType) -> Result<Arc<dyn Adaptor>> {
        self.adaptors
            .get(&channel_type)
            .cloned()
            .ok_or_else(|| RelayError::Internal(format!("no adaptor registered for {channel_type:?}")))
    }
}

impl Default for AdaptorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_total_over_every_channel_type() {
        let registry = AdaptorRegistry::new();
        for ty in [
            ChannelType::OpenAI,
            ChannelType::AzureOpenAI,
            ChannelType::Anthropic,
            ChannelType::Gemini,
            ChannelType::DeepSeek,
            ChannelType::Baidu,
            ChannelType::Alibaba,
            ChannelType::Doubao,
            ChannelType::OpenRouter,
            ChannelType::Mistral,
            ChannelType::Cohere,
            ChannelType::Groq,
            ChannelType::Together,
            ChannelType::Bedrock,
            ChannelType::Local,
        ] {
            assert!(registry.get(ty).is_ok(), "missing adaptor for {ty:?}");
        }
    }
}
