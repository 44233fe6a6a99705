//! Placeholder adaptor for channel types the core relay recognizes but does
//! not yet translate: Cohere, Bedrock, Local. Satisfies [`Adaptor`] so the
//! registry stays total over [`crate::types::ChannelType`], but every
//! request-shaping method is unreachable because `do_request` is overridden
//! to fail fast with [`RelayError::NotImplemented`] before any of them run.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::error::{RelayError, Result};
use crate::relay::{RelayMeta, Usage};

use super::Adaptor;

pub struct StubAdaptor {
    name: &'static str,
}

impl StubAdaptor {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

#[async_trait]
impl Adaptor for StubAdaptor {
    fn channel_name(&self) -> &'static str {
        self.name
    }

    fn get_request_url(&self, _meta: &RelayMeta) -> Result<String> {
        Err(RelayError::NotImplemented)
    }

    fn setup_request_headers(
        &self,
        _meta: &RelayMeta,
        builder: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        builder
    }

    fn convert_request(&self, _meta: &RelayMeta, _body: Value) -> Result<Value> {
        Err(RelayError::NotImplemented)
    }

    fn extract_usage(&self, _body: &Value) -> Option<Usage> {
        None
    }

    fn extract_completion_text(&self, _body: &Value) -> String {
        String::new()
    }

    async fn do_request(
        &self,
        _client: &reqwest::Client,
        _meta: &RelayMeta,
        _body: Bytes,
    ) -> Result<reqwest::Response> {
        Err(RelayError::NotImplemented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelType, RelayMode};

    #[tokio::test]
    async fn do_request_fails_fast_without_building_a_url() {
        let adaptor = StubAdaptor::new("cohere");
        let client = reqwest::Client::new();
        let meta = RelayMeta {
            channel_id: 1,
            channel_type: ChannelType::Cohere,
            base_url: None,
            api_key: "x".to_string(),
            region: None,
            api_version: None,
            project_id: None,
            mode: RelayMode::ChatCompletions,
            requested_model: "command-r".to_string(),
            actual_model: "command-r".to_string(),
            forced_system_prompt: None,
            is_stream: false,
            prompt_tokens: 0,
            request_id: "req-1".to_string(),
        };
        let result = adaptor.do_request(&client, &meta, Bytes::new()).await;
        assert!(matches!(result, Err(RelayError::NotImplemented)));
    }
}
