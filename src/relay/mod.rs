//! Relay pipeline: request-routing and metering state machine.
//!
//! `pipeline` holds the per-request orchestration (§4.5 of the design
//! doc); `auth` extracts and validates the bearer token and optional
//! channel pin; this module root carries the OpenAI wire types and mode
//! detection shared by both.

pub mod auth;
pub mod pipeline;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::RelayMode;

/// Maps an inbound request path to a [`RelayMode`]. `/api/v1/public/*` is
/// normalised to be equivalent to `/v1/*`, matching the external
/// interfaces contract.
pub fn detect_mode(path: &str) -> RelayMode {
    let trimmed = path
        .strip_prefix("/api/v1/public")
        .unwrap_or_else(|| path.strip_prefix("/v1").unwrap_or(path));

    match trimmed {
        "/chat/completions" => RelayMode::ChatCompletions,
        "/completions" => RelayMode::Completions,
        "/embeddings" => RelayMode::Embeddings,
        "/edits" => RelayMode::Edits,
        "/moderations" => RelayMode::Moderations,
        "/images/generations" => RelayMode::ImagesGenerations,
        "/audio/speech" => RelayMode::AudioSpeech,
        "/audio/transcriptions" => RelayMode::AudioTranscription,
        "/audio/translations" => RelayMode::AudioTranslation,
        "/responses" => RelayMode::Responses,
        p if p.starts_with("/oneapi/proxy/") => RelayMode::Proxy,
        _ => RelayMode::Unknown,
    }
}

// ============================================================================
// OpenAI wire types (chat completions only; other modes are relayed as raw
// `serde_json::Value` bodies since their adaptors are out of scope).
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    /// Either a plain string or an array of typed content parts (text,
    /// image_url, input_audio) per the OpenAI multimodal content schema.
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    /// Everything else (temperature, max_tokens, tools, ...) is forwarded
    /// to the upstream adaptor untouched via the original request buffer;
    /// this struct only extracts the fields the pipeline itself needs.
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Per-request metadata threaded through the adaptor boundary. Built once
/// after routing and model mapping, then handed to whichever adaptor the
/// selected channel resolves to.
#[derive(Debug, Clone)]
pub struct RelayMeta {
    pub channel_id: i64,
    pub channel_type: crate::types::ChannelType,
    pub base_url: Option<String>,
    pub api_key: String,
    pub region: Option<String>,
    pub api_version: Option<String>,
    pub project_id: Option<String>,
    pub mode: RelayMode,
    pub requested_model: String,
    pub actual_model: String,
    pub forced_system_prompt: Option<String>,
    pub is_stream: bool,
    pub prompt_tokens: u32,
    pub request_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_mode_normalises_public_prefix() {
        assert_eq!(detect_mode("/v1/chat/completions"), RelayMode::ChatCompletions);
        assert_eq!(
            detect_mode("/api/v1/public/chat/completions"),
            RelayMode::ChatCompletions
        );
    }

    #[test]
    fn detect_mode_proxy_matches_channel_suffix() {
        assert_eq!(detect_mode("/v1/oneapi/proxy/42"), RelayMode::Proxy);
    }

    #[test]
    fn detect_mode_unknown_path_falls_through() {
        assert_eq!(detect_mode("/v1/unknown-endpoint"), RelayMode::Unknown);
    }
}
