//! Core data model shared across the gateway.
//!
//! These types mirror the authoritative rows in the primary datastore.
//! The gateway core treats `User` and `Token` as mostly read-only and only
//! ever mutates their quota fields through [`crate::db::quota`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// User
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Guest,
    Common,
    Admin,
    Root,
}

impl Role {
    pub fn rank(self) -> u8 {
        match self {
            Role::Guest => 0,
            Role::Common => 1,
            Role::Admin => 2,
            Role::Root => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Enabled,
    Disabled,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub wallet_address: Option<String>,
    pub role: Role,
    pub status: UserStatus,
    pub quota: i64,
    pub used_quota: i64,
    #[serde(default = "default_group")]
    pub group: String,
    pub request_count: i64,
}

fn default_group() -> String {
    "default".to_string()
}

impl User {
    pub fn is_enabled(&self) -> bool {
        self.status == UserStatus::Enabled
    }
}

// ============================================================================
// Token (API key)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    Enabled,
    Disabled,
    Expired,
    Exhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: i64,
    pub user_id: i64,
    #[serde(skip_serializing)]
    pub key: String,
    pub name: String,
    pub status: TokenStatus,
    pub remain_quota: i64,
    pub used_quota: i64,
    pub unlimited_quota: bool,
    /// -1 means the token never expires.
    pub expired_time: i64,
    pub subnet: Option<String>,
    /// Comma-separated allow-list of models; `None`/empty means "all models".
    pub models: Option<String>,
}

impl Token {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expired_time != -1 && self.expired_time < now.timestamp()
    }

    pub fn allows_model(&self, requested_model: &str) -> bool {
        match &self.models {
            None => true,
            Some(list) if list.is_empty() => true,
            Some(list) => list.split(',').any(|m| m.trim() == requested_model),
        }
    }
}

// ============================================================================
// Channel
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    OpenAI,
    AzureOpenAI,
    Anthropic,
    Gemini,
    DeepSeek,
    Baidu,
    Alibaba,
    Doubao,
    OpenRouter,
    Mistral,
    Cohere,
    Groq,
    Together,
    Bedrock,
    Local,
}

impl std::str::FromStr for ChannelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "azure" | "azure_openai" | "azureopenai" => Ok(Self::AzureOpenAI),
            "anthropic" => Ok(Self::Anthropic),
            "gemini" | "google" => Ok(Self::Gemini),
            "deepseek" => Ok(Self::DeepSeek),
            "baidu" => Ok(Self::Baidu),
            "alibaba" | "qwen" => Ok(Self::Alibaba),
            "doubao" => Ok(Self::Doubao),
            "openrouter" => Ok(Self::OpenRouter),
            "mistral" => Ok(Self::Mistral),
            "cohere" => Ok(Self::Cohere),
            "groq" => Ok(Self::Groq),
            "together" => Ok(Self::Together),
            "bedrock" => Ok(Self::Bedrock),
            "local" | "ollama" => Ok(Self::Local),
            other => Err(format!("unknown channel type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Unknown,
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ChannelConfig {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub use_responses: bool,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub channel_type: ChannelType,
    #[serde(skip_serializing)]
    pub key: String,
    pub status: ChannelStatus,
    pub name: String,
    pub base_url: Option<String>,
    /// Comma-separated list of upstream model ids this channel can serve.
    pub models: String,
    /// Comma-separated list of routing groups this channel accepts.
    pub group: String,
    pub model_mapping: Option<HashMap<String, String>>,
    pub priority: i64,
    pub weight: u32,
    pub config: ChannelConfig,
    pub model_ratio: Option<HashMap<String, f64>>,
    pub completion_ratio: Option<HashMap<String, f64>>,
    pub used_quota: i64,
    pub response_time_ms: i64,
    pub balance: f64,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("channel_type", &self.channel_type)
            .field("key", &"***")
            .field("status", &self.status)
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("models", &self.models)
            .field("group", &self.group)
            .field("priority", &self.priority)
            .field("weight", &self.weight)
            .finish()
    }
}

impl Channel {
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.group.split(',').map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn model_list(&self) -> impl Iterator<Item = &str> {
        self.models.split(',').map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn accepts_group(&self, group: &str) -> bool {
        self.groups().any(|g| g == group)
    }

    pub fn serves_model(&self, model: &str) -> bool {
        self.model_list().any(|m| m == model)
    }

    pub fn map_model(&self, requested: &str) -> String {
        self.model_mapping
            .as_ref()
            .and_then(|m| m.get(requested))
            .cloned()
            .unwrap_or_else(|| requested.to_string())
    }

    /// A channel-specific model-ratio override for `model`, if this
    /// channel carries one. Falls through to the process-wide
    /// `OptionsSnapshot` ratio when absent (channel overrides exist for
    /// upstreams whose actual cost differs from the model's usual rate,
    /// e.g. a discounted Azure deployment of the same model).
    pub fn model_ratio_override(&self, model: &str) -> Option<f64> {
        self.model_ratio.as_ref().and_then(|m| m.get(model).or_else(|| m.get("default")).copied())
    }

    pub fn completion_ratio_override(&self, model: &str) -> Option<f64> {
        self.completion_ratio.as_ref().and_then(|m| m.get(model).or_else(|| m.get("default")).copied())
    }
}

// ============================================================================
// Ability
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ability {
    pub group: String,
    pub model: String,
    pub channel_id: i64,
    pub enabled: bool,
    pub priority: i64,
    pub weight: u32,
}

// ============================================================================
// Log
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    Unknown,
    Topup,
    Consume,
    Manage,
    System,
    Test,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    pub id: i64,
    pub user_id: i64,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub log_type: LogType,
    pub content: String,
    pub token_name: String,
    pub model_name: String,
    pub quota: i64,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub channel_id: i64,
    pub request_id: String,
    pub elapsed_time_ms: i64,
    pub is_stream: bool,
    pub system_prompt_reset: bool,
}

// ============================================================================
// Relay mode
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayMode {
    Unknown,
    ChatCompletions,
    Completions,
    Embeddings,
    Edits,
    Moderations,
    ImagesGenerations,
    AudioSpeech,
    AudioTranscription,
    AudioTranslation,
    Proxy,
    Responses,
}

impl RelayMode {
    /// Modes whose upstream body is rewritten per-channel rather than
    /// passed through verbatim.
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            RelayMode::ChatCompletions | RelayMode::Completions | RelayMode::Edits
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_channel() -> Channel {
        Channel {
            id: 1,
            channel_type: ChannelType::OpenAI,
            key: "sk-test".to_string(),
            status: ChannelStatus::Enabled,
            name: "test".to_string(),
            base_url: None,
            models: "gpt-4o-mini, gpt-4o".to_string(),
            group: "default,vip".to_string(),
            model_mapping: Some(HashMap::from([(
                "gpt-4o-mini".to_string(),
                "gpt-4o-mini-2024-07-18".to_string(),
            )])),
            priority: 10,
            weight: 1,
            config: ChannelConfig::default(),
            model_ratio: None,
            completion_ratio: None,
            used_quota: 0,
            response_time_ms: 0,
            balance: 0.0,
        }
    }

    #[test]
    fn channel_debug_redacts_key() {
        let c = sample_channel();
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("sk-test"));
        assert!(dbg.contains("***"));
    }

    #[test]
    fn channel_groups_and_models_are_trimmed() {
        let c = sample_channel();
        assert!(c.accepts_group("vip"));
        assert!(!c.accepts_group("enterprise"));
        assert!(c.serves_model("gpt-4o"));
        assert!(!c.serves_model("claude-3-opus"));
    }

    #[test]
    fn model_mapping_falls_back_to_requested_name() {
        let c = sample_channel();
        assert_eq!(c.map_model("gpt-4o-mini"), "gpt-4o-mini-2024-07-18");
        assert_eq!(c.map_model("gpt-4o"), "gpt-4o");
    }

    #[test]
    fn token_model_allow_list() {
        let token = Token {
            id: 1,
            user_id: 1,
            key: "k".to_string(),
            name: "t".to_string(),
            status: TokenStatus::Enabled,
            remain_quota: 100,
            used_quota: 0,
            unlimited_quota: false,
            expired_time: -1,
            subnet: None,
            models: Some("gpt-4o-mini".to_string()),
        };
        assert!(token.allows_model("gpt-4o-mini"));
        assert!(!token.allows_model("claude-3-opus"));
    }
}
