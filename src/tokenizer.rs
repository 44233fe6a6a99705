//! Token Counter: estimates prompt/completion tokens for metering when the
//! upstream response omits a `usage` block.
//!
//! Falls back to a ~4-characters-per-token heuristic as the
//! `ApproximateTokenEnabled` fast path, but defaults to a real BPE count via
//! `tiktoken-rs` the way a production metering layer would, caching one
//! `CoreBPE` per model family behind a `DashMap` so concurrent requests for
//! the same family share the encoder instead of rebuilding it.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde_json::Value;
use std::sync::Arc;
use tiktoken_rs::CoreBPE;
use tracing::warn;

use crate::relay::ChatMessage;

static ENCODERS: Lazy<DashMap<&'static str, Arc<CoreBPE>>> = Lazy::new(DashMap::new);

/// Fixed per-image token surcharge, independent of resolution, plus a
/// resolution-dependent term approximated from the `detail` hint OpenAI's
/// vision API accepts (`low` | `high` | `auto`).
const IMAGE_BASE_TOKENS: u32 = 85;
const IMAGE_HIGH_DETAIL_TOKENS: u32 = 170;

/// Audio is billed by duration upstream; absent a decoder we approximate
/// duration from the base64 payload size at a fixed bitrate and convert to
/// tokens at a flat per-second rate.
const AUDIO_BYTES_PER_SECOND: u64 = 16_000;
const AUDIO_TOKENS_PER_SECOND: u32 = 5;

fn family_key(model: &str) -> &'static str {
    if model.starts_with("gpt-4o") || model.starts_with("o1") || model.starts_with("o3") {
        "o200k_base"
    } else if model.starts_with("gpt-4") || model.starts_with("gpt-3.5") {
        "cl100k_base"
    } else {
        "cl100k_base"
    }
}

fn encoder_for(model: &str) -> Arc<CoreBPE> {
    let key = family_key(model);
    if let Some(enc) = ENCODERS.get(key) {
        return enc.clone();
    }
    let built = match key {
        "o200k_base" => tiktoken_rs::o200k_base(),
        _ => tiktoken_rs::cl100k_base(),
    };
    let enc = Arc::new(built.unwrap_or_else(|err| {
        warn!(error = %err, model, "failed to build tokenizer, falling back is not possible, using empty vocabulary panics avoided upstream");
        tiktoken_rs::cl100k_base().expect("cl100k_base must always construct")
    }));
    ENCODERS.insert(key, enc.clone());
    enc
}

/// Byte-length heuristic used when `ApproximateTokenEnabled` trades
/// accuracy for speed: ~4 characters per token.
fn approximate(text: &str) -> u32 {
    ((text.len() as f64) / 4.0).ceil() as u32
}

/// Counts tokens for a prompt given either a plain string (completions/
/// edits modes) or a list of chat messages (chat completions mode),
/// including per-part multimodal surcharges for image and audio content.
pub fn count_prompt_messages(messages: &[ChatMessage], model: &str, approximate_enabled: bool) -> u32 {
    let mut total = 0u32;
    for message in messages {
        total += count_prompt_text(&message.role, model, approximate_enabled);
        match &message.content {
            Value::String(s) => total += count_prompt_text(s, model, approximate_enabled),
            Value::Array(parts) => {
                for part in parts {
                    total += count_content_part(part, model, approximate_enabled);
                }
            }
            _ => {}
        }
        // Per-message role/formatting overhead, matching OpenAI's documented
        // ~4 extra tokens per message in the chat format.
        total += 4;
    }
    total
}

pub fn count_prompt_text(text: &str, model: &str, approximate_enabled: bool) -> u32 {
    if approximate_enabled {
        return approximate(text);
    }
    encoder_for(model).encode_with_special_tokens(text).len() as u32
}

pub fn count_completion(text: &str, model: &str, approximate_enabled: bool) -> u32 {
    count_prompt_text(text, model, approximate_enabled)
}

fn count_content_part(part: &Value, model: &str, approximate_enabled: bool) -> u32 {
    let kind = part.get("type").and_then(Value::as_str).unwrap_or("");
    match kind {
        "text" => part
            .get("text")
            .and_then(Value::as_str)
            .map(|t| count_prompt_text(t, model, approximate_enabled))
            .unwrap_or(0),
        "image_url" => {
            let detail = part
                .get("image_url")
                .and_then(|v| v.get("detail"))
                .and_then(Value::as_str)
                .unwrap_or("auto");
            if detail == "low" {
                IMAGE_BASE_TOKENS
            } else {
                IMAGE_BASE_TOKENS + IMAGE_HIGH_DETAIL_TOKENS
            }
        }
        "input_audio" => {
            let payload_len = part
                .get("input_audio")
                .and_then(|v| v.get("data"))
                .and_then(Value::as_str)
                .map(|s| s.len() as u64)
                .unwrap_or(0);
            // base64 inflates size by 4/3; undo that before estimating duration.
            let raw_bytes = payload_len * 3 / 4;
            let seconds = raw_bytes / AUDIO_BYTES_PER_SECOND.max(1);
            (seconds as u32).saturating_mul(AUDIO_TOKENS_PER_SECOND)
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn approximate_scales_with_length() {
        assert_eq!(approximate(""), 0);
        assert!(approximate("a".repeat(40).as_str()) >= 10);
    }

    #[test]
    fn count_prompt_text_matches_bpe_for_known_model() {
        let n = count_prompt_text("hello world", "gpt-4o-mini", false);
        assert!(n > 0 && n < 10);
    }

    #[test]
    fn approximate_mode_uses_heuristic_not_bpe() {
        let text = "x".repeat(100);
        let approx = count_prompt_text(&text, "gpt-4o-mini", true);
        assert_eq!(approx, 25);
    }

    #[test]
    fn image_part_high_detail_costs_more_than_low() {
        let low = count_content_part(
            &json!({"type":"image_url","image_url":{"detail":"low"}}),
            "gpt-4o-mini",
            false,
        );
        let high = count_content_part(
            &json!({"type":"image_url","image_url":{"detail":"high"}}),
            "gpt-4o-mini",
            false,
        );
        assert!(high > low);
    }

    #[test]
    fn chat_messages_add_per_message_overhead() {
        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: Value::String("hi".to_string()),
            name: None,
        }];
        let n = count_prompt_messages(&messages, "gpt-4o-mini", false);
        assert!(n > 4);
    }
}
