//! Core relay state machine: Received → Authorised → Routed → Reserved →
//! Dispatched → {Streaming|Buffering} → Metered → Settled → Logged, with
//! failure transitions to Errored from any state after Authorised.
//!
//! Built around a select-adaptor → call-it → record-outcome flow, with
//! quota pre-reservation/settlement and retry-with-failover across
//! channels layered on top.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::Event;
use bytes::Bytes;
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tracing::{info, warn};

use crate::db::OptionsSnapshot;
use crate::error::{RelayError, Result};
use crate::health::FailureKind;
use crate::retry::{self, Classification};
use crate::selector;
use crate::state::SharedState;
use crate::tokenizer;
use crate::types::{Channel, ChannelStatus, Log, LogType, RelayMode, Token, User};

use super::{ChatMessage, RelayMeta, Usage};

pub type BoxEventStream = Pin<Box<dyn Stream<Item = std::result::Result<Event, Infallible>> + Send>>;

/// Everything the pipeline needs about the inbound request beyond the raw
/// bytes: the authenticated identity, routing inputs, and the parsed mode.
pub struct RequestContext {
    pub user: User,
    pub token: Token,
    pub group: String,
    pub requested_model: String,
    pub forced_system_prompt: Option<String>,
    pub pinned_channel_id: Option<i64>,
    pub mode: RelayMode,
    pub body: Bytes,
    pub request_id: String,
}

pub enum RelayOutcome {
    Buffered {
        status: StatusCode,
        body: Value,
    },
    Stream(BoxEventStream),
    Raw {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
}

struct AttemptSuccess {
    outcome: RelayOutcome,
    usage: Usage,
}

/// Everything [`settle_and_log`] needs, captured by value so it can run
/// either synchronously after a buffered attempt or from inside a `'static`
/// stream generator once the upstream SSE body has finished draining.
struct SettleParams {
    state: SharedState,
    user_id: i64,
    username: String,
    token_id: i64,
    token_name: String,
    token_unlimited_quota: bool,
    requested_model: String,
    group: String,
    system_prompt_reset: bool,
    request_id: String,
    channel_id: i64,
    channel_name: String,
    model_ratio_override: Option<f64>,
    completion_ratio_override: Option<f64>,
    actual_model: String,
    is_stream: bool,
    pre_reserve: i64,
    options: OptionsSnapshot,
    start: Instant,
}

impl SettleParams {
    fn new(
        state: &SharedState,
        ctx: &RequestContext,
        channel: &Channel,
        meta: &RelayMeta,
        pre_reserve: i64,
        options: &OptionsSnapshot,
        start: Instant,
    ) -> Self {
        SettleParams {
            state: state.clone(),
            user_id: ctx.user.id,
            username: ctx.user.username.clone(),
            token_id: ctx.token.id,
            token_name: ctx.token.name.clone(),
            token_unlimited_quota: ctx.token.unlimited_quota,
            requested_model: ctx.requested_model.clone(),
            group: ctx.group.clone(),
            system_prompt_reset: ctx.forced_system_prompt.is_some(),
            request_id: ctx.request_id.clone(),
            channel_id: channel.id,
            channel_name: channel.name.clone(),
            model_ratio_override: channel.model_ratio_override(&meta.actual_model),
            completion_ratio_override: channel.completion_ratio_override(&meta.actual_model),
            actual_model: meta.actual_model.clone(),
            is_stream: meta.is_stream,
            pre_reserve,
            options: options.clone(),
            start,
        }
    }
}

/// Entry point: runs the full pipeline for one request, including the
/// retry loop over alternate channels, and returns the response to hand
/// back to the client or an error already carrying the request id.
pub async fn run(state: &SharedState, ctx: RequestContext) -> Result<RelayOutcome> {
    let options = state.options.snapshot().await;
    let start = Instant::now();

    let is_stream = parse_stream_flag(&ctx.body);
    let prompt_tokens = if ctx.mode.is_text_like() {
        estimate_prompt_tokens(&ctx.body, &ctx.requested_model, options.approximate_token_enabled)
    } else {
        0
    };

    let model_ratio = options.model_ratio(&ctx.requested_model);
    let group_ratio = options.group_ratio(&ctx.group);
    let pre_reserve = ((options.pre_consumed_quota as f64)
        .max(prompt_tokens as f64 * model_ratio * group_ratio))
        .round() as i64;

    reserve_quota(state, &ctx, pre_reserve).await?;
    warn_if_below_remind_threshold(state, &ctx, &options).await;

    let result = run_attempts(state, &ctx, &options, prompt_tokens, is_stream, pre_reserve, start).await;

    match result {
        Ok(success) => Ok(success),
        Err(err) => {
            // Nothing settled; the entire pre-reservation is a pure cost
            // that never happened from the user's perspective.
            refund_quota(state, &ctx, pre_reserve).await;
            Err(err.with_request_id(&ctx.request_id))
        }
    }
}

async fn reserve_quota(state: &SharedState, ctx: &RequestContext, pre_reserve: i64) -> Result<()> {
    if !state.users.reserve_quota(ctx.user.id, pre_reserve).await? {
        return Err(RelayError::InsufficientQuota);
    }
    if !ctx.token.unlimited_quota {
        match state.tokens.reserve(ctx.token.id, pre_reserve).await {
            Ok(true) => {}
            Ok(false) => {
                state.users.adjust_quota(ctx.user.id, -pre_reserve).await.ok();
                return Err(RelayError::InsufficientQuota);
            }
            Err(err) => {
                state.users.adjust_quota(ctx.user.id, -pre_reserve).await.ok();
                return Err(err);
            }
        }
    }
    Ok(())
}

async fn refund_quota(state: &SharedState, ctx: &RequestContext, amount: i64) {
    if amount == 0 {
        return;
    }
    if let Err(err) = state.users.adjust_quota(ctx.user.id, -amount).await {
        warn!(error = %err, user_id = ctx.user.id, "failed to refund pre-reserved user quota");
    }
    if !ctx.token.unlimited_quota {
        if let Err(err) = state.tokens.refund(ctx.token.id, amount).await {
            warn!(error = %err, token_id = ctx.token.id, "failed to refund pre-reserved token quota");
        }
    }
}

async fn warn_if_below_remind_threshold(state: &SharedState, ctx: &RequestContext, options: &OptionsSnapshot) {
    if let Ok(Some(user)) = state.users.get_by_id(ctx.user.id).await {
        if user.quota <= options.quota_remind_threshold {
            info!(user_id = user.id, remaining = user.quota, "user quota below remind threshold");
        }
    }
}

async fn run_attempts(
    state: &SharedState,
    ctx: &RequestContext,
    options: &OptionsSnapshot,
    prompt_tokens: u32,
    is_stream: bool,
    pre_reserve: i64,
    start: Instant,
) -> Result<RelayOutcome> {
    let mut excluded: Vec<i64> = Vec::new();
    let mut ignore_top_tier = false;
    let mut last_err: Option<RelayError> = None;
    let mut last_status: Option<StatusCode> = None;
    // One initial attempt plus `retry_times` retries on a fresh channel.
    let max_attempts = options.retry_times + 1;

    for _ in 0..max_attempts {
        let channel_id = match ctx.pinned_channel_id {
            Some(pinned) if excluded.contains(&pinned) => break,
            Some(pinned) => pinned,
            None => match selector::pick_channel(&state.cache, &ctx.group, &ctx.requested_model, ignore_top_tier, &excluded).await {
                Ok(id) => id,
                Err(err) => {
                    last_err = Some(err);
                    break;
                }
            },
        };

        let channel = match state.channels.get_by_id(channel_id).await? {
            Some(c) if c.status == ChannelStatus::Enabled => c,
            _ => {
                excluded.push(channel_id);
                continue;
            }
        };

        let meta = build_meta(&channel, ctx, prompt_tokens, is_stream);

        match dispatch_once(state, &channel, &meta, ctx, options, pre_reserve, start).await {
            Ok(outcome) => {
                state.health.emit(channel.id, true, None, options).await.ok();
                return Ok(outcome);
            }
            Err((err, classification)) => {
                let classification = if ctx.pinned_channel_id.is_some() {
                    retry::pin_overrides(classification)
                } else {
                    classification
                };
                state.health.emit(channel.id, false, classification.failure_kind, options).await.ok();
                excluded.push(channel.id);
                let retryable = classification.should_retry;
                last_status = classification.status;
                last_err = Some(err);
                if !retryable {
                    break;
                }
                ignore_top_tier = true;
            }
        }
    }

    // Once every attempt is spent, a final failure whose last classified
    // status was 429 is rewritten into a group-saturation message: the
    // upstream's own "too many requests" no longer means anything useful
    // to the client once every eligible channel has been tried.
    if last_status == Some(StatusCode::TOO_MANY_REQUESTS) {
        return Err(RelayError::RetriesExhausted(retry::group_saturated_message(
            &ctx.group,
            &ctx.requested_model,
        )));
    }

    Err(last_err.unwrap_or_else(|| RelayError::NoChannelAvailable {
        group: ctx.group.clone(),
        model: ctx.requested_model.clone(),
    }))
}

/// The effective relay mode for one attempt against `channel`. A channel
/// configured with `UseResponses` always downgrades to raw passthrough
/// against the provider's responses endpoint, overriding whatever mode the
/// inbound path selected — this is a per-channel dialect choice, not a
/// per-request one.
fn effective_mode(channel: &Channel, requested: RelayMode) -> RelayMode {
    if channel.config.use_responses {
        RelayMode::Responses
    } else {
        requested
    }
}

fn build_meta(channel: &Channel, ctx: &RequestContext, prompt_tokens: u32, is_stream: bool) -> RelayMeta {
    RelayMeta {
        channel_id: channel.id,
        channel_type: channel.channel_type,
        base_url: channel.base_url.clone(),
        api_key: channel.key.clone(),
        region: channel.config.region.clone(),
        api_version: channel.config.api_version.clone(),
        project_id: channel.config.project_id.clone(),
        mode: effective_mode(channel, ctx.mode),
        requested_model: ctx.requested_model.clone(),
        actual_model: channel.map_model(&ctx.requested_model),
        forced_system_prompt: ctx.forced_system_prompt.clone(),
        is_stream,
        prompt_tokens,
        request_id: ctx.request_id.clone(),
    }
}

/// Runs one channel attempt end to end, including settlement for every
/// outcome that can be metered synchronously. The one exception is a
/// streaming success: its `Usage` is only known once the body has fully
/// drained, so [`dispatch_stream`] defers settlement to the moment the
/// stream itself terminates rather than blocking this function on it.
async fn dispatch_once(
    state: &SharedState,
    channel: &Channel,
    meta: &RelayMeta,
    ctx: &RequestContext,
    options: &OptionsSnapshot,
    pre_reserve: i64,
    start: Instant,
) -> std::result::Result<RelayOutcome, (RelayError, Classification)> {
    let adaptor = match state.adaptors.get(channel.channel_type) {
        Ok(a) => a,
        Err(err) => {
            return Err((
                err,
                Classification { should_retry: true, failure_kind: Some(FailureKind::Fatal), status: None },
            ))
        }
    };

    if matches!(meta.mode, RelayMode::Proxy | RelayMode::Responses) {
        let success = dispatch_passthrough(state, &adaptor, meta, ctx).await?;
        settle_and_log(SettleParams::new(state, ctx, channel, meta, pre_reserve, options, start), &success.usage).await;
        return Ok(success.outcome);
    }

    let response = match adaptor.do_request(&state.http_client, meta, ctx.body.clone()).await {
        Ok(r) => r,
        Err(err) => return Err(transport_failure(err)),
    };

    let status = response.status();
    if !status.is_success() {
        let classification = retry::classify_response(status);
        let detail = response.text().await.unwrap_or_default();
        return Err((RelayError::Upstream(format!("upstream returned {status}: {detail}")), classification));
    }

    if meta.is_stream {
        let settle_params = SettleParams::new(state, ctx, channel, meta, pre_reserve, options, start);
        Ok(dispatch_stream(adaptor, meta.clone(), response, options.clone(), settle_params))
    } else {
        let success = dispatch_buffered(adaptor.as_ref(), meta, response, options).await?;
        settle_and_log(SettleParams::new(state, ctx, channel, meta, pre_reserve, options, start), &success.usage).await;
        Ok(success.outcome)
    }
}

async fn dispatch_passthrough(
    state: &SharedState,
    adaptor: &std::sync::Arc<dyn crate::adaptor::Adaptor>,
    meta: &RelayMeta,
    ctx: &RequestContext,
) -> std::result::Result<AttemptSuccess, (RelayError, Classification)> {
    let response = match adaptor.do_request(&state.http_client, meta, ctx.body.clone()).await {
        Ok(r) => r,
        Err(err) => return Err(transport_failure(err)),
    };
    let status = response.status();
    if !status.is_success() {
        let classification = retry::classify_response(status);
        return Err((RelayError::Upstream(format!("upstream returned {status}")), classification));
    }
    let axum_status = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK);
    let mut headers = HeaderMap::new();
    for (name, value) in response.headers() {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.insert(name, value);
        }
    }
    let bytes = response.bytes().await.unwrap_or_default();
    let usage = serde_json::from_slice::<Value>(&bytes)
        .ok()
        .and_then(|v| adaptor.extract_usage(&v))
        .unwrap_or_default();
    Ok(AttemptSuccess {
        outcome: RelayOutcome::Raw { status: axum_status, headers, body: bytes },
        usage,
    })
}

fn transport_failure(err: RelayError) -> (RelayError, Classification) {
    (err, retry::classify_transport_error())
}

async fn dispatch_buffered(
    adaptor: &dyn crate::adaptor::Adaptor,
    meta: &RelayMeta,
    response: reqwest::Response,
    options: &OptionsSnapshot,
) -> std::result::Result<AttemptSuccess, (RelayError, Classification)> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| transport_failure(RelayError::Transport(e)))?;
    let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

    let usage = adaptor.extract_usage(&body).unwrap_or_else(|| {
        let text = adaptor.extract_completion_text(&body);
        let completion_tokens = tokenizer::count_completion(&text, &meta.actual_model, options.approximate_token_enabled);
        Usage {
            prompt_tokens: meta.prompt_tokens,
            completion_tokens,
            total_tokens: meta.prompt_tokens + completion_tokens,
        }
    });

    Ok(AttemptSuccess {
        outcome: RelayOutcome::Buffered { status: StatusCode::OK, body },
        usage,
    })
}

/// Consumes the upstream SSE body as it arrives off the wire — no
/// `bytes().await` pre-drain — forwarding each complete `data: …` frame to
/// the client the moment it is parsed out of the byte stream. This gives
/// the client real backpressure (a slow reader stalls the upstream pull)
/// and means a client disconnect drops the upstream response body instead
/// of finishing a buffered read no one wants anymore. Delta text and any
/// `usage` frame are captured inline as frames pass through; quota is only
/// settled once the stream terminates, whether by a clean `[DONE]`, upstream
/// EOF without one, or a transport error partway through.
fn dispatch_stream(
    adaptor: Arc<dyn crate::adaptor::Adaptor>,
    meta: RelayMeta,
    response: reqwest::Response,
    options: OptionsSnapshot,
    settle: SettleParams,
) -> RelayOutcome {
    let prompt_tokens = meta.prompt_tokens;
    let model = meta.actual_model.clone();
    let approximate = options.approximate_token_enabled;

    let event_stream: BoxEventStream = Box::pin(stream! {
        let mut upstream = response.bytes_stream();
        let mut buf = String::new();
        let mut completion_text = String::new();
        let mut usage: Option<Usage> = None;
        let mut saw_done = false;

        loop {
            let chunk = match upstream.next().await {
                Some(Ok(bytes)) => bytes,
                Some(Err(err)) => {
                    warn!(error = %err, "upstream stream read failed mid-transfer");
                    break;
                }
                None => break,
            };
            buf.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buf.find('\n') {
                let line = buf[..pos].trim_end_matches('\r').to_string();
                buf.drain(..=pos);
                let Some(payload) = line.strip_prefix("data: ") else { continue };
                if payload.trim() == "[DONE]" {
                    saw_done = true;
                    yield Ok(Event::default().data(payload));
                    continue;
                }
                if let Ok(chunk_json) = serde_json::from_str::<Value>(payload) {
                    if let Some(u) = adaptor.extract_usage(&chunk_json) {
                        usage = Some(u);
                    }
                    if let Some(delta) = chunk_json
                        .get("choices")
                        .and_then(Value::as_array)
                        .and_then(|c| c.first())
                        .and_then(|c| c.get("delta"))
                        .and_then(|d| d.get("content"))
                        .and_then(Value::as_str)
                    {
                        completion_text.push_str(delta);
                    }
                }
                yield Ok(Event::default().data(payload));
            }
        }

        // A trailing frame without its final newline, left over when the
        // upstream closed the connection immediately after writing it.
        if let Some(payload) = buf.strip_prefix("data: ") {
            if payload.trim() == "[DONE]" {
                saw_done = true;
            }
            yield Ok(Event::default().data(payload));
        }

        if !saw_done {
            yield Ok(Event::default().data("[DONE]"));
        }

        let usage = usage.unwrap_or_else(|| {
            let completion_tokens = tokenizer::count_completion(&completion_text, &model, approximate);
            Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }
        });
        settle_and_log(settle, &usage).await;
    });

    RelayOutcome::Stream(event_stream)
}

async fn settle_and_log(params: SettleParams, usage: &Usage) {
    let state = &params.state;
    let model_ratio = params
        .model_ratio_override
        .unwrap_or_else(|| params.options.model_ratio(&params.requested_model));
    let completion_ratio = params
        .completion_ratio_override
        .unwrap_or_else(|| params.options.completion_ratio(&params.requested_model));
    let group_ratio = params.options.group_ratio(&params.group);

    let final_quota = ((usage.prompt_tokens as f64) * model_ratio * group_ratio
        + (usage.completion_tokens as f64) * model_ratio * completion_ratio * group_ratio)
        .round() as i64;
    let delta = final_quota - params.pre_reserve;

    if let Err(err) = state.users.adjust_quota(params.user_id, delta).await {
        warn!(error = %err, "failed to settle user quota");
    }
    if !params.token_unlimited_quota {
        if let Err(err) = state.tokens.consume(params.token_id, delta).await {
            warn!(error = %err, "failed to settle token quota");
        }
        if let Err(err) = state.tokens.mark_exhausted_if_depleted(params.token_id).await {
            warn!(error = %err, "failed to check token exhaustion");
        }
    }
    if let Err(err) = state.channels.update_used_quota(params.channel_id, final_quota).await {
        warn!(error = %err, "failed to update channel used_quota");
    }

    // request_count is a pure analytics counter, not part of quota
    // settlement, so it is the one field this step routes through the
    // batch accumulator when batching is on instead of always hitting the
    // row directly.
    if params.options.batch_update_enabled {
        state.batch.add_user_request_count(params.user_id, 1);
    } else if let Err(err) = state.users.increment_request_count(params.user_id, 1).await {
        warn!(error = %err, "failed to increment user request count");
    }

    if params.options.log_consume_enabled {
        let log = Log {
            id: 0,
            user_id: params.user_id,
            username: params.username,
            created_at: Utc::now(),
            log_type: LogType::Consume,
            content: format!("chat via channel {}", params.channel_name),
            token_name: params.token_name,
            model_name: params.actual_model,
            quota: final_quota,
            prompt_tokens: usage.prompt_tokens as i32,
            completion_tokens: usage.completion_tokens as i32,
            channel_id: params.channel_id,
            request_id: params.request_id,
            elapsed_time_ms: params.start.elapsed().as_millis() as i64,
            is_stream: params.is_stream,
            system_prompt_reset: params.system_prompt_reset,
        };
        if let Err(err) = state.logs.record_consume(&log).await {
            warn!(error = %err, "failed to write consume log");
        }
    }
}

fn parse_stream_flag(body: &Bytes) -> bool {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("stream").and_then(Value::as_bool))
        .unwrap_or(false)
}

/// Counts prompt tokens for text-like modes. Chat completions parses the
/// `messages` array through the multimodal-aware counter; other text-like
/// modes (`Completions`, `Edits`) fall back to counting the raw `prompt`
/// string.
fn estimate_prompt_tokens(body: &Bytes, model: &str, approximate: bool) -> u32 {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return 0;
    };
    if let Some(messages) = value.get("messages").and_then(Value::as_array) {
        let parsed: Vec<ChatMessage> = messages
            .iter()
            .filter_map(|m| serde_json::from_value(m.clone()).ok())
            .collect();
        return tokenizer::count_prompt_messages(&parsed, model, approximate);
    }
    if let Some(prompt) = value.get("prompt").and_then(Value::as_str) {
        return tokenizer::count_prompt_text(prompt, model, approximate);
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_stream_flag_reads_true() {
        let body = Bytes::from_static(br#"{"stream": true}"#);
        assert!(parse_stream_flag(&body));
    }

    #[test]
    fn parse_stream_flag_defaults_to_false() {
        let body = Bytes::from_static(br#"{"model": "gpt-4o"}"#);
        assert!(!parse_stream_flag(&body));
    }

    #[test]
    fn estimate_prompt_tokens_from_chat_messages() {
        let body = Bytes::from_static(br#"{"messages":[{"role":"user","content":"hi there"}]}"#);
        let n = estimate_prompt_tokens(&body, "gpt-4o-mini", false);
        assert!(n > 0);
    }

    #[test]
    fn estimate_prompt_tokens_from_raw_prompt() {
        let body = Bytes::from_static(br#"{"prompt":"hello world"}"#);
        let n = estimate_prompt_tokens(&body, "gpt-4o-mini", false);
        assert!(n > 0);
    }

    fn sample_channel(use_responses: bool) -> Channel {
        Channel {
            id: 1,
            channel_type: crate::types::ChannelType::OpenAI,
            key: "sk-test".to_string(),
            status: ChannelStatus::Enabled,
            name: "n".to_string(),
            base_url: None,
            models: "gpt-4o-mini".to_string(),
            group: "default".to_string(),
            model_mapping: None,
            priority: 0,
            weight: 1,
            config: crate::types::ChannelConfig {
                use_responses: use_responses,
                ..Default::default()
            },
            model_ratio: None,
            completion_ratio: None,
            used_quota: 0,
            response_time_ms: 0,
            balance: 0.0,
        }
    }

    #[test]
    fn use_responses_config_downgrades_chat_to_passthrough() {
        let channel = sample_channel(true);
        assert_eq!(effective_mode(&channel, RelayMode::ChatCompletions), RelayMode::Responses);
    }

    #[test]
    fn without_use_responses_mode_is_unchanged() {
        let channel = sample_channel(false);
        assert_eq!(effective_mode(&channel, RelayMode::ChatCompletions), RelayMode::ChatCompletions);
    }

    #[test]
    fn channel_model_ratio_override_takes_precedence() {
        let mut channel = sample_channel(false);
        channel.model_ratio = Some(std::collections::HashMap::from([("gpt-4o-mini".to_string(), 2.5)]));
        assert_eq!(channel.model_ratio_override("gpt-4o-mini"), Some(2.5));
        assert_eq!(channel.model_ratio_override("some-other-model"), None);
    }

    #[test]
    fn channel_without_override_falls_through_to_default_entry() {
        let mut channel = sample_channel(false);
        channel.completion_ratio = Some(std::collections::HashMap::from([("default".to_string(), 1.5)]));
        assert_eq!(channel.completion_ratio_override("anything"), Some(1.5));
    }
}
