//! HTTP handlers. One generic relay handler serves every OpenAI-shaped
//! route; mode-specific behaviour lives in [`crate::relay::pipeline`] and
//! the adaptors, not here — this layer only does auth, context assembly
//! and response rendering.

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, OriginalUri, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::relay::auth::{authorize, parse_key_and_pin, AuthContext};
use crate::relay::pipeline::{self, RelayOutcome, RequestContext};
use crate::relay::{self};
use crate::state::SharedState;

/// Resolves the caller's IP for subnet enforcement: prefers the first hop
/// of `X-Forwarded-For` (set by a reverse proxy in front of this gateway),
/// falling back to the raw TCP peer address.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<std::net::IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|ip| ip.trim().parse().ok())
        .or_else(|| peer.map(|addr| addr.ip()))
}

async fn authenticate(
    state: &SharedState,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
) -> Result<AuthContext> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RelayError::Authentication("missing Authorization header".to_string()))?;

    let (key, pin) = parse_key_and_pin(raw);
    let token = state
        .tokens
        .get_by_key(key)
        .await?
        .ok_or_else(|| RelayError::Authentication("invalid API key".to_string()))?;
    let user = state
        .users
        .get_by_id(token.user_id)
        .await?
        .ok_or_else(|| RelayError::Authentication("token owner no longer exists".to_string()))?;

    authorize(token, user, pin, client_ip(headers, peer), Utc::now().timestamp())
}

fn extract_proxy_channel_id(path: &str) -> Option<i64> {
    path.rsplit('/').next().and_then(|segment| segment.parse().ok())
}

fn extract_requested_model(body: &Bytes) -> String {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("model").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default()
}

/// Shared entry point for every OpenAI-shaped relay route. Path-based mode
/// detection, auth, model-allowlist enforcement and context assembly all
/// happen here; `pipeline::run` does everything else.
pub async fn relay(
    State(state): State<SharedState>,
    OriginalUri(uri): OriginalUri,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let path = uri.path();
    let mode = relay::detect_mode(path);
    let auth = authenticate(&state, &headers, peer.map(|ConnectInfo(addr)| addr)).await?;

    let pinned_channel_id = match mode {
        crate::types::RelayMode::Proxy => extract_proxy_channel_id(path),
        _ => auth.pinned_channel_id,
    };

    let requested_model = extract_requested_model(&body);
    if !requested_model.is_empty() && !auth.token.allows_model(&requested_model) {
        return Err(RelayError::Permission(format!(
            "token is not allowed to use model '{requested_model}'"
        )));
    }

    let options = state.options.snapshot().await;
    let group = if auth.user.group.is_empty() {
        options.default_group.clone()
    } else {
        auth.user.group.clone()
    };

    let ctx = RequestContext {
        user: auth.user,
        token: auth.token,
        group,
        requested_model,
        forced_system_prompt: None,
        pinned_channel_id,
        mode,
        body,
        request_id: Uuid::new_v4().to_string(),
    };

    let outcome = pipeline::run(&state, ctx).await?;
    Ok(render(outcome))
}

fn render(outcome: RelayOutcome) -> Response {
    match outcome {
        RelayOutcome::Buffered { status, body } => (status, Json(body)).into_response(),
        RelayOutcome::Stream(stream) => {
            Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
        }
        RelayOutcome::Raw { status, headers, body } => {
            let mut response = Response::builder().status(status);
            if let Some(h) = response.headers_mut() {
                *h = headers;
            }
            response.body(axum::body::Body::from(body)).unwrap_or_else(|_| {
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            })
        }
    }
}

/// `GET /v1/models`: the union of models enabled for the caller's group,
/// rendered in the OpenAI `list` envelope.
pub async fn list_models(
    State(state): State<SharedState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let auth = authenticate(&state, &headers, peer.map(|ConnectInfo(addr)| addr)).await?;
    let options = state.options.snapshot().await;
    let group = if auth.user.group.is_empty() {
        options.default_group.clone()
    } else {
        auth.user.group.clone()
    };
    let models = state.abilities.group_models(&group).await?;
    let data: Vec<Value> = models
        .into_iter()
        .map(|id| json!({"id": id, "object": "model", "owned_by": "relaymux"}))
        .collect();
    Ok(Json(json!({"object": "list", "data": data})))
}

/// `GET /v1/models/{id}`: existence check against the caller's group.
pub async fn get_model(
    State(state): State<SharedState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(model_id): Path<String>,
) -> Result<Json<Value>> {
    let auth = authenticate(&state, &headers, peer.map(|ConnectInfo(addr)| addr)).await?;
    let options = state.options.snapshot().await;
    let group = if auth.user.group.is_empty() {
        options.default_group.clone()
    } else {
        auth.user.group.clone()
    };
    let models = state.abilities.group_models(&group).await?;
    if !models.iter().any(|m| m == &model_id) {
        return Err(RelayError::InvalidRequest(format!("model '{model_id}' not found")));
    }
    Ok(Json(json!({"id": model_id, "object": "model", "owned_by": "relaymux"})))
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}
