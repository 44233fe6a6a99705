//! Rate-limiting middleware layer, applied ahead of every relay route.
//!
//! Checks the global bucket first (cheapest check, protects the whole
//! process), then the per-IP bucket (optionally mirrored through Redis for
//! multi-instance deployments via [`crate::ratelimit::RedisRateLimiter`]).

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::RelayError;
use crate::state::SharedState;

pub async fn rate_limit<B>(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<B>,
    next: Next<B>,
) -> Response {
    if !state.rate_limiters.check_global() {
        return RelayError::RateLimited.into_response();
    }
    if !state
        .rate_limiters
        .check_ip(addr.ip(), state.config.rate_limit_per_ip_rps)
        .await
    {
        return RelayError::RateLimited.into_response();
    }
    next.run(request).await
}
