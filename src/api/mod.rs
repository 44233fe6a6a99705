//! HTTP surface: axum router assembly.
//!
//! Every OpenAI-shaped route is served twice — once under `/v1/*` and once
//! under `/api/v1/public/*` — by registering the same handler at both
//! paths, matching the external interfaces contract that the two prefixes
//! are equivalent. `relay::detect_mode` normalises the prefix away so the
//! handler itself never branches on which one was hit.

pub mod handlers;
pub mod middleware;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

const RELAY_PATHS: &[&str] = &[
    "/chat/completions",
    "/completions",
    "/embeddings",
    "/edits",
    "/moderations",
    "/images/generations",
    "/audio/speech",
    "/audio/transcriptions",
    "/audio/translations",
    "/responses",
];

pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut router = Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/models/:id", get(handlers::get_model))
        .route("/api/v1/public/models", get(handlers::list_models))
        .route("/api/v1/public/models/:id", get(handlers::get_model))
        .route("/v1/oneapi/proxy/:channel_id", post(handlers::relay))
        .route("/api/v1/public/oneapi/proxy/:channel_id", post(handlers::relay));

    for path in RELAY_PATHS {
        router = router
            .route(&format!("/v1{path}"), post(handlers::relay))
            .route(&format!("/api/v1/public{path}"), post(handlers::relay));
    }

    router
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), middleware::rate_limit))
        .layer(DefaultBodyLimit::max(50 * 1024 * 1024))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(tower_http::compression::CompressionLayer::new()),
        )
        .with_state(state)
}
