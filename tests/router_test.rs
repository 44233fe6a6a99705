//! Router-level tests driving the full axum app through `tower::ServiceExt`.
//! State is built with a lazily-connecting pool so these never need a live
//! Postgres instance; every path exercised here returns before issuing a
//! query.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use sqlx::postgres::PgPoolOptions;
use tower::ServiceExt;

use relaymux::api::build_router;
use relaymux::config::{Config, DatabaseConfig, ServerConfig};
use relaymux::ratelimit::{RateLimiters, RedisRateLimiter};
use relaymux::state::{AppState, SharedState};

fn test_state() -> SharedState {
    let config = Config {
        server: ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 3000,
            cors_origins: vec!["*".to_string()],
        },
        database: DatabaseConfig {
            url: "postgresql://localhost/relaymux_test".to_string(),
            max_connections: 5,
            min_connections: 0,
        },
        logs_database: DatabaseConfig {
            url: "postgresql://localhost/relaymux_test".to_string(),
            max_connections: 5,
            min_connections: 0,
        },
        redis: None,
        sync_frequency_secs: 10,
        channel_test_frequency_secs: 300,
        batch_update_enabled: false,
        batch_update_interval_secs: 5,
        log_dir: None,
        rate_limit_global_rps: 200,
        rate_limit_per_ip_rps: 10,
    };
    let pool = PgPoolOptions::new().connect_lazy(&config.database.url).unwrap();
    let rate_limiters = RedisRateLimiter::new(RateLimiters::new(200, 10), None);
    let http_client = reqwest::Client::new();
    std::sync::Arc::new(AppState::new(config, pool.clone(), pool, rate_limiters, http_client))
}

#[tokio::test]
async fn healthz_reports_ok_without_touching_the_database() {
    let app = build_router(test_state());

    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn relay_without_authorization_header_returns_openai_shaped_error() {
    let app = build_router(test_state());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"model":"gpt-4o-mini","messages":[]}"#))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn public_prefix_serves_the_same_healthz_semantics_as_v1() {
    // /healthz has no dual-prefix variant; this instead checks that the
    // public proxy alias for a relay path reaches the same auth gate as the
    // v1 one, matching the "equivalent prefixes" external interface.
    let app = build_router(test_state());

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/public/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"model":"gpt-4o-mini","messages":[]}"#))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_route_returns_not_found() {
    let app = build_router(test_state());

    let response = app
        .oneshot(Request::builder().uri("/v1/not-a-real-route").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
