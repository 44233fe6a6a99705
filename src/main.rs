//! relaymux - OpenAI-compatible multi-channel relay gateway
//!
//! Entry point: load config, stand up the two database pools, build the
//! shared application state, spawn the background workers the relay path
//! depends on (option hot-reload, channel cache sync, batch counter flush,
//! auto-disabled channel canary sweep) and serve the HTTP surface.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relaymux::api::build_router;
use relaymux::config::Config;
use relaymux::db;
use relaymux::ratelimit::{RateLimiters, RedisRateLimiter};
use relaymux::state::{AppState, SharedState};

/// `relaymux` - OpenAI-compatible multi-channel relay gateway.
///
/// Flags override the matching environment variable, which in turn
/// overrides a file-sourced default; see [`relaymux::config::Config`] for
/// the rest of the tunables this binary reads straight from the
/// environment (`SQL_DSN`, `REDIS_CONN_STRING`, `SYNC_FREQUENCY`, ...).
#[derive(Parser, Debug)]
#[command(name = "relaymux", version, about, long_about = None)]
struct Cli {
    /// Listening port. Overrides the `PORT` environment variable.
    #[arg(long)]
    port: Option<u16>,

    /// Directory to write log files into, in addition to stderr.
    #[arg(long = "log-dir")]
    log_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relaymux=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting relaymux v{}", env!("CARGO_PKG_VERSION"));

    if let Some(port) = cli.port {
        std::env::set_var("PORT", port.to_string());
    }
    if let Some(log_dir) = &cli.log_dir {
        std::env::set_var("LOG_DIR", log_dir);
    }

    let config = match Config::load() {
        Ok(c) => c,
        Err(err) => {
            tracing::error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    tracing::info!("configuration loaded");

    if let Some(log_dir) = &config.log_dir {
        if let Err(err) = std::fs::create_dir_all(log_dir) {
            tracing::error!(error = %err, log_dir, "could not create log directory");
            std::process::exit(1);
        }
    }

    let primary_pool = db::init_pool(&config.database).await?;
    tracing::info!("connected to primary database");
    let logs_pool = if config.logs_database.url == config.database.url {
        primary_pool.clone()
    } else {
        db::init_pool(&config.logs_database).await?
    };
    tracing::info!("connected to logs database");

    // A finite timeout here is what bounds non-streaming relay calls; the
    // streaming path issues its own per-request client with no timeout so a
    // long-lived SSE upstream is never cut off mid-response.
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()?;

    let redis_conn = match &config.redis {
        Some(redis_cfg) => match redis::Client::open(redis_cfg.conn_string.clone()) {
            Ok(client) => match redis::aio::ConnectionManager::new(client).await {
                Ok(conn) => {
                    tracing::info!("connected to redis for distributed rate limiting");
                    Some(conn)
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to connect to redis, falling back to in-process rate limiting");
                    None
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "invalid redis connection string, falling back to in-process rate limiting");
                None
            }
        },
        None => None,
    };
    let rate_limiters = RedisRateLimiter::new(
        RateLimiters::new(config.rate_limit_global_rps, config.rate_limit_per_ip_rps),
        redis_conn,
    );

    let state: SharedState = std::sync::Arc::new(AppState::new(
        config.clone(),
        primary_pool,
        logs_pool,
        rate_limiters,
        http_client,
    ));

    let raw_options = state.options_repo.load_all().await?;
    state.options.reload(raw_options).await;
    state.cache.sync(&state.abilities).await?;
    tracing::info!("initial options and channel cache loaded");

    spawn_options_sync(state.clone());
    spawn_cache_sync(state.clone());
    if config.batch_update_enabled {
        spawn_batch_flush(state.clone());
    }
    spawn_health_sweep(state.clone());

    let app = build_router(state.clone());

    let addr: SocketAddr = config.server_addr().parse()?;
    tracing::info!("http server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if config.batch_update_enabled {
        if let Err(err) = state.batch.flush().await {
            tracing::error!(error = %err, "final batch counter flush failed");
        }
    }

    Ok(())
}

fn spawn_options_sync(state: SharedState) {
    let interval = Duration::from_secs(state.config.sync_frequency_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match state.options_repo.load_all().await {
                Ok(raw) => state.options.reload(raw).await,
                Err(err) => tracing::warn!(error = %err, "options sync failed"),
            }
        }
    });
}

fn spawn_cache_sync(state: SharedState) {
    let interval = Duration::from_secs(state.config.sync_frequency_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = state.cache.sync(&state.abilities).await {
                tracing::warn!(error = %err, "channel cache sync failed");
            }
        }
    });
}

fn spawn_batch_flush(state: SharedState) {
    let interval = Duration::from_secs(state.config.batch_update_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = state.batch.flush().await {
                tracing::error!(error = %err, "batch counter flush failed");
            }
        }
    });
}

fn spawn_health_sweep(state: SharedState) {
    let interval = Duration::from_secs(state.config.channel_test_frequency_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let options = state.options.snapshot().await;
            let probe_state = state.clone();
            let result = state
                .health
                .sweep_auto_disabled(&options, move |channel_id| {
                    let state = probe_state.clone();
                    async move { canary_probe(&state, channel_id).await }
                })
                .await;
            if let Err(err) = result {
                tracing::warn!(error = %err, "auto-disabled channel sweep failed");
            }
        }
    });
}

/// Minimal chat completion against a channel's first listed model, used
/// only to decide whether an auto-disabled channel has recovered.
async fn canary_probe(state: &SharedState, channel_id: i64) -> bool {
    let Ok(Some(channel)) = state.channels.get_by_id(channel_id).await else {
        return false;
    };
    let Some(model) = channel.models.split(',').map(str::trim).find(|m| !m.is_empty()) else {
        return false;
    };
    let Ok(adaptor) = state.adaptors.get(channel.channel_type) else {
        return false;
    };

    let meta = relaymux::relay::RelayMeta {
        channel_id: channel.id,
        channel_type: channel.channel_type,
        base_url: channel.base_url.clone(),
        api_key: channel.key.clone(),
        region: channel.config.region.clone(),
        api_version: channel.config.api_version.clone(),
        project_id: channel.config.project_id.clone(),
        mode: relaymux::types::RelayMode::ChatCompletions,
        requested_model: model.to_string(),
        actual_model: model.to_string(),
        forced_system_prompt: None,
        is_stream: false,
        prompt_tokens: 1,
        request_id: "canary".to_string(),
    };
    let body = bytes::Bytes::from(
        serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": "ping"}],
            "max_tokens": 1,
        })
        .to_string(),
    );
    adaptor
        .do_request(&state.http_client, &meta, body)
        .await
        .map(|resp| resp.status().is_success())
        .unwrap_or(false)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, draining connections");
}
