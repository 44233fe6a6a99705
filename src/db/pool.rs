//! Database connection pools.
//!
//! The gateway holds two independent pools: `primary` for users, tokens,
//! channels, abilities and options, and `logs` for the append-only
//! consumption log. Splitting them means a burst of log writes on the
//! consume-heavy relay path cannot starve reads/writes against the primary
//! schema that routing depends on.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::DatabaseConfig;

pub type DbPool = PgPool;

pub async fn init_pool(cfg: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .min_connections(cfg.min_connections)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .connect(&cfg.url)
        .await
}
