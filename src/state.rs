//! Shared application state, built once in `main` and handed to every
//! handler/worker behind an `Arc`.
//!
//! Bundles a router, provider registry and database pool behind one
//! struct injected via axum's `State` extractor, generalised to the
//! larger set of long-lived collaborators the relay pipeline needs (two
//! pools, the hot-reloaded options snapshot, the channel cache, the
//! health monitor, the batch accumulator and the adaptor registry).

use std::sync::Arc;

use crate::adaptor::AdaptorRegistry;
use crate::cache::ChannelCache;
use crate::config::Config;
use crate::db::{
    AbilityRepository, BatchAccumulator, ChannelRepository, DbPool, LogRepository,
    OptionRepository, OptionsStore, TokenRepository, UserRepository,
};
use crate::health::HealthMonitor;
use crate::ratelimit::RedisRateLimiter;

pub struct AppState {
    pub config: Config,
    pub primary_pool: DbPool,
    pub logs_pool: DbPool,

    pub users: UserRepository,
    pub tokens: TokenRepository,
    pub channels: ChannelRepository,
    pub abilities: AbilityRepository,
    pub logs: LogRepository,
    pub options_repo: OptionRepository,

    pub options: OptionsStore,
    pub cache: ChannelCache,
    pub health: HealthMonitor,
    pub batch: BatchAccumulator,
    pub rate_limiters: RedisRateLimiter,
    pub adaptors: AdaptorRegistry,
    pub http_client: reqwest::Client,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        primary_pool: DbPool,
        logs_pool: DbPool,
        rate_limiters: RedisRateLimiter,
        http_client: reqwest::Client,
    ) -> Self {
        let channels = ChannelRepository::new(primary_pool.clone());
        let abilities = AbilityRepository::new(primary_pool.clone());
        let health = HealthMonitor::new(ChannelRepository::new(primary_pool.clone()), AbilityRepository::new(primary_pool.clone()));
        let batch = BatchAccumulator::new(primary_pool.clone());

        AppState {
            users: UserRepository::new(primary_pool.clone()),
            tokens: TokenRepository::new(primary_pool.clone()),
            channels,
            abilities,
            logs: LogRepository::new(logs_pool.clone()),
            options_repo: OptionRepository::new(primary_pool.clone()),
            options: OptionsStore::new(),
            cache: ChannelCache::new(),
            health,
            batch,
            rate_limiters,
            adaptors: AdaptorRegistry::new(),
            http_client,
            config,
            primary_pool,
            logs_pool,
        }
    }
}
