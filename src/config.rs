//! Configuration management for the relay gateway.

use std::env;

/// Process-wide tunables loaded once at startup from `.env`, an optional
/// `config.toml`, and environment variables. Tunables that can change at
/// runtime (ratios, retry counts, toggles) live in [`crate::options`]
/// instead, which is hot-reloaded from the `Option` table.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logs_database: DatabaseConfig,
    pub redis: Option<RedisConfig>,
    pub sync_frequency_secs: u64,
    pub channel_test_frequency_secs: u64,
    pub batch_update_enabled: bool,
    pub batch_update_interval_secs: u64,
    pub log_dir: Option<String>,
    pub rate_limit_global_rps: u32,
    pub rate_limit_per_ip_rps: u32,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub conn_string: String,
}

impl Config {
    /// Load configuration from environment variables, an optional
    /// `config.toml`/`config.json` in the working directory, and a `.env`
    /// file if present. Environment variables under the `RELAYMUX__` prefix
    /// override file-sourced values; the well-known deployment env vars
    /// (`PORT`, `SQL_DSN`, `REDIS_CONN_STRING`, ...) are read directly so
    /// operators don't need to know the internal prefix.
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        let builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("server.cors_origins", vec!["*"])?
            .set_default("database.max_connections", 20)?
            .set_default("database.min_connections", 5)?
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("RELAYMUX").separator("__"));

        let loaded = builder.build()?;

        let port: u16 = env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| loaded.get("server.port").unwrap_or(3000));

        let sql_dsn = env::var("SQL_DSN")
            .or_else(|_| env::var("DATABASE_URL"))
            .unwrap_or_else(|_| "postgresql://localhost/relaymux".to_string());
        let log_sql_dsn = env::var("LOG_SQL_DSN").unwrap_or_else(|_| sql_dsn.clone());

        Ok(Config {
            server: ServerConfig {
                host: loaded.get("server.host").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port,
                cors_origins: loaded
                    .get("server.cors_origins")
                    .unwrap_or_else(|_| vec!["*".to_string()]),
            },
            database: DatabaseConfig {
                url: sql_dsn,
                max_connections: loaded.get("database.max_connections").unwrap_or(20),
                min_connections: loaded.get("database.min_connections").unwrap_or(5),
            },
            logs_database: DatabaseConfig {
                url: log_sql_dsn,
                max_connections: loaded.get("database.max_connections").unwrap_or(20),
                min_connections: loaded.get("database.min_connections").unwrap_or(5),
            },
            redis: env::var("REDIS_CONN_STRING").ok().map(|conn_string| RedisConfig { conn_string }),
            sync_frequency_secs: env::var("SYNC_FREQUENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            channel_test_frequency_secs: env::var("CHANNEL_TEST_FREQUENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            batch_update_enabled: env::var("BATCH_UPDATE_ENABLED")
                .ok()
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            batch_update_interval_secs: env::var("BATCH_UPDATE_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            log_dir: env::var("LOG_DIR").ok(),
            rate_limit_global_rps: env::var("RATE_LIMIT_GLOBAL_RPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(200),
            rate_limit_per_ip_rps: env::var("RATE_LIMIT_PER_IP_RPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_loads_with_defaults() {
        let config = Config::load();
        assert!(config.is_ok());
    }

    #[test]
    fn server_addr_combines_host_and_port() {
        let config = Config::load().unwrap();
        assert!(config.server_addr().contains(':'));
    }
}
