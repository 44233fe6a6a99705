//! Option table repository and the process-wide hot-reload snapshot.
//!
//! The Option table is a flat key/value store of operator-tunable
//! settings (retry counts, pricing ratios, toggles). [`OptionsSync`] scans
//! it on a timer and republishes a typed [`OptionsSnapshot`] behind a
//! `tokio::sync::RwLock`, so request-path readers never touch the database
//! to learn the current retry count or pre-consumption ratio.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::Row;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::Result;

use super::pool::DbPool;

/// Keys the gateway still understands. Anything else read off the table is
/// silently ignored; this list is also used to migrate operators off
/// retired wallet/theme settings from the admin panel this crate does not
/// carry.
const KNOWN_KEYS: &[&str] = &[
    "RetryTimes",
    "PreConsumedQuota",
    "QuotaPerUnit",
    "QuotaRemindThreshold",
    "BatchUpdateEnabled",
    "BatchUpdateInterval",
    "ChannelDisableThreshold",
    "AutomaticDisableChannelEnabled",
    "AutomaticEnableChannelEnabled",
    "DefaultGroup",
    "ModelRatio",
    "CompletionRatio",
    "GroupRatio",
    "LogConsumeEnabled",
    "ApproximateTokenEnabled",
    "DisplayInCurrencyEnabled",
];

const OBSOLETE_KEYS: &[&str] = &[
    "WalletLoginEnabled",
    "WalletAutoRegisterEnabled",
    "WalletAllowedChains",
    "AutoRegisterEnabled",
    "Theme",
];

#[derive(Debug, Clone)]
pub struct OptionsSnapshot {
    pub retry_times: u32,
    pub pre_consumed_quota: i64,
    pub quota_per_unit: f64,
    pub quota_remind_threshold: i64,
    pub batch_update_enabled: bool,
    pub batch_update_interval_secs: u64,
    pub channel_disable_threshold: f64,
    pub automatic_disable_channel_enabled: bool,
    pub automatic_enable_channel_enabled: bool,
    pub default_group: String,
    /// Per-model multiplier applied to prompt-token quota; `"default"` is
    /// used for any model without its own entry.
    pub model_ratio: HashMap<String, f64>,
    /// Per-model multiplier applied on top of `model_ratio` for completion
    /// tokens; `"default"` is the fallback entry.
    pub completion_ratio: HashMap<String, f64>,
    /// Per-group multiplier applied to the whole settlement; `"default"`
    /// is the fallback entry.
    pub group_ratio: HashMap<String, f64>,
    pub log_consume_enabled: bool,
    pub approximate_token_enabled: bool,
    pub display_in_currency_enabled: bool,
}

impl Default for OptionsSnapshot {
    fn default() -> Self {
        OptionsSnapshot {
            retry_times: 3,
            pre_consumed_quota: 500,
            quota_per_unit: 500_000.0,
            quota_remind_threshold: 1_000,
            batch_update_enabled: false,
            batch_update_interval_secs: 5,
            channel_disable_threshold: 5.0,
            automatic_disable_channel_enabled: true,
            automatic_enable_channel_enabled: true,
            default_group: "default".to_string(),
            model_ratio: HashMap::from([("default".to_string(), 1.0)]),
            completion_ratio: HashMap::from([("default".to_string(), 1.0)]),
            group_ratio: HashMap::from([("default".to_string(), 1.0)]),
            log_consume_enabled: true,
            approximate_token_enabled: false,
            display_in_currency_enabled: false,
        }
    }
}

impl OptionsSnapshot {
    pub fn model_ratio(&self, model: &str) -> f64 {
        self.model_ratio
            .get(model)
            .or_else(|| self.model_ratio.get("default"))
            .copied()
            .unwrap_or(1.0)
    }

    pub fn completion_ratio(&self, model: &str) -> f64 {
        self.completion_ratio
            .get(model)
            .or_else(|| self.completion_ratio.get("default"))
            .copied()
            .unwrap_or(1.0)
    }

    pub fn group_ratio(&self, group: &str) -> f64 {
        self.group_ratio
            .get(group)
            .or_else(|| self.group_ratio.get("default"))
            .copied()
            .unwrap_or(1.0)
    }
}

impl OptionsSnapshot {
    /// Applies a raw key/value onto a clone of `self`. Malformed numeric
    /// values retain the previous value rather than falling back to a
    /// hardcoded default, per the hot-reload tolerance requirement.
    fn apply(mut self, key: &str, value: &str) -> Self {
        match key {
            "RetryTimes" => {
                if let Ok(v) = value.parse() {
                    self.retry_times = v;
                } else {
                    warn!(key, value, "malformed option value, keeping previous");
                }
            }
            "PreConsumedQuota" => {
                if let Ok(v) = value.parse() {
                    self.pre_consumed_quota = v;
                } else {
                    warn!(key, value, "malformed option value, keeping previous");
                }
            }
            "QuotaPerUnit" => {
                if let Ok(v) = value.parse() {
                    self.quota_per_unit = v;
                } else {
                    warn!(key, value, "malformed option value, keeping previous");
                }
            }
            "BatchUpdateEnabled" => self.batch_update_enabled = value == "true" || value == "1",
            "BatchUpdateInterval" => {
                if let Ok(v) = value.parse() {
                    self.batch_update_interval_secs = v;
                } else {
                    warn!(key, value, "malformed option value, keeping previous");
                }
            }
            "ChannelDisableThreshold" => {
                if let Ok(v) = value.parse() {
                    self.channel_disable_threshold = v;
                } else {
                    warn!(key, value, "malformed option value, keeping previous");
                }
            }
            "AutomaticDisableChannelEnabled" => {
                self.automatic_disable_channel_enabled = value == "true" || value == "1"
            }
            "AutomaticEnableChannelEnabled" => {
                self.automatic_enable_channel_enabled = value == "true" || value == "1"
            }
            "DefaultGroup" => {
                if !value.is_empty() {
                    self.default_group = value.to_string();
                }
            }
            "QuotaRemindThreshold" => {
                if let Ok(v) = value.parse() {
                    self.quota_remind_threshold = v;
                } else {
                    warn!(key, value, "malformed option value, keeping previous");
                }
            }
            "ModelRatio" => match serde_json::from_str(value) {
                Ok(map) => self.model_ratio = map,
                Err(_) => warn!(key, "malformed option value, keeping previous"),
            },
            "CompletionRatio" => match serde_json::from_str(value) {
                Ok(map) => self.completion_ratio = map,
                Err(_) => warn!(key, "malformed option value, keeping previous"),
            },
            "GroupRatio" => match serde_json::from_str(value) {
                Ok(map) => self.group_ratio = map,
                Err(_) => warn!(key, "malformed option value, keeping previous"),
            },
            "LogConsumeEnabled" => self.log_consume_enabled = value == "true" || value == "1",
            "ApproximateTokenEnabled" => {
                self.approximate_token_enabled = value == "true" || value == "1"
            }
            "DisplayInCurrencyEnabled" => {
                self.display_in_currency_enabled = value == "true" || value == "1"
            }
            _ => {}
        }
        self
    }
}

pub struct OptionRepository {
    pool: DbPool,
}

impl OptionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn load_all(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query(r#"SELECT key, value FROM options"#)
            .fetch_all(&self.pool)
            .await?;
        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get("key");
            if OBSOLETE_KEYS.contains(&key.as_str()) {
                continue;
            }
            map.insert(key, row.get::<String, _>("value"));
        }
        Ok(map)
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO options (key, value) VALUES ($1, $2)
               ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value"#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Process-wide holder for the current [`OptionsSnapshot`]. A single
/// instance is constructed in `main` and cloned (cheap `Arc` clone) into
/// every handler/worker that needs it.
#[derive(Clone)]
pub struct OptionsStore {
    inner: Arc<RwLock<OptionsSnapshot>>,
}

impl Default for OptionsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OptionsStore {
    pub fn new() -> Self {
        OptionsStore {
            inner: Arc::new(RwLock::new(OptionsSnapshot::default())),
        }
    }

    pub async fn snapshot(&self) -> OptionsSnapshot {
        self.inner.read().await.clone()
    }

    /// Rebuilds the snapshot from a freshly loaded key/value map, applying
    /// only keys this build understands and dropping everything else.
    pub async fn reload(&self, raw: HashMap<String, String>) {
        let mut next = { self.inner.read().await.clone() };
        for (key, value) in raw {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                continue;
            }
            next = next.apply(&key, &value);
        }
        *self.inner.write().await = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_and_obsolete_keys_are_ignored() {
        let store = OptionsStore::new();
        let mut raw = HashMap::new();
        raw.insert("RetryTimes".to_string(), "7".to_string());
        raw.insert("Theme".to_string(), "dark".to_string());
        raw.insert("SomeFutureKey".to_string(), "x".to_string());
        store.reload(raw).await;
        let snap = store.snapshot().await;
        assert_eq!(snap.retry_times, 7);
    }

    #[tokio::test]
    async fn malformed_numeric_value_keeps_previous() {
        let store = OptionsStore::new();
        let mut raw = HashMap::new();
        raw.insert("RetryTimes".to_string(), "not-a-number".to_string());
        store.reload(raw).await;
        let snap = store.snapshot().await;
        assert_eq!(snap.retry_times, OptionsSnapshot::default().retry_times);
    }

    #[tokio::test]
    async fn model_ratio_falls_back_to_default_entry() {
        let store = OptionsStore::new();
        let mut raw = HashMap::new();
        raw.insert(
            "ModelRatio".to_string(),
            r#"{"default":1.0,"gpt-4o":5.0}"#.to_string(),
        );
        store.reload(raw).await;
        let snap = store.snapshot().await;
        assert_eq!(snap.model_ratio("gpt-4o"), 5.0);
        assert_eq!(snap.model_ratio("unknown-model"), 1.0);
    }

    #[tokio::test]
    async fn malformed_ratio_json_keeps_previous_map() {
        let store = OptionsStore::new();
        let mut raw = HashMap::new();
        raw.insert("ModelRatio".to_string(), "not json".to_string());
        store.reload(raw).await;
        let snap = store.snapshot().await;
        assert_eq!(snap.model_ratio("anything"), 1.0);
    }
}
