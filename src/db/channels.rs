//! Channel repository: the authoritative store for upstream provider
//! configuration. Every insert/update/delete recomputes the associated
//! [`crate::types::Ability`] rows through [`super::abilities::AbilityRepository`]
//! so the two tables never drift apart.

use std::collections::HashMap;
use std::str::FromStr;

use serde_json::Value;
use sqlx::{FromRow, Row};

use crate::error::{RelayError, Result};
use crate::types::{Channel, ChannelConfig, ChannelStatus, ChannelType};

use super::pool::DbPool;

#[derive(FromRow)]
struct ChannelRow {
    id: i64,
    channel_type: String,
    key: String,
    status: String,
    name: String,
    base_url: Option<String>,
    models: String,
    group_list: String,
    model_mapping: Option<String>,
    priority: i64,
    weight: i32,
    config: Option<String>,
    model_ratio: Option<String>,
    completion_ratio: Option<String>,
    used_quota: i64,
    response_time_ms: i64,
    balance: f64,
}

fn status_to_str(status: ChannelStatus) -> &'static str {
    match status {
        ChannelStatus::Unknown => "unknown",
        ChannelStatus::Enabled => "enabled",
        ChannelStatus::ManuallyDisabled => "manually_disabled",
        ChannelStatus::AutoDisabled => "auto_disabled",
    }
}

fn status_from_str(s: &str) -> ChannelStatus {
    match s {
        "enabled" => ChannelStatus::Enabled,
        "manually_disabled" => ChannelStatus::ManuallyDisabled,
        "auto_disabled" => ChannelStatus::AutoDisabled,
        _ => ChannelStatus::Unknown,
    }
}

impl TryFrom<ChannelRow> for Channel {
    type Error = RelayError;

    fn try_from(row: ChannelRow) -> Result<Self> {
        let channel_type = ChannelType::from_str(&row.channel_type)
            .map_err(RelayError::Internal)?;
        let model_mapping: Option<HashMap<String, String>> = row
            .model_mapping
            .filter(|s| !s.is_empty() && s != "{}")
            .and_then(|s| serde_json::from_str(&s).ok());
        let config: ChannelConfig = row
            .config
            .filter(|s| !s.is_empty())
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        let model_ratio: Option<HashMap<String, f64>> = row
            .model_ratio
            .filter(|s| !s.is_empty())
            .and_then(|s| serde_json::from_str(&s).ok());
        let completion_ratio: Option<HashMap<String, f64>> = row
            .completion_ratio
            .filter(|s| !s.is_empty())
            .and_then(|s| serde_json::from_str(&s).ok());

        Ok(Channel {
            id: row.id,
            channel_type,
            key: row.key,
            status: status_from_str(&row.status),
            name: row.name,
            base_url: row.base_url,
            models: row.models,
            group: row.group_list,
            model_mapping,
            priority: row.priority,
            weight: row.weight.max(0) as u32,
            config,
            model_ratio,
            completion_ratio,
            used_quota: row.used_quota,
            response_time_ms: row.response_time_ms,
            balance: row.balance,
        })
    }
}

pub struct ChannelRepository {
    pool: DbPool,
}

impl ChannelRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Channel>> {
        let row = sqlx::query_as::<_, ChannelRow>(
            r#"SELECT id, type as channel_type, key, status, name, base_url, models,
                      "group" as group_list, model_mapping, priority, weight, config,
                      model_ratio, completion_ratio, used_quota, response_time_ms, balance
               FROM channels WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Channel::try_from).transpose()
    }

    pub async fn list(&self, offset: i64, limit: i64) -> Result<Vec<Channel>> {
        let rows = sqlx::query_as::<_, ChannelRow>(
            r#"SELECT id, type as channel_type, key, status, name, base_url, models,
                      "group" as group_list, model_mapping, priority, weight, config,
                      model_ratio, completion_ratio, used_quota, response_time_ms, balance
               FROM channels ORDER BY id ASC OFFSET $1 LIMIT $2"#,
        )
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Channel::try_from).collect()
    }

    pub async fn list_all_enabled(&self) -> Result<Vec<Channel>> {
        let rows = sqlx::query_as::<_, ChannelRow>(
            r#"SELECT id, type as channel_type, key, status, name, base_url, models,
                      "group" as group_list, model_mapping, priority, weight, config,
                      model_ratio, completion_ratio, used_quota, response_time_ms, balance
               FROM channels WHERE status = 'enabled'"#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Channel::try_from).collect()
    }

    /// Channels currently disabled by the health monitor, the only ones the
    /// background canary sweep needs to probe.
    pub async fn list_auto_disabled(&self) -> Result<Vec<Channel>> {
        let rows = sqlx::query_as::<_, ChannelRow>(
            r#"SELECT id, type as channel_type, key, status, name, base_url, models,
                      "group" as group_list, model_mapping, priority, weight, config,
                      model_ratio, completion_ratio, used_quota, response_time_ms, balance
               FROM channels WHERE status = 'auto_disabled'"#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Channel::try_from).collect()
    }

    pub async fn search(&self, keyword: &str) -> Result<Vec<Channel>> {
        let pattern = format!("%{keyword}%");
        let rows = sqlx::query_as::<_, ChannelRow>(
            r#"SELECT id, type as channel_type, key, status, name, base_url, models,
                      "group" as group_list, model_mapping, priority, weight, config,
                      model_ratio, completion_ratio, used_quota, response_time_ms, balance
               FROM channels WHERE name ILIKE $1 OR models ILIKE $1 ORDER BY id ASC"#,
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Channel::try_from).collect()
    }

    /// Inserts the channel row and regenerates its Ability cross-product in
    /// the same call, so the two tables are never observed out of sync by
    /// a caller that only touches the repository layer.
    pub async fn insert_with_abilities(
        &self,
        channel: &Channel,
        abilities: &super::AbilityRepository,
    ) -> Result<i64> {
        let id = self.insert(channel).await?;
        let mut with_id = channel.clone();
        with_id.id = id;
        abilities.regenerate(&with_id).await?;
        Ok(id)
    }

    /// Updates the channel row and regenerates its abilities. Must be used
    /// for every mutation that can affect `models`, `group`, `priority`,
    /// `weight` or `status`, per the Channel & Ability Store invariant.
    pub async fn update_with_abilities(
        &self,
        channel: &Channel,
        abilities: &super::AbilityRepository,
    ) -> Result<()> {
        self.update(channel).await?;
        abilities.regenerate(channel).await
    }

    /// Deletes the channel row and its abilities together.
    pub async fn delete_with_abilities(
        &self,
        id: i64,
        abilities: &super::AbilityRepository,
    ) -> Result<()> {
        abilities.delete_for_channel(id).await?;
        self.delete(id).await
    }

    pub async fn insert(&self, channel: &Channel) -> Result<i64> {
        let model_mapping = channel
            .model_mapping
            .as_ref()
            .map(|m| serde_json::to_string(m).unwrap_or_default());
        let config = serde_json::to_string(&channel.config).unwrap_or_default();
        let row = sqlx::query(
            r#"INSERT INTO channels
                 (type, key, status, name, base_url, models, "group", model_mapping,
                  priority, weight, config, used_quota, response_time_ms, balance)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)
               RETURNING id"#,
        )
        .bind(format!("{:?}", channel.channel_type).to_lowercase())
        .bind(&channel.key)
        .bind(status_to_str(channel.status))
        .bind(&channel.name)
        .bind(&channel.base_url)
        .bind(&channel.models)
        .bind(&channel.group)
        .bind(model_mapping)
        .bind(channel.priority)
        .bind(channel.weight as i32)
        .bind(config)
        .bind(channel.used_quota)
        .bind(channel.response_time_ms)
        .bind(channel.balance)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("id"))
    }

    pub async fn update(&self, channel: &Channel) -> Result<()> {
        let model_mapping = channel
            .model_mapping
            .as_ref()
            .map(|m| serde_json::to_string(m).unwrap_or_default());
        let config = serde_json::to_string(&channel.config).unwrap_or_default();
        sqlx::query(
            r#"UPDATE channels SET
                 status = $1, name = $2, base_url = $3, models = $4, "group" = $5,
                 model_mapping = $6, priority = $7, weight = $8, config = $9
               WHERE id = $10"#,
        )
        .bind(status_to_str(channel.status))
        .bind(&channel.name)
        .bind(&channel.base_url)
        .bind(&channel.models)
        .bind(&channel.group)
        .bind(model_mapping)
        .bind(channel.priority)
        .bind(channel.weight as i32)
        .bind(config)
        .bind(channel.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM channels WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_status(&self, id: i64, status: ChannelStatus) -> Result<()> {
        sqlx::query("UPDATE channels SET status = $1 WHERE id = $2")
            .bind(status_to_str(status))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_used_quota(&self, id: i64, delta: i64) -> Result<()> {
        sqlx::query("UPDATE channels SET used_quota = used_quota + $1 WHERE id = $2")
            .bind(delta)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_response_time(&self, id: i64, response_time_ms: i64) -> Result<()> {
        sqlx::query("UPDATE channels SET response_time_ms = $1 WHERE id = $2")
            .bind(response_time_ms)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_balance(&self, id: i64, balance: f64) -> Result<()> {
        sqlx::query("UPDATE channels SET balance = $1 WHERE id = $2")
            .bind(balance)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Serializes a `serde_json::Value` config blob defensively; used by admin
/// surfaces (out of scope here) when constructing a [`Channel`] from raw
/// JSON. Kept here because it is the one JSON<->Channel boundary the core
/// touches when loading `config` off a row.
pub fn parse_config_value(value: Value) -> ChannelConfig {
    serde_json::from_value(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for s in [
            ChannelStatus::Unknown,
            ChannelStatus::Enabled,
            ChannelStatus::ManuallyDisabled,
            ChannelStatus::AutoDisabled,
        ] {
            assert_eq!(status_from_str(status_to_str(s)), s);
        }
    }
}
