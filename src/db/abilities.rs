//! Ability repository.
//!
//! Abilities are a derived materialised view: `{channels} x {channel.groups}
//! x {channel.models}` filtered by channel status. The core never writes an
//! Ability row directly; it always goes through [`AbilityRepository::regenerate`],
//! which is called by [`super::channels::ChannelRepository`] callers whenever
//! a channel's `models`, `group`, `priority`, `weight` or `status` changes.

use sqlx::{FromRow, Row};

use crate::error::Result;
use crate::types::{Ability, Channel, ChannelStatus};

use super::pool::DbPool;

#[derive(FromRow)]
struct AbilityRow {
    #[sqlx(rename = "group")]
    group_name: String,
    model: String,
    channel_id: i64,
    enabled: bool,
    priority: i64,
    weight: i32,
}

impl From<AbilityRow> for Ability {
    fn from(row: AbilityRow) -> Self {
        Ability {
            group: row.group_name,
            model: row.model,
            channel_id: row.channel_id,
            enabled: row.enabled,
            priority: row.priority,
            weight: row.weight.max(0) as u32,
        }
    }
}

pub struct AbilityRepository {
    pool: DbPool,
}

impl AbilityRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Deletes every ability row for `channel.id` and re-inserts the
    /// cross-product of its (deduplicated) groups and models. This is the
    /// only path that creates or mutates ability rows besides `set_enabled`.
    pub async fn regenerate(&self, channel: &Channel) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM abilities WHERE channel_id = $1")
            .bind(channel.id)
            .execute(&mut *tx)
            .await?;

        let enabled = channel.status == ChannelStatus::Enabled;
        let mut seen_models: Vec<&str> = channel.model_list().collect();
        seen_models.dedup();

        for model in &seen_models {
            for group in channel.groups() {
                sqlx::query(
                    r#"INSERT INTO abilities ("group", model, channel_id, enabled, priority, weight)
                       VALUES ($1, $2, $3, $4, $5, $6)"#,
                )
                .bind(group)
                .bind(*model)
                .bind(channel.id)
                .bind(enabled)
                .bind(channel.priority)
                .bind(channel.weight as i32)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_for_channel(&self, channel_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM abilities WHERE channel_id = $1")
            .bind(channel_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_enabled(&self, channel_id: i64, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE abilities SET enabled = $1 WHERE channel_id = $2")
            .bind(enabled)
            .bind(channel_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Full table scan used by the channel cache syncher; never called on
    /// the hot request path.
    pub async fn list_all_enabled(&self) -> Result<Vec<Ability>> {
        let rows = sqlx::query_as::<_, AbilityRow>(
            r#"SELECT "group", model, channel_id, enabled, priority, weight
               FROM abilities WHERE enabled = true"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Ability::from).collect())
    }

    /// Cache-bypass read path used when a caller needs strictly fresh
    /// routing data (e.g. immediately after an admin reconfigures a
    /// channel).
    pub async fn list_for_group_model(&self, group: &str, model: &str) -> Result<Vec<Ability>> {
        let rows = sqlx::query_as::<_, AbilityRow>(
            r#"SELECT "group", model, channel_id, enabled, priority, weight
               FROM abilities WHERE "group" = $1 AND model = $2 AND enabled = true"#,
        )
        .bind(group)
        .bind(model)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Ability::from).collect())
    }

    pub async fn group_models(&self, group: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"SELECT DISTINCT model FROM abilities WHERE "group" = $1 AND enabled = true ORDER BY model"#,
        )
        .bind(group)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("model")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelConfig, ChannelType};

    fn sample_channel() -> Channel {
        Channel {
            id: 7,
            channel_type: ChannelType::OpenAI,
            key: "k".to_string(),
            status: ChannelStatus::Enabled,
            name: "n".to_string(),
            base_url: None,
            models: "gpt-4o-mini,gpt-4o-mini".to_string(),
            group: "default,vip".to_string(),
            model_mapping: None,
            priority: 5,
            weight: 2,
            config: ChannelConfig::default(),
            model_ratio: None,
            completion_ratio: None,
            used_quota: 0,
            response_time_ms: 0,
            balance: 0.0,
        }
    }

    #[test]
    fn dedups_models_before_cross_product() {
        let channel = sample_channel();
        let models: Vec<&str> = channel.model_list().collect();
        assert_eq!(models, vec!["gpt-4o-mini", "gpt-4o-mini"]);
        let mut deduped = models.clone();
        deduped.dedup();
        assert_eq!(deduped, vec!["gpt-4o-mini"]);
    }
}
