//! Append-only consumption log repository.
//!
//! Writes go against the dedicated `logs` pool (see [`super::pool`]) so a
//! burst of relay traffic logging cannot contend with the primary schema's
//! routing reads. Log rows are written once, after settlement, and never
//! updated.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::error::Result;
use crate::types::{Log, LogType};

use super::pool::DbPool;

#[derive(FromRow)]
struct LogRow {
    id: i64,
    user_id: i64,
    username: String,
    created_at: DateTime<Utc>,
    log_type: String,
    content: String,
    token_name: String,
    model_name: String,
    quota: i64,
    prompt_tokens: i32,
    completion_tokens: i32,
    channel_id: i64,
    request_id: String,
    elapsed_time_ms: i64,
    is_stream: bool,
    system_prompt_reset: bool,
}

fn log_type_from_str(s: &str) -> LogType {
    match s {
        "topup" => LogType::Topup,
        "consume" => LogType::Consume,
        "manage" => LogType::Manage,
        "system" => LogType::System,
        "test" => LogType::Test,
        _ => LogType::Unknown,
    }
}

fn log_type_to_str(t: LogType) -> &'static str {
    match t {
        LogType::Unknown => "unknown",
        LogType::Topup => "topup",
        LogType::Consume => "consume",
        LogType::Manage => "manage",
        LogType::System => "system",
        LogType::Test => "test",
    }
}

impl From<LogRow> for Log {
    fn from(row: LogRow) -> Self {
        Log {
            id: row.id,
            user_id: row.user_id,
            username: row.username,
            created_at: row.created_at,
            log_type: log_type_from_str(&row.log_type),
            content: row.content,
            token_name: row.token_name,
            model_name: row.model_name,
            quota: row.quota,
            prompt_tokens: row.prompt_tokens,
            completion_tokens: row.completion_tokens,
            channel_id: row.channel_id,
            request_id: row.request_id,
            elapsed_time_ms: row.elapsed_time_ms,
            is_stream: row.is_stream,
            system_prompt_reset: row.system_prompt_reset,
        }
    }
}

pub struct LogRepository {
    pool: DbPool,
}

impl LogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_consume(&self, log: &Log) -> Result<i64> {
        let row = sqlx::query(
            r#"INSERT INTO logs
                 (user_id, username, created_at, log_type, content, token_name, model_name,
                  quota, prompt_tokens, completion_tokens, channel_id, request_id,
                  elapsed_time_ms, is_stream, system_prompt_reset)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
               RETURNING id"#,
        )
        .bind(log.user_id)
        .bind(&log.username)
        .bind(log.created_at)
        .bind(log_type_to_str(log.log_type))
        .bind(&log.content)
        .bind(&log.token_name)
        .bind(&log.model_name)
        .bind(log.quota)
        .bind(log.prompt_tokens)
        .bind(log.completion_tokens)
        .bind(log.channel_id)
        .bind(&log.request_id)
        .bind(log.elapsed_time_ms)
        .bind(log.is_stream)
        .bind(log.system_prompt_reset)
        .fetch_one(&self.pool)
        .await?;
        Ok(sqlx::Row::get::<i64, _>(&row, "id"))
    }

    pub async fn list_for_user(&self, user_id: i64, offset: i64, limit: i64) -> Result<Vec<Log>> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"SELECT id, user_id, username, created_at, log_type, content, token_name,
                      model_name, quota, prompt_tokens, completion_tokens, channel_id,
                      request_id, elapsed_time_ms, is_stream, system_prompt_reset
               FROM logs WHERE user_id = $1 ORDER BY created_at DESC OFFSET $2 LIMIT $3"#,
        )
        .bind(user_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Log::from).collect())
    }

    pub async fn sum_quota_for_channel_since(
        &self,
        channel_id: i64,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(quota), 0) as total FROM logs WHERE channel_id = $1 AND created_at >= $2",
        )
        .bind(channel_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(sqlx::Row::get::<i64, _>(&row, "total"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_type_round_trips() {
        for t in [
            LogType::Unknown,
            LogType::Topup,
            LogType::Consume,
            LogType::Manage,
            LogType::System,
            LogType::Test,
        ] {
            assert_eq!(log_type_from_str(log_type_to_str(t)), t);
        }
    }
}
