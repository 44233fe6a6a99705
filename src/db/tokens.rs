//! Token repository: API key lookup and per-token quota bookkeeping.
//!
//! Mirrors [`super::users::UserRepository`]'s direct-path discipline —
//! `consume`/`refund` are atomic SQL updates, never read-modify-write in
//! application code, so concurrent requests against the same token cannot
//! race past each other's deduction.

use sqlx::FromRow;

use crate::error::Result;
use crate::types::{Token, TokenStatus};

use super::pool::DbPool;

#[derive(FromRow)]
struct TokenRow {
    id: i64,
    user_id: i64,
    key: String,
    name: String,
    status: String,
    remain_quota: i64,
    used_quota: i64,
    unlimited_quota: bool,
    expired_time: i64,
    subnet: Option<String>,
    models: Option<String>,
}

fn status_from_str(s: &str) -> TokenStatus {
    match s {
        "disabled" => TokenStatus::Disabled,
        "expired" => TokenStatus::Expired,
        "exhausted" => TokenStatus::Exhausted,
        _ => TokenStatus::Enabled,
    }
}

fn status_to_str(status: TokenStatus) -> &'static str {
    match status {
        TokenStatus::Enabled => "enabled",
        TokenStatus::Disabled => "disabled",
        TokenStatus::Expired => "expired",
        TokenStatus::Exhausted => "exhausted",
    }
}

impl From<TokenRow> for Token {
    fn from(row: TokenRow) -> Self {
        Token {
            id: row.id,
            user_id: row.user_id,
            key: row.key,
            name: row.name,
            status: status_from_str(&row.status),
            remain_quota: row.remain_quota,
            used_quota: row.used_quota,
            unlimited_quota: row.unlimited_quota,
            expired_time: row.expired_time,
            subnet: row.subnet,
            models: row.models,
        }
    }
}

pub struct TokenRepository {
    pool: DbPool,
}

impl TokenRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Looks a token up by its raw key. The caller is expected to have
    /// already stripped the `sk-`/`Bearer ` prefix and any `-<channel_id>`
    /// admin pin suffix before calling this.
    pub async fn get_by_key(&self, key: &str) -> Result<Option<Token>> {
        let row = sqlx::query_as::<_, TokenRow>(
            r#"SELECT id, user_id, key, name, status, remain_quota, used_quota,
                      unlimited_quota, expired_time, subnet, models
               FROM tokens WHERE key = $1"#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Token::from))
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Token>> {
        let row = sqlx::query_as::<_, TokenRow>(
            r#"SELECT id, user_id, key, name, status, remain_quota, used_quota,
                      unlimited_quota, expired_time, subnet, models
               FROM tokens WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Token::from))
    }

    /// Atomic deduction. No-op on quota fields when `unlimited_quota` is
    /// set, matching the "unlimited tokens never exhaust" invariant; the
    /// caller should skip calling this in that case entirely, this guard
    /// is a backstop.
    pub async fn consume(&self, token_id: i64, delta: i64) -> Result<()> {
        sqlx::query(
            r#"UPDATE tokens SET
                 remain_quota = CASE WHEN unlimited_quota THEN remain_quota ELSE remain_quota - $1 END,
                 used_quota = used_quota + $1
               WHERE id = $2"#,
        )
        .bind(delta)
        .bind(token_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn refund(&self, token_id: i64, delta: i64) -> Result<()> {
        self.consume(token_id, -delta).await
    }

    /// Conditional atomic reservation: debits `amount` unless
    /// `unlimited_quota`, failing (without writing) when it would drive
    /// `remain_quota` negative. Mirrors
    /// [`super::users::UserRepository::reserve_quota`].
    pub async fn reserve(&self, token_id: i64, amount: i64) -> Result<bool> {
        let row = sqlx::query(
            r#"UPDATE tokens SET
                 remain_quota = CASE WHEN unlimited_quota THEN remain_quota ELSE remain_quota - $1 END,
                 used_quota = used_quota + $1
               WHERE id = $2 AND (unlimited_quota OR remain_quota >= $1)
               RETURNING id"#,
        )
        .bind(amount)
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn set_status(&self, token_id: i64, status: TokenStatus) -> Result<()> {
        sqlx::query("UPDATE tokens SET status = $1 WHERE id = $2")
            .bind(status_to_str(status))
            .bind(token_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_exhausted_if_depleted(&self, token_id: i64) -> Result<()> {
        sqlx::query(
            r#"UPDATE tokens SET status = 'exhausted'
               WHERE id = $1 AND unlimited_quota = false AND remain_quota <= 0"#,
        )
        .bind(token_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for s in [
            TokenStatus::Enabled,
            TokenStatus::Disabled,
            TokenStatus::Expired,
            TokenStatus::Exhausted,
        ] {
            assert_eq!(status_from_str(status_to_str(s)), s);
        }
    }
}
