//! User repository and the direct (non-batched) quota settlement path.
//!
//! Settlement and refunds always go through [`UserRepository::adjust_quota`],
//! an atomic `used_quota = used_quota + $delta` / `quota = quota - $delta`
//! update. Analytics-only counters (request_count) may be coalesced by the
//! batch accumulator in [`super::batch`]; balance-affecting quota never is.

use sqlx::FromRow;

use crate::error::Result;
use crate::types::{Role, User, UserStatus};

use super::pool::DbPool;

#[derive(FromRow)]
struct UserRow {
    id: i64,
    username: String,
    wallet_address: Option<String>,
    role: String,
    status: String,
    quota: i64,
    used_quota: i64,
    group_name: String,
    request_count: i64,
}

fn role_from_str(s: &str) -> Role {
    match s {
        "admin" => Role::Admin,
        "root" => Role::Root,
        "common" => Role::Common,
        _ => Role::Guest,
    }
}

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::Guest => "guest",
        Role::Common => "common",
        Role::Admin => "admin",
        Role::Root => "root",
    }
}

fn status_from_str(s: &str) -> UserStatus {
    match s {
        "disabled" => UserStatus::Disabled,
        "deleted" => UserStatus::Deleted,
        _ => UserStatus::Enabled,
    }
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            username: row.username,
            wallet_address: row.wallet_address,
            role: role_from_str(&row.role),
            status: status_from_str(&row.status),
            quota: row.quota,
            used_quota: row.used_quota,
            group: row.group_name,
            request_count: row.request_count,
        }
    }
}

pub struct UserRepository {
    pool: DbPool,
}

impl UserRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"SELECT id, username, wallet_address, role, status, quota, used_quota,
                      "group" as group_name, request_count
               FROM users WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"SELECT id, username, wallet_address, role, status, quota, used_quota,
                      "group" as group_name, request_count
               FROM users WHERE username = $1"#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    pub async fn insert(&self, username: &str, role: Role, group: &str) -> Result<i64> {
        let row = sqlx::query(
            r#"INSERT INTO users (username, role, status, quota, used_quota, "group", request_count)
               VALUES ($1, $2, 'enabled', 0, 0, $3, 0)
               RETURNING id"#,
        )
        .bind(username)
        .bind(role_to_str(role))
        .bind(group)
        .fetch_one(&self.pool)
        .await?;
        Ok(sqlx::Row::get::<i64, _>(&row, "id"))
    }

    /// Atomically moves `delta` quota units from `quota` to `used_quota`.
    /// A negative `delta` performs a refund and is the only path by which
    /// `used_quota` may decrease.
    pub async fn adjust_quota(&self, user_id: i64, delta: i64) -> Result<()> {
        sqlx::query(
            "UPDATE users SET quota = quota - $1, used_quota = used_quota + $1 WHERE id = $2",
        )
        .bind(delta)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Conditional atomic reservation used by the relay pipeline's
    /// pre-consumption step: debits `amount` only if `quota >= amount`,
    /// returning whether the reservation succeeded. Unlike `adjust_quota`
    /// this never drives `quota` negative, so a check-then-update race
    /// between two concurrent requests on the same user cannot both
    /// succeed against an already-thin balance.
    pub async fn reserve_quota(&self, user_id: i64, amount: i64) -> Result<bool> {
        let row = sqlx::query(
            "UPDATE users SET quota = quota - $1, used_quota = used_quota + $1 \
             WHERE id = $2 AND quota >= $1 RETURNING id",
        )
        .bind(amount)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn has_sufficient_quota(&self, user_id: i64, estimated_quota: i64) -> Result<bool> {
        let row = sqlx::query("SELECT quota FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(r) => sqlx::Row::get::<i64, _>(&r, "quota") >= estimated_quota,
            None => false,
        })
    }

    pub async fn increment_request_count(&self, user_id: i64, delta: i64) -> Result<()> {
        sqlx::query("UPDATE users SET request_count = request_count + $1 WHERE id = $2")
            .bind(delta)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_status(&self, user_id: i64, status: UserStatus) -> Result<()> {
        let status_str = match status {
            UserStatus::Enabled => "enabled",
            UserStatus::Disabled => "disabled",
            UserStatus::Deleted => "deleted",
        };
        sqlx::query("UPDATE users SET status = $1 WHERE id = $2")
            .bind(status_str)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips() {
        for role in [Role::Guest, Role::Common, Role::Admin, Role::Root] {
            assert_eq!(role_from_str(role_to_str(role)), role);
        }
    }
}
