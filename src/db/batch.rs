//! Batch accumulator for analytics-only quota counters.
//!
//! `used_quota` (display/reporting) and `request_count` updates may be
//! coalesced here instead of hitting the database on every relay request.
//! Settlement and refund quota deltas never go through this path — see
//! [`super::users::UserRepository::adjust_quota`] and
//! [`super::tokens::TokenRepository::consume`], which are always direct.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error};

use crate::error::Result;

use super::pool::DbPool;
use super::tokens::TokenRepository;
use super::users::UserRepository;

#[derive(Default)]
struct Counters {
    user_used_quota: DashMap<i64, i64>,
    user_request_count: DashMap<i64, i64>,
    token_used_quota: DashMap<i64, i64>,
    channel_used_quota: DashMap<i64, i64>,
}

/// Accumulates analytics counter deltas in memory and flushes them to the
/// database on a fixed interval or on shutdown. Each counter kind is a
/// `DashMap<id, delta>` drained and summed on flush so concurrent
/// increments for the same id never block each other.
#[derive(Clone)]
pub struct BatchAccumulator {
    counters: Arc<Counters>,
    pool: DbPool,
}

impl BatchAccumulator {
    pub fn new(pool: DbPool) -> Self {
        BatchAccumulator {
            counters: Arc::new(Counters::default()),
            pool,
        }
    }

    pub fn add_user_used_quota(&self, user_id: i64, delta: i64) {
        *self.counters.user_used_quota.entry(user_id).or_insert(0) += delta;
    }

    pub fn add_user_request_count(&self, user_id: i64, delta: i64) {
        *self.counters.user_request_count.entry(user_id).or_insert(0) += delta;
    }

    pub fn add_token_used_quota(&self, token_id: i64, delta: i64) {
        *self.counters.token_used_quota.entry(token_id).or_insert(0) += delta;
    }

    pub fn add_channel_used_quota(&self, channel_id: i64, delta: i64) {
        *self.counters.channel_used_quota.entry(channel_id).or_insert(0) += delta;
    }

    /// Drains every counter and applies the accumulated deltas via direct
    /// atomic updates. Safe to call concurrently with itself (each drain
    /// removes entries before applying them, so a racing increment for the
    /// same id simply starts a fresh entry rather than being lost).
    pub async fn flush(&self) -> Result<()> {
        let users = UserRepository::new(self.pool.clone());
        let tokens = TokenRepository::new(self.pool.clone());

        let mut flushed = 0usize;
        for entry in drain(&self.counters.user_used_quota) {
            users.adjust_quota(entry.0, entry.1).await.map_err(log_flush_err)?;
            flushed += 1;
        }
        for entry in drain(&self.counters.user_request_count) {
            users.increment_request_count(entry.0, entry.1).await.map_err(log_flush_err)?;
            flushed += 1;
        }
        for entry in drain(&self.counters.token_used_quota) {
            tokens.consume(entry.0, entry.1).await.map_err(log_flush_err)?;
            flushed += 1;
        }
        for entry in drain(&self.counters.channel_used_quota) {
            sqlx::query("UPDATE channels SET used_quota = used_quota + $1 WHERE id = $2")
                .bind(entry.1)
                .bind(entry.0)
                .execute(&self.pool)
                .await
                .map_err(crate::error::RelayError::Database)?;
            flushed += 1;
        }

        if flushed > 0 {
            debug!(flushed, "flushed batched quota counters");
        }
        Ok(())
    }
}

fn log_flush_err(err: crate::error::RelayError) -> crate::error::RelayError {
    error!(error = %err, "batch flush of quota counter failed");
    err
}

fn drain(map: &DashMap<i64, i64>) -> Vec<(i64, i64)> {
    let keys: Vec<i64> = map.iter().map(|e| *e.key()).collect();
    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
        if let Some((_, value)) = map.remove(&key) {
            out.push((key, value));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_multiple_deltas_for_same_id() {
        let counters = Counters::default();
        *counters.user_used_quota.entry(1).or_insert(0) += 10;
        *counters.user_used_quota.entry(1).or_insert(0) += 5;
        assert_eq!(*counters.user_used_quota.get(&1).unwrap(), 15);
    }

    #[test]
    fn drain_empties_the_map() {
        let map = DashMap::new();
        map.insert(1i64, 3i64);
        map.insert(2i64, 7i64);
        let drained = drain(&map);
        assert_eq!(drained.len(), 2);
        assert!(map.is_empty());
    }
}
