//! Rate limiting middleware: global and per-IP token buckets ahead of the
//! relay routes, built on `governor`. When `REDIS_CONN_STRING` is set,
//! [`RedisRateLimiter`] additionally mirrors counters into Redis so
//! multiple gateway instances share one distributed limit, falling back to
//! the in-process limiter if Redis is unreachable.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use tracing::warn;

type KeyedLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;
type GlobalLimiter = RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, DefaultClock>;

/// In-process limiter pair: one global bucket for the whole process, one
/// keyed bucket per client IP. Construction never fails; callers that pass
/// `0` as a rate get the crate-default instead of a panic.
#[derive(Clone)]
pub struct RateLimiters {
    global: Arc<GlobalLimiter>,
    per_ip: Arc<KeyedLimiter>,
}

impl RateLimiters {
    pub fn new(global_rps: u32, per_ip_rps: u32) -> Self {
        let global_quota = Quota::per_second(nonzero(global_rps).unwrap_or(nonzero!(200u32)));
        let per_ip_quota = Quota::per_second(nonzero(per_ip_rps).unwrap_or(nonzero!(10u32)));
        RateLimiters {
            global: Arc::new(RateLimiter::direct(global_quota)),
            per_ip: Arc::new(RateLimiter::keyed(per_ip_quota)),
        }
    }

    pub fn check_global(&self) -> bool {
        self.global.check().is_ok()
    }

    pub fn check_ip(&self, ip: IpAddr) -> bool {
        self.per_ip.check_key(&ip).is_ok()
    }
}

fn nonzero(v: u32) -> Option<NonZeroU32> {
    NonZeroU32::new(v)
}

/// Wraps [`RateLimiters`] with an optional distributed counter mirrored
/// into Redis via `INCR`+`EXPIRE`. Redis is consulted best-effort: any
/// connection error just logs and falls back to the in-process decision,
/// so a flaky Redis never takes the gateway down.
#[derive(Clone)]
pub struct RedisRateLimiter {
    local: RateLimiters,
    redis: Option<redis::aio::ConnectionManager>,
}

impl RedisRateLimiter {
    pub fn new(local: RateLimiters, redis: Option<redis::aio::ConnectionManager>) -> Self {
        RedisRateLimiter { local, redis }
    }

    pub fn check_global(&self) -> bool {
        self.local.check_global()
    }

    pub async fn check_ip(&self, ip: IpAddr, per_ip_rps: u32) -> bool {
        if !self.local.check_ip(ip) {
            return false;
        }
        let Some(mut conn) = self.redis.clone() else {
            return true;
        };
        let key = format!("relaymux:ratelimit:{ip}");
        let result: redis::RedisResult<i64> = redis::pipe()
            .atomic()
            .incr(&key, 1)
            .expire(&key, 1)
            .query_async(&mut conn)
            .await
            .map(|v: Vec<i64>| v[0]);
        match result {
            Ok(count) => count <= per_ip_rps as i64,
            Err(err) => {
                warn!(error = %err, "redis rate limit check failed, falling back to local limiter");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_falls_back_to_default() {
        let limiters = RateLimiters::new(0, 0);
        assert!(limiters.check_global());
    }

    #[test]
    fn distinct_ips_have_independent_buckets() {
        let limiters = RateLimiters::new(1000, 1);
        let a: IpAddr = "127.0.0.1".parse().unwrap();
        let b: IpAddr = "127.0.0.2".parse().unwrap();
        assert!(limiters.check_ip(a));
        assert!(limiters.check_ip(b));
    }
}
