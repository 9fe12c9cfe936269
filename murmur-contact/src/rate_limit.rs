//! Sliding-window rate limiting keyed by client.
//!
//! Each key keeps the timestamps (epoch ms) of its accepted requests inside
//! the trailing window. A request is accepted while fewer than `limit`
//! timestamps remain after trimming; rejected requests are not recorded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::Utc;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::info;

use crate::error::AppError;

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// Outcome of a single rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch milliseconds at which the oldest counted request leaves the window.
    pub reset_at: i64,
}

impl RateLimitDecision {
    fn from_count(allowed: bool, limit: u32, count: u32, reset_at: i64) -> Self {
        Self {
            allowed,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at,
        }
    }

    /// Whole seconds until a slot frees up, never below one.
    pub fn retry_after_secs(&self, now_ms: i64) -> u64 {
        let wait_ms = (self.reset_at - now_ms).max(0) as u64;
        wait_ms.div_ceil(1000).max(1)
    }

    pub fn write_headers(&self, headers: &mut HeaderMap) {
        headers.insert(HeaderName::from_static(LIMIT_HEADER), HeaderValue::from(self.limit));
        headers.insert(
            HeaderName::from_static(REMAINING_HEADER),
            HeaderValue::from(self.remaining),
        );
        headers.insert(HeaderName::from_static(RESET_HEADER), HeaderValue::from(self.reset_at));
        if !self.allowed {
            let retry = self.retry_after_secs(Utc::now().timestamp_millis());
            headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(retry));
        }
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count a request for `key` and decide whether it may proceed.
    async fn check(&self, key: &str) -> Result<RateLimitDecision, AppError>;
}

/// Process-local window, used when no Redis URL is configured.
pub struct MemorySlidingWindow {
    hits: DashMap<String, VecDeque<i64>>,
    limit: u32,
    window_ms: i64,
}

impl MemorySlidingWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            hits: DashMap::new(),
            limit,
            window_ms: window.as_millis() as i64,
        }
    }

    pub fn check_at(&self, key: &str, now_ms: i64) -> RateLimitDecision {
        let mut hits = self.hits.entry(key.to_string()).or_default();

        let floor = now_ms - self.window_ms;
        while hits.front().is_some_and(|&t| t <= floor) {
            hits.pop_front();
        }

        let allowed = (hits.len() as u32) < self.limit;
        if allowed {
            hits.push_back(now_ms);
        }

        let reset_at = hits.front().map_or(now_ms + self.window_ms, |t| t + self.window_ms);
        RateLimitDecision::from_count(allowed, self.limit, hits.len() as u32, reset_at)
    }

    /// Drop keys whose requests have all left the window.
    pub fn purge_expired(&self, now_ms: i64) {
        let floor = now_ms - self.window_ms;
        self.hits
            .retain(|_, hits| hits.back().is_some_and(|&t| t > floor));
    }
}

#[async_trait]
impl RateLimiter for MemorySlidingWindow {
    async fn check(&self, key: &str) -> Result<RateLimitDecision, AppError> {
        Ok(self.check_at(key, Utc::now().timestamp_millis()))
    }
}

// KEYS[1] = bucket; ARGV = now_ms, window_ms, limit, member
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, 0, now - window)
local count = redis.call('ZCARD', key)
local allowed = 0
if count < limit then
    redis.call('ZADD', key, now, ARGV[4])
    count = count + 1
    allowed = 1
end
redis.call('PEXPIRE', key, window)

local reset = now + window
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
    reset = tonumber(oldest[2]) + window
end
return {allowed, count, reset}
"#;

/// Window shared between instances through a Redis sorted set per key.
pub struct RedisSlidingWindow {
    conn: ConnectionManager,
    script: Script,
    limit: u32,
    window_ms: i64,
    sequence: AtomicU64,
}

impl RedisSlidingWindow {
    pub async fn connect(url: &str, limit: u32, window: Duration) -> Result<Self, AppError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Rate limiter connected to Redis");

        Ok(Self {
            conn,
            script: Script::new(SLIDING_WINDOW_SCRIPT),
            limit,
            window_ms: window.as_millis() as i64,
            sequence: AtomicU64::new(0),
        })
    }

    fn bucket(key: &str) -> String {
        format!("ratelimit:contact:{}", key)
    }
}

#[async_trait]
impl RateLimiter for RedisSlidingWindow {
    async fn check(&self, key: &str) -> Result<RateLimitDecision, AppError> {
        let now = Utc::now().timestamp_millis();
        // Sorted set members must be unique for same-millisecond requests
        let member = format!("{}-{}", now, self.sequence.fetch_add(1, Ordering::Relaxed));

        let mut conn = self.conn.clone();
        let (allowed, count, reset_at): (i64, i64, i64) = self
            .script
            .key(Self::bucket(key))
            .arg(now)
            .arg(self.window_ms)
            .arg(self.limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AppError::RateLimiter(e.to_string()))?;

        Ok(RateLimitDecision::from_count(
            allowed == 1,
            self.limit,
            count.max(0) as u32,
            reset_at,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_allows_up_to_limit() {
        let limiter = MemorySlidingWindow::new(3, HOUR);
        let start = 1_000_000;

        let first = limiter.check_at("1.2.3.4", start);
        assert!(first.allowed);
        assert_eq!(first.remaining, 2);
        assert_eq!(first.reset_at, start + 3_600_000);

        assert!(limiter.check_at("1.2.3.4", start + 10).allowed);
        let third = limiter.check_at("1.2.3.4", start + 20);
        assert!(third.allowed);
        assert_eq!(third.remaining, 0);

        let fourth = limiter.check_at("1.2.3.4", start + 30);
        assert!(!fourth.allowed);
        assert_eq!(fourth.remaining, 0);
        assert_eq!(fourth.reset_at, start + 3_600_000);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = MemorySlidingWindow::new(1, HOUR);
        assert!(limiter.check_at("a", 0).allowed);
        assert!(!limiter.check_at("a", 1).allowed);
        assert!(limiter.check_at("b", 1).allowed);
    }

    #[test]
    fn test_window_slides() {
        let limiter = MemorySlidingWindow::new(2, Duration::from_secs(10));
        assert!(limiter.check_at("k", 0).allowed);
        assert!(limiter.check_at("k", 5_000).allowed);
        assert!(!limiter.check_at("k", 9_999).allowed);

        // the first request leaves the window exactly at its boundary
        let decision = limiter.check_at("k", 10_000);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_at, 15_000);
    }

    #[test]
    fn test_rejections_are_not_counted() {
        let limiter = MemorySlidingWindow::new(1, Duration::from_secs(10));
        assert!(limiter.check_at("k", 0).allowed);
        for t in 1..5 {
            assert!(!limiter.check_at("k", t * 1_000).allowed);
        }
        assert!(limiter.check_at("k", 10_000).allowed);
    }

    #[test]
    fn test_purge_expired() {
        let limiter = MemorySlidingWindow::new(3, Duration::from_secs(10));
        limiter.check_at("old", 0);
        limiter.check_at("fresh", 8_000);
        limiter.purge_expired(12_000);
        assert!(!limiter.hits.contains_key("old"));
        assert!(limiter.hits.contains_key("fresh"));
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let decision = RateLimitDecision::from_count(false, 3, 3, 10_500);
        assert_eq!(decision.retry_after_secs(9_000), 2);
        assert_eq!(decision.retry_after_secs(10_500), 1);
        assert_eq!(decision.retry_after_secs(20_000), 1);
    }

    #[test]
    fn test_headers() {
        let mut headers = HeaderMap::new();
        RateLimitDecision::from_count(true, 3, 1, 42).write_headers(&mut headers);
        assert_eq!(headers[LIMIT_HEADER], "3");
        assert_eq!(headers[REMAINING_HEADER], "2");
        assert_eq!(headers[RESET_HEADER], "42");
        assert!(headers.get("retry-after").is_none());

        let mut headers = HeaderMap::new();
        RateLimitDecision::from_count(false, 3, 3, 0).write_headers(&mut headers);
        assert_eq!(headers["retry-after"], "1");
    }
}
