//! Client-side backoff for rate-limited endpoints.
//!
//! Each [`RestHistoryApi`](super::RestHistoryApi) owns one limiter. When the
//! server answers 429 the endpoint URL is blocked until its `Retry-After`
//! has elapsed and requests to it fail fast locally.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Used when a 429 carries no parseable `Retry-After`.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct RateLimiter {
    blocked_until: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining backoff for `url`, if any.
    pub fn check(&self, url: &str) -> Option<Duration> {
        self.check_at(url, Instant::now())
    }

    pub fn record(&self, url: &str, retry_after: Duration) {
        self.record_at(url, retry_after, Instant::now());
    }

    fn check_at(&self, url: &str, now: Instant) -> Option<Duration> {
        let mut map = self.blocked_until.lock().ok()?;
        match map.get(url) {
            Some(until) if *until > now => Some(*until - now),
            Some(_) => {
                map.remove(url);
                None
            }
            None => None,
        }
    }

    fn record_at(&self, url: &str, retry_after: Duration, now: Instant) {
        if let Ok(mut map) = self.blocked_until.lock() {
            map.insert(url.to_string(), now + retry_after);
        }
        tracing::warn!(url, retry_after_secs = retry_after.as_secs(), "endpoint rate limited");
    }
}

/// Parse a `Retry-After` header given in seconds.
pub fn parse_retry_after(header: Option<&str>) -> Duration {
    header
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_url_is_not_blocked() {
        let limiter = RateLimiter::new();
        assert!(limiter.check("http://a/x").is_none());
    }

    #[test]
    fn blocks_until_retry_after_elapses() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();
        limiter.record_at("http://a/x", Duration::from_secs(10), t0);

        let remaining = limiter.check_at("http://a/x", t0 + Duration::from_secs(4));
        assert_eq!(remaining, Some(Duration::from_secs(6)));
        assert!(limiter
            .check_at("http://a/x", t0 + Duration::from_secs(10))
            .is_none());
    }

    #[test]
    fn limits_are_per_url() {
        let limiter = RateLimiter::new();
        let t0 = Instant::now();
        limiter.record_at("http://a/x", Duration::from_secs(10), t0);
        assert!(limiter.check_at("http://a/y", t0).is_none());
    }

    #[test]
    fn separate_limiters_do_not_share_state() {
        let a = RateLimiter::new();
        let b = RateLimiter::new();
        a.record("http://a/x", Duration::from_secs(60));
        assert!(a.check("http://a/x").is_some());
        assert!(b.check("http://a/x").is_none());
    }

    #[test]
    fn parses_retry_after_seconds() {
        assert_eq!(parse_retry_after(Some("7")), Duration::from_secs(7));
        assert_eq!(parse_retry_after(Some(" 3 ")), Duration::from_secs(3));
        assert_eq!(parse_retry_after(Some("soon")), DEFAULT_RETRY_AFTER);
        assert_eq!(parse_retry_after(None), DEFAULT_RETRY_AFTER);
    }
}
