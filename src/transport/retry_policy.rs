use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;

use crate::config::RetryConfig;

const RETRY_AFTER_MS: &str = "retry-after-ms";
const BACKOFF_MAX_SHIFT: u32 = 20;

/// What to do after a failed connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Exponential backoff with multiplicative jitter for the connection phase.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff for zero-based `attempt` before jitter, capped at `max_delay`.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let multiplier = 1_u32 << attempt.min(BACKOFF_MAX_SHIFT);
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }

    /// Backoff with ±`jitter_ratio` applied.
    #[must_use]
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_delay(attempt);
        if self.jitter_ratio <= 0.0 {
            return base;
        }
        let factor = 1.0 + self.jitter_ratio * (fastrand::f64() * 2.0 - 1.0);
        base.mul_f64(factor.max(0.0))
    }

    /// Decide whether attempt number `attempt` (zero-based, the one that just
    /// failed) may be retried.
    ///
    /// A server-supplied delay wins when it is longer than the computed
    /// backoff. A server delay beyond `max_delay` ends retrying: waiting that
    /// long inside one call is the caller's decision, and `retryAfterMs` on
    /// the error carries the hint.
    #[must_use]
    pub fn decide(&self, attempt: u32, retry_after: Option<Duration>) -> RetryDecision {
        if attempt >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        let computed = self.jittered_delay(attempt);
        match retry_after {
            Some(server) if server > self.max_delay => RetryDecision::GiveUp,
            Some(server) => RetryDecision::RetryAfter(server.max(computed)),
            None => RetryDecision::RetryAfter(computed),
        }
    }
}

/// Read a server retry hint: `retry-after-ms` first, then `Retry-After` as
/// seconds or an HTTP date.
#[must_use]
pub fn retry_after_from_headers(headers: &http::HeaderMap) -> Option<Duration> {
    if let Some(ms) = headers
        .get(RETRY_AFTER_MS)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
    {
        return Some(Duration::from_secs_f64(ms / 1000.0));
    }
    parse_retry_after_delay(headers)
}

#[inline]
pub(crate) fn parse_retry_after_delay(headers: &http::HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let target = httpdate::parse_http_date(raw).ok()?;
    Some(target.duration_since(SystemTime::now()).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter_ratio: 0.1,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(800));
        assert_eq!(policy.backoff_delay(10), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let policy = policy();
        for _ in 0..200 {
            let delay = policy.jittered_delay(2);
            assert!(delay >= Duration::from_millis(360), "{delay:?}");
            assert!(delay <= Duration::from_millis(440), "{delay:?}");
        }
    }

    #[test]
    fn test_decide_respects_budget() {
        let policy = policy();
        assert!(matches!(policy.decide(0, None), RetryDecision::RetryAfter(_)));
        assert_eq!(policy.decide(3, None), RetryDecision::GiveUp);
        assert_eq!(RetryPolicy::none().decide(0, None), RetryDecision::GiveUp);
    }

    #[test]
    fn test_server_delay_takes_precedence_when_longer() {
        let policy = policy();
        assert_eq!(
            policy.decide(0, Some(Duration::from_secs(1))),
            RetryDecision::RetryAfter(Duration::from_secs(1))
        );
        match policy.decide(0, Some(Duration::from_millis(1))) {
            RetryDecision::RetryAfter(delay) => assert!(delay >= Duration::from_millis(90)),
            RetryDecision::GiveUp => panic!("expected retry"),
        }
        assert_eq!(
            policy.decide(0, Some(Duration::from_secs(30))),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = http::HeaderMap::new();
        headers.insert(RETRY_AFTER, http::HeaderValue::from_static("5"));
        assert_eq!(
            retry_after_from_headers(&headers),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_parse_retry_after_ms_wins() {
        let mut headers = http::HeaderMap::new();
        headers.insert(RETRY_AFTER, http::HeaderValue::from_static("5"));
        headers.insert(RETRY_AFTER_MS, http::HeaderValue::from_static("1500.0"));
        assert_eq!(
            retry_after_from_headers(&headers),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let target = SystemTime::now() + Duration::from_secs(2);
        let mut headers = http::HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            http::HeaderValue::from_str(&httpdate::fmt_http_date(target)).unwrap(),
        );
        let delay = retry_after_from_headers(&headers).unwrap();
        assert!(delay <= Duration::from_secs(2));
    }

    #[test]
    fn test_parse_retry_after_invalid() {
        let mut headers = http::HeaderMap::new();
        headers.insert(RETRY_AFTER, http::HeaderValue::from_static("not-a-delay"));
        assert!(retry_after_from_headers(&headers).is_none());
    }
}
