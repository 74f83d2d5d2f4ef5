//! What the limiter decided for a request, and how that is reported.

use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderValue};

use crate::ratelimit::{RateLimit, RateLimitKey, WindowCount};

/// Response header names.
pub mod headers {
    use http::HeaderName;

    pub const REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
    pub const LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
    pub const RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
    pub const CONCURRENT_REMAINING: HeaderName =
        HeaderName::from_static("x-ratelimit-concurrentremaining");
    pub const CONCURRENT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-concurrentlimit");
}

/// Why a request was (or would have been) limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitReason {
    NotLimited,
    WindowLimit,
    ConcurrentLimit,
}

/// The limiter's view of one request.
///
/// Inserted into the request extensions before the handler runs, and used
/// to render the quota headers on the way out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitMetadata {
    pub key: RateLimitKey,
    pub limit: RateLimit,
    pub reason: RateLimitReason,
    /// False when the endpoint only tracks usage
    pub enforced: bool,
    pub window: WindowCount,
    /// Live slots right after this request's acquisition attempt. `None`
    /// when the limit has no concurrency bound or the attempt failed.
    pub concurrent_in_flight: Option<u64>,
}

impl RateLimitMetadata {
    pub fn new(key: RateLimitKey, limit: RateLimit, window: WindowCount, enforced: bool) -> Self {
        Self {
            key,
            limit,
            reason: RateLimitReason::NotLimited,
            enforced,
            window,
            concurrent_in_flight: None,
        }
    }

    pub fn is_limited(&self) -> bool {
        self.reason != RateLimitReason::NotLimited
    }

    /// Window quota left after this request.
    pub fn remaining(&self) -> u64 {
        self.window.remaining()
    }

    /// When the current window ends.
    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::try_from(self.window.reset_time).ok()?, 0)
    }

    /// Concurrent slots left while this request is in flight.
    pub fn concurrent_remaining(&self) -> Option<u64> {
        let max = self.limit.max_concurrent?;
        let in_flight = self.concurrent_in_flight?;
        Some(max.saturating_sub(in_flight))
    }

    /// Write the quota headers.
    pub fn apply_headers(&self, map: &mut HeaderMap) {
        map.insert(headers::REMAINING, HeaderValue::from(self.remaining()));
        map.insert(headers::LIMIT, HeaderValue::from(self.limit.max_requests));
        map.insert(headers::RESET, HeaderValue::from(self.window.reset_time));

        if let (Some(max), Some(remaining)) =
            (self.limit.max_concurrent, self.concurrent_remaining())
        {
            map.insert(headers::CONCURRENT_REMAINING, HeaderValue::from(remaining));
            map.insert(headers::CONCURRENT_LIMIT, HeaderValue::from(max));
        }
    }

    /// Explanation returned in the body of a 429.
    pub fn detail(&self) -> String {
        match self.reason {
            RateLimitReason::ConcurrentLimit => format!(
                "You are attempting to go above the allowed concurrency for this endpoint. \
                 Concurrency limit is {}",
                self.limit.max_concurrent.unwrap_or_default()
            ),
            _ => format!(
                "You are attempting to use this endpoint too frequently. \
                 Limit is {} requests in {} seconds",
                self.limit.max_requests,
                self.limit.window_seconds
            ),
        }
    }
}
