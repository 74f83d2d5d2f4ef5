//! Rate limit values and classification categories.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A rate limit: at most `max_requests` per `window_seconds`, and optionally
/// at most `max_concurrent` requests in flight at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimit {
    /// Requests allowed per window. Zero denies everything.
    pub max_requests: u64,
    /// Window length in seconds. Must be positive.
    pub window_seconds: u64,
    /// Simultaneous in-flight bound, independent of the window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u64>,
}

impl RateLimit {
    /// Create a windowed limit without a concurrency bound.
    pub const fn new(max_requests: u64, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds,
            max_concurrent: None,
        }
    }

    /// Create a windowed limit with a concurrency bound.
    pub const fn with_concurrency(
        max_requests: u64,
        window_seconds: u64,
        max_concurrent: u64,
    ) -> Self {
        Self {
            max_requests,
            window_seconds,
            max_concurrent: Some(max_concurrent),
        }
    }

    /// Whether this limit can be enforced as written.
    pub fn is_valid(&self) -> bool {
        self.window_seconds > 0
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s", self.max_requests, self.window_seconds)?;
        if let Some(concurrent) = self.max_concurrent {
            write!(f, " (concurrent {})", concurrent)?;
        }
        Ok(())
    }
}

/// The identity dimension a rate limit is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RateLimitCategory {
    #[serde(rename = "ip")]
    Ip,
    #[serde(rename = "user")]
    User,
    #[serde(rename = "org", alias = "organization")]
    Organization,
}

impl RateLimitCategory {
    /// Categories in the order a request's identities are tried.
    pub const PREFERENCE: [RateLimitCategory; 3] = [
        RateLimitCategory::Organization,
        RateLimitCategory::User,
        RateLimitCategory::Ip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitCategory::Ip => "ip",
            RateLimitCategory::User => "user",
            RateLimitCategory::Organization => "org",
        }
    }
}

impl fmt::Display for RateLimitCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateLimitCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ip" => Ok(RateLimitCategory::Ip),
            "user" => Ok(RateLimitCategory::User),
            "org" | "organization" => Ok(RateLimitCategory::Organization),
            other => Err(format!("unknown rate limit category: {}", other)),
        }
    }
}
