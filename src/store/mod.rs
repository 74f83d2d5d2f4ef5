//! Shared counter stores backing the admission decisions.
//!
//! Every operation here is a single atomic step against the store. Callers
//! never read a count and write it back, so racing requests in different
//! processes always observe distinct, correctly incremented values.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::ratelimit::{RateLimit, WindowCount};

/// Default lifetime of a concurrency slot that is never released.
pub const DEFAULT_SLOT_TTL: Duration = Duration::from_secs(30);

/// Errors returned by counter store operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer in time
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with an error
    #[error("store operation failed: {0}")]
    Script(String),
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Timeout(Duration::ZERO)
        } else if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Script(err.to_string())
        }
    }
}

/// Identifies one in-flight request's reservation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotToken(Uuid);

impl SlotToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SlotToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SlotToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a slot acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAcquisition {
    /// The reservation, or `None` when every slot was taken
    pub token: Option<SlotToken>,
    /// Live slots for the key right after the attempt, including ours
    pub in_flight: u64,
}

impl SlotAcquisition {
    pub fn acquired(&self) -> bool {
        self.token.is_some()
    }
}

/// Fixed-window request counters.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Add one request to the key's current window and report the new count.
    async fn increment_and_check(
        &self,
        key: &str,
        limit: &RateLimit,
    ) -> Result<WindowCount, StoreError>;

    /// Read the key's count in the current window without changing it.
    async fn current_count(&self, key: &str, limit: &RateLimit) -> Result<u64, StoreError>;
}

/// Bounded sets of in-flight request slots.
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Reserve a slot if fewer than `max_concurrent` are live for the key.
    async fn try_acquire(
        &self,
        key: &str,
        max_concurrent: u64,
    ) -> Result<SlotAcquisition, StoreError>;

    /// Drop the slot identified by `token`. Unknown tokens are ignored.
    async fn release(&self, key: &str, token: &SlotToken) -> Result<(), StoreError>;

    /// Number of live slots for the key.
    async fn in_flight(&self, key: &str) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_tokens_are_unique() {
        let a = SlotToken::new();
        let b = SlotToken::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 36);
    }

    #[test]
    fn test_acquisition_flag() {
        let taken = SlotAcquisition {
            token: None,
            in_flight: 3,
        };
        assert!(!taken.acquired());
    }
}
