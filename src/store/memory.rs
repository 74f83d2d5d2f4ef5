//! In-process counter store.
//!
//! Atomicity comes from the per-key shard lock held by `DashMap` entry
//! guards, so this store is exact for a single process. Deployments with
//! several server processes need a shared store such as [`RedisStore`].
//!
//! [`RedisStore`]: super::RedisStore

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::{SlotAcquisition, SlotStore, SlotToken, StoreError, WindowStore, DEFAULT_SLOT_TTL};
use crate::clock::{Clock, SystemClock};
use crate::ratelimit::{RateLimit, WindowBucket, WindowCount};

/// Expired entries are swept after this many window increments.
const SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug)]
struct WindowEntry {
    count: u64,
    /// Epoch seconds after which the entry is dead
    expires_at: u64,
}

#[derive(Debug, Clone)]
struct LiveSlot {
    token: SlotToken,
    /// Epoch milliseconds after which the slot is reclaimed
    expires_at: u64,
}

/// Counter store kept in process memory.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    windows: DashMap<String, WindowEntry>,
    slots: DashMap<String, Vec<LiveSlot>>,
    slot_ttl: Duration,
    increments: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock), DEFAULT_SLOT_TTL)
    }

    pub fn with_clock(clock: Arc<dyn Clock>, slot_ttl: Duration) -> Self {
        Self {
            clock,
            windows: DashMap::new(),
            slots: DashMap::new(),
            slot_ttl,
            increments: AtomicU64::new(0),
        }
    }

    /// Number of window counters currently held.
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Drop window counters and slot sets that can no longer matter.
    pub fn purge_expired(&self) {
        let now_secs = self.clock.now_secs();
        let now_millis = self.clock.now_millis();
        self.windows.retain(|_, entry| entry.expires_at > now_secs);
        self.slots.retain(|_, live| {
            live.retain(|slot| slot.expires_at > now_millis);
            !live.is_empty()
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn increment_and_check(
        &self,
        key: &str,
        limit: &RateLimit,
    ) -> Result<WindowCount, StoreError> {
        let now = self.clock.now_secs();
        let bucket = WindowBucket::at(now, limit.window_seconds);

        let count = {
            let mut entry = self
                .windows
                .entry(bucket.storage_key(key))
                .or_insert_with(|| WindowEntry {
                    count: 0,
                    expires_at: bucket.reset_time(),
                });
            entry.count += 1;
            entry.count
        };

        trace!(key = %key, bucket = bucket.index, count = count, "Incremented window counter");

        if self.increments.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.purge_expired();
        }

        Ok(WindowCount::new(count, limit, bucket.reset_time()))
    }

    async fn current_count(&self, key: &str, limit: &RateLimit) -> Result<u64, StoreError> {
        let now = self.clock.now_secs();
        let bucket = WindowBucket::at(now, limit.window_seconds);
        Ok(self
            .windows
            .get(&bucket.storage_key(key))
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.count)
            .unwrap_or(0))
    }
}

#[async_trait]
impl SlotStore for MemoryStore {
    async fn try_acquire(
        &self,
        key: &str,
        max_concurrent: u64,
    ) -> Result<SlotAcquisition, StoreError> {
        let now = self.clock.now_millis();
        let mut live = self.slots.entry(key.to_string()).or_default();
        live.retain(|slot| slot.expires_at > now);

        let in_flight = live.len() as u64;
        if in_flight >= max_concurrent {
            drop(live);
            self.slots.remove_if(key, |_, live| live.is_empty());
            trace!(key = %key, in_flight = in_flight, "No concurrent slot available");
            return Ok(SlotAcquisition {
                token: None,
                in_flight,
            });
        }

        let token = SlotToken::new();
        live.push(LiveSlot {
            token: token.clone(),
            expires_at: now + self.slot_ttl.as_millis() as u64,
        });
        trace!(key = %key, token = %token, in_flight = in_flight + 1, "Acquired concurrent slot");

        Ok(SlotAcquisition {
            token: Some(token),
            in_flight: in_flight + 1,
        })
    }

    async fn release(&self, key: &str, token: &SlotToken) -> Result<(), StoreError> {
        if let Some(mut live) = self.slots.get_mut(key) {
            live.retain(|slot| &slot.token != token);
        }
        self.slots.remove_if(key, |_, live| live.is_empty());
        trace!(key = %key, token = %token, "Released concurrent slot");
        Ok(())
    }

    async fn in_flight(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        Ok(self
            .slots
            .get(key)
            .map(|live| live.iter().filter(|slot| slot.expires_at > now).count() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::collections::HashSet;
    use tokio_test::assert_ok;

    const KEY: &str = "ip:default:Ping:GET:127.0.0.1";

    fn store_at(secs: u64) -> (MemoryStore, ManualClock) {
        let clock = ManualClock::at_secs(secs);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()), Duration::from_secs(30));
        (store, clock)
    }

    #[tokio::test]
    async fn test_counts_increase_by_one_within_window() {
        let (store, _clock) = store_at(946_684_800);
        let limit = RateLimit::new(100, 100);

        for expected in 1..=20 {
            let result = assert_ok!(store.increment_and_check(KEY, &limit).await);
            assert_eq!(result.count, expected);
        }
        assert_eq!(assert_ok!(store.current_count(KEY, &limit).await), 20);
    }

    #[tokio::test]
    async fn test_n_allowed_then_denied_then_reset() {
        let (store, clock) = store_at(946_684_800);
        let limit = RateLimit::new(10, 100);

        for _ in 0..10 {
            assert!(store.increment_and_check(KEY, &limit).await.unwrap().allowed);
        }
        let denied = store.increment_and_check(KEY, &limit).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.count, 11);
        assert_eq!(denied.reset_time, 946_684_900);

        clock.advance_secs(100);
        let fresh = store.increment_and_check(KEY, &limit).await.unwrap();
        assert!(fresh.allowed);
        assert_eq!(fresh.count, 1);
    }

    #[tokio::test]
    async fn test_current_count_does_not_increment() {
        let (store, _clock) = store_at(1_000);
        let limit = RateLimit::new(5, 10);
        assert_eq!(store.current_count(KEY, &limit).await.unwrap(), 0);
        store.increment_and_check(KEY, &limit).await.unwrap();
        assert_eq!(store.current_count(KEY, &limit).await.unwrap(), 1);
        assert_eq!(store.current_count(KEY, &limit).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_drops_expired_windows() {
        let (store, clock) = store_at(1_000);
        let limit = RateLimit::new(5, 10);
        store.increment_and_check(KEY, &limit).await.unwrap();
        assert_eq!(store.window_count(), 1);

        clock.advance_secs(10);
        store.purge_expired();
        assert_eq!(store.window_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_parallel_increments_see_distinct_counts() {
        let (store, _clock) = store_at(946_684_800);
        let store = Arc::new(store);
        let limit = RateLimit::new(50, 100);

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment_and_check(KEY, &limit).await.unwrap() })
            })
            .collect();

        let mut counts = HashSet::new();
        let mut allowed = 0;
        for handle in handles {
            let result = handle.await.unwrap();
            assert!(counts.insert(result.count), "count {} seen twice", result.count);
            if result.allowed {
                allowed += 1;
            }
        }
        assert_eq!(counts.len(), 200);
        assert_eq!(allowed, 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_parallel_acquire_grants_exactly_limit() {
        let (store, _clock) = store_at(946_684_800);
        let store = Arc::new(store);
        let barrier = Arc::new(tokio::sync::Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    store.try_acquire(KEY, 3).await.unwrap()
                })
            })
            .collect();

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap().acquired() {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
        assert_eq!(store.in_flight(KEY).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (store, _clock) = store_at(1_000);
        let first = store.try_acquire(KEY, 2).await.unwrap();
        let token = first.token.unwrap();
        assert_eq!(first.in_flight, 1);

        assert_ok!(store.release(KEY, &token).await);
        assert_ok!(store.release(KEY, &token).await);
        assert_ok!(store.release(KEY, &SlotToken::new()).await);
        assert_eq!(store.in_flight(KEY).await.unwrap(), 0);

        let again = store.try_acquire(KEY, 2).await.unwrap();
        assert_eq!(again.in_flight, 1);
    }

    #[tokio::test]
    async fn test_release_only_removes_its_own_slot() {
        let (store, _clock) = store_at(1_000);
        let a = store.try_acquire(KEY, 3).await.unwrap().token.unwrap();
        let b = store.try_acquire(KEY, 3).await.unwrap().token.unwrap();

        store.release(KEY, &b).await.unwrap();
        store.release(KEY, &a).await.unwrap();
        store.release(KEY, &b).await.unwrap();
        assert_eq!(store.in_flight(KEY).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_leaked_slots_expire() {
        let (store, clock) = store_at(1_000);
        for _ in 0..3 {
            assert!(store.try_acquire(KEY, 3).await.unwrap().acquired());
        }
        assert!(!store.try_acquire(KEY, 3).await.unwrap().acquired());

        clock.advance_secs(31);
        let after = store.try_acquire(KEY, 3).await.unwrap();
        assert!(after.acquired());
        assert_eq!(after.in_flight, 1);
    }

    #[tokio::test]
    async fn test_zero_concurrency_never_grants() {
        let (store, _clock) = store_at(1_000);
        let attempt = store.try_acquire(KEY, 0).await.unwrap();
        assert!(!attempt.acquired());
        assert_eq!(attempt.in_flight, 0);
        assert!(store.slots.is_empty());
    }
}
