//! Redis-backed counter store shared by every server process.
//!
//! Window counters and slot sets are updated by Lua scripts so each logical
//! operation is one round trip and executes atomically on the server.
//!
//! The connection is established by a background task started when the
//! store is opened. Until it is ready, operations fail immediately with
//! [`StoreError::Unavailable`] and callers fail open.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace, warn};

use super::{SlotAcquisition, SlotStore, SlotToken, StoreError, WindowStore, DEFAULT_SLOT_TTL};
use crate::clock::{Clock, SystemClock};
use crate::ratelimit::{RateLimit, WindowBucket, WindowCount};

/// First delay between connection attempts.
const CONNECT_BACKOFF_MIN: Duration = Duration::from_millis(100);

/// Longest delay between connection attempts.
const CONNECT_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// KEYS[1] = bucket key, ARGV[1] = window seconds.
const WINDOW_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('EXPIRE', KEYS[1], tonumber(ARGV[1]))
end
return current
"#;

/// KEYS[1] = slot set, ARGV = limit, token, ttl (ms).
///
/// Slots are scored by the Redis server's clock at acquisition; anything
/// older than the TTL is dropped before counting.
const ACQUIRE_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local token = ARGV[2]
local ttl = tonumber(ARGV[3])
local time = redis.call('TIME')
local now = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - ttl)
local current = redis.call('ZCARD', key)
if current < limit then
    redis.call('ZADD', key, now, token)
    redis.call('PEXPIRE', key, ttl)
    return {1, current + 1}
end
return {0, current}
"#;

/// KEYS[1] = slot set, ARGV[1] = ttl (ms).
const IN_FLIGHT_SCRIPT: &str = r#"
local ttl = tonumber(ARGV[1])
local time = redis.call('TIME')
local now = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)
return redis.call('ZCOUNT', KEYS[1], '(' .. (now - ttl), '+inf')
"#;

/// Counter store backed by a Redis server.
pub struct RedisStore {
    client: Client,
    connection: Arc<OnceCell<ConnectionManager>>,
    connecting: Arc<AtomicBool>,
    prefix: String,
    slot_ttl: Duration,
    clock: Arc<dyn Clock>,
    window_script: Script,
    acquire_script: Script,
    in_flight_script: Script,
}

impl RedisStore {
    /// Create a store for the given Redis URL.
    ///
    /// When called inside a Tokio runtime the connection is started in the
    /// background right away; otherwise it starts with the first operation.
    /// An unreachable server never blocks startup or a request.
    pub fn open(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let store = Self {
            client,
            connection: Arc::new(OnceCell::new()),
            connecting: Arc::new(AtomicBool::new(false)),
            prefix: prefix.into(),
            slot_ttl: DEFAULT_SLOT_TTL,
            clock: Arc::new(SystemClock),
            window_script: Script::new(WINDOW_SCRIPT),
            acquire_script: Script::new(ACQUIRE_SCRIPT),
            in_flight_script: Script::new(IN_FLIGHT_SCRIPT),
        };
        store.connect_in_background();
        Ok(store)
    }

    pub fn with_slot_ttl(mut self, slot_ttl: Duration) -> Self {
        self.slot_ttl = slot_ttl;
        self
    }

    /// Whether the background connection has been established.
    pub fn is_connected(&self) -> bool {
        self.connection.initialized()
    }

    /// Start the connection task unless one is already running.
    ///
    /// The task retries with exponential backoff until it connects, and
    /// stops once the store is dropped.
    fn connect_in_background(&self) {
        if self.connection.initialized() || self.connecting.swap(true, Ordering::AcqRel) {
            return;
        }

        let Ok(handle) = Handle::try_current() else {
            self.connecting.store(false, Ordering::Release);
            return;
        };

        let client = self.client.clone();
        let cell = Arc::downgrade(&self.connection);
        let connecting = self.connecting.clone();
        handle.spawn(async move {
            let mut backoff = CONNECT_BACKOFF_MIN;
            loop {
                debug!("Connecting to Redis");
                let result = ConnectionManager::new(client.clone()).await;
                let Some(cell) = cell.upgrade() else {
                    return;
                };
                match result {
                    Ok(manager) => {
                        if cell.set(manager).is_ok() {
                            info!("Connected to Redis");
                        }
                        connecting.store(false, Ordering::Release);
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, retry_in = ?backoff, "Failed to connect to Redis");
                    }
                }
                drop(cell);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(CONNECT_BACKOFF_MAX);
            }
        });
    }

    fn connection(&self) -> Result<ConnectionManager, StoreError> {
        match self.connection.get() {
            Some(manager) => Ok(manager.clone()),
            None => {
                self.connect_in_background();
                Err(StoreError::Unavailable(
                    "connection to Redis not established".to_string(),
                ))
            }
        }
    }

    fn window_key(&self, key: &str, bucket: &WindowBucket) -> String {
        format!("{}:rl:{}", self.prefix, bucket.storage_key(key))
    }

    fn slot_key(&self, key: &str) -> String {
        format!("{}:concurrent:{}", self.prefix, key)
    }

    fn slot_ttl_millis(&self) -> u64 {
        self.slot_ttl.as_millis().max(1) as u64
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn increment_and_check(
        &self,
        key: &str,
        limit: &RateLimit,
    ) -> Result<WindowCount, StoreError> {
        let bucket = WindowBucket::at(self.clock.now_secs(), limit.window_seconds);
        let redis_key = self.window_key(key, &bucket);
        let mut conn = self.connection()?;

        let count: u64 = self
            .window_script
            .key(&redis_key)
            .arg(bucket.window_seconds)
            .invoke_async(&mut conn)
            .await?;

        trace!(key = %redis_key, count = count, "Incremented window counter");
        Ok(WindowCount::new(count, limit, bucket.reset_time()))
    }

    async fn current_count(&self, key: &str, limit: &RateLimit) -> Result<u64, StoreError> {
        let bucket = WindowBucket::at(self.clock.now_secs(), limit.window_seconds);
        let mut conn = self.connection()?;
        let count: Option<u64> = conn.get(self.window_key(key, &bucket)).await?;
        Ok(count.unwrap_or(0))
    }
}

#[async_trait]
impl SlotStore for RedisStore {
    async fn try_acquire(
        &self,
        key: &str,
        max_concurrent: u64,
    ) -> Result<SlotAcquisition, StoreError> {
        let redis_key = self.slot_key(key);
        let token = SlotToken::new();
        let mut conn = self.connection()?;

        let (granted, in_flight): (i64, u64) = self
            .acquire_script
            .key(&redis_key)
            .arg(max_concurrent)
            .arg(token.to_string())
            .arg(self.slot_ttl_millis())
            .invoke_async(&mut conn)
            .await?;

        trace!(
            key = %redis_key,
            granted = granted,
            in_flight = in_flight,
            "Concurrent slot attempt"
        );
        Ok(SlotAcquisition {
            token: (granted == 1).then_some(token),
            in_flight,
        })
    }

    async fn release(&self, key: &str, token: &SlotToken) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let removed: u64 = conn.zrem(self.slot_key(key), token.to_string()).await?;
        trace!(key = %key, token = %token, removed = removed, "Released concurrent slot");
        Ok(())
    }

    async fn in_flight(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection()?;
        let count: u64 = self
            .in_flight_script
            .key(self.slot_key(key))
            .arg(self.slot_ttl_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }
}
