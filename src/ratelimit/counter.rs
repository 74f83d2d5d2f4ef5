//! Fixed-window bookkeeping shared by every window store.

use super::limit::RateLimit;

/// The epoch-aligned window a timestamp falls into.
///
/// Windows are `[index * window_seconds, (index + 1) * window_seconds)` in
/// Unix seconds, so every process agrees on bucket boundaries without
/// coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowBucket {
    /// Bucket number since the Unix epoch
    pub index: u64,
    /// Window start, epoch seconds
    pub window_start: u64,
    /// Window length in seconds
    pub window_seconds: u64,
}

impl WindowBucket {
    /// Locate the bucket containing `now_secs`.
    ///
    /// A zero-length window is treated as one second long; callers are
    /// expected to have rejected such limits already.
    pub fn at(now_secs: u64, window_seconds: u64) -> Self {
        let window_seconds = window_seconds.max(1);
        let index = now_secs / window_seconds;
        Self {
            index,
            window_start: index * window_seconds,
            window_seconds,
        }
    }

    /// Epoch seconds at which this window ends.
    pub fn reset_time(&self) -> u64 {
        self.window_start + self.window_seconds
    }

    /// Counter key for this bucket.
    pub fn storage_key(&self, key: &str) -> String {
        format!("{}:{}", key, self.index)
    }
}

/// Outcome of one atomic increment against a window counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Count after this request was added
    pub count: u64,
    /// The window maximum the count was checked against
    pub limit: u64,
    /// Whether the count is within the limit
    pub allowed: bool,
    /// Epoch seconds at which the window ends
    pub reset_time: u64,
}

impl WindowCount {
    pub fn new(count: u64, limit: &RateLimit, reset_time: u64) -> Self {
        Self {
            count,
            limit: limit.max_requests,
            allowed: limit.max_requests > 0 && count <= limit.max_requests,
            reset_time,
        }
    }

    /// Quota left in the window after this request.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_alignment() {
        let bucket = WindowBucket::at(1_000_005, 10);
        assert_eq!(bucket.index, 100_000);
        assert_eq!(bucket.window_start, 1_000_000);
        assert_eq!(bucket.reset_time(), 1_000_010);
    }

    #[test]
    fn test_adjacent_seconds_in_different_one_second_windows() {
        let first = WindowBucket::at(946_684_800, 1);
        let second = WindowBucket::at(946_684_801, 1);
        assert_ne!(first.index, second.index);
        assert_eq!(first.reset_time(), second.window_start);
    }

    #[test]
    fn test_storage_key() {
        let bucket = WindowBucket::at(250, 100);
        assert_eq!(
            bucket.storage_key("ip:default:Ping:GET:10.0.0.1"),
            "ip:default:Ping:GET:10.0.0.1:2"
        );
    }

    #[test]
    fn test_window_count_decisions() {
        let limit = RateLimit::new(10, 100);
        let count = WindowCount::new(10, &limit, 200);
        assert!(count.allowed);
        assert_eq!(count.remaining(), 0);

        let over = WindowCount::new(11, &limit, 200);
        assert!(!over.allowed);
        assert_eq!(over.remaining(), 0);
    }

    #[test]
    fn test_zero_limit_always_denies() {
        let limit = RateLimit::new(0, 100);
        let count = WindowCount::new(0, &limit, 200);
        assert!(!count.allowed);
        assert_eq!(count.remaining(), 0);
    }
}
