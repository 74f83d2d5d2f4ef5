//! Scoped ownership of a concurrency slot.

use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{trace, warn};

use crate::store::{SlotStore, SlotToken};

/// A held concurrency slot, released exactly once.
///
/// The normal path calls [`SlotGuard::release`] after the handler returns.
/// If the guard is dropped instead (the handler panicked, or the request
/// future was cancelled because the client went away) the release is
/// spawned onto the current runtime. Should that also be impossible, the
/// store's slot TTL reclaims the slot.
pub struct SlotGuard {
    store: Arc<dyn SlotStore>,
    key: String,
    token: Option<SlotToken>,
    timeout: Duration,
}

impl SlotGuard {
    pub(crate) fn new(
        store: Arc<dyn SlotStore>,
        key: String,
        token: SlotToken,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            key,
            token: Some(token),
            timeout,
        }
    }

    /// Release the slot and wait for the store to acknowledge it.
    pub async fn release(mut self) {
        if let Some(token) = self.token.take() {
            release_slot(self.store.as_ref(), &self.key, &token, self.timeout).await;
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };

        match Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                let key = std::mem::take(&mut self.key);
                let timeout = self.timeout;
                handle.spawn(async move {
                    release_slot(store.as_ref(), &key, &token, timeout).await;
                });
            }
            Err(_) => {
                warn!(
                    key = %self.key,
                    token = %token,
                    "No runtime available to release concurrent slot; it will expire"
                );
            }
        }
    }
}

async fn release_slot(store: &dyn SlotStore, key: &str, token: &SlotToken, timeout: Duration) {
    match tokio::time::timeout(timeout, store.release(key, token)).await {
        Ok(Ok(())) => trace!(key = %key, token = %token, "Concurrent slot released"),
        Ok(Err(e)) => warn!(
            key = %key,
            token = %token,
            error = %e,
            "Failed to release concurrent slot; it will expire"
        ),
        Err(_) => warn!(
            key = %key,
            token = %token,
            "Timed out releasing concurrent slot; it will expire"
        ),
    }
}
