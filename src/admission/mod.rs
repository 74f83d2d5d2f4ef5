//! Per-request admission decisions.
//!
//! [`Admission::evaluate`] runs the whole decision for one request: derive
//! the key, resolve the limit, count the request against its window and,
//! for concurrency-limited endpoints, reserve an in-flight slot. Any store
//! failure makes the request pass without rate-limit information, so an
//! outage of the store never turns into an outage of the API.

mod guard;
mod layer;
mod metadata;

pub use guard::SlotGuard;
pub use layer::{AdmissionLayer, AdmissionService};
pub use metadata::{headers, RateLimitMetadata, RateLimitReason};

use http::Method;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::ratelimit::{LimitResolver, RateLimitConfig, RateLimitKey, RequestIdentity};
use crate::store::{SlotStore, StoreError, WindowStore};

/// Default upper bound on a single store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(50);

/// Rate limiting capabilities an endpoint declares at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPolicy {
    /// Endpoint identity used in keys (a handler or route name)
    pub endpoint: String,
    /// Whether requests to the endpoint are limited at all
    pub opt_in: bool,
    /// Whether over-limit requests are rejected, or only tracked
    pub enforce: bool,
    /// Group and per-method overrides
    pub config: RateLimitConfig,
}

impl EndpointPolicy {
    /// A limited, enforced endpoint using group defaults.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            opt_in: true,
            enforce: true,
            config: RateLimitConfig::default(),
        }
    }

    /// An endpoint that is never limited.
    pub fn exempt(endpoint: impl Into<String>) -> Self {
        Self {
            opt_in: false,
            ..Self::new(endpoint)
        }
    }

    pub fn with_config(mut self, config: RateLimitConfig) -> Self {
        self.config = config;
        self
    }

    /// Count and report, but never reject.
    pub fn tracking_only(mut self) -> Self {
        self.enforce = false;
        self
    }
}

/// A request that may proceed.
pub struct Admitted {
    /// What the limiter decided, absent if the store could not be consulted
    pub metadata: Option<RateLimitMetadata>,
    /// Slot held for the duration of the request
    pub slot: Option<SlotGuard>,
}

/// Outcome of an admission check.
pub enum Decision {
    /// Not subject to limiting
    Bypassed,
    /// Forward to the handler
    Allowed(Admitted),
    /// Answer with 429
    Rejected(RateLimitMetadata),
}

impl Decision {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Decision::Rejected(_))
    }

    pub fn metadata(&self) -> Option<&RateLimitMetadata> {
        match self {
            Decision::Bypassed => None,
            Decision::Allowed(admitted) => admitted.metadata.as_ref(),
            Decision::Rejected(metadata) => Some(metadata),
        }
    }
}

/// The admission controller shared by every endpoint.
pub struct Admission {
    resolver: LimitResolver,
    windows: Arc<dyn WindowStore>,
    slots: Arc<dyn SlotStore>,
    store_timeout: Duration,
}

impl Admission {
    pub fn new(
        resolver: LimitResolver,
        windows: Arc<dyn WindowStore>,
        slots: Arc<dyn SlotStore>,
    ) -> Self {
        Self {
            resolver,
            windows,
            slots,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Use one store for both window counters and concurrency slots.
    pub fn with_store<S>(resolver: LimitResolver, store: Arc<S>) -> Self
    where
        S: WindowStore + SlotStore + 'static,
    {
        Self::new(resolver, store.clone(), store)
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn resolver(&self) -> &LimitResolver {
        &self.resolver
    }

    /// Decide whether a request may proceed.
    pub async fn evaluate(
        &self,
        method: &Method,
        policy: &EndpointPolicy,
        identity: &RequestIdentity,
    ) -> Decision {
        if !policy.opt_in {
            return Decision::Bypassed;
        }

        let group = policy.config.group();
        let Some(key) = RateLimitKey::derive(method, &policy.endpoint, group, identity) else {
            trace!(endpoint = %policy.endpoint, "No identity to rate limit by");
            return Decision::Bypassed;
        };

        let limit = self.resolver.resolve(method, &policy.config, key.category);
        let storage_key = key.to_string();

        let window = match self
            .bounded(self.windows.increment_and_check(&storage_key, &limit))
            .await
        {
            Ok(window) => window,
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Rate limit store failed; allowing request");
                return Decision::Allowed(Admitted {
                    metadata: None,
                    slot: None,
                });
            }
        };

        let mut metadata = RateLimitMetadata::new(key, limit, window, policy.enforce);

        if !window.allowed {
            metadata.reason = RateLimitReason::WindowLimit;
            if policy.enforce {
                debug!(
                    key = %storage_key,
                    count = window.count,
                    limit = limit.max_requests,
                    reset_at = ?metadata.reset_at(),
                    "Rate limit exceeded"
                );
                return Decision::Rejected(metadata);
            }
            info!(key = %storage_key, count = window.count, "Request would be rate limited");
        }

        let mut slot = None;
        if let Some(max_concurrent) = limit.max_concurrent {
            match self.bounded(self.slots.try_acquire(&storage_key, max_concurrent)).await {
                Ok(acquisition) => {
                    metadata.concurrent_in_flight = Some(acquisition.in_flight);
                    match acquisition.token {
                        Some(token) => {
                            slot = Some(SlotGuard::new(
                                self.slots.clone(),
                                storage_key.clone(),
                                token,
                                self.store_timeout,
                            ));
                        }
                        None => {
                            if metadata.reason == RateLimitReason::NotLimited {
                                metadata.reason = RateLimitReason::ConcurrentLimit;
                            }
                            if policy.enforce {
                                debug!(
                                    key = %storage_key,
                                    in_flight = acquisition.in_flight,
                                    limit = max_concurrent,
                                    "Concurrent request limit exceeded"
                                );
                                return Decision::Rejected(metadata);
                            }
                            info!(key = %storage_key, "Request would be concurrency limited");
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        key = %storage_key,
                        error = %e,
                        "Concurrent slot store failed; allowing request"
                    );
                }
            }
        }

        trace!(key = %storage_key, reason = ?metadata.reason, "Request admitted");
        Decision::Allowed(Admitted {
            metadata: Some(metadata),
            slot,
        })
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.store_timeout, operation)
            .await
            .map_err(|_| StoreError::Timeout(self.store_timeout))?
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::{AuthMarker, LimitDefaults, RateLimit, RateLimitCategory, WindowCount};
    use crate::store::{MemoryStore, SlotAcquisition, SlotToken};
    use async_trait::async_trait;

    /// A store whose every operation fails.
    pub(crate) struct FailingStore;

    #[async_trait]
    impl WindowStore for FailingStore {
        async fn increment_and_check(
            &self,
            _key: &str,
            _limit: &RateLimit,
        ) -> Result<WindowCount, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn current_count(&self, _key: &str, _limit: &RateLimit) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    #[async_trait]
    impl SlotStore for FailingStore {
        async fn try_acquire(&self, _key: &str, _max: u64) -> Result<SlotAcquisition, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn release(&self, _key: &str, _token: &SlotToken) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn in_flight(&self, _key: &str) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    /// A store that never answers in time.
    pub(crate) struct StalledStore;

    #[async_trait]
    impl WindowStore for StalledStore {
        async fn increment_and_check(
            &self,
            _key: &str,
            _limit: &RateLimit,
        ) -> Result<WindowCount, StoreError> {
            std::future::pending().await
        }

        async fn current_count(&self, _key: &str, _limit: &RateLimit) -> Result<u64, StoreError> {
            std::future::pending().await
        }
    }

    fn admission_at(secs: u64) -> (Admission, Arc<MemoryStore>) {
        let clock = ManualClock::at_secs(secs);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock), Duration::from_secs(30)));
        (Admission::with_store(LimitResolver::default(), store.clone()), store)
    }

    fn policy_with(limit: RateLimit) -> EndpointPolicy {
        EndpointPolicy::new("Ping").with_config(
            RateLimitConfig::new()
                .with_override(Method::GET, RateLimitCategory::Ip, limit)
                .with_override(Method::GET, RateLimitCategory::User, limit)
                .with_override(Method::GET, RateLimitCategory::Organization, limit),
        )
    }

    #[tokio::test]
    async fn test_exempt_endpoint_bypassed() {
        let (admission, _) = admission_at(1_000);
        let identity = RequestIdentity::anonymous("10.0.0.1");
        let decision = admission
            .evaluate(&Method::GET, &EndpointPolicy::exempt("Health"), &identity)
            .await;
        assert!(matches!(decision, Decision::Bypassed));
    }

    #[tokio::test]
    async fn test_missing_identity_bypassed() {
        let (admission, store) = admission_at(1_000);
        let policy = policy_with(RateLimit::new(0, 100));
        let decision = admission
            .evaluate(&Method::GET, &policy, &RequestIdentity::default())
            .await;
        assert!(matches!(decision, Decision::Bypassed));
        assert_eq!(store.window_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_limit_rejects() {
        let (admission, _) = admission_at(1_000);
        let policy = policy_with(RateLimit::new(0, 100));
        let identity = RequestIdentity::anonymous("10.0.0.1");
        let decision = admission.evaluate(&Method::GET, &policy, &identity).await;
        let metadata = decision.metadata().unwrap();
        assert!(decision.is_rejected());
        assert_eq!(metadata.reason, RateLimitReason::WindowLimit);
        assert_eq!(metadata.remaining(), 0);
    }

    #[tokio::test]
    async fn test_tracking_only_admits_over_limit() {
        let (admission, _) = admission_at(1_000);
        let policy = policy_with(RateLimit::new(0, 100)).tracking_only();
        let decision = admission
            .evaluate(&Method::GET, &policy, &RequestIdentity::anonymous("10.0.0.1"))
            .await;

        assert!(!decision.is_rejected());
        let metadata = decision.metadata().unwrap();
        assert_eq!(metadata.reason, RateLimitReason::WindowLimit);
        assert!(!metadata.enforced);
    }

    #[tokio::test]
    async fn test_organization_token_limits_by_organization() {
        let (admission, _) = admission_at(1_000);
        let identity = RequestIdentity::anonymous("10.0.0.1")
            .with_user(3)
            .with_auth(AuthMarker::OrganizationToken { organization_id: 9 });
        let decision = admission
            .evaluate(&Method::GET, &policy_with(RateLimit::new(5, 100)), &identity)
            .await;

        let metadata = decision.metadata().unwrap();
        assert_eq!(metadata.key.category, RateLimitCategory::Organization);
        assert_eq!(metadata.key.to_string(), "org:default:Ping:GET:9");
    }

    #[tokio::test]
    async fn test_group_default_applies() {
        let clock = ManualClock::at_secs(1_000);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock), Duration::from_secs(30)));
        let defaults = LimitDefaults::default().with_group_default(
            "tight",
            RateLimitCategory::Ip,
            RateLimit::new(1, 60),
        );
        let admission = Admission::with_store(LimitResolver::new(defaults), store);
        let config = RateLimitConfig::new().with_group("tight");
        let policy = EndpointPolicy::new("Ping").with_config(config);
        let identity = RequestIdentity::anonymous("10.0.0.1");

        assert!(!admission.evaluate(&Method::GET, &policy, &identity).await.is_rejected());
        assert!(admission.evaluate(&Method::GET, &policy, &identity).await.is_rejected());
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let store = Arc::new(FailingStore);
        let admission = Admission::with_store(LimitResolver::default(), store);
        let policy = policy_with(RateLimit::new(0, 100));
        let identity = RequestIdentity::anonymous("10.0.0.1");
        let decision = admission.evaluate(&Method::GET, &policy, &identity).await;

        match decision {
            Decision::Allowed(admitted) => {
                assert!(admitted.metadata.is_none());
                assert!(admitted.slot.is_none());
            }
            _ => panic!("expected the request to be allowed"),
        }
    }

    #[tokio::test]
    async fn test_store_timeout_fails_open() {
        let admission = Admission::new(
            LimitResolver::default(),
            Arc::new(StalledStore),
            Arc::new(MemoryStore::new()),
        )
        .with_store_timeout(Duration::from_millis(10));
        let policy = policy_with(RateLimit::new(0, 100));
        let identity = RequestIdentity::anonymous("10.0.0.1");
        let decision = admission.evaluate(&Method::GET, &policy, &identity).await;

        assert!(!decision.is_rejected());
        assert!(decision.metadata().is_none());
    }

    #[tokio::test]
    async fn test_slot_store_failure_keeps_window_metadata() {
        let windows = Arc::new(MemoryStore::new());
        let admission = Admission::new(LimitResolver::default(), windows, Arc::new(FailingStore));
        let decision = admission
            .evaluate(
                &Method::GET,
                &policy_with(RateLimit::with_concurrency(10, 100, 1)),
                &RequestIdentity::anonymous("10.0.0.1"),
            )
            .await;

        match decision {
            Decision::Allowed(admitted) => {
                let metadata = admitted.metadata.unwrap();
                assert_eq!(metadata.remaining(), 9);
                assert_eq!(metadata.concurrent_remaining(), None);
                assert!(admitted.slot.is_none());
            }
            _ => panic!("expected the request to be allowed"),
        }
    }

    #[tokio::test]
    async fn test_concurrency_limit_rejects_when_full() {
        let (admission, store) = admission_at(1_000);
        let policy = policy_with(RateLimit::with_concurrency(100, 100, 1));
        let identity = RequestIdentity::anonymous("10.0.0.1");

        let first = admission.evaluate(&Method::GET, &policy, &identity).await;
        let second = admission.evaluate(&Method::GET, &policy, &identity).await;
        assert!(second.is_rejected());
        assert_eq!(second.metadata().unwrap().reason, RateLimitReason::ConcurrentLimit);
        assert_eq!(second.metadata().unwrap().concurrent_remaining(), Some(0));

        if let Decision::Allowed(admitted) = first {
            admitted.slot.unwrap().release().await;
        } else {
            panic!("expected the first request to be allowed");
        }
        assert_eq!(store.in_flight("ip:default:Ping:GET:10.0.0.1").await.unwrap(), 0);
        assert!(!admission.evaluate(&Method::GET, &policy, &identity).await.is_rejected());
    }
}
