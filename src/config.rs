//! Configuration management for Floodgate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::admission::{Admission, EndpointPolicy};
use crate::error::{FloodgateError, Result};
use crate::ratelimit::{CategoryLimits, LimitDefaults, LimitResolver, RateLimitConfig};
use crate::store::{MemoryStore, RedisStore};

/// Prefix of environment variables that override file settings,
/// e.g. `FLOODGATE_STORE__BACKEND=redis`.
pub const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Global and group default limits
    #[serde(default)]
    pub limits: LimitDefaults,

    /// Endpoints served and their rate limit declarations
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which store holds the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local; exact only with a single server process
    #[default]
    Memory,
    /// Shared Redis server
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for every key written to the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on one store round trip before failing open
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Lifetime of a concurrency slot that is never released
    #[serde(default = "default_slot_ttl")]
    pub slot_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            operation_timeout_ms: default_operation_timeout(),
            slot_ttl_secs: default_slot_ttl(),
        }
    }
}

fn default_key_prefix() -> String {
    "floodgate".to_string()
}

fn default_operation_timeout() -> u64 {
    50
}

fn default_slot_ttl() -> u64 {
    30
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn slot_ttl(&self) -> Duration {
        Duration::from_secs(self.slot_ttl_secs)
    }
}

/// An endpoint served by the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Endpoint identity used in rate limit keys
    pub name: String,

    /// Route path
    pub path: String,

    /// Whether the endpoint is rate limited at all
    #[serde(default = "default_true")]
    pub rate_limited: bool,

    /// Whether over-limit requests are rejected or only tracked
    #[serde(default = "default_true")]
    pub enforce: bool,

    /// Default limit group
    #[serde(default)]
    pub group: Option<String>,

    /// Method -> category -> limit
    #[serde(default)]
    pub limit_overrides: HashMap<String, CategoryLimits>,

    /// Simulated handler latency
    #[serde(default)]
    pub response_delay_ms: u64,
}

fn default_true() -> bool {
    true
}

impl EndpointConfig {
    pub fn policy(&self) -> EndpointPolicy {
        EndpointPolicy {
            endpoint: self.name.clone(),
            opt_in: self.rate_limited,
            enforce: self.enforce,
            config: RateLimitConfig {
                group: self.group.clone(),
                limit_overrides: self.limit_overrides.clone(),
            },
        }
    }

    pub fn response_delay(&self) -> Duration {
        Duration::from_millis(self.response_delay_ms)
    }
}

impl FloodgateConfig {
    /// Load configuration from an optional file, overlaid with
    /// `FLOODGATE_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path));
        }
        let config: FloodgateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig = serde_yaml::from_str(yaml).map_err(|e| {
            FloodgateError::Config(format!("Failed to parse configuration: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(FloodgateError::Config(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }
        if self.store.operation_timeout_ms == 0 {
            return Err(FloodgateError::Config(
                "store.operation_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the admission controller described by this configuration.
    pub fn admission(&self) -> Result<Admission> {
        let resolver = LimitResolver::new(self.limits.clone());
        let admission = match self.store.backend {
            StoreBackend::Memory => {
                let store = Arc::new(MemoryStore::with_clock(
                    Arc::new(crate::clock::SystemClock),
                    self.store.slot_ttl(),
                ));
                Admission::with_store(resolver, store)
            }
            StoreBackend::Redis => {
                let url = self.store.redis_url.as_deref().ok_or_else(|| {
                    FloodgateError::Config(
                        "store.redis_url is required for the redis backend".to_string(),
                    )
                })?;
                let store = RedisStore::open(url, self.store.key_prefix.clone())?
                    .with_slot_ttl(self.store.slot_ttl());
                Admission::with_store(resolver, Arc::new(store))
            }
        };
        info!(backend = ?self.store.backend, "Admission controller initialized");
        Ok(admission.with_store_timeout(self.store.operation_timeout()))
    }
}
