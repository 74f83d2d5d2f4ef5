//! Rate limit rule configuration and resolution.
//!
//! Limits are resolved from three layers: an endpoint's per-method,
//! per-category override, then the default set of the endpoint's group,
//! then the global default. The defaults are loaded once at startup and
//! never change while the process runs.

use http::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::limit::{RateLimit, RateLimitCategory};
use crate::error::{FloodgateError, Result};

/// Group used by endpoints that do not name one.
pub const DEFAULT_GROUP: &str = "default";

/// Limit applied when nothing more specific is configured.
pub const GLOBAL_DEFAULT_LIMIT: RateLimit = RateLimit::new(40, 1);

/// Methods an endpoint can declare overrides for.
pub const METHODS: [Method; 7] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
    Method::HEAD,
    Method::OPTIONS,
];

/// Per-category limits keyed by category.
pub type CategoryLimits = HashMap<RateLimitCategory, RateLimit>;

/// Rate limit configuration declared by a single endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Named default set to fall back on
    #[serde(default)]
    pub group: Option<String>,
    /// Method (upper case) -> category -> limit
    #[serde(default)]
    pub limit_overrides: HashMap<String, CategoryLimits>,
}

impl RateLimitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_override(
        mut self,
        method: Method,
        category: RateLimitCategory,
        limit: RateLimit,
    ) -> Self {
        self.limit_overrides
            .entry(method.as_str().to_string())
            .or_default()
            .insert(category, limit);
        self
    }

    /// The group this endpoint belongs to.
    pub fn group(&self) -> &str {
        self.group.as_deref().unwrap_or(DEFAULT_GROUP)
    }

    /// The explicit override for a method and category, if declared.
    pub fn override_for(&self, method: &Method, category: RateLimitCategory) -> Option<&RateLimit> {
        let by_category = self.limit_overrides.get(method.as_str()).or_else(|| {
            self.limit_overrides
                .iter()
                .find(|(m, _)| m.eq_ignore_ascii_case(method.as_str()))
                .map(|(_, limits)| limits)
        })?;
        by_category.get(&category)
    }

    /// Human-readable descriptions of overrides that cannot be used as
    /// written. Resolution falls back to the global default for these.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (method, limits) in &self.limit_overrides {
            if Method::from_bytes(method.to_ascii_uppercase().as_bytes()).is_err() {
                problems.push(format!("override declared for invalid method {:?}", method));
            }
            for (category, limit) in limits {
                if !limit.is_valid() {
                    problems.push(format!(
                        "{} override for {} has a zero-length window",
                        method, category
                    ));
                }
            }
        }
        problems.sort();
        problems
    }
}

/// Process-wide default limits: the global default and named group sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitDefaults {
    /// Limit used when neither an override nor a group default applies
    #[serde(default = "default_global_limit")]
    pub global_default: RateLimit,
    /// Group name -> category -> limit
    #[serde(default)]
    pub groups: HashMap<String, CategoryLimits>,
}

fn default_global_limit() -> RateLimit {
    GLOBAL_DEFAULT_LIMIT
}

impl Default for LimitDefaults {
    fn default() -> Self {
        Self {
            global_default: GLOBAL_DEFAULT_LIMIT,
            groups: HashMap::new(),
        }
    }
}

impl LimitDefaults {
    pub fn with_group_default(
        mut self,
        group: impl Into<String>,
        category: RateLimitCategory,
        limit: RateLimit,
    ) -> Self {
        self.groups.entry(group.into()).or_default().insert(category, limit);
        self
    }

    /// Load defaults from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading default rate limits");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load defaults from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let defaults: LimitDefaults = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse default limits: {}", e)))?;
        defaults.validate()?;
        Ok(defaults)
    }

    /// Reject defaults that could never be enforced.
    pub fn validate(&self) -> Result<()> {
        if !self.global_default.is_valid() {
            return Err(FloodgateError::Config(
                "global default limit has a zero-length window".to_string(),
            ));
        }
        for (group, limits) in &self.groups {
            for (category, limit) in limits {
                if !limit.is_valid() {
                    return Err(FloodgateError::Config(format!(
                        "default limit for group {} category {} has a zero-length window",
                        group, category
                    )));
                }
            }
        }
        Ok(())
    }

    /// The default for a group and category, if the group defines one.
    pub fn group_default(&self, group: &str, category: RateLimitCategory) -> Option<RateLimit> {
        self.groups
            .get(group)
            .and_then(|limits| limits.get(&category))
            .copied()
            .filter(RateLimit::is_valid)
    }
}

/// Resolves the limit that applies to a request.
///
/// Resolution is a pure function of the method, the endpoint's
/// configuration, the category and the immutable defaults.
#[derive(Debug, Clone, Default)]
pub struct LimitResolver {
    defaults: Arc<LimitDefaults>,
}

impl LimitResolver {
    pub fn new(defaults: LimitDefaults) -> Self {
        Self {
            defaults: Arc::new(defaults),
        }
    }

    pub fn defaults(&self) -> &LimitDefaults {
        &self.defaults
    }

    pub fn resolve(
        &self,
        method: &Method,
        config: &RateLimitConfig,
        category: RateLimitCategory,
    ) -> RateLimit {
        if let Some(limit) = config.override_for(method, category) {
            if limit.is_valid() {
                return *limit;
            }
            return self.defaults.global_default;
        }

        self.defaults
            .group_default(config.group(), category)
            .unwrap_or(self.defaults.global_default)
    }

    /// Every method/category combination with its resolved limit.
    pub fn resolve_all(
        &self,
        config: &RateLimitConfig,
    ) -> Vec<(Method, RateLimitCategory, RateLimit)> {
        let mut table = Vec::with_capacity(METHODS.len() * RateLimitCategory::PREFERENCE.len());
        for method in METHODS.iter() {
            for category in RateLimitCategory::PREFERENCE {
                table.push((method.clone(), category, self.resolve(method, config, category)));
            }
        }
        table
    }
}
