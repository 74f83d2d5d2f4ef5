//! Rate limit values, key derivation and limit resolution.

mod counter;
mod key;
mod limit;
mod rules;

pub use counter::{WindowBucket, WindowCount};
pub use key::{AuthMarker, RateLimitKey, RequestIdentity};
pub use limit::{RateLimit, RateLimitCategory};
pub use rules::{
    CategoryLimits, LimitDefaults, LimitResolver, RateLimitConfig, DEFAULT_GROUP,
    GLOBAL_DEFAULT_LIMIT, METHODS,
};
