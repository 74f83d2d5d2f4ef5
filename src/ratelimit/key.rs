//! Rate limit key derivation from a request's resolved identity.

use http::Method;
use std::fmt;

use super::limit::RateLimitCategory;

/// How the request authenticated, as reported by the auth layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMarker {
    /// A personal token acting on behalf of the attached user
    UserToken,
    /// An organization API key. It does not carry a rate-limit identity of
    /// its own, so such requests are limited by the caller's address.
    ApiKey { organization_id: u64 },
    /// A token scoped to an organization (integration installs). Narrows
    /// the request to that organization even if a user is attached.
    OrganizationToken { organization_id: u64 },
}

/// The resolved identity of a request.
///
/// Produced by the authentication collaborator and handed to the admission
/// layer through the request extensions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIdentity {
    /// Client address, as resolved by any proxy handling upstream
    pub ip: Option<String>,
    /// Authenticated user id
    pub user_id: Option<u64>,
    /// Authentication marker
    pub auth: Option<AuthMarker>,
}

impl RequestIdentity {
    /// An anonymous caller at the given address.
    pub fn anonymous(ip: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: u64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_auth(mut self, auth: AuthMarker) -> Self {
        self.auth = Some(auth);
        self
    }

    /// The identity value for a category, if this request has one.
    pub fn value_for(&self, category: RateLimitCategory) -> Option<String> {
        match category {
            RateLimitCategory::Organization => match self.auth {
                Some(AuthMarker::OrganizationToken { organization_id }) => {
                    Some(organization_id.to_string())
                }
                _ => None,
            },
            RateLimitCategory::User => self.user_id.map(|id| id.to_string()),
            RateLimitCategory::Ip => {
                self.ip.as_deref().filter(|ip| !ip.is_empty()).map(String::from)
            }
        }
    }

    /// The most specific category this request can be limited by.
    pub fn classify(&self) -> Option<(RateLimitCategory, String)> {
        RateLimitCategory::PREFERENCE
            .iter()
            .find_map(|&category| self.value_for(category).map(|value| (category, value)))
    }
}

/// A key that identifies who is limited on which endpoint and method.
///
/// Rendered as `<category>:<group>:<endpoint>:<METHOD>:<identity>`. The
/// identity comes last and is taken verbatim, so IPv6 colons are harmless.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub category: RateLimitCategory,
    pub group: String,
    pub endpoint: String,
    pub method: Method,
    pub identity: String,
}

impl RateLimitKey {
    /// Derive the key for one specific category.
    ///
    /// Returns `None` when the request has no identity value for the
    /// category; no placeholder identity is ever substituted.
    pub fn for_category(
        method: &Method,
        endpoint: &str,
        group: &str,
        category: RateLimitCategory,
        identity: &RequestIdentity,
    ) -> Option<Self> {
        let value = identity.value_for(category)?;
        Some(Self {
            category,
            group: group.to_string(),
            endpoint: endpoint.to_string(),
            method: method.clone(),
            identity: value,
        })
    }

    /// Derive the key for the most specific category the request supports.
    pub fn derive(
        method: &Method,
        endpoint: &str,
        group: &str,
        identity: &RequestIdentity,
    ) -> Option<Self> {
        RateLimitCategory::PREFERENCE
            .iter()
            .find_map(|&category| Self::for_category(method, endpoint, group, category, identity))
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.category, self.group, self.endpoint, self.method, self.identity
        )
    }
}
