//! Inputs to ticket creation: the authenticated principal and the target service.
//!
//! Both are produced upstream (credential verification, service registry) and
//! are treated here as plain values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Authentication attribute carrying the remember-me choice.
pub const REMEMBER_ME_ATTRIBUTE: &str = "remember_me";

/// Multi-valued attribute map. Ordered so serialized tickets are byte-stable.
pub type Attributes = BTreeMap<String, Vec<String>>;

/// Authenticated subject.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Attributes::new(),
        }
    }
}

/// Result of a successful primary (or proxy) authentication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Authentication {
    pub principal: Principal,
    #[serde(default)]
    pub attributes: Attributes,
    /// When the authentication happened (Unix ms).
    pub authentication_date_ms: u64,
}

impl Authentication {
    pub fn new(principal: Principal, authentication_date_ms: u64) -> Self {
        Self {
            principal,
            attributes: Attributes::new(),
            authentication_date_ms,
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, values: Vec<String>) -> Self {
        self.attributes.insert(name.into(), values);
        self
    }

    pub fn with_remember_me(self, remember_me: bool) -> Self {
        self.with_attribute(REMEMBER_ME_ATTRIBUTE, vec![remember_me.to_string()])
    }

    pub fn is_remember_me(&self) -> bool {
        self.attributes
            .get(REMEMBER_ME_ATTRIBUTE)
            .is_some_and(|values| values.iter().any(|v| v.eq_ignore_ascii_case("true")))
    }
}

/// Target application a service ticket is issued to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Service {
    /// Identifier the service presents at validation time.
    pub id: String,
    /// URL as originally requested, before normalization.
    pub original_url: String,
    /// Where single-logout notifications are sent. Defaults to the service id.
    #[serde(default)]
    pub logout_url: Option<String>,
}

impl Service {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            original_url: id.clone(),
            id,
            logout_url: None,
        }
    }

    pub fn with_logout_url(mut self, logout_url: impl Into<String>) -> Self {
        self.logout_url = Some(logout_url.into());
        self
    }

    /// True when `other` identifies the same service as this one.
    pub fn matches(&self, other: &Service) -> bool {
        self.id == other.id
    }

    /// Service URL without query string or path parameters
    /// (`;jsessionid=...`), used to detect repeat sessions to one application.
    pub fn normalized_url(&self) -> &str {
        let url = self.original_url.as_str();
        let end = url.find(['?', ';', '#']).unwrap_or(url.len());
        &url[..end]
    }

    pub fn logout_endpoint(&self) -> &str {
        self.logout_url.as_deref().unwrap_or(&self.id)
    }
}
