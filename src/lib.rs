//! Medgate - role-based access control for a hospital record-keeping API
//!
//! Medgate authenticates staff, issues signed session tokens, decides whether a
//! request may touch a resource, and keeps an append-only audit trail of every
//! security-relevant decision. The route layer calls into [`Medgate`] and the
//! services it wires together; no router is provided.

pub mod audit;
pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod permissions;
pub mod records;
pub mod storage;

pub use engine::Medgate;
pub use error::{MedgateError, Result};

use auth::{Claims, RoleName, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

/// Context for a request being processed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    /// Unique request identifier
    pub request_id: String,
    /// When the request was received
    pub timestamp: DateTime<Utc>,
    /// Source IP address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<IpAddr>,
    /// User agent string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl RequestContext {
    /// Create a new request context with generated ID
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source_ip: None,
            user_agent: None,
        }
    }

    /// Set the client address
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.source_ip = Some(ip);
        self
    }

    /// Set the client user agent
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Who is performing an administrative operation.
///
/// Built from verified [`Claims`] for API callers, or with [`Actor::system`]
/// for operator tooling such as the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_name: Option<RoleName>,
}

impl Actor {
    /// An operator acting outside of any session
    pub fn system(name: impl Into<String>) -> Self {
        Self {
            user_id: None,
            username: name.into(),
            role_name: None,
        }
    }
}

impl From<&Claims> for Actor {
    fn from(claims: &Claims) -> Self {
        Self {
            user_id: Some(claims.user_id),
            username: claims.username.clone(),
            role_name: Some(claims.role_name.clone()),
        }
    }
}
