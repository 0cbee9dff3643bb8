//! Audit event types

use crate::RequestContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Store-assigned, monotonically increasing event identifier
pub type EventId = i64;

/// Kind of security-relevant action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Login,
    Logout,
    /// Older rows record failed logins with their own event type instead of
    /// `Login` + `failed`; both are counted as failed logins.
    FailedLogin,
    Select,
    Insert,
    Update,
    Delete,
    Grant,
    Revoke,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        EventType::Login,
        EventType::Logout,
        EventType::FailedLogin,
        EventType::Select,
        EventType::Insert,
        EventType::Update,
        EventType::Delete,
        EventType::Grant,
        EventType::Revoke,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Login => "LOGIN",
            EventType::Logout => "LOGOUT",
            EventType::FailedLogin => "FAILED_LOGIN",
            EventType::Select => "SELECT",
            EventType::Insert => "INSERT",
            EventType::Update => "UPDATE",
            EventType::Delete => "DELETE",
            EventType::Grant => "GRANT",
            EventType::Revoke => "REVOKE",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("Unknown event type: {}", s))
    }
}

/// Outcome of the audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    /// The action completed
    Success,
    /// The action was attempted and failed (bad credentials, missing row, store error)
    Failed,
    /// The caller was refused by the access gate
    Denied,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Success => "success",
            AuditStatus::Failed => "failed",
            AuditStatus::Denied => "denied",
        }
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "success" => Ok(AuditStatus::Success),
            "failed" | "failure" => Ok(AuditStatus::Failed),
            "denied" => Ok(AuditStatus::Denied),
            other => Err(format!("Unknown audit status: {}", other)),
        }
    }
}

/// Audit event builder, handed to the recorder or the store
#[derive(Debug, Clone)]
pub struct NewAuditEvent {
    pub event_type: EventType,
    pub resource: String,
    pub username: String,
    pub status: AuditStatus,
    pub details: Option<String>,
    pub ip_address: Option<IpAddr>,
    pub timestamp: DateTime<Utc>,
}

impl NewAuditEvent {
    /// A successful event stamped with the current time
    pub fn new(event_type: EventType, resource: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            event_type,
            resource: resource.into(),
            username: username.into(),
            status: AuditStatus::Success,
            details: None,
            ip_address: None,
            timestamp: Utc::now(),
        }
    }

    pub fn status(mut self, status: AuditStatus) -> Self {
        self.status = status;
        self
    }

    pub fn failed(self) -> Self {
        self.status(AuditStatus::Failed)
    }

    pub fn denied(self) -> Self {
        self.status(AuditStatus::Denied)
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn ip(mut self, ip_address: IpAddr) -> Self {
        self.ip_address = Some(ip_address);
        self
    }

    /// Take the client address from the request context
    pub fn context(mut self, ctx: &RequestContext) -> Self {
        self.ip_address = ctx.source_ip.or(self.ip_address);
        self
    }

    /// Override the event time
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Materialize with a store-assigned id
    pub fn into_event(self, event_id: EventId) -> AuditEvent {
        AuditEvent {
            event_id,
            event_type: self.event_type,
            resource: self.resource,
            username: self.username,
            status: self.status,
            details: self.details,
            ip_address: self.ip_address.map(|ip| ip.to_string()),
            timestamp: self.timestamp,
        }
    }
}

/// An immutable audit log row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: EventId,
    pub event_type: EventType,
    /// Table the action touched
    pub resource: String,
    /// Username as supplied, even when it matched no account
    pub username: String,
    pub status: AuditStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn is_failed_login(&self) -> bool {
        match self.event_type {
            EventType::FailedLogin => true,
            EventType::Login => self.status != AuditStatus::Success,
            _ => false,
        }
    }

    /// A refused or failed action other than a login attempt
    pub fn is_unauthorized_attempt(&self) -> bool {
        !matches!(self.event_type, EventType::Login | EventType::FailedLogin)
            && self.status != AuditStatus::Success
    }
}
