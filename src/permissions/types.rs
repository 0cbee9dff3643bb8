//! Resources, actions and permission records

use crate::audit::EventType;
use crate::auth::{RoleId, RoleName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Store-assigned permission identifier
pub type PermissionId = i64;

/// A table guarded by the access gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Patients,
    MedicalRecords,
    Appointments,
    Users,
    Roles,
    Permissions,
    AuditLog,
}

impl Resource {
    pub const ALL: [Resource; 7] = [
        Resource::Patients,
        Resource::MedicalRecords,
        Resource::Appointments,
        Resource::Users,
        Resource::Roles,
        Resource::Permissions,
        Resource::AuditLog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Patients => "patients",
            Resource::MedicalRecords => "medical_records",
            Resource::Appointments => "appointments",
            Resource::Users => "users",
            Resource::Roles => "roles",
            Resource::Permissions => "permissions",
            Resource::AuditLog => "audit_log",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resource::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("Unknown resource: {}", s))
    }
}

/// Operation performed on a resource, named after the SQL verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Select,
    Insert,
    Update,
    Delete,
}

impl Action {
    pub const ALL: [Action; 4] = [Action::Select, Action::Insert, Action::Update, Action::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Select => "SELECT",
            Action::Insert => "INSERT",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
        }
    }

    /// Audit event type recorded when this action is performed
    pub fn event_type(&self) -> EventType {
        match self {
            Action::Select => EventType::Select,
            Action::Insert => EventType::Insert,
            Action::Update => EventType::Update,
            Action::Delete => EventType::Delete,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("Unknown action: {}", s))
    }
}

/// A (resource, action) pair that can be granted to roles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub permission_id: PermissionId,
    pub resource_name: String,
    pub action_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Edge between a role and a permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Grant {
    pub role_id: RoleId,
    pub permission_id: PermissionId,
}

/// Actions defined for one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceActions {
    pub name: String,
    pub actions: Vec<String>,
}

/// Full role x resource view of the grant table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionMatrix {
    /// Every role, in id order
    pub roles: Vec<RoleName>,
    /// Every resource with its defined actions
    pub resources: Vec<ResourceActions>,
    /// role -> resource -> granted actions (sorted); roles and resources
    /// without grants map to empty collections
    pub permissions: BTreeMap<RoleName, BTreeMap<String, Vec<String>>>,
}

impl PermissionMatrix {
    /// Whether `role` holds `action` on `resource`
    pub fn allows(&self, role: &str, resource: &str, action: &str) -> bool {
        self.permissions
            .get(role)
            .and_then(|resources| resources.get(resource))
            .is_some_and(|actions| actions.iter().any(|a| a == action))
    }
}
