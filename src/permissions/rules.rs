//! Route allow-lists consulted by the access gate

use super::types::{Action, Resource};
use crate::auth::{ROLE_ADMIN, ROLE_DOCTOR, ROLE_NURSE, ROLE_RECEPTIONIST};
use serde::Serialize;

/// Which roles a route admits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleAllowList {
    /// Any holder of a valid token
    AnyAuthenticated,
    /// Only the listed roles
    Only(&'static [&'static str]),
}

impl RoleAllowList {
    pub fn admits(&self, role_name: &str) -> bool {
        match self {
            RoleAllowList::AnyAuthenticated => true,
            RoleAllowList::Only(roles) => roles.contains(&role_name),
        }
    }

    /// Roles admitted, expanding `AnyAuthenticated` to the built-in roles
    pub fn builtin_roles(&self) -> &'static [&'static str] {
        match self {
            RoleAllowList::AnyAuthenticated => ALL_BUILTIN,
            RoleAllowList::Only(roles) => roles,
        }
    }
}

const ALL_BUILTIN: &[&str] = &[ROLE_ADMIN, ROLE_DOCTOR, ROLE_RECEPTIONIST, ROLE_NURSE];
const ADMIN_ONLY: &[&str] = &[ROLE_ADMIN];
const ADMIN_RECEPTION: &[&str] = &[ROLE_ADMIN, ROLE_RECEPTIONIST];
const ADMIN_DOCTOR: &[&str] = &[ROLE_ADMIN, ROLE_DOCTOR];

/// The roles a route accepts for one action on one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccessRule {
    pub resource: Resource,
    pub action: Action,
    pub roles: RoleAllowList,
}

impl AccessRule {
    pub const fn new(resource: Resource, action: Action, roles: RoleAllowList) -> Self {
        Self {
            resource,
            action,
            roles,
        }
    }

    /// Built-in allow-list for a route
    pub fn for_route(resource: Resource, action: Action) -> Self {
        use Action::*;
        use Resource::*;
        use RoleAllowList::*;

        let roles = match (resource, action) {
            (Patients | Appointments | MedicalRecords, Select) => AnyAuthenticated,
            (Patients, Insert) => Only(ADMIN_RECEPTION),
            (Patients, Update | Delete) => Only(ADMIN_ONLY),
            (Appointments, Insert | Update | Delete) => Only(ADMIN_RECEPTION),
            (MedicalRecords, Insert | Update) => Only(ADMIN_DOCTOR),
            (MedicalRecords, Delete) => Only(ADMIN_ONLY),
            (Users | Roles | Permissions | AuditLog, _) => Only(ADMIN_ONLY),
        };

        Self::new(resource, action, roles)
    }

    /// Whether Doctors are additionally restricted to records they own
    pub fn is_owner_scoped(&self) -> bool {
        self.resource == Resource::MedicalRecords && self.action == Action::Update
    }

    /// Message returned when a role is refused
    pub fn denial_message(&self) -> String {
        match self.roles {
            RoleAllowList::AnyAuthenticated => "Access denied.".to_string(),
            RoleAllowList::Only(roles) => {
                format!("Access denied. Required roles: {}", roles.join(", "))
            }
        }
    }
}
