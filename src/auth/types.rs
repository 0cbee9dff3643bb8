//! Identity types: users, roles and the session claim set

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-assigned user identifier
pub type UserId = i64;
/// Store-assigned role identifier
pub type RoleId = i64;
/// Human-readable role name, e.g. "Doctor"
pub type RoleName = String;

/// Predefined role names
pub const ROLE_ADMIN: &str = "Admin";
pub const ROLE_DOCTOR: &str = "Doctor";
pub const ROLE_RECEPTIONIST: &str = "Receptionist";
pub const ROLE_NURSE: &str = "Nurse";

/// Built-in roles and their descriptions, in seeding order
pub const BUILTIN_ROLES: [(&str, &str); 4] = [
    (ROLE_ADMIN, "Full system access including user and permission management"),
    (ROLE_DOCTOR, "Reads patients and authors their own medical records"),
    (
        ROLE_RECEPTIONIST,
        "Registers patients and manages appointments",
    ),
    (ROLE_NURSE, "Read-only clinical access"),
];

/// A staff account as persisted in the credential store.
///
/// Serialized into store snapshots; use [`UserSummary`] for anything that
/// leaves the process.
#[derive(Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: UserId,
    pub username: String,
    /// bcrypt digest of the password
    pub password_hash: String,
    pub role_id: RoleId,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("password_hash", &"[REDACTED]")
            .field("role_id", &self.role_id)
            .field("is_active", &self.is_active)
            .finish()
    }
}

/// Fields needed to create a user
#[derive(Clone)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub role_id: RoleId,
}

/// User information safe to return to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id: UserId,
    pub username: String,
    pub role_id: RoleId,
    pub role_name: RoleName,
    pub is_active: bool,
}

impl UserSummary {
    /// Combine a user row with its role name
    pub fn new(user: &User, role_name: impl Into<RoleName>) -> Self {
        Self {
            user_id: user.user_id,
            username: user.username.clone(),
            role_id: user.role_id,
            role_name: role_name.into(),
            is_active: user.is_active,
        }
    }
}

/// A named role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub role_id: RoleId,
    pub role_name: RoleName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Role listing entry with the number of users assigned to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSummary {
    pub role_id: RoleId,
    pub role_name: RoleName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub user_count: u64,
}

/// The claim set carried inside a session token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: UserId,
    pub username: String,
    pub role_id: RoleId,
    pub role_name: RoleName,
    /// Issued at, seconds since the epoch
    pub iat: i64,
    /// Expiry, seconds since the epoch; the token is invalid from this instant on
    pub exp: i64,
    /// Unique token id, used for logout
    pub jti: String,
}

impl Claims {
    /// Whether the bearer holds the given role
    pub fn has_role(&self, role_name: &str) -> bool {
        self.role_name == role_name
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ROLE_ADMIN)
    }

    pub fn is_doctor(&self) -> bool {
        self.has_role(ROLE_DOCTOR)
    }

    /// Expiry as a timestamp
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Result of a successful login
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginToken {
    pub token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    /// Seconds until expiry
    pub expires_in: i64,
}

impl LoginToken {
    pub fn bearer(token: String, claims: &Claims) -> Self {
        Self {
            token,
            token_type: "Bearer".to_string(),
            expires_at: claims.expires_at(),
            expires_in: claims.exp - claims.iat,
        }
    }
}
