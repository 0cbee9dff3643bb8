//! Storage backends for the credential store
//!
//! Users, roles, permissions, grants, the audit log and the medical-record
//! ownership column all live behind [`StorageBackend`].

mod file;
mod memory;
#[cfg(feature = "postgres")]
mod postgres;
#[cfg(test)]
pub(crate) mod outage;

pub use file::FileStorage;
pub use memory::MemoryStorage;
#[cfg(feature = "postgres")]
pub use postgres::PgStorage;

use crate::audit::{AuditCriteria, AuditEvent, NewAuditEvent};
use crate::auth::{NewUser, Role, RoleId, User, UserId};
use crate::config::{StorageBackendType, StorageConfig};
use crate::permissions::{Grant, Permission, PermissionId};
use crate::records::{MedicalRecord, MedicalRecordUpdate, NewMedicalRecord, RecordId, RecordWrite};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Storage-related errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("Role {role_id} is still assigned to {users} user(s)")]
    RoleInUse { role_id: RoleId, users: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid storage configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Audit rows matching a query, newest first, plus the total match count
#[derive(Debug, Clone, Default)]
pub struct AuditSlice {
    pub events: Vec<AuditEvent>,
    pub total: u64,
}

/// Trait for credential store backends
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Check if the storage backend is available and healthy
    async fn health_check(&self) -> Result<(), StorageError>;

    // ==================== Users ====================

    /// Create a user; fails with `AlreadyExists` on a duplicate username and
    /// `NotFound` when the role does not exist
    async fn insert_user(&self, user: &NewUser) -> Result<User, StorageError>;

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>, StorageError>;

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, StorageError>;

    /// All users, active or not, in id order
    async fn list_users(&self) -> Result<Vec<User>, StorageError>;

    async fn update_password(&self, user_id: UserId, password_hash: &str)
        -> Result<(), StorageError>;

    async fn set_user_role(&self, user_id: UserId, role_id: RoleId) -> Result<(), StorageError>;

    async fn set_user_active(&self, user_id: UserId, is_active: bool) -> Result<(), StorageError>;

    // ==================== Roles ====================

    async fn insert_role(
        &self,
        role_name: &str,
        description: Option<&str>,
    ) -> Result<Role, StorageError>;

    async fn get_role(&self, role_id: RoleId) -> Result<Option<Role>, StorageError>;

    async fn get_role_by_name(&self, role_name: &str) -> Result<Option<Role>, StorageError>;

    /// All roles in id order
    async fn list_roles(&self) -> Result<Vec<Role>, StorageError>;

    /// Delete a role and its grants. Refused with `RoleInUse` while any user,
    /// active or not, references it. The check and delete are atomic.
    async fn delete_role(&self, role_id: RoleId) -> Result<(), StorageError>;

    // ==================== Permissions ====================

    /// Create the (resource, action) permission, or return the existing one
    async fn upsert_permission(
        &self,
        resource_name: &str,
        action_name: &str,
        description: Option<&str>,
    ) -> Result<Permission, StorageError>;

    async fn find_permission(
        &self,
        resource_name: &str,
        action_name: &str,
    ) -> Result<Option<Permission>, StorageError>;

    async fn list_permissions(&self) -> Result<Vec<Permission>, StorageError>;

    async fn list_grants(&self) -> Result<Vec<Grant>, StorageError>;

    /// Permissions granted to one role
    async fn role_permissions(&self, role_id: RoleId) -> Result<Vec<Permission>, StorageError>;

    /// Add a grant edge; `false` when it already existed
    async fn insert_grant(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
    ) -> Result<bool, StorageError>;

    /// Remove a grant edge; `false` when it did not exist
    async fn delete_grant(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
    ) -> Result<bool, StorageError>;

    // ==================== Audit log ====================

    async fn append_audit(&self, event: &NewAuditEvent) -> Result<AuditEvent, StorageError>;

    /// Matching events newest first; `limit = None` returns every match
    async fn query_audit(
        &self,
        criteria: &AuditCriteria,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<AuditSlice, StorageError>;

    // ==================== Medical records ====================

    /// Insert a record and its audit row in one unit of work
    async fn insert_record(
        &self,
        record: &NewMedicalRecord,
        audit: &NewAuditEvent,
    ) -> Result<MedicalRecord, StorageError>;

    async fn get_record(&self, record_id: RecordId) -> Result<Option<MedicalRecord>, StorageError>;

    /// Update a record if it exists and, when `required_owner` is set, is owned
    /// by that user. The ownership check, the write and the audit row happen in
    /// one unit of work; `audit` is only written when the update is applied.
    async fn update_record(
        &self,
        record_id: RecordId,
        update: &MedicalRecordUpdate,
        required_owner: Option<UserId>,
        audit: &NewAuditEvent,
    ) -> Result<RecordWrite, StorageError>;

    /// Delete a record and write its audit row; `false` when it did not exist
    async fn delete_record(
        &self,
        record_id: RecordId,
        audit: &NewAuditEvent,
    ) -> Result<bool, StorageError>;
}

/// Open the backend selected by configuration
pub async fn open(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>, StorageError> {
    match config.backend {
        StorageBackendType::Memory => Ok(Arc::new(MemoryStorage::new())),
        StorageBackendType::File => {
            let path = config.file_path.as_ref().ok_or_else(|| {
                StorageError::InvalidConfig("storage.file.path is not set".to_string())
            })?;
            Ok(Arc::new(FileStorage::open(path).await?))
        }
        #[cfg(feature = "postgres")]
        StorageBackendType::Postgres => {
            use secrecy::ExposeSecret;

            let url = config.database_url.as_ref().ok_or_else(|| {
                StorageError::InvalidConfig(format!(
                    "storage.postgres.url is not set (or {})",
                    crate::config::ENV_DATABASE_URL
                ))
            })?;
            Ok(Arc::new(
                PgStorage::connect(url.expose_secret(), config.max_connections).await?,
            ))
        }
        #[cfg(not(feature = "postgres"))]
        StorageBackendType::Postgres => Err(StorageError::InvalidConfig(
            "medgate was built without the `postgres` feature".to_string(),
        )),
    }
}
