//! Test double: a working store whose audit log rejects every append

use super::{AuditSlice, MemoryStorage, StorageBackend, StorageError};
use crate::audit::{AuditCriteria, AuditEvent, NewAuditEvent};
use crate::auth::{NewUser, Role, RoleId, User, UserId};
use crate::permissions::{Grant, Permission, PermissionId};
use crate::records::{MedicalRecord, MedicalRecordUpdate, NewMedicalRecord, RecordId, RecordWrite};
use async_trait::async_trait;

#[derive(Default)]
pub(crate) struct AuditOutage {
    inner: MemoryStorage,
}

impl AuditOutage {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for AuditOutage {
    async fn health_check(&self) -> Result<(), StorageError> {
        self.inner.health_check().await
    }

    async fn insert_user(&self, user: &NewUser) -> Result<User, StorageError> {
        self.inner.insert_user(user).await
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>, StorageError> {
        self.inner.get_user(user_id).await
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, StorageError> {
        self.inner.get_user_by_username(username).await
    }

    async fn list_users(&self) -> Result<Vec<User>, StorageError> {
        self.inner.list_users().await
    }

    async fn update_password(
        &self,
        user_id: UserId,
        password_hash: &str,
    ) -> Result<(), StorageError> {
        self.inner.update_password(user_id, password_hash).await
    }

    async fn set_user_role(&self, user_id: UserId, role_id: RoleId) -> Result<(), StorageError> {
        self.inner.set_user_role(user_id, role_id).await
    }

    async fn set_user_active(&self, user_id: UserId, is_active: bool) -> Result<(), StorageError> {
        self.inner.set_user_active(user_id, is_active).await
    }

    async fn insert_role(
        &self,
        role_name: &str,
        description: Option<&str>,
    ) -> Result<Role, StorageError> {
        self.inner.insert_role(role_name, description).await
    }

    async fn get_role(&self, role_id: RoleId) -> Result<Option<Role>, StorageError> {
        self.inner.get_role(role_id).await
    }

    async fn get_role_by_name(&self, role_name: &str) -> Result<Option<Role>, StorageError> {
        self.inner.get_role_by_name(role_name).await
    }

    async fn list_roles(&self) -> Result<Vec<Role>, StorageError> {
        self.inner.list_roles().await
    }

    async fn delete_role(&self, role_id: RoleId) -> Result<(), StorageError> {
        self.inner.delete_role(role_id).await
    }

    async fn upsert_permission(
        &self,
        resource_name: &str,
        action_name: &str,
        description: Option<&str>,
    ) -> Result<Permission, StorageError> {
        self.inner
            .upsert_permission(resource_name, action_name, description)
            .await
    }

    async fn find_permission(
        &self,
        resource_name: &str,
        action_name: &str,
    ) -> Result<Option<Permission>, StorageError> {
        self.inner.find_permission(resource_name, action_name).await
    }

    async fn list_permissions(&self) -> Result<Vec<Permission>, StorageError> {
        self.inner.list_permissions().await
    }

    async fn list_grants(&self) -> Result<Vec<Grant>, StorageError> {
        self.inner.list_grants().await
    }

    async fn role_permissions(&self, role_id: RoleId) -> Result<Vec<Permission>, StorageError> {
        self.inner.role_permissions(role_id).await
    }

    async fn insert_grant(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
    ) -> Result<bool, StorageError> {
        self.inner.insert_grant(role_id, permission_id).await
    }

    async fn delete_grant(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
    ) -> Result<bool, StorageError> {
        self.inner.delete_grant(role_id, permission_id).await
    }

    async fn append_audit(&self, _event: &NewAuditEvent) -> Result<AuditEvent, StorageError> {
        Err(StorageError::Unavailable("audit_log is read-only".to_string()))
    }

    async fn query_audit(
        &self,
        criteria: &AuditCriteria,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<AuditSlice, StorageError> {
        self.inner.query_audit(criteria, offset, limit).await
    }

    async fn insert_record(
        &self,
        record: &NewMedicalRecord,
        audit: &NewAuditEvent,
    ) -> Result<MedicalRecord, StorageError> {
        self.inner.insert_record(record, audit).await
    }

    async fn get_record(&self, record_id: RecordId) -> Result<Option<MedicalRecord>, StorageError> {
        self.inner.get_record(record_id).await
    }

    async fn update_record(
        &self,
        record_id: RecordId,
        update: &MedicalRecordUpdate,
        required_owner: Option<UserId>,
        audit: &NewAuditEvent,
    ) -> Result<RecordWrite, StorageError> {
        self.inner
            .update_record(record_id, update, required_owner, audit)
            .await
    }

    async fn delete_record(
        &self,
        record_id: RecordId,
        audit: &NewAuditEvent,
    ) -> Result<bool, StorageError> {
        self.inner.delete_record(record_id, audit).await
    }
}
