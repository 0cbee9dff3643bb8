//! File-based storage backend
//!
//! Keeps the working set in memory and writes a JSON snapshot to disk after
//! every mutation. A mutation whose snapshot cannot be written is rolled back,
//! so memory never holds state the disk does not.

use super::memory::{MemoryStorage, StoreState};
use super::{AuditSlice, StorageBackend, StorageError};
use crate::audit::{AuditCriteria, AuditEvent, NewAuditEvent};
use crate::auth::{NewUser, Role, RoleId, User, UserId};
use crate::permissions::{Grant, Permission, PermissionId};
use crate::records::{MedicalRecord, MedicalRecordUpdate, NewMedicalRecord, RecordId, RecordWrite};
use async_trait::async_trait;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

/// JSON snapshot storage
pub struct FileStorage {
    /// Path to the storage file
    path: PathBuf,
    inner: MemoryStorage,
    /// Held from the start of a mutation until its snapshot is on disk
    write_lock: Mutex<()>,
}

impl FileStorage {
    /// Open the store at `path`, creating an empty one if the file is absent
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        if path.exists() {
            let content = fs::read(&path).await?;
            let state: StoreState = serde_json::from_slice(&content)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;

            tracing::debug!(path = %path.display(), "Loaded store snapshot");

            Ok(Self {
                path,
                inner: MemoryStorage::from_state(state),
                write_lock: Mutex::new(()),
            })
        } else {
            let storage = Self {
                path,
                inner: MemoryStorage::new(),
                write_lock: Mutex::new(()),
            };

            // Write initial empty storage
            storage.write_snapshot().await?;

            Ok(storage)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the current state to disk
    async fn write_snapshot(&self) -> Result<(), StorageError> {
        let content = self.inner.snapshot()?;

        // Write atomically by writing to temp file first
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    /// Run `mutation` against the working set and persist the result when
    /// `changed` says it touched anything. On any error the working set is
    /// put back as it was.
    async fn commit<T>(
        &self,
        mutation: impl Future<Output = Result<T, StorageError>>,
        changed: impl FnOnce(&T) -> bool,
    ) -> Result<T, StorageError> {
        let _guard = self.write_lock.lock().await;
        let checkpoint = self.inner.checkpoint();

        let value = match mutation.await {
            Ok(value) => value,
            Err(e) => {
                self.inner.restore(checkpoint);
                return Err(e);
            }
        };

        if changed(&value) {
            if let Err(e) = self.write_snapshot().await {
                tracing::error!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to write store snapshot; change rolled back"
                );
                self.inner.restore(checkpoint);
                return Err(e);
            }
        }

        Ok(value)
    }
}

fn always<T>(_: &T) -> bool {
    true
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn health_check(&self) -> Result<(), StorageError> {
        if !self.path.exists() {
            return Err(StorageError::Unavailable(
                "Storage file does not exist".to_string(),
            ));
        }

        fs::metadata(&self.path).await?;
        Ok(())
    }

    async fn insert_user(&self, user: &NewUser) -> Result<User, StorageError> {
        self.commit(self.inner.insert_user(user), always).await
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
        self.commit(self.inner.update_password(user_id, password_hash), always)
            .await
    }

    async fn set_user_role(&self, user_id: UserId, role_id: RoleId) -> Result<(), StorageError> {
        self.commit(self.inner.set_user_role(user_id, role_id), always)
            .await
    }

    async fn set_user_active(&self, user_id: UserId, is_active: bool) -> Result<(), StorageError> {
        self.commit(self.inner.set_user_active(user_id, is_active), always)
            .await
    }

    async fn insert_role(
        &self,
        role_name: &str,
        description: Option<&str>,
    ) -> Result<Role, StorageError> {
        self.commit(self.inner.insert_role(role_name, description), always)
            .await
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
        self.commit(self.inner.delete_role(role_id), always).await
    }

    async fn upsert_permission(
        &self,
        resource_name: &str,
        action_name: &str,
        description: Option<&str>,
    ) -> Result<Permission, StorageError> {
        self.commit(
            self.inner
                .upsert_permission(resource_name, action_name, description),
            always,
        )
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
        self.commit(self.inner.insert_grant(role_id, permission_id), |inserted| *inserted)
            .await
    }

    async fn delete_grant(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
    ) -> Result<bool, StorageError> {
        self.commit(self.inner.delete_grant(role_id, permission_id), |removed| *removed)
            .await
    }

    async fn append_audit(&self, event: &NewAuditEvent) -> Result<AuditEvent, StorageError> {
        self.commit(self.inner.append_audit(event), always).await
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
        self.commit(self.inner.insert_record(record, audit), always)
            .await
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
        self.commit(
            self.inner
                .update_record(record_id, update, required_owner, audit),
            |outcome| matches!(outcome, RecordWrite::Applied(_)),
        )
        .await
    }

    async fn delete_record(
        &self,
        record_id: RecordId,
        audit: &NewAuditEvent,
    ) -> Result<bool, StorageError> {
        self.commit(self.inner.delete_record(record_id, audit), |removed| *removed)
            .await
    }
}
