//! In-process storage backend
//!
//! Also the working set behind [`FileStorage`](super::FileStorage), which
//! persists snapshots of the same state.

use super::{AuditSlice, StorageBackend, StorageError};
use crate::audit::{AuditCriteria, AuditEvent, NewAuditEvent};
use crate::auth::{NewUser, Role, RoleId, User, UserId};
use crate::permissions::{Grant, Permission, PermissionId};
use crate::records::{MedicalRecord, MedicalRecordUpdate, NewMedicalRecord, RecordId, RecordWrite};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Last id handed out per table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Sequences {
    user: i64,
    role: i64,
    permission: i64,
    audit: i64,
    record: i64,
}

fn next_id(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

/// Everything the store holds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(super) struct StoreState {
    #[serde(default)]
    sequences: Sequences,
    #[serde(default)]
    users: BTreeMap<UserId, User>,
    #[serde(default)]
    roles: BTreeMap<RoleId, Role>,
    #[serde(default)]
    permissions: BTreeMap<PermissionId, Permission>,
    #[serde(default)]
    grants: BTreeSet<Grant>,
    /// Oldest first by (timestamp, event_id)
    #[serde(default)]
    audit_log: Vec<AuditEvent>,
    #[serde(default)]
    medical_records: BTreeMap<RecordId, MedicalRecord>,

    // Secondary indexes (not serialized, rebuilt on load)
    /// Index: username -> user ID
    #[serde(skip)]
    username_index: HashMap<String, UserId>,
    /// Index: role name -> role ID
    #[serde(skip)]
    role_name_index: HashMap<String, RoleId>,
}

impl StoreState {
    /// Rebuild all secondary indexes from primary data
    pub(super) fn rebuild_indexes(&mut self) {
        self.audit_log
            .sort_by(|a, b| (a.timestamp, a.event_id).cmp(&(b.timestamp, b.event_id)));

        self.username_index = self
            .users
            .values()
            .map(|u| (u.username.clone(), u.user_id))
            .collect();
        self.role_name_index = self
            .roles
            .values()
            .map(|r| (r.role_name.clone(), r.role_id))
            .collect();
    }

    fn user_mut(&mut self, user_id: UserId) -> Result<&mut User, StorageError> {
        self.users
            .get_mut(&user_id)
            .ok_or_else(|| StorageError::NotFound(format!("User {} not found", user_id)))
    }

    fn ensure_role(&self, role_id: RoleId) -> Result<(), StorageError> {
        if self.roles.contains_key(&role_id) {
            Ok(())
        } else {
            Err(StorageError::NotFound(format!("Role {} not found", role_id)))
        }
    }

    fn push_audit(&mut self, event: &NewAuditEvent) -> AuditEvent {
        let event_id = next_id(&mut self.sequences.audit);
        let event = event.clone().into_event(event_id);

        // Events are usually stamped just before they arrive, so this lands
        // at or near the end.
        let key = (event.timestamp, event.event_id);
        let at = self
            .audit_log
            .partition_point(|e| (e.timestamp, e.event_id) <= key);
        self.audit_log.insert(at, event.clone());
        event
    }

    fn insert_user(&mut self, new: &NewUser) -> Result<User, StorageError> {
        if self.username_index.contains_key(&new.username) {
            return Err(StorageError::AlreadyExists(
                "Username already exists".to_string(),
            ));
        }
        self.ensure_role(new.role_id)?;

        let now = Utc::now();
        let user = User {
            user_id: next_id(&mut self.sequences.user),
            username: new.username.clone(),
            password_hash: new.password_hash.clone(),
            role_id: new.role_id,
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        self.username_index.insert(user.username.clone(), user.user_id);
        self.users.insert(user.user_id, user.clone());
        Ok(user)
    }

    fn insert_role(&mut self, role_name: &str, description: Option<&str>) -> Result<Role, StorageError> {
        if self.role_name_index.contains_key(role_name) {
            return Err(StorageError::AlreadyExists(format!(
                "Role '{}' already exists",
                role_name
            )));
        }

        let role = Role {
            role_id: next_id(&mut self.sequences.role),
            role_name: role_name.to_string(),
            description: description.map(str::to_string),
            created_at: Utc::now(),
        };

        self.role_name_index.insert(role.role_name.clone(), role.role_id);
        self.roles.insert(role.role_id, role.clone());
        Ok(role)
    }

    fn delete_role(&mut self, role_id: RoleId) -> Result<(), StorageError> {
        self.ensure_role(role_id)?;

        let users = self.users.values().filter(|u| u.role_id == role_id).count() as u64;
        if users > 0 {
            return Err(StorageError::RoleInUse { role_id, users });
        }

        if let Some(role) = self.roles.remove(&role_id) {
            self.role_name_index.remove(&role.role_name);
        }
        self.grants.retain(|g| g.role_id != role_id);
        Ok(())
    }

    fn find_permission(&self, resource_name: &str, action_name: &str) -> Option<&Permission> {
        self.permissions
            .values()
            .find(|p| p.resource_name == resource_name && p.action_name == action_name)
    }

    fn upsert_permission(
        &mut self,
        resource_name: &str,
        action_name: &str,
        description: Option<&str>,
    ) -> Permission {
        if let Some(existing) = self.find_permission(resource_name, action_name) {
            return existing.clone();
        }

        let permission = Permission {
            permission_id: next_id(&mut self.sequences.permission),
            resource_name: resource_name.to_string(),
            action_name: action_name.to_string(),
            description: description.map(str::to_string),
        };
        self.permissions
            .insert(permission.permission_id, permission.clone());
        permission
    }

    fn insert_grant(&mut self, role_id: RoleId, permission_id: PermissionId) -> Result<bool, StorageError> {
        self.ensure_role(role_id)?;
        if !self.permissions.contains_key(&permission_id) {
            return Err(StorageError::NotFound(format!(
                "Permission {} not found",
                permission_id
            )));
        }

        Ok(self.grants.insert(Grant {
            role_id,
            permission_id,
        }))
    }

    fn query_audit(&self, criteria: &AuditCriteria, offset: u64, limit: Option<u64>) -> AuditSlice {
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        let limit = limit.map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));

        let mut total = 0usize;
        let mut events = Vec::new();
        for event in self.audit_log.iter().rev().filter(|e| criteria.matches(e)) {
            if total >= offset && events.len() < limit {
                events.push(event.clone());
            }
            total += 1;
        }

        AuditSlice {
            events,
            total: total as u64,
        }
    }

    fn insert_record(&mut self, new: &NewMedicalRecord, audit: &NewAuditEvent) -> MedicalRecord {
        let now = Utc::now();
        let record = MedicalRecord {
            record_id: next_id(&mut self.sequences.record),
            patient_id: new.patient_id,
            doctor_id: new.doctor_id,
            diagnosis: new.diagnosis.clone(),
            treatment: new.treatment.clone(),
            prescription: new.prescription.clone(),
            notes: new.notes.clone(),
            record_date: new.record_date.unwrap_or_else(|| now.date_naive()),
            created_at: now,
            updated_at: now,
        };

        self.medical_records.insert(record.record_id, record.clone());
        self.push_audit(audit);
        record
    }

    fn update_record(
        &mut self,
        record_id: RecordId,
        update: &MedicalRecordUpdate,
        required_owner: Option<UserId>,
        audit: &NewAuditEvent,
    ) -> RecordWrite {
        let Some(record) = self.medical_records.get_mut(&record_id) else {
            return RecordWrite::NotFound;
        };
        if let Some(owner) = required_owner {
            if record.doctor_id != Some(owner) {
                return RecordWrite::NotOwner;
            }
        }

        update.apply(record, Utc::now());
        let updated = record.clone();
        self.push_audit(audit);
        RecordWrite::Applied(updated)
    }
}

/// Volatile store; contents are lost when the process exits
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<StoreState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn from_state(mut state: StoreState) -> Self {
        state.rebuild_indexes();
        Self {
            state: RwLock::new(state),
        }
    }

    /// Copy of the current state, for [`restore`](Self::restore)
    pub(super) fn checkpoint(&self) -> StoreState {
        self.state.read().clone()
    }

    /// Replace the current state with an earlier checkpoint
    pub(super) fn restore(&self, checkpoint: StoreState) {
        *self.state.write() = checkpoint;
    }

    /// Serialize the full state for persistence
    pub(super) fn snapshot(&self) -> Result<Vec<u8>, StorageError> {
        let state = self.state.read();
        serde_json::to_vec_pretty(&*state).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn health_check(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn insert_user(&self, user: &NewUser) -> Result<User, StorageError> {
        self.state.write().insert_user(user)
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>, StorageError> {
        Ok(self.state.read().users.get(&user_id).cloned())
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, StorageError> {
        let state = self.state.read();
        Ok(state
            .username_index
            .get(username)
            .and_then(|id| state.users.get(id))
            .cloned())
    }

    async fn list_users(&self) -> Result<Vec<User>, StorageError> {
        Ok(self.state.read().users.values().cloned().collect())
    }

    async fn update_password(
        &self,
        user_id: UserId,
        password_hash: &str,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write();
        let user = state.user_mut(user_id)?;
        user.password_hash = password_hash.to_string();
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn set_user_role(&self, user_id: UserId, role_id: RoleId) -> Result<(), StorageError> {
        let mut state = self.state.write();
        state.ensure_role(role_id)?;
        let user = state.user_mut(user_id)?;
        user.role_id = role_id;
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn set_user_active(&self, user_id: UserId, is_active: bool) -> Result<(), StorageError> {
        let mut state = self.state.write();
        let user = state.user_mut(user_id)?;
        user.is_active = is_active;
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_role(
        &self,
        role_name: &str,
        description: Option<&str>,
    ) -> Result<Role, StorageError> {
        self.state.write().insert_role(role_name, description)
    }

    async fn get_role(&self, role_id: RoleId) -> Result<Option<Role>, StorageError> {
        Ok(self.state.read().roles.get(&role_id).cloned())
    }

    async fn get_role_by_name(&self, role_name: &str) -> Result<Option<Role>, StorageError> {
        let state = self.state.read();
        Ok(state
            .role_name_index
            .get(role_name)
            .and_then(|id| state.roles.get(id))
            .cloned())
    }

    async fn list_roles(&self) -> Result<Vec<Role>, StorageError> {
        Ok(self.state.read().roles.values().cloned().collect())
    }

    async fn delete_role(&self, role_id: RoleId) -> Result<(), StorageError> {
        self.state.write().delete_role(role_id)
    }

    async fn upsert_permission(
        &self,
        resource_name: &str,
        action_name: &str,
        description: Option<&str>,
    ) -> Result<Permission, StorageError> {
        Ok(self
            .state
            .write()
            .upsert_permission(resource_name, action_name, description))
    }

    async fn find_permission(
        &self,
        resource_name: &str,
        action_name: &str,
    ) -> Result<Option<Permission>, StorageError> {
        Ok(self
            .state
            .read()
            .find_permission(resource_name, action_name)
            .cloned())
    }

    async fn list_permissions(&self) -> Result<Vec<Permission>, StorageError> {
        Ok(self.state.read().permissions.values().cloned().collect())
    }

    async fn list_grants(&self) -> Result<Vec<Grant>, StorageError> {
        Ok(self.state.read().grants.iter().copied().collect())
    }

    async fn role_permissions(&self, role_id: RoleId) -> Result<Vec<Permission>, StorageError> {
        let state = self.state.read();
        Ok(state
            .grants
            .iter()
            .filter(|g| g.role_id == role_id)
            .filter_map(|g| state.permissions.get(&g.permission_id))
            .cloned()
            .collect())
    }

    async fn insert_grant(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
    ) -> Result<bool, StorageError> {
        self.state.write().insert_grant(role_id, permission_id)
    }

    async fn delete_grant(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
    ) -> Result<bool, StorageError> {
        Ok(self.state.write().grants.remove(&Grant {
            role_id,
            permission_id,
        }))
    }

    async fn append_audit(&self, event: &NewAuditEvent) -> Result<AuditEvent, StorageError> {
        Ok(self.state.write().push_audit(event))
    }

    async fn query_audit(
        &self,
        criteria: &AuditCriteria,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<AuditSlice, StorageError> {
        Ok(self.state.read().query_audit(criteria, offset, limit))
    }

    async fn insert_record(
        &self,
        record: &NewMedicalRecord,
        audit: &NewAuditEvent,
    ) -> Result<MedicalRecord, StorageError> {
        Ok(self.state.write().insert_record(record, audit))
    }

    async fn get_record(&self, record_id: RecordId) -> Result<Option<MedicalRecord>, StorageError> {
        Ok(self.state.read().medical_records.get(&record_id).cloned())
    }

    async fn update_record(
        &self,
        record_id: RecordId,
        update: &MedicalRecordUpdate,
        required_owner: Option<UserId>,
        audit: &NewAuditEvent,
    ) -> Result<RecordWrite, StorageError> {
        Ok(self
            .state
            .write()
            .update_record(record_id, update, required_owner, audit))
    }

    async fn delete_record(
        &self,
        record_id: RecordId,
        audit: &NewAuditEvent,
    ) -> Result<bool, StorageError> {
        let mut state = self.state.write();
        if state.medical_records.remove(&record_id).is_none() {
            return Ok(false);
        }
        state.push_audit(audit);
        Ok(true)
    }
}
