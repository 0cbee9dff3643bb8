//! PostgreSQL storage backend
//!
//! Expects the following tables to exist (schema migration is managed outside
//! medgate):
//!
//! ```sql
//! roles(role_id BIGSERIAL PRIMARY KEY, role_name TEXT UNIQUE NOT NULL,
//!       description TEXT, created_at TIMESTAMPTZ NOT NULL DEFAULT NOW())
//! users(user_id BIGSERIAL PRIMARY KEY, username TEXT UNIQUE NOT NULL,
//!       password_hash TEXT NOT NULL, role_id BIGINT NOT NULL REFERENCES roles,
//!       is_active BOOLEAN NOT NULL DEFAULT TRUE,
//!       created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!       updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW())
//! permissions(permission_id BIGSERIAL PRIMARY KEY, resource_name TEXT NOT NULL,
//!       action_name TEXT NOT NULL, description TEXT,
//!       UNIQUE (resource_name, action_name))
//! role_permissions(role_id BIGINT REFERENCES roles ON DELETE CASCADE,
//!       permission_id BIGINT REFERENCES permissions ON DELETE CASCADE,
//!       PRIMARY KEY (role_id, permission_id))
//! audit_log(audit_id BIGSERIAL PRIMARY KEY, event_type TEXT NOT NULL,
//!       resource_name TEXT NOT NULL, username TEXT NOT NULL, status TEXT NOT NULL,
//!       details TEXT, ip_address TEXT, event_time TIMESTAMPTZ NOT NULL)
//! medical_records(record_id BIGSERIAL PRIMARY KEY, patient_id BIGINT NOT NULL,
//!       doctor_id BIGINT REFERENCES users, diagnosis TEXT NOT NULL, treatment TEXT,
//!       prescription TEXT, notes TEXT, record_date DATE NOT NULL,
//!       created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!       updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW())
//! ```

use super::{AuditSlice, StorageBackend, StorageError};
use crate::audit::{AuditCriteria, AuditEvent, AuditStatus, EventType, NewAuditEvent};
use crate::auth::{NewUser, Role, RoleId, User, UserId};
use crate::permissions::{Grant, Permission, PermissionId};
use crate::records::{MedicalRecord, MedicalRecordUpdate, NewMedicalRecord, RecordId, RecordWrite};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgExecutor, Postgres, QueryBuilder, Row};
use std::time::Duration;

const USER_COLUMNS: &str =
    "user_id, username, password_hash, role_id, is_active, created_at, updated_at";
const ROLE_COLUMNS: &str = "role_id, role_name, description, created_at";
const PERMISSION_COLUMNS: &str = "permission_id, resource_name, action_name, description";
const AUDIT_COLUMNS: &str =
    "audit_id, event_type, resource_name, username, status, details, ip_address, event_time";
const RECORD_COLUMNS: &str = "record_id, patient_id, doctor_id, diagnosis, treatment, \
     prescription, notes, record_date, created_at, updated_at";

/// Store backed by a PostgreSQL connection pool
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    /// Connect a pool to `database_url`
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn user_from_row(row: &PgRow) -> Result<User, sqlx::Error> {
    Ok(User {
        user_id: row.try_get("user_id")?,
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        role_id: row.try_get("role_id")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn role_from_row(row: &PgRow) -> Result<Role, sqlx::Error> {
    Ok(Role {
        role_id: row.try_get("role_id")?,
        role_name: row.try_get("role_name")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}

fn permission_from_row(row: &PgRow) -> Result<Permission, sqlx::Error> {
    Ok(Permission {
        permission_id: row.try_get("permission_id")?,
        resource_name: row.try_get("resource_name")?,
        action_name: row.try_get("action_name")?,
        description: row.try_get("description")?,
    })
}

/// Parse the stored event type and status; `None` when either is a value
/// this build does not know
fn decode_audit_kind(event_type: &str, status: &str) -> Option<(EventType, AuditStatus)> {
    Some((event_type.parse().ok()?, status.parse().ok()?))
}

/// Decode an audit row. Rows written by other tools may carry event types or
/// statuses medgate does not know; those are skipped with a warning.
fn audit_from_row(row: &PgRow) -> Result<Option<AuditEvent>, StorageError> {
    let audit_id: i64 = row.try_get("audit_id")?;
    let event_type: String = row.try_get("event_type")?;
    let status: String = row.try_get("status")?;

    let Some((event_type, status)) = decode_audit_kind(&event_type, &status) else {
        tracing::warn!(
            audit_id,
            event_type = %event_type,
            status = %status,
            "Skipping audit row with unrecognized type or status"
        );
        return Ok(None);
    };

    Ok(Some(AuditEvent {
        event_id: audit_id,
        event_type,
        resource: row.try_get("resource_name")?,
        username: row.try_get("username")?,
        status,
        details: row.try_get("details")?,
        ip_address: row.try_get("ip_address")?,
        timestamp: row.try_get("event_time")?,
    }))
}

/// Convert a page bound to the BIGINT Postgres expects
fn sql_count(value: u64, what: &str) -> Result<i64, StorageError> {
    i64::try_from(value)
        .map_err(|_| StorageError::InvalidArgument(format!("{} {} is out of range", what, value)))
}

fn record_from_row(row: &PgRow) -> Result<MedicalRecord, sqlx::Error> {
    Ok(MedicalRecord {
        record_id: row.try_get("record_id")?,
        patient_id: row.try_get("patient_id")?,
        doctor_id: row.try_get("doctor_id")?,
        diagnosis: row.try_get("diagnosis")?,
        treatment: row.try_get("treatment")?,
        prescription: row.try_get("prescription")?,
        notes: row.try_get("notes")?,
        record_date: row.try_get("record_date")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Translate constraint violations into store errors
fn write_error(err: sqlx::Error, conflict: &str, missing: &str) -> StorageError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StorageError::AlreadyExists(conflict.to_string());
        }
        if db.is_foreign_key_violation() {
            return StorageError::NotFound(missing.to_string());
        }
    }
    StorageError::Database(err)
}

fn not_found_if_zero(rows: u64, what: String) -> Result<(), StorageError> {
    if rows == 0 {
        Err(StorageError::NotFound(what))
    } else {
        Ok(())
    }
}

async fn insert_audit<'e, E>(executor: E, event: &NewAuditEvent) -> Result<AuditEvent, StorageError>
where
    E: PgExecutor<'e>,
{
    let sql = format!(
        "INSERT INTO audit_log (event_type, resource_name, username, status, details, ip_address, event_time) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {}",
        AUDIT_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(event.event_type.as_str())
        .bind(&event.resource)
        .bind(&event.username)
        .bind(event.status.as_str())
        .bind(event.details.as_deref())
        .bind(event.ip_address.map(|ip| ip.to_string()))
        .bind(event.timestamp)
        .fetch_one(executor)
        .await?;

    audit_from_row(&row)?.ok_or_else(|| {
        StorageError::Serialization("Inserted audit row could not be decoded".to_string())
    })
}

/// Escape LIKE wildcards in a user-supplied search term
fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

fn push_criteria(builder: &mut QueryBuilder<'_, Postgres>, criteria: &AuditCriteria) {
    builder.push(" WHERE TRUE");
    if let Some(event_type) = criteria.event_type {
        builder.push(" AND event_type = ").push_bind(event_type.as_str());
    }
    if let Some(status) = criteria.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(since) = criteria.since {
        builder.push(" AND event_time >= ").push_bind(since);
    }
    if let Some(until) = criteria.until {
        builder.push(" AND event_time <= ").push_bind(until);
    }
    if let Some(term) = &criteria.search {
        let pattern = like_pattern(term);
        builder
            .push(" AND (LOWER(username) LIKE ")
            .push_bind(pattern.clone())
            .push(" OR LOWER(resource_name) LIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

#[async_trait]
impl StorageBackend for PgStorage {
    async fn health_check(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_user(&self, user: &NewUser) -> Result<User, StorageError> {
        let sql = format!(
            "INSERT INTO users (username, password_hash, role_id, is_active) \
             VALUES ($1, $2, $3, TRUE) RETURNING {}",
            USER_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&user.username)
            .bind(&user.password_hash)
            .bind(user.role_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                write_error(
                    e,
                    "Username already exists",
                    &format!("Role {} not found", user.role_id),
                )
            })?;

        Ok(user_from_row(&row)?)
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>, StorageError> {
        let sql = format!("SELECT {} FROM users WHERE user_id = $1", USER_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(user_from_row).transpose()?)
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, StorageError> {
        let sql = format!("SELECT {} FROM users WHERE username = $1", USER_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(user_from_row).transpose()?)
    }

    async fn list_users(&self) -> Result<Vec<User>, StorageError> {
        let sql = format!("SELECT {} FROM users ORDER BY user_id", USER_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        Ok(rows.iter().map(user_from_row).collect::<Result<_, _>>()?)
    }

    async fn update_password(
        &self,
        user_id: UserId,
        password_hash: &str,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE users SET password_hash = $2, updated_at = NOW() WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(password_hash)
        .execute(&self.pool)
        .await?;

        not_found_if_zero(result.rows_affected(), format!("User {} not found", user_id))
    }

    async fn set_user_role(&self, user_id: UserId, role_id: RoleId) -> Result<(), StorageError> {
        let result =
            sqlx::query("UPDATE users SET role_id = $2, updated_at = NOW() WHERE user_id = $1")
                .bind(user_id)
                .bind(role_id)
                .execute(&self.pool)
                .await
                .map_err(|e| write_error(e, "", &format!("Role {} not found", role_id)))?;

        not_found_if_zero(result.rows_affected(), format!("User {} not found", user_id))
    }

    async fn set_user_active(&self, user_id: UserId, is_active: bool) -> Result<(), StorageError> {
        let result =
            sqlx::query("UPDATE users SET is_active = $2, updated_at = NOW() WHERE user_id = $1")
                .bind(user_id)
                .bind(is_active)
                .execute(&self.pool)
                .await?;

        not_found_if_zero(result.rows_affected(), format!("User {} not found", user_id))
    }

    async fn insert_role(
        &self,
        role_name: &str,
        description: Option<&str>,
    ) -> Result<Role, StorageError> {
        let sql = format!(
            "INSERT INTO roles (role_name, description) VALUES ($1, $2) RETURNING {}",
            ROLE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(role_name)
            .bind(description)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| write_error(e, &format!("Role '{}' already exists", role_name), ""))?;

        Ok(role_from_row(&row)?)
    }

    async fn get_role(&self, role_id: RoleId) -> Result<Option<Role>, StorageError> {
        let sql = format!("SELECT {} FROM roles WHERE role_id = $1", ROLE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(role_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(role_from_row).transpose()?)
    }

    async fn get_role_by_name(&self, role_name: &str) -> Result<Option<Role>, StorageError> {
        let sql = format!("SELECT {} FROM roles WHERE role_name = $1", ROLE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(role_name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(role_from_row).transpose()?)
    }

    async fn list_roles(&self) -> Result<Vec<Role>, StorageError> {
        let sql = format!("SELECT {} FROM roles ORDER BY role_id", ROLE_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        Ok(rows.iter().map(role_from_row).collect::<Result<_, _>>()?)
    }

    async fn delete_role(&self, role_id: RoleId) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        let locked = sqlx::query("SELECT role_id FROM roles WHERE role_id = $1 FOR UPDATE")
            .bind(role_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(StorageError::NotFound(format!("Role {} not found", role_id)));
        }

        let users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE role_id = $1")
            .bind(role_id)
            .fetch_one(&mut *tx)
            .await?;
        if users > 0 {
            return Err(StorageError::RoleInUse {
                role_id,
                users: users as u64,
            });
        }

        sqlx::query("DELETE FROM role_permissions WHERE role_id = $1")
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM roles WHERE role_id = $1")
            .bind(role_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn upsert_permission(
        &self,
        resource_name: &str,
        action_name: &str,
        description: Option<&str>,
    ) -> Result<Permission, StorageError> {
        // The no-op update makes RETURNING yield the existing row on conflict
        let sql = format!(
            "INSERT INTO permissions (resource_name, action_name, description) VALUES ($1, $2, $3) \
             ON CONFLICT (resource_name, action_name) DO UPDATE SET resource_name = EXCLUDED.resource_name \
             RETURNING {}",
            PERMISSION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(resource_name)
            .bind(action_name)
            .bind(description)
            .fetch_one(&self.pool)
            .await?;

        Ok(permission_from_row(&row)?)
    }

    async fn find_permission(
        &self,
        resource_name: &str,
        action_name: &str,
    ) -> Result<Option<Permission>, StorageError> {
        let sql = format!(
            "SELECT {} FROM permissions WHERE resource_name = $1 AND action_name = $2",
            PERMISSION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(resource_name)
            .bind(action_name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(permission_from_row).transpose()?)
    }

    async fn list_permissions(&self) -> Result<Vec<Permission>, StorageError> {
        let sql = format!(
            "SELECT {} FROM permissions ORDER BY resource_name, action_name",
            PERMISSION_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        Ok(rows.iter().map(permission_from_row).collect::<Result<_, _>>()?)
    }

    async fn list_grants(&self) -> Result<Vec<Grant>, StorageError> {
        let rows = sqlx::query(
            "SELECT role_id, permission_id FROM role_permissions ORDER BY role_id, permission_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let grants = rows
            .iter()
            .map(|row| {
                Ok(Grant {
                    role_id: row.try_get("role_id")?,
                    permission_id: row.try_get("permission_id")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()?;

        Ok(grants)
    }

    async fn role_permissions(&self, role_id: RoleId) -> Result<Vec<Permission>, StorageError> {
        let rows = sqlx::query(
            "SELECT p.permission_id, p.resource_name, p.action_name, p.description \
             FROM permissions p JOIN role_permissions rp ON rp.permission_id = p.permission_id \
             WHERE rp.role_id = $1 ORDER BY p.resource_name, p.action_name",
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(permission_from_row).collect::<Result<_, _>>()?)
    }

    async fn insert_grant(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "INSERT INTO role_permissions (role_id, permission_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(role_id)
        .bind(permission_id)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(e, "", "Role or permission not found"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_grant(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
    ) -> Result<bool, StorageError> {
        let result =
            sqlx::query("DELETE FROM role_permissions WHERE role_id = $1 AND permission_id = $2")
                .bind(role_id)
                .bind(permission_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn append_audit(&self, event: &NewAuditEvent) -> Result<AuditEvent, StorageError> {
        insert_audit(&self.pool, event).await
    }

    async fn query_audit(
        &self,
        criteria: &AuditCriteria,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<AuditSlice, StorageError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM audit_log");
        push_criteria(&mut count, criteria);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM audit_log", AUDIT_COLUMNS));
        push_criteria(&mut select, criteria);
        select.push(" ORDER BY event_time DESC, audit_id DESC");
        if let Some(limit) = limit {
            select.push(" LIMIT ").push_bind(sql_count(limit, "limit")?);
        }
        select.push(" OFFSET ").push_bind(sql_count(offset, "offset")?);

        let rows = select.build().fetch_all(&self.pool).await?;
        // `total` still counts skipped rows
        let events = rows
            .iter()
            .filter_map(|row| audit_from_row(row).transpose())
            .collect::<Result<_, _>>()?;

        Ok(AuditSlice {
            events,
            total: total as u64,
        })
    }

    async fn insert_record(
        &self,
        record: &NewMedicalRecord,
        audit: &NewAuditEvent,
    ) -> Result<MedicalRecord, StorageError> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "INSERT INTO medical_records \
             (patient_id, doctor_id, diagnosis, treatment, prescription, notes, record_date) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {}",
            RECORD_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(record.patient_id)
            .bind(record.doctor_id)
            .bind(&record.diagnosis)
            .bind(record.treatment.as_deref())
            .bind(record.prescription.as_deref())
            .bind(record.notes.as_deref())
            .bind(record.record_date.unwrap_or_else(|| Utc::now().date_naive()))
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| write_error(e, "", "Doctor not found"))?;
        let created = record_from_row(&row)?;

        insert_audit(&mut *tx, audit).await?;
        tx.commit().await?;

        Ok(created)
    }

    async fn get_record(&self, record_id: RecordId) -> Result<Option<MedicalRecord>, StorageError> {
        let sql = format!(
            "SELECT {} FROM medical_records WHERE record_id = $1",
            RECORD_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn update_record(
        &self,
        record_id: RecordId,
        update: &MedicalRecordUpdate,
        required_owner: Option<UserId>,
        audit: &NewAuditEvent,
    ) -> Result<RecordWrite, StorageError> {
        let mut tx = self.pool.begin().await?;

        let locked = sqlx::query(
            "SELECT doctor_id FROM medical_records WHERE record_id = $1 FOR UPDATE",
        )
        .bind(record_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(locked) = locked else {
            return Ok(RecordWrite::NotFound);
        };
        if let Some(owner) = required_owner {
            let doctor_id: Option<i64> = locked.try_get("doctor_id")?;
            if doctor_id != Some(owner) {
                return Ok(RecordWrite::NotOwner);
            }
        }

        let sql = format!(
            "UPDATE medical_records SET \
             diagnosis = COALESCE($2, diagnosis), \
             treatment = COALESCE($3, treatment), \
             prescription = COALESCE($4, prescription), \
             notes = COALESCE($5, notes), \
             updated_at = NOW() \
             WHERE record_id = $1 RETURNING {}",
            RECORD_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(record_id)
            .bind(update.diagnosis.as_deref())
            .bind(update.treatment.as_deref())
            .bind(update.prescription.as_deref())
            .bind(update.notes.as_deref())
            .fetch_one(&mut *tx)
            .await?;
        let updated = record_from_row(&row)?;

        insert_audit(&mut *tx, audit).await?;
        tx.commit().await?;

        Ok(RecordWrite::Applied(updated))
    }

    async fn delete_record(
        &self,
        record_id: RecordId,
        audit: &NewAuditEvent,
    ) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM medical_records WHERE record_id = $1")
            .bind(record_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        insert_audit(&mut *tx, audit).await?;
        tx.commit().await?;

        Ok(true)
    }
}
