//! Medical records, the one owner-scoped resource
//!
//! Doctors may only update records they authored. The ownership check runs
//! inside the store together with the write, so a record cannot change hands
//! between the check and the update.

mod types;

pub use types::{MedicalRecord, MedicalRecordUpdate, NewMedicalRecord, RecordId, RecordWrite};

use crate::audit::{AuditRecorder, EventType, NewAuditEvent};
use crate::auth::{AccessGate, Claims};
use crate::error::{MedgateError, Result};
use crate::permissions::{AccessRule, Action, Resource};
use crate::storage::StorageBackend;
use crate::RequestContext;
use std::sync::Arc;

const MEDICAL_RECORDS: &str = "medical_records";

/// Gated access to medical records
pub struct RecordService {
    storage: Arc<dyn StorageBackend>,
    gate: Arc<AccessGate>,
    audit: Arc<AuditRecorder>,
}

impl RecordService {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        gate: Arc<AccessGate>,
        audit: Arc<AuditRecorder>,
    ) -> Self {
        Self {
            storage,
            gate,
            audit,
        }
    }

    pub async fn get(
        &self,
        claims: &Claims,
        record_id: RecordId,
        ctx: &RequestContext,
    ) -> Result<MedicalRecord> {
        self.gate.enforce(claims, &rule(Action::Select), ctx).await?;

        self.storage
            .get_record(record_id)
            .await?
            .ok_or_else(|| MedgateError::NotFound("Medical record not found".to_string()))
    }

    /// Create a record. A Doctor is always recorded as the owner of what
    /// they create.
    pub async fn create(
        &self,
        claims: &Claims,
        mut record: NewMedicalRecord,
        ctx: &RequestContext,
    ) -> Result<MedicalRecord> {
        self.gate.enforce(claims, &rule(Action::Insert), ctx).await?;

        if record.diagnosis.trim().is_empty() {
            return Err(MedgateError::Validation(
                "Missing required field: diagnosis".to_string(),
            ));
        }
        if claims.is_doctor() {
            record.doctor_id = Some(claims.user_id);
        }

        let audit = self
            .event(claims, Action::Insert, ctx)
            .details(format!(
                "Created medical record for patient ID: {}",
                record.patient_id
            ));

        match self.storage.insert_record(&record, &audit).await {
            Ok(created) => {
                tracing::info!(
                    record_id = created.record_id,
                    patient_id = created.patient_id,
                    username = %claims.username,
                    "Medical record created"
                );
                Ok(created)
            }
            Err(e) => {
                let err = MedgateError::from(e);
                self.record_failure(claims, Action::Insert, &err, ctx).await;
                Err(err)
            }
        }
    }

    /// Update the set fields of a record, enforcing Doctor ownership
    pub async fn update(
        &self,
        claims: &Claims,
        record_id: RecordId,
        update: &MedicalRecordUpdate,
        ctx: &RequestContext,
    ) -> Result<MedicalRecord> {
        let update_rule = rule(Action::Update);
        self.gate.enforce(claims, &update_rule, ctx).await?;

        if update.is_empty() {
            return Err(MedgateError::Validation("No fields to update".to_string()));
        }

        let required_owner = (update_rule.is_owner_scoped() && claims.is_doctor())
            .then_some(claims.user_id);
        let audit = self
            .event(claims, Action::Update, ctx)
            .details(format!("Updated medical record ID: {}", record_id));

        let outcome = self
            .storage
            .update_record(record_id, update, required_owner, &audit)
            .await;

        match outcome {
            Ok(RecordWrite::Applied(record)) => {
                tracing::info!(record_id, username = %claims.username, "Medical record updated");
                Ok(record)
            }
            Ok(RecordWrite::NotFound) => {
                let err = MedgateError::NotFound("Medical record not found".to_string());
                self.record_failure(claims, Action::Update, &err, ctx).await;
                Err(err)
            }
            Ok(RecordWrite::NotOwner) => {
                tracing::warn!(
                    record_id,
                    username = %claims.username,
                    "Doctor attempted to update another doctor's record"
                );
                self.audit
                    .record(
                        self.event(claims, Action::Update, ctx)
                            .denied()
                            .details(format!(
                                "Attempted to update medical record ID: {} owned by another doctor",
                                record_id
                            )),
                    )
                    .await;
                Err(MedgateError::Forbidden(
                    "You can only update your own medical records".to_string(),
                ))
            }
            Err(e) => {
                let err = MedgateError::from(e);
                self.record_failure(claims, Action::Update, &err, ctx).await;
                Err(err)
            }
        }
    }

    pub async fn delete(
        &self,
        claims: &Claims,
        record_id: RecordId,
        ctx: &RequestContext,
    ) -> Result<()> {
        self.gate.enforce(claims, &rule(Action::Delete), ctx).await?;

        let audit = self
            .event(claims, Action::Delete, ctx)
            .details(format!("Deleted medical record ID: {}", record_id));

        let err = match self.storage.delete_record(record_id, &audit).await {
            Ok(true) => {
                tracing::info!(record_id, username = %claims.username, "Medical record deleted");
                return Ok(());
            }
            Ok(false) => MedgateError::NotFound("Medical record not found".to_string()),
            Err(e) => MedgateError::from(e),
        };

        self.record_failure(claims, Action::Delete, &err, ctx).await;
        Err(err)
    }

    fn event(&self, claims: &Claims, action: Action, ctx: &RequestContext) -> NewAuditEvent {
        NewAuditEvent::new(action.event_type(), MEDICAL_RECORDS, &claims.username).context(ctx)
    }

    async fn record_failure(
        &self,
        claims: &Claims,
        action: Action,
        err: &MedgateError,
        ctx: &RequestContext,
    ) {
        self.audit
            .record(self.event(claims, action, ctx).failed().details(err.to_string()))
            .await;
    }
}

fn rule(action: Action) -> AccessRule {
    AccessRule::for_route(Resource::MedicalRecords, action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditFilter, AuditStatus, PageRequest};
    use crate::auth::{RevocationList, TokenService};
    use crate::config::AuditConfig;
    use crate::storage::MemoryStorage;
    use chrono::Duration;

    struct Fixture {
        service: RecordService,
        tokens: Arc<TokenService>,
        audit: Arc<AuditRecorder>,
    }

    fn fixture() -> Fixture {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
        let tokens = Arc::new(
            TokenService::from_secret(b"records-test-secret-at-least-32-bytes", Duration::hours(1))
                .unwrap(),
        );
        let audit = Arc::new(AuditRecorder::new(storage.clone(), AuditConfig::default()));
        let gate = Arc::new(AccessGate::new(
            tokens.clone(),
            Arc::new(RevocationList::new()),
            storage.clone(),
            audit.clone(),
        ));
        Fixture {
            service: RecordService::new(storage, gate, audit.clone()),
            tokens,
            audit,
        }
    }

    fn claims(f: &Fixture, user_id: i64, username: &str, role: &str) -> Claims {
        f.tokens.issue(user_id, username, 0, role).unwrap().claims
    }

    fn new_record(patient_id: i64) -> NewMedicalRecord {
        NewMedicalRecord {
            patient_id,
            doctor_id: None,
            diagnosis: "Type 2 diabetes".to_string(),
            treatment: Some("Metformin".to_string()),
            prescription: None,
            notes: None,
            record_date: None,
        }
    }

    #[tokio::test]
    async fn test_doctor_becomes_owner_on_create() {
        let f = fixture();
        let ctx = RequestContext::new();
        let doctor = claims(&f, 7, "drAlice", "Doctor");

        let mut record = new_record(42);
        record.doctor_id = Some(99);
        let created = f.service.create(&doctor, record, &ctx).await.unwrap();
        assert_eq!(created.doctor_id, Some(7));

        let admin = claims(&f, 1, "admin", "Admin");
        let by_admin = f.service.create(&admin, new_record(42), &ctx).await.unwrap();
        assert_eq!(by_admin.doctor_id, None);
    }

    #[tokio::test]
    async fn test_nurse_cannot_write() {
        let f = fixture();
        let ctx = RequestContext::new();
        let nurse = claims(&f, 4, "nurseBob", "Nurse");

        let result = f.service.create(&nurse, new_record(1), &ctx).await;
        assert!(matches!(result, Err(MedgateError::Forbidden(_))));

        let page = f
            .audit
            .query(&AuditFilter::new().status(AuditStatus::Denied), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].username, "nurseBob");
    }

    #[tokio::test]
    async fn test_update_requires_ownership_for_doctors() {
        let f = fixture();
        let ctx = RequestContext::new();
        let alice = claims(&f, 7, "drAlice", "Doctor");
        let ben = claims(&f, 8, "drBen", "Doctor");
        let admin = claims(&f, 1, "admin", "Admin");

        let record = f.service.create(&ben, new_record(5), &ctx).await.unwrap();
        let update = MedicalRecordUpdate {
            notes: Some("Reviewed".to_string()),
            ..Default::default()
        };

        let result = f.service.update(&alice, record.record_id, &update, &ctx).await;
        assert!(matches!(
            result,
            Err(MedgateError::Forbidden(ref m)) if m == "You can only update your own medical records"
        ));
        let unchanged = f.service.get(&alice, record.record_id, &ctx).await.unwrap();
        assert_eq!(unchanged.notes, None);

        let updated = f
            .service
            .update(&ben, record.record_id, &update, &ctx)
            .await
            .unwrap();
        assert_eq!(updated.notes.as_deref(), Some("Reviewed"));

        // Admins are not owner-scoped
        assert!(f
            .service
            .update(&admin, record.record_id, &update, &ctx)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_update_validation_and_missing_record() {
        let f = fixture();
        let ctx = RequestContext::new();
        let admin = claims(&f, 1, "admin", "Admin");

        let empty = f
            .service
            .update(&admin, 1, &MedicalRecordUpdate::default(), &ctx)
            .await;
        assert!(matches!(empty, Err(MedgateError::Validation(_))));

        let update = MedicalRecordUpdate {
            diagnosis: Some("Influenza".to_string()),
            ..Default::default()
        };
        let missing = f.service.update(&admin, 404, &update, &ctx).await;
        assert!(matches!(missing, Err(MedgateError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_is_admin_only() {
        let f = fixture();
        let ctx = RequestContext::new();
        let doctor = claims(&f, 7, "drAlice", "Doctor");
        let admin = claims(&f, 1, "admin", "Admin");

        let record = f.service.create(&doctor, new_record(3), &ctx).await.unwrap();
        assert!(matches!(
            f.service.delete(&doctor, record.record_id, &ctx).await,
            Err(MedgateError::Forbidden(_))
        ));

        f.service.delete(&admin, record.record_id, &ctx).await.unwrap();
        assert!(matches!(
            f.service.delete(&admin, record.record_id, &ctx).await,
            Err(MedgateError::NotFound(_))
        ));
        assert!(matches!(
            f.service.get(&admin, record.record_id, &ctx).await,
            Err(MedgateError::NotFound(_))
        ));
    }
}
