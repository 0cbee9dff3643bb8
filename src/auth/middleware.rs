//! Request-time access gate
//!
//! Every protected route passes through [`AccessGate`]:
//! - Extract the bearer token from the Authorization header
//! - Verify signature, expiry and logout state
//! - Check the caller's role against the route's allow-list
//! - Optionally run the handler and audit its outcome

use super::revocation::RevocationList;
use super::token::TokenService;
use super::types::Claims;
use crate::audit::{AuditRecorder, AuditStatus, NewAuditEvent};
use crate::error::{MedgateError, Result};
use crate::permissions::AccessRule;
use crate::records::RecordId;
use crate::storage::StorageBackend;
use crate::RequestContext;
use std::future::Future;
use std::sync::Arc;

/// Extract the token from an Authorization header value
///
/// Expected format: `Authorization: Bearer <token>`
pub fn extract_bearer_token(auth_header: Option<&str>) -> Result<&str> {
    let header = auth_header.ok_or(MedgateError::TokenMissing)?;

    let (scheme, token) = header
        .trim()
        .split_once(' ')
        .ok_or(MedgateError::TokenInvalid)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(MedgateError::TokenInvalid);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(MedgateError::TokenInvalid);
    }

    Ok(token)
}

/// Verifies tokens and enforces route allow-lists
pub struct AccessGate {
    tokens: Arc<TokenService>,
    revocations: Arc<RevocationList>,
    storage: Arc<dyn StorageBackend>,
    audit: Arc<AuditRecorder>,
}

impl AccessGate {
    pub fn new(
        tokens: Arc<TokenService>,
        revocations: Arc<RevocationList>,
        storage: Arc<dyn StorageBackend>,
        audit: Arc<AuditRecorder>,
    ) -> Self {
        Self {
            tokens,
            revocations,
            storage,
            audit,
        }
    }

    /// Verify a raw token, rejecting logged-out ones
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let claims = self.tokens.verify(token)?;

        if self.revocations.is_revoked(&claims.jti) {
            tracing::debug!(username = %claims.username, "Token was logged out");
            return Err(MedgateError::TokenInvalid);
        }

        Ok(claims)
    }

    /// Verify `token` and require one of `required_roles`. An empty list
    /// admits any authenticated caller.
    pub fn authorize(&self, token: &str, required_roles: &[&str]) -> Result<Claims> {
        let claims = self.verify(token)?;

        if !required_roles.is_empty() && !required_roles.contains(&claims.role_name.as_str()) {
            tracing::warn!(
                username = %claims.username,
                role = %claims.role_name,
                "Role not permitted"
            );
            return Err(MedgateError::Forbidden(format!(
                "Access denied. Required roles: {}",
                required_roles.join(", ")
            )));
        }

        Ok(claims)
    }

    /// Full flow for a route: header extraction, verification and allow-list
    pub fn authorize_header(&self, auth_header: Option<&str>, rule: &AccessRule) -> Result<Claims> {
        let token = extract_bearer_token(auth_header)?;
        let claims = self.verify(token)?;
        self.require(&claims, rule)?;
        Ok(claims)
    }

    /// Check already-verified claims against a route allow-list
    pub fn require(&self, claims: &Claims, rule: &AccessRule) -> Result<()> {
        if rule.roles.admits(&claims.role_name) {
            return Ok(());
        }

        tracing::warn!(
            username = %claims.username,
            role = %claims.role_name,
            resource = %rule.resource,
            action = %rule.action,
            "Access denied"
        );
        Err(MedgateError::Forbidden(rule.denial_message()))
    }

    /// As [`require`](Self::require), recording a `denied` audit event on refusal
    pub async fn enforce(
        &self,
        claims: &Claims,
        rule: &AccessRule,
        ctx: &RequestContext,
    ) -> Result<()> {
        if let Err(e) = self.require(claims, rule) {
            self.audit
                .record(
                    NewAuditEvent::new(
                        rule.action.event_type(),
                        rule.resource.as_str(),
                        &claims.username,
                    )
                    .denied()
                    .details(format!(
                        "Role {} may not {} {}",
                        claims.role_name, rule.action, rule.resource
                    ))
                    .context(ctx),
                )
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// Whether the caller may mutate the given medical record.
    ///
    /// Doctors may only touch records they own; other roles that passed the
    /// allow-list are not owner-scoped. This is an advisory read: the record
    /// service repeats the check atomically with the write.
    pub async fn check_ownership(&self, claims: &Claims, record_id: RecordId) -> Result<bool> {
        let record = self
            .storage
            .get_record(record_id)
            .await?
            .ok_or_else(|| MedgateError::NotFound("Medical record not found".to_string()))?;

        if !claims.is_doctor() {
            return Ok(true);
        }

        Ok(record.doctor_id == Some(claims.user_id))
    }

    /// Authorize a request, run `handler` with the caller's claims, and audit
    /// the outcome.
    ///
    /// Authentication failures are returned without an audit row since there
    /// is no trustworthy identity to record. Allow-list refusals are audited
    /// as `denied`; handler results as `success` or `failed`.
    pub async fn run_guarded<T, F, Fut>(
        &self,
        auth_header: Option<&str>,
        rule: &AccessRule,
        ctx: &RequestContext,
        handler: F,
    ) -> Result<T>
    where
        F: FnOnce(Claims) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = extract_bearer_token(auth_header)?;
        let claims = self.verify(token)?;
        self.enforce(&claims, rule, ctx).await?;

        let username = claims.username.clone();
        let outcome = handler(claims).await;

        let event = NewAuditEvent::new(rule.action.event_type(), rule.resource.as_str(), username)
            .context(ctx);
        let event = match &outcome {
            Ok(_) => event,
            Err(e) => event.status(AuditStatus::Failed).details(e.to_string()),
        };
        self.audit.record(event).await;

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEvent, AuditFilter, EventType, PageRequest};
    use crate::config::AuditConfig;
    use crate::permissions::{Action, Resource};
    use crate::records::NewMedicalRecord;
    use crate::storage::MemoryStorage;
    use chrono::Duration;

    const SECRET: &[u8] = b"gate-test-secret-at-least-32-bytes-long";

    struct Fixture {
        gate: AccessGate,
        tokens: Arc<TokenService>,
        revocations: Arc<RevocationList>,
        storage: Arc<MemoryStorage>,
        audit: Arc<AuditRecorder>,
    }

    fn fixture() -> Fixture {
        let tokens = Arc::new(TokenService::from_secret(SECRET, Duration::hours(1)).unwrap());
        let revocations = Arc::new(RevocationList::new());
        let storage = Arc::new(MemoryStorage::new());
        let audit = Arc::new(AuditRecorder::new(storage.clone(), AuditConfig::default()));
        let gate = AccessGate::new(
            tokens.clone(),
            revocations.clone(),
            storage.clone(),
            audit.clone(),
        );
        Fixture {
            gate,
            tokens,
            revocations,
            storage,
            audit,
        }
    }

    async fn audit_rows(audit: &AuditRecorder) -> Vec<AuditEvent> {
        audit
            .query(&AuditFilter::default(), PageRequest::default())
            .await
            .unwrap()
            .items
    }

    #[test]
    fn test_extract_bearer_token() {
        assert_eq!(extract_bearer_token(Some("Bearer abc.def.ghi")).unwrap(), "abc.def.ghi");
        assert_eq!(extract_bearer_token(Some("bearer  xyz ")).unwrap(), "xyz");

        assert!(matches!(extract_bearer_token(None), Err(MedgateError::TokenMissing)));
        assert!(matches!(
            extract_bearer_token(Some("Basic dXNlcjpwYXNz")),
            Err(MedgateError::TokenInvalid)
        ));
        assert!(matches!(
            extract_bearer_token(Some("Bearer")),
            Err(MedgateError::TokenInvalid)
        ));
        assert!(matches!(
            extract_bearer_token(Some("Bearer    ")),
            Err(MedgateError::TokenInvalid)
        ));
    }

    #[test]
    fn test_authorize_roles() {
        let f = fixture();
        let nurse = f.tokens.issue(4, "nurseBob", 4, "Nurse").unwrap();

        let claims = f.gate.authorize(&nurse.token, &[]).unwrap();
        assert_eq!(claims.username, "nurseBob");

        let err = f.gate.authorize(&nurse.token, &["Admin", "Doctor"]).unwrap_err();
        assert!(matches!(err, MedgateError::Forbidden(ref m) if m == "Access denied. Required roles: Admin, Doctor"));
    }

    #[test]
    fn test_logged_out_token_rejected() {
        let f = fixture();
        let issued = f.tokens.issue(1, "admin", 1, "Admin").unwrap();
        assert!(f.gate.verify(&issued.token).is_ok());

        f.revocations.revoke(&issued.claims);
        assert!(matches!(f.gate.verify(&issued.token), Err(MedgateError::TokenInvalid)));
    }

    #[test]
    fn test_authorize_header_with_rule() {
        let f = fixture();
        let receptionist = f.tokens.issue(3, "frontDesk", 3, "Receptionist").unwrap();
        let header = format!("Bearer {}", receptionist.token);

        let add_patient = AccessRule::for_route(Resource::Patients, Action::Insert);
        assert!(f.gate.authorize_header(Some(&header), &add_patient).is_ok());

        let delete_patient = AccessRule::for_route(Resource::Patients, Action::Delete);
        assert!(matches!(
            f.gate.authorize_header(Some(&header), &delete_patient),
            Err(MedgateError::Forbidden(_))
        ));
        assert!(matches!(
            f.gate.authorize_header(None, &add_patient),
            Err(MedgateError::TokenMissing)
        ));
    }

    #[tokio::test]
    async fn test_check_ownership() {
        let f = fixture();
        let audit = NewAuditEvent::new(EventType::Insert, "medical_records", "drAlice");
        let record = f
            .storage
            .insert_record(
                &NewMedicalRecord {
                    patient_id: 12,
                    doctor_id: Some(7),
                    diagnosis: "Hypertension".to_string(),
                    treatment: None,
                    prescription: None,
                    notes: None,
                    record_date: None,
                },
                &audit,
            )
            .await
            .unwrap();

        let owner = f.tokens.issue(7, "drAlice", 2, "Doctor").unwrap().claims;
        let other = f.tokens.issue(8, "drBen", 2, "Doctor").unwrap().claims;
        let admin = f.tokens.issue(1, "admin", 1, "Admin").unwrap().claims;

        assert!(f.gate.check_ownership(&owner, record.record_id).await.unwrap());
        assert!(!f.gate.check_ownership(&other, record.record_id).await.unwrap());
        assert!(f.gate.check_ownership(&admin, record.record_id).await.unwrap());
        assert!(matches!(
            f.gate.check_ownership(&owner, 999).await,
            Err(MedgateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_run_guarded_audits_outcomes() {
        let f = fixture();
        let doctor = f.tokens.issue(7, "drAlice", 2, "Doctor").unwrap();
        let header = format!("Bearer {}", doctor.token);
        let ctx = RequestContext::new().with_ip("10.0.0.8".parse().unwrap());

        let read = AccessRule::for_route(Resource::Patients, Action::Select);
        let value = f
            .gate
            .run_guarded(Some(&header), &read, &ctx, |claims| async move {
                Ok(claims.user_id)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let result: Result<()> = f
            .gate
            .run_guarded(Some(&header), &read, &ctx, |_| async {
                Err(MedgateError::NotFound("Patient not found".to_string()))
            })
            .await;
        assert!(matches!(result, Err(MedgateError::NotFound(_))));

        let delete = AccessRule::for_route(Resource::Patients, Action::Delete);
        let result: Result<()> = f
            .gate
            .run_guarded(Some(&header), &delete, &ctx, |_| async {
                Err(MedgateError::Internal("handler ran".to_string()))
            })
            .await;
        assert!(matches!(result, Err(MedgateError::Forbidden(_))));

        let rows = audit_rows(&f.audit).await;
        assert_eq!(rows.len(), 3);
        // Newest first
        assert_eq!(rows[0].status, AuditStatus::Denied);
        assert_eq!(rows[0].event_type, EventType::Delete);
        assert_eq!(rows[1].status, AuditStatus::Failed);
        assert_eq!(rows[1].details.as_deref(), Some("Patient not found"));
        assert_eq!(rows[2].status, AuditStatus::Success);
        assert_eq!(rows[2].ip_address.as_deref(), Some("10.0.0.8"));
    }

    #[tokio::test]
    async fn test_run_guarded_skips_audit_without_identity() {
        let f = fixture();
        let read = AccessRule::for_route(Resource::Patients, Action::Select);

        let result: Result<()> = f
            .gate
            .run_guarded(Some("Bearer garbage"), &read, &RequestContext::new(), |_| async {
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(MedgateError::TokenInvalid)));
        assert!(audit_rows(&f.audit).await.is_empty());
    }
}
