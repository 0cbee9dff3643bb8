//! End-to-end tests for login, token handling and access decisions
//!
//! Drives the public API the way a route layer would: open a [`Medgate`],
//! seed the default roles, log in and call the gated services.

use chrono::{Duration, Utc};
use medgate::audit::{AuditFilter, AuditStatus, EventType, PageRequest};
use medgate::auth::{TokenService, ROLE_ADMIN, ROLE_DOCTOR, ROLE_NURSE};
use medgate::config::{Config, StorageBackendType};
use medgate::permissions::{AccessRule, Action, Resource};
use medgate::records::{MedicalRecordUpdate, NewMedicalRecord};
use medgate::{Actor, Medgate, MedgateError, RequestContext};
use secrecy::SecretString;

const SECRET: &str = "integration-secret-that-is-long-enough-for-hs256";

fn config() -> Config {
    let mut config = Config::default_config();
    config.token.secret = Some(SecretString::from(SECRET.to_string()));
    config.password.bcrypt_cost = 4;
    config.storage.backend = StorageBackendType::Memory;
    config
}

/// A seeded gate with an admin, two doctors and a nurse
async fn hospital() -> Medgate {
    let medgate = Medgate::open(&config()).await.unwrap();
    medgate.permissions.seed_defaults().await.unwrap();

    let operator = Actor::system("setup");
    let ctx = RequestContext::new();
    for (username, role) in [
        ("admin", ROLE_ADMIN),
        ("drAlice", ROLE_DOCTOR),
        ("drBen", ROLE_DOCTOR),
        ("nurseJoy", ROLE_NURSE),
    ] {
        medgate
            .auth
            .create_user(&operator, username, "correct horse", role, &ctx)
            .await
            .unwrap();
    }

    medgate
}

async fn login(medgate: &Medgate, username: &str) -> String {
    let (login, _) = medgate
        .auth
        .authenticate(username, "correct horse", &RequestContext::new())
        .await
        .unwrap();
    login.token
}

#[tokio::test]
async fn test_login_issues_verifiable_token_and_audits() {
    let medgate = hospital().await;
    let ctx = RequestContext::new().with_ip("192.168.1.20".parse().unwrap());

    let (login, user) = medgate
        .auth
        .authenticate("drAlice", "correct horse", &ctx)
        .await
        .unwrap();
    assert_eq!(login.token_type, "Bearer");
    assert_eq!(user.role_name, ROLE_DOCTOR);

    let claims = medgate.gate.verify(&login.token).unwrap();
    assert_eq!(claims.username, "drAlice");
    assert_eq!(claims.user_id, user.user_id);
    assert_eq!(claims.exp - claims.iat, Duration::hours(24).num_seconds());

    let logins = medgate
        .audit
        .query(
            &AuditFilter::new().event_type(EventType::Login),
            PageRequest::default(),
        )
        .await
        .unwrap();
    assert_eq!(logins.total, 1);
    assert_eq!(logins.items[0].status, AuditStatus::Success);
    assert_eq!(logins.items[0].ip_address.as_deref(), Some("192.168.1.20"));
}

#[tokio::test]
async fn test_failed_logins_look_alike() {
    let medgate = hospital().await;
    let ctx = RequestContext::new();

    let unknown = medgate.auth.authenticate("ghost", "whatever", &ctx).await;
    let wrong = medgate.auth.authenticate("drAlice", "wrong", &ctx).await;
    assert!(matches!(unknown, Err(MedgateError::InvalidCredentials)));
    assert!(matches!(wrong, Err(MedgateError::InvalidCredentials)));

    let failed = medgate.audit.failed_logins(10).await.unwrap();
    assert_eq!(failed.len(), 2);
    // The attempted username is kept even when no account matched
    assert_eq!(failed[1].username, "ghost");
}

#[tokio::test]
async fn test_token_expiry_boundary() {
    let tokens = TokenService::from_secret(SECRET.as_bytes(), Duration::hours(1)).unwrap();
    let issued_at = Utc::now();
    let issued = tokens.issue_at(7, "drAlice", 2, ROLE_DOCTOR, issued_at).unwrap();

    let claims = tokens
        .verify_at(&issued.token, issued_at + Duration::minutes(59))
        .unwrap();
    assert_eq!(claims.role_name, ROLE_DOCTOR);

    assert!(matches!(
        tokens.verify_at(&issued.token, issued_at + Duration::hours(1)),
        Err(MedgateError::TokenInvalid)
    ));

    let other = TokenService::from_secret(
        b"a-completely-different-secret-of-32-bytes",
        Duration::hours(1),
    )
    .unwrap();
    assert!(matches!(
        other.verify_at(&issued.token, issued_at),
        Err(MedgateError::TokenInvalid)
    ));
}

#[tokio::test]
async fn test_logout_revokes_token() {
    let medgate = hospital().await;
    let token = login(&medgate, "nurseJoy").await;
    let claims = medgate.gate.verify(&token).unwrap();

    medgate.auth.logout(&claims, &RequestContext::new()).await;

    assert!(matches!(
        medgate.gate.verify(&token),
        Err(MedgateError::TokenInvalid)
    ));
}

#[tokio::test]
async fn test_route_rules_by_role() {
    let medgate = hospital().await;
    let nurse = login(&medgate, "nurseJoy").await;
    let header = format!("Bearer {}", nurse);

    let read = AccessRule::for_route(Resource::Patients, Action::Select);
    let delete = AccessRule::for_route(Resource::Patients, Action::Delete);

    assert!(medgate.gate.authorize_header(Some(&header), &read).is_ok());
    assert!(matches!(
        medgate.gate.authorize_header(Some(&header), &delete),
        Err(MedgateError::Forbidden(_))
    ));
    assert!(matches!(
        medgate.gate.authorize_header(None, &read),
        Err(MedgateError::TokenMissing)
    ));
}

#[tokio::test]
async fn test_doctor_cannot_update_colleagues_record() {
    let medgate = hospital().await;
    let alice = medgate.gate.verify(&login(&medgate, "drAlice").await).unwrap();
    let ben = medgate.gate.verify(&login(&medgate, "drBen").await).unwrap();
    let ctx = RequestContext::new().with_ip("10.1.2.3".parse().unwrap());

    let record = medgate
        .records
        .create(
            &ben,
            NewMedicalRecord {
                patient_id: 12,
                doctor_id: None,
                diagnosis: "Hypertension".to_string(),
                treatment: None,
                prescription: Some("Lisinopril".to_string()),
                notes: None,
                record_date: None,
            },
            &ctx,
        )
        .await
        .unwrap();
    assert_eq!(record.doctor_id, Some(ben.user_id));

    assert!(medgate
        .gate
        .check_ownership(&ben, record.record_id)
        .await
        .unwrap());
    assert!(!medgate
        .gate
        .check_ownership(&alice, record.record_id)
        .await
        .unwrap());

    let update = MedicalRecordUpdate {
        diagnosis: Some("Something else".to_string()),
        ..Default::default()
    };
    let result = medgate
        .records
        .update(&alice, record.record_id, &update, &ctx)
        .await;
    assert!(matches!(result, Err(MedgateError::Forbidden(_))));

    let denied = medgate
        .audit
        .query(
            &AuditFilter::new().status(AuditStatus::Denied),
            PageRequest::default(),
        )
        .await
        .unwrap();
    assert_eq!(denied.total, 1);
    assert_eq!(denied.items[0].username, "drAlice");
    assert_eq!(denied.items[0].event_type, EventType::Update);
    assert_eq!(denied.items[0].resource, "medical_records");
    assert_eq!(denied.items[0].ip_address.as_deref(), Some("10.1.2.3"));
}

#[tokio::test]
async fn test_grant_and_revoke_round_trip() {
    let medgate = hospital().await;
    let operator = Actor::system("security-officer");
    let ctx = RequestContext::new();

    let matrix = medgate.permissions.matrix().await.unwrap();
    assert!(!matrix.allows(ROLE_NURSE, "appointments", "DELETE"));

    assert!(medgate
        .permissions
        .grant(&operator, ROLE_NURSE, "appointments", "delete", &ctx)
        .await
        .unwrap());
    assert!(!medgate
        .permissions
        .grant(&operator, ROLE_NURSE, "appointments", "DELETE", &ctx)
        .await
        .unwrap());

    let matrix = medgate.permissions.matrix().await.unwrap();
    assert!(matrix.allows(ROLE_NURSE, "appointments", "DELETE"));

    medgate
        .permissions
        .revoke(&operator, ROLE_NURSE, "appointments", "DELETE", &ctx)
        .await
        .unwrap();
    assert!(matches!(
        medgate
            .permissions
            .revoke(&operator, ROLE_NURSE, "appointments", "DELETE", &ctx)
            .await,
        Err(MedgateError::NotFound(_))
    ));

    let grants = medgate
        .audit
        .query(
            &AuditFilter::new().event_type(EventType::Grant),
            PageRequest::default(),
        )
        .await
        .unwrap();
    assert_eq!(grants.total, 2);
}

#[tokio::test]
async fn test_role_in_use_cannot_be_deleted() {
    let medgate = hospital().await;
    let operator = Actor::system("setup");
    let ctx = RequestContext::new();

    medgate
        .auth
        .create_role(&operator, "Pharmacist", Some("Dispensing staff"), &ctx)
        .await
        .unwrap();
    medgate
        .permissions
        .grant(&operator, "Pharmacist", "medical_records", "SELECT", &ctx)
        .await
        .unwrap();
    let pharmacist = medgate
        .auth
        .create_user(&operator, "pharmPat", "pills", "Pharmacist", &ctx)
        .await
        .unwrap();

    assert!(matches!(
        medgate.auth.delete_role(&operator, "Pharmacist", &ctx).await,
        Err(MedgateError::Conflict(_))
    ));

    medgate
        .auth
        .assign_role(&operator, pharmacist.user_id, ROLE_NURSE, &ctx)
        .await
        .unwrap();
    medgate
        .auth
        .delete_role(&operator, "Pharmacist", &ctx)
        .await
        .unwrap();

    let matrix = medgate.permissions.matrix().await.unwrap();
    assert!(!matrix.roles.iter().any(|r| r == "Pharmacist"));
    assert!(!matrix.permissions.contains_key("Pharmacist"));
}
