//! Session token issuing and verification (HS256 JWT)

use super::types::{Claims, RoleId, UserId};
use crate::config::{TokenConfig, MIN_SECRET_LEN};
use crate::error::{MedgateError, Result};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::ExposeSecret;
use uuid::Uuid;

/// A freshly signed token together with the claims it carries
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: Claims,
}

/// Signs and verifies session tokens with a server-held secret
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenService {
    /// Build from configuration; fails when the secret is missing or too short
    pub fn new(config: &TokenConfig) -> Result<Self> {
        let secret = config.secret.as_ref().ok_or_else(|| {
            MedgateError::Config(format!(
                "token secret is not set (configure token.secret or {})",
                crate::config::ENV_TOKEN_SECRET
            ))
        })?;

        Self::from_secret(secret.expose_secret().as_bytes(), config.ttl)
    }

    /// Build from a raw secret
    pub fn from_secret(secret: &[u8], ttl: Duration) -> Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(MedgateError::Config(format!(
                "token secret must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }
        if ttl <= Duration::zero() {
            return Err(MedgateError::Config("token ttl must be positive".to_string()));
        }

        // Expiry is checked by hand in verify_at so it can be strict and testable.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            ttl,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token valid from now until now + ttl
    pub fn issue(
        &self,
        user_id: UserId,
        username: &str,
        role_id: RoleId,
        role_name: &str,
    ) -> Result<IssuedToken> {
        self.issue_at(user_id, username, role_id, role_name, Utc::now())
    }

    /// Issue a token as if the current time were `now`
    pub fn issue_at(
        &self,
        user_id: UserId,
        username: &str,
        role_id: RoleId,
        role_name: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken> {
        let iat = now.timestamp();
        let claims = Claims {
            user_id,
            username: username.to_string(),
            role_id,
            role_name: role_name.to_string(),
            iat,
            exp: iat + self.ttl.num_seconds(),
            jti: Uuid::new_v4().to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| MedgateError::Internal(format!("Failed to sign token: {}", e)))?;

        Ok(IssuedToken { token, claims })
    }

    /// Verify signature and expiry against the current time
    pub fn verify(&self, token: &str) -> Result<Claims> {
        self.verify_at(token, Utc::now())
    }

    /// Verify signature and expiry as if the current time were `now`.
    ///
    /// A token is rejected from the instant `now >= exp`, with no leeway.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<Claims> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "Token rejected");
            MedgateError::TokenInvalid
        })?;

        let claims = data.claims;
        if now.timestamp() >= claims.exp {
            tracing::debug!(username = %claims.username, exp = claims.exp, "Token expired");
            return Err(MedgateError::TokenInvalid);
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use chrono::TimeZone;

    const SECRET: &[u8] = b"test-secret-that-is-at-least-32-bytes!!";

    fn service() -> TokenService {
        TokenService::from_secret(SECRET, Duration::hours(24)).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let service = service();
        let issued = service.issue_at(7, "drAlice", 2, "Doctor", t0()).unwrap();
        let claims = service.verify_at(&issued.token, t0()).unwrap();

        assert_eq!(claims.user_id, 7);
        assert_eq!(claims.username, "drAlice");
        assert_eq!(claims.role_id, 2);
        assert_eq!(claims.role_name, "Doctor");
        assert_eq!(claims.exp - claims.iat, 24 * 3600);
        assert_eq!(claims, issued.claims);
    }

    #[test]
    fn test_strict_expiry() {
        let service = service();
        let issued = service.issue_at(1, "admin", 1, "Admin", t0()).unwrap();
        let exp = t0() + Duration::hours(24);

        assert!(service
            .verify_at(&issued.token, exp - Duration::seconds(1))
            .is_ok());
        assert!(matches!(
            service.verify_at(&issued.token, exp),
            Err(MedgateError::TokenInvalid)
        ));
        assert!(matches!(
            service.verify_at(&issued.token, exp + Duration::seconds(1)),
            Err(MedgateError::TokenInvalid)
        ));
    }

    #[test]
    fn test_tampered_and_foreign_tokens() {
        let service = service();
        let issued = service.issue_at(5, "nurseBob", 4, "Nurse", t0()).unwrap();

        // Swap in an escalated payload but keep the original signature
        let mut forged = issued.claims.clone();
        forged.role_name = "Admin".to_string();
        forged.role_id = 1;
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        let parts: Vec<&str> = issued.token.split('.').collect();
        let tampered = format!("{}.{}.{}", parts[0], payload, parts[2]);
        assert!(matches!(
            service.verify_at(&tampered, t0()),
            Err(MedgateError::TokenInvalid)
        ));

        let other = TokenService::from_secret(
            b"another-secret-that-is-also-32-bytes-long",
            Duration::hours(24),
        )
        .unwrap();
        assert!(matches!(
            other.verify_at(&issued.token, t0()),
            Err(MedgateError::TokenInvalid)
        ));

        assert!(matches!(
            service.verify_at("not.a.token", t0()),
            Err(MedgateError::TokenInvalid)
        ));
    }

    #[test]
    fn test_each_token_has_unique_id() {
        let service = service();
        let a = service.issue_at(1, "admin", 1, "Admin", t0()).unwrap();
        let b = service.issue_at(1, "admin", 1, "Admin", t0()).unwrap();
        assert_ne!(a.claims.jti, b.claims.jti);
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(matches!(
            TokenService::from_secret(b"short", Duration::hours(1)),
            Err(MedgateError::Config(_))
        ));
        assert!(matches!(
            TokenService::new(&TokenConfig::default()),
            Err(MedgateError::Config(_))
        ));
    }
}
