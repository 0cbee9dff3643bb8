//! Node-local deny-list of logged-out tokens

use super::types::Claims;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Token ids revoked by logout, kept until the token would have expired anyway.
///
/// The list lives in process memory and is not shared between nodes.
#[derive(Debug, Default)]
pub struct RevocationList {
    /// jti -> exp (seconds since the epoch)
    revoked: RwLock<HashMap<String, i64>>,
}

impl RevocationList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Revoke the token carrying these claims
    pub fn revoke(&self, claims: &Claims) {
        self.revoked.write().insert(claims.jti.clone(), claims.exp);
    }

    pub fn is_revoked(&self, jti: &str) -> bool {
        self.revoked.read().contains_key(jti)
    }

    /// Drop entries whose tokens have expired; returns how many were removed
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let now = now.timestamp();
        let mut revoked = self.revoked.write();
        let before = revoked.len();
        revoked.retain(|_, exp| *exp > now);
        before - revoked.len()
    }

    pub fn len(&self) -> usize {
        self.revoked.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.revoked.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn claims(jti: &str, exp: i64) -> Claims {
        Claims {
            user_id: 1,
            username: "admin".to_string(),
            role_id: 1,
            role_name: "Admin".to_string(),
            iat: exp - 3600,
            exp,
            jti: jti.to_string(),
        }
    }

    #[test]
    fn test_revoke_and_prune() {
        let list = RevocationList::new();
        list.revoke(&claims("a", 1_000));
        list.revoke(&claims("b", 5_000));

        assert!(list.is_revoked("a"));
        assert!(list.is_revoked("b"));
        assert!(!list.is_revoked("c"));

        let removed = list.prune(Utc.timestamp_opt(2_000, 0).unwrap());
        assert_eq!(removed, 1);
        assert!(!list.is_revoked("a"));
        assert!(list.is_revoked("b"));
        assert_eq!(list.len(), 1);
    }
}
