//! Password hashing with bcrypt

use crate::error::{MedgateError, Result};

/// Lowest bcrypt work factor accepted by configuration
pub const MIN_BCRYPT_COST: u32 = 4;
/// Highest bcrypt work factor accepted by configuration
pub const MAX_BCRYPT_COST: u32 = 31;

/// Hashes and verifies staff passwords.
///
/// Verification never errors: a digest that bcrypt cannot parse (for example a
/// plaintext value left behind by a seed script) simply fails to match.
pub struct PasswordHasher {
    cost: u32,
    /// Digest checked against when the username is unknown, so that failed
    /// lookups spend the same time as wrong passwords.
    dummy_hash: String,
}

impl PasswordHasher {
    /// Create a hasher with the given work factor
    pub fn new(cost: u32) -> Result<Self> {
        if !(MIN_BCRYPT_COST..=MAX_BCRYPT_COST).contains(&cost) {
            return Err(MedgateError::Config(format!(
                "bcrypt cost must be between {} and {}",
                MIN_BCRYPT_COST, MAX_BCRYPT_COST
            )));
        }

        let dummy_hash = bcrypt::hash(uuid::Uuid::new_v4().to_string(), cost)
            .map_err(|e| MedgateError::Internal(format!("Failed to hash password: {}", e)))?;

        Ok(Self { cost, dummy_hash })
    }

    pub fn cost(&self) -> u32 {
        self.cost
    }

    /// Produce a salted digest of `plaintext`
    pub fn hash(&self, plaintext: &str) -> Result<String> {
        bcrypt::hash(plaintext, self.cost)
            .map_err(|e| MedgateError::Internal(format!("Failed to hash password: {}", e)))
    }

    /// Check `plaintext` against a stored digest
    pub fn verify(&self, plaintext: &str, digest: &str) -> bool {
        bcrypt::verify(plaintext, digest).unwrap_or(false)
    }

    /// Spend one verification's worth of work without a real digest
    pub fn verify_dummy(&self, plaintext: &str) {
        let _ = self.verify(plaintext, &self.dummy_hash);
    }
}

impl std::fmt::Debug for PasswordHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordHasher")
            .field("cost", &self.cost)
            .finish_non_exhaustive()
    }
}
