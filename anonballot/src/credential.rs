use crate::*;
use chrono::{DateTime, Utc};
use num_bigint_dig::BigUint;
use uuid::Uuid;

/// Prefix of every issued token id
pub const TOKEN_PREFIX: &str = "AT_";

/// A blind-signing session.
///
/// Lives only inside the issuer. The blinding factor is never serialized.
#[derive(Clone, Debug, PartialEq)]
pub struct BlindSignSession {
    pub session_id: Uuid,
    pub election_id: Uuid,
    pub blinding_factor: BigUint,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,

    /// The blinded signature produced for this session, once signed
    pub blinded_signature: Option<BigUint>,
}

impl BlindSignSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// An anonymous, single-use voting credential
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AnonymousCredential {
    pub token_id: String,
    pub election_id: Uuid,
    pub session_id: Uuid,
    pub blinding_factor_hash: String,

    /// The message the authority's signature is over
    #[serde(with = "crate::serde_hex::biguint_hex")]
    pub message: BigUint,

    #[serde(with = "crate::serde_hex::biguint_hex")]
    pub blind_signature: BigUint,

    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub spent: bool,
    pub active: bool,
    pub spent_at: Option<DateTime<Utc>>,
}

impl AnonymousCredential {
    pub fn new_token_id() -> String {
        format!("{}{}", TOKEN_PREFIX, Uuid::new_v4().to_simple())
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.check(now).is_ok()
    }

    /// Check usability, reporting the first failing condition.
    pub fn check(&self, now: DateTime<Utc>) -> Result<(), CredentialError> {
        if !self.active {
            return Err(CredentialError::Inactive);
        }
        if self.spent {
            return Err(CredentialError::AlreadySpent);
        }
        if now >= self.expires_at {
            return Err(CredentialError::Expired);
        }
        Ok(())
    }

    /// Verify the authority's signature on this credential
    pub fn verify_signature(&self, public_key: &BlindPublicKey) -> bool {
        public_key.verify(&self.message, &self.blind_signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn credential(now: DateTime<Utc>) -> AnonymousCredential {
        AnonymousCredential {
            token_id: AnonymousCredential::new_token_id(),
            election_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            blinding_factor_hash: sha256_hex(b"r"),
            message: BigUint::from(42u32),
            blind_signature: BigUint::from(7u32),
            issued_at: now,
            expires_at: now + Duration::days(7),
            spent: false,
            active: true,
            spent_at: None,
        }
    }

    #[test]
    fn test_check_order() {
        let now = Utc::now();
        let mut c = credential(now);
        assert!(c.is_valid(now));
        assert!(c.token_id.starts_with(TOKEN_PREFIX));
        assert_eq!(c.token_id.len(), TOKEN_PREFIX.len() + 32);

        assert_eq!(c.check(now + Duration::days(8)), Err(CredentialError::Expired));

        c.spent = true;
        assert_eq!(c.check(now + Duration::days(8)), Err(CredentialError::AlreadySpent));

        c.active = false;
        assert_eq!(c.check(now), Err(CredentialError::Inactive));
    }
}
