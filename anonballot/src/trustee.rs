use crate::*;
use num_bigint_dig::BigUint;
use std::sync::Arc;
use uuid::Uuid;

/// A trustee's share of an election's Paillier λ.
///
/// Most elections will have a handful of trustees, with the threshold set to a
/// majority of them. Any threshold-sized group of trustees may decrypt the tally;
/// no smaller group learns anything about λ.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TrusteeShare {
    pub trustee_index: u32,

    #[serde(with = "crate::serde_hex::biguint_hex")]
    pub share_value: BigUint,

    /// SHA-256 commitment to the share, kept alongside the reference copy
    pub verification_key: String,
}

impl std::fmt::Debug for TrusteeShare {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TrusteeShare")
            .field("trustee_index", &self.trustee_index)
            .field("verification_key", &self.verification_key)
            .finish()
    }
}

impl TrusteeShare {
    pub fn new(share: SecretShare) -> Self {
        let verification_key = share_verification_key(share.x, &share.y);
        TrusteeShare {
            trustee_index: share.x,
            share_value: share.y,
            verification_key,
        }
    }

    pub fn secret_share(&self) -> SecretShare {
        SecretShare {
            x: self.trustee_index,
            y: self.share_value.clone(),
        }
    }

    /// Custody id under which the reference copy of a share is sealed
    pub fn custody_id(election_id: Uuid, trustee_index: u32) -> String {
        format!("paillier_share_{}_{}", election_id, trustee_index)
    }
}

pub fn share_verification_key(trustee_index: u32, share_value: &BigUint) -> String {
    sha256_hex(format!("{}:{}", trustee_index, share_value.to_str_radix(16)).as_bytes())
}

/// Keeps the reference copy of every trustee share sealed in key custody.
#[derive(Clone)]
pub struct ShareCustodian {
    custody: Arc<dyn KeyCustody>,
}

impl ShareCustodian {
    pub fn new(custody: Arc<dyn KeyCustody>) -> Self {
        ShareCustodian { custody }
    }

    pub fn store_shares(&self, election_id: Uuid, shares: &[TrusteeShare]) -> Result<(), Error> {
        for share in shares {
            let sealed = serde_cbor::to_vec(share)?;
            self.custody
                .store_secret(&TrusteeShare::custody_id(election_id, share.trustee_index), &sealed)?;
        }
        Ok(())
    }

    pub fn reference(&self, election_id: Uuid, trustee_index: u32) -> Result<Option<TrusteeShare>, Error> {
        let id = TrusteeShare::custody_id(election_id, trustee_index);
        match self.custody.retrieve_secret(&id)? {
            Some(bytes) => Ok(Some(serde_cbor::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Hand a trustee their share, for them to present at decryption time
    pub fn release_share(&self, election_id: Uuid, trustee_index: u32) -> Result<TrusteeShare, Error> {
        self.reference(election_id, trustee_index)?
            .ok_or_else(|| ShareError::Invalid(trustee_index).into())
    }

    /// Check a presented share against its sealed reference and its own commitment
    pub fn verify_share(&self, election_id: Uuid, share: &TrusteeShare) -> Result<(), Error> {
        let invalid = || Error::from(ShareError::Invalid(share.trustee_index));

        let reference = self
            .reference(election_id, share.trustee_index)?
            .ok_or_else(invalid)?;
        let commitment = share_verification_key(share.trustee_index, &share.share_value);

        if commitment != share.verification_key
            || reference.verification_key != share.verification_key
            || reference.share_value != share.share_value
        {
            tracing::warn!(
                "share from trustee {} failed verification for election {}",
                share.trustee_index,
                election_id
            );
            return Err(invalid());
        }
        Ok(())
    }

    /// How many of the election's shares are currently held in custody
    pub fn available_shares(&self, election_id: Uuid, total_trustees: usize) -> Result<usize, Error> {
        let mut available = 0;
        for index in 1..=total_trustees as u32 {
            let id = TrusteeShare::custody_id(election_id, index);
            if self.custody.retrieve_secret(&id)?.is_some() {
                available += 1;
            }
        }
        Ok(available)
    }
}
