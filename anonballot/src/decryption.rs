use crate::*;
use num_bigint_dig::BigUint;
use std::collections::HashSet;
use uuid::Uuid;

/// Threshold decryption of an election's ciphertexts from trustee shares.
pub struct ThresholdDecryptor<'a> {
    pub election_id: Uuid,
    pub public_key: &'a PaillierPublicKey,
    pub threshold: usize,
    pub custodian: &'a ShareCustodian,
}

impl<'a> ThresholdDecryptor<'a> {
    /// Check the presented shares and rebuild λ from exactly those shares.
    ///
    /// Fails with `ShareError::Insufficient` below the threshold and with
    /// `ShareError::Invalid` naming the first trustee whose share does not match
    /// its sealed reference.
    pub fn reconstruct_lambda(&self, shares: &[TrusteeShare]) -> Result<BigUint, Error> {
        if shares.len() < self.threshold {
            return Err(ShareError::Insufficient {
                required: self.threshold,
                provided: shares.len(),
            }
            .into());
        }

        let mut seen = HashSet::new();
        for share in shares {
            if !seen.insert(share.trustee_index) {
                return Err(ShareError::DuplicateIndex(share.trustee_index).into());
            }
            self.custodian.verify_share(self.election_id, share)?;
        }

        let points: Vec<SecretShare> = shares.iter().map(TrusteeShare::secret_share).collect();
        Ok(recover_secret(self.threshold, &points)?)
    }

    pub fn decrypt(&self, ciphertext: &Ciphertext, shares: &[TrusteeShare]) -> Result<BigUint, Error> {
        let lambda = self.reconstruct_lambda(shares)?;
        self.public_key.decrypt_with_lambda(&lambda, ciphertext)
    }

    /// Decrypt several ciphertexts with a single reconstruction
    pub fn decrypt_all(
        &self,
        ciphertexts: &[&Ciphertext],
        shares: &[TrusteeShare],
    ) -> Result<Vec<BigUint>, Error> {
        let lambda = self.reconstruct_lambda(shares)?;
        ciphertexts
            .iter()
            .map(|c| self.public_key.decrypt_with_lambda(&lambda, c))
            .collect()
    }
}
