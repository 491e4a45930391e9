use crate::*;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use uuid::Uuid;

/// Paillier primes must be at least this large outside of tests
pub const MIN_PAILLIER_PRIME_BITS: usize = 1024;

/// How an election's tally key is held
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeyMode {
    /// One private key, sealed in custody
    SingleAuthority,

    /// λ split across trustees; it is never stored whole
    Threshold { trustees: usize, threshold: usize },
}

/// Public description of an election's tally key
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ElectionKeys {
    pub election_id: Uuid,
    pub public_key: PaillierPublicKey,
    pub mode: KeyMode,
    pub created_at: DateTime<Utc>,
}

impl ElectionKeys {
    pub fn threshold(&self) -> Option<(usize, usize)> {
        match self.mode {
            KeyMode::SingleAuthority => None,
            KeyMode::Threshold {
                trustees,
                threshold,
            } => Some((trustees, threshold)),
        }
    }
}

pub fn private_key_custody_id(election_id: Uuid) -> String {
    format!("paillier_private_{}", election_id)
}

/// Generate an election's key and put the secret half into custody.
pub fn generate_election_keys<R: Rng + ?Sized>(
    rng: &mut R,
    custody: &Arc<dyn KeyCustody>,
    election_id: Uuid,
    mode: KeyMode,
    prime_bits: usize,
) -> Result<ElectionKeys, Error> {
    if let KeyMode::Threshold {
        trustees,
        threshold,
    } = mode
    {
        if threshold == 0 || threshold > trustees {
            return Err(ShareError::InvalidParameters {
                threshold,
                trustees,
            }
            .into());
        }
    }

    let private_key = generate_paillier_keypair(rng, prime_bits)?;

    match mode {
        KeyMode::SingleAuthority => {
            let sealed = serde_cbor::to_vec(&private_key)?;
            custody.store_secret(&private_key_custody_id(election_id), &sealed)?;
        }
        KeyMode::Threshold {
            trustees,
            threshold,
        } => {
            let shares: Vec<TrusteeShare> =
                deal_secret_shares(rng, threshold, trustees, &private_key.lambda)?
                    .into_iter()
                    .map(TrusteeShare::new)
                    .collect();
            ShareCustodian::new(custody.clone()).store_shares(election_id, &shares)?;
        }
    }

    tracing::info!(
        "generated {}-bit tally key for election {} ({:?})",
        private_key.public.n.bits(),
        election_id,
        mode
    );

    Ok(ElectionKeys {
        election_id,
        public_key: private_key.public.clone(),
        mode,
        created_at: Utc::now(),
    })
}

pub fn load_private_key(custody: &dyn KeyCustody, election_id: Uuid) -> Result<PaillierPrivateKey, Error> {
    let sealed = custody
        .retrieve_secret(&private_key_custody_id(election_id))?
        .ok_or(StateError::KeysNotConfigured(election_id))?;
    Ok(serde_cbor::from_slice(&sealed)?)
}
