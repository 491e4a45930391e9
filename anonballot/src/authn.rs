//! RSA blind signatures.
//!
//! The requester blinds a message with a random factor r, the signer signs the
//! blinded value without learning the message, and the requester strips r off to
//! get an ordinary signature on the original message.

use crate::*;
use digest::Digest;
use num_bigint_dig::{BigUint, RandBigInt, RandPrime};
use num_integer::Integer;
use num_traits::One;
use rand::Rng;
use rsa::{RSAPrivateKey, RSAPublicKey};
use sha2::Sha256;
use uuid::Uuid;

pub const MIN_RSA_BITS: usize = 2048;
pub const PUBLIC_EXPONENT: u32 = 65537;

/// Draws of r before giving up on finding one coprime to n
pub const BLINDING_ATTEMPTS: u32 = 100;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlindPublicKey {
    #[serde(with = "crate::serde_hex::biguint_hex")]
    pub n: BigUint,

    #[serde(with = "crate::serde_hex::biguint_hex")]
    pub e: BigUint,
}

pub struct BlindSigningKey {
    public: BlindPublicKey,
    d: BigUint,
}

impl std::fmt::Debug for BlindSigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BlindSigningKey")
            .field("public", &self.public)
            .finish()
    }
}

impl BlindSigningKey {
    /// Generate a key with a modulus of `bits` bits
    pub fn generate<R: Rng + ?Sized>(rng: &mut R, bits: usize) -> Result<Self, Error> {
        let e = BigUint::from(PUBLIC_EXPONENT);
        loop {
            let p = rng.gen_prime(bits / 2);
            let q = rng.gen_prime(bits - bits / 2);
            if p == q {
                continue;
            }
            let phi = (&p - 1u32) * (&q - 1u32);
            if !e.gcd(&phi).is_one() {
                continue;
            }
            let d = match mod_inverse(&e, &phi) {
                Some(d) => d,
                None => continue,
            };
            let n = &p * &q;

            let rsa_key = RSAPrivateKey::from_components(n.clone(), e.clone(), d.clone(), vec![p, q]);
            rsa_key.validate()?;

            return Ok(BlindSigningKey {
                public: BlindPublicKey { n, e },
                d,
            });
        }
    }

    pub fn public_key(&self) -> &BlindPublicKey {
        &self.public
    }

    /// s' = m'^d mod n. The signer never sees the unblinded message.
    pub fn sign_blinded(&self, blinded: &BigUint) -> Result<BigUint, ProtocolViolation> {
        if blinded >= &self.public.n {
            return Err(ProtocolViolation::MessageOutOfRange);
        }
        Ok(blinded.modpow(&self.d, &self.public.n))
    }
}

impl BlindPublicKey {
    pub fn to_rsa(&self) -> Result<RSAPublicKey, Error> {
        Ok(RSAPublicKey::new(self.n.clone(), self.e.clone())?)
    }

    /// A blinding factor drawn uniformly from [2, n-1] with gcd(r, n) = 1
    pub fn random_blinding_factor<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
    ) -> Result<BigUint, ProtocolViolation> {
        let low = BigUint::from(2u32);
        for _ in 0..BLINDING_ATTEMPTS {
            let r = rng.gen_biguint_range(&low, &self.n);
            if r.gcd(&self.n).is_one() {
                return Ok(r);
            }
        }
        tracing::error!(
            "no invertible blinding factor after {} attempts, check the entropy source",
            BLINDING_ATTEMPTS
        );
        Err(ProtocolViolation::BlindingFactorExhausted(BLINDING_ATTEMPTS))
    }

    /// An unpredictable, session-specific message:
    /// SHA-256(nonce || election id || clock || session id) mod n
    pub fn create_message<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        election_id: Uuid,
        session_id: Uuid,
        clock_nanos: i64,
    ) -> BigUint {
        let nonce: [u8; 16] = rng.gen();
        let mut hasher = Sha256::new();
        hasher.update(&nonce);
        hasher.update(election_id.as_bytes());
        hasher.update(&clock_nanos.to_be_bytes());
        hasher.update(session_id.as_bytes());
        BigUint::from_bytes_be(&hasher.finalize()) % &self.n
    }

    /// m' = m * r^e mod n
    pub fn blind(&self, message: &BigUint, r: &BigUint) -> Result<BigUint, ProtocolViolation> {
        if message >= &self.n {
            return Err(ProtocolViolation::MessageOutOfRange);
        }
        if r >= &self.n || !r.gcd(&self.n).is_one() {
            return Err(ProtocolViolation::BlindingFactorNotInvertible);
        }
        Ok((message * r.modpow(&self.e, &self.n)) % &self.n)
    }

    /// s = s' * r^-1 mod n
    pub fn unblind(&self, blind_signature: &BigUint, r: &BigUint) -> Result<BigUint, ProtocolViolation> {
        if blind_signature >= &self.n {
            return Err(ProtocolViolation::MessageOutOfRange);
        }
        let r_inverse = mod_inverse(r, &self.n).ok_or(ProtocolViolation::BlindingFactorNotInvertible)?;
        Ok((blind_signature * r_inverse) % &self.n)
    }

    /// s^e mod n == m
    pub fn verify(&self, message: &BigUint, signature: &BigUint) -> bool {
        message < &self.n && signature < &self.n && signature.modpow(&self.e, &self.n) == *message
    }
}
