//! Paillier encryption with g = n + 1.
//!
//! `Encrypt(a) * Encrypt(b) = Encrypt(a + b)`, which is all the tally needs.

use crate::*;
use num_bigint_dig::{BigUint, RandBigInt, RandPrime};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::Rng;

const RANDOMNESS_ATTEMPTS: u32 = 100;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PaillierPublicKey {
    #[serde(with = "crate::serde_hex::biguint_hex")]
    pub n: BigUint,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PaillierPrivateKey {
    pub public: PaillierPublicKey,

    #[serde(with = "crate::serde_hex::biguint_hex")]
    pub lambda: BigUint,

    #[serde(with = "crate::serde_hex::biguint_hex")]
    pub mu: BigUint,
}

// λ and μ stay out of debug output
impl std::fmt::Debug for PaillierPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PaillierPrivateKey")
            .field("public", &self.public)
            .finish()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Ciphertext(#[serde(with = "crate::serde_hex::biguint_hex")] pub BigUint);

impl Ciphertext {
    /// Lowercase hex SHA-256 of the big-endian ciphertext bytes
    pub fn hash_hex(&self) -> String {
        sha256_hex(&self.0.to_bytes_be())
    }
}

/// Generate a key pair from two distinct primes of `prime_bits` bits each
pub fn generate_paillier_keypair<R: Rng + ?Sized>(
    rng: &mut R,
    prime_bits: usize,
) -> Result<PaillierPrivateKey, Error> {
    loop {
        let p = rng.gen_prime(prime_bits);
        let q = rng.gen_prime(prime_bits);
        if p == q {
            continue;
        }
        let n = &p * &q;
        let phi = (&p - 1u32) * (&q - 1u32);
        if !n.gcd(&phi).is_one() {
            continue;
        }
        let lambda = (&p - 1u32).lcm(&(&q - 1u32));
        let public = PaillierPublicKey { n };
        return PaillierPrivateKey::from_lambda(public, lambda);
    }
}

impl PaillierPublicKey {
    pub fn n_squared(&self) -> BigUint {
        &self.n * &self.n
    }

    pub fn encrypt<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        plaintext: &BigUint,
    ) -> Result<Ciphertext, Error> {
        if plaintext >= &self.n {
            return Err(ProtocolViolation::PlaintextOutOfRange.into());
        }
        let r = self.random_unit(rng)?;
        let n_squared = self.n_squared();
        let g = &self.n + 1u32;
        let c = (g.modpow(plaintext, &n_squared) * r.modpow(&self.n, &n_squared)) % &n_squared;
        Ok(Ciphertext(c))
    }

    pub fn encrypt_u64<R: Rng + ?Sized>(&self, rng: &mut R, plaintext: u64) -> Result<Ciphertext, Error> {
        self.encrypt(rng, &BigUint::from(plaintext))
    }

    /// Homomorphic addition of the two plaintexts
    pub fn add(&self, a: &Ciphertext, b: &Ciphertext) -> Ciphertext {
        Ciphertext((&a.0 * &b.0) % self.n_squared())
    }

    /// A ciphertext must be a unit modulo n²: non-zero, below n² and coprime to n.
    pub fn validate(&self, ciphertext: &Ciphertext) -> Result<(), ProtocolViolation> {
        let c = &ciphertext.0;
        if c.is_zero() || c >= &self.n_squared() || !c.gcd(&self.n).is_one() {
            return Err(ProtocolViolation::CiphertextOutOfRange);
        }
        Ok(())
    }

    /// Decrypt with a λ supplied from outside, such as one reconstructed from shares
    pub fn decrypt_with_lambda(
        &self,
        lambda: &BigUint,
        ciphertext: &Ciphertext,
    ) -> Result<BigUint, Error> {
        let mu = mod_inverse(&(lambda % &self.n), &self.n).ok_or(ProtocolViolation::NotInvertible)?;
        Ok(self.decrypt_raw(lambda, &mu, ciphertext))
    }

    fn decrypt_raw(&self, lambda: &BigUint, mu: &BigUint, ciphertext: &Ciphertext) -> BigUint {
        let u = ciphertext.0.modpow(lambda, &self.n_squared());
        (self.l(&u) * mu) % &self.n
    }

    fn l(&self, u: &BigUint) -> BigUint {
        (u - 1u32) / &self.n
    }

    fn random_unit<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<BigUint, Error> {
        let one = BigUint::one();
        for _ in 0..RANDOMNESS_ATTEMPTS {
            let r = rng.gen_biguint_range(&one, &self.n);
            if r.gcd(&self.n).is_one() {
                return Ok(r);
            }
        }
        Err(ProtocolViolation::BlindingFactorExhausted(RANDOMNESS_ATTEMPTS).into())
    }
}

impl PaillierPrivateKey {
    pub fn from_lambda(public: PaillierPublicKey, lambda: BigUint) -> Result<Self, Error> {
        let mu = mod_inverse(&(&lambda % &public.n), &public.n).ok_or(ProtocolViolation::NotInvertible)?;
        Ok(PaillierPrivateKey { public, lambda, mu })
    }

    pub fn decrypt(&self, ciphertext: &Ciphertext) -> BigUint {
        self.public.decrypt_raw(&self.lambda, &self.mu, ciphertext)
    }
}
