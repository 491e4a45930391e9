use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::Keypair;
use num_bigint_dig::{BigInt, BigUint, ModInverse, Sign};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

pub fn generate_keypair() -> Keypair {
    let mut csprng = rand::rngs::OsRng {};
    Keypair::generate(&mut csprng)
}

/// Lowercase hex SHA-256 of the input
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Mask a credential token for logging: first four and last four characters only.
pub fn mask_token(token: &str) -> String {
    if token.len() < 8 || !token.is_ascii() {
        return "***".to_owned();
    }
    format!("{}***{}", &token[..4], &token[token.len() - 4..])
}

/// Inverse of `a` modulo `m`, normalized into `[0, m)`
pub fn mod_inverse(a: &BigUint, m: &BigUint) -> Option<BigUint> {
    let inverse: BigInt = a.clone().mod_inverse(m)?;
    let modulus = BigInt::from_biguint(Sign::Plus, m.clone());
    let normalized = ((inverse % &modulus) + &modulus) % &modulus;
    normalized.to_biguint()
}

/// Source of wall-clock time. Services take a clock so expiry can be driven in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualClock {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = *now + by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        ManualClock::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
