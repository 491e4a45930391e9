//! Shamir secret sharing over a prime field.

use crate::*;
use num_bigint_dig::{BigUint, RandBigInt};
use num_traits::{One, Zero};
use rand::Rng;
use std::collections::HashSet;

/// Exponent of the Mersenne prime 2^4253 - 1 that defines the sharing field.
/// It comfortably exceeds any λ derived from two 2048-bit primes.
const FIELD_PRIME_EXPONENT: usize = 4253;

pub fn field_prime() -> BigUint {
    (BigUint::one() << FIELD_PRIME_EXPONENT) - 1u32
}

/// One point (x, f(x)) on the sharing polynomial
#[derive(Clone, PartialEq, Eq)]
pub struct SecretShare {
    pub x: u32,
    pub y: BigUint,
}

impl std::fmt::Debug for SecretShare {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SecretShare").field("x", &self.x).finish()
    }
}

/// Split `secret` into `num_trustees` shares, any `threshold` of which recover it.
/// Shares are numbered from 1.
pub fn deal_secret_shares<R: Rng + ?Sized>(
    rng: &mut R,
    threshold: usize,
    num_trustees: usize,
    secret: &BigUint,
) -> Result<Vec<SecretShare>, ShareError> {
    if threshold == 0 || threshold > num_trustees || num_trustees > u32::MAX as usize {
        return Err(ShareError::InvalidParameters {
            threshold,
            trustees: num_trustees,
        });
    }
    let prime = field_prime();
    if secret >= &prime {
        return Err(ShareError::SecretTooLarge);
    }

    let mut coefficients = Vec::with_capacity(threshold);
    coefficients.push(secret.clone());
    for _ in 1..threshold {
        coefficients.push(rng.gen_biguint_below(&prime));
    }

    let shares = (1..=num_trustees as u32)
        .map(|x| {
            let x_big = BigUint::from(x);
            // Horner's rule, highest coefficient first
            let y = coefficients
                .iter()
                .rev()
                .fold(BigUint::zero(), |acc, a| (acc * &x_big + a) % &prime);
            SecretShare { x, y }
        })
        .collect();

    Ok(shares)
}

/// Recover the secret by Lagrange interpolation at zero, using exactly the given shares.
pub fn recover_secret(threshold: usize, shares: &[SecretShare]) -> Result<BigUint, ShareError> {
    if shares.len() < threshold || shares.is_empty() {
        return Err(ShareError::Insufficient {
            required: threshold.max(1),
            provided: shares.len(),
        });
    }

    let mut seen = HashSet::new();
    for share in shares {
        if share.x == 0 {
            return Err(ShareError::Invalid(share.x));
        }
        if !seen.insert(share.x) {
            return Err(ShareError::DuplicateIndex(share.x));
        }
    }

    let prime = field_prime();
    let mut secret = BigUint::zero();
    for share in shares {
        let x_i = BigUint::from(share.x);
        let mut numerator = BigUint::one();
        let mut denominator = BigUint::one();
        for other in shares.iter().filter(|s| s.x != share.x) {
            let x_j = BigUint::from(other.x);
            numerator = (numerator * &x_j) % &prime;
            denominator = (denominator * ((&prime + &x_j - &x_i) % &prime)) % &prime;
        }
        let inverse = mod_inverse(&denominator, &prime).ok_or(ShareError::Invalid(share.x))?;
        let basis = (numerator * inverse) % &prime;
        secret = (secret + (&share.y % &prime) * basis) % &prime;
    }

    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn test_deal_and_recover() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let secret = BigUint::from(123_456_789_u64) << 1000;
        let shares = deal_secret_shares(&mut rng, 3, 5, &secret).unwrap();
        assert_eq!(shares.len(), 5);
        assert_eq!(shares[0].x, 1);

        assert_eq!(recover_secret(3, &shares[..3]).unwrap(), secret);
        assert_eq!(recover_secret(3, &shares[2..]).unwrap(), secret);
        assert_eq!(recover_secret(3, &shares).unwrap(), secret);

        // Two points of a degree-2 polynomial say nothing useful
        assert_eq!(
            recover_secret(3, &shares[..2]),
            Err(ShareError::Insufficient {
                required: 3,
                provided: 2
            })
        );
        assert_ne!(recover_secret(2, &shares[..2]).unwrap(), secret);
    }

    #[test]
    fn test_bad_parameters() {
        let mut rng = ChaCha20Rng::seed_from_u64(8);
        let secret = BigUint::from(5u32);
        assert!(deal_secret_shares(&mut rng, 0, 5, &secret).is_err());
        assert!(deal_secret_shares(&mut rng, 6, 5, &secret).is_err());
        assert_eq!(
            deal_secret_shares(&mut rng, 2, 3, &field_prime()),
            Err(ShareError::SecretTooLarge)
        );

        let shares = deal_secret_shares(&mut rng, 2, 3, &secret).unwrap();
        let duplicated = vec![shares[0].clone(), shares[0].clone()];
        assert_eq!(
            recover_secret(2, &duplicated),
            Err(ShareError::DuplicateIndex(1))
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn any_threshold_subset_recovers(
            threshold in 1usize..6,
            extra in 0usize..4,
            seed in any::<u64>(),
            picks in prop::collection::vec(any::<prop::sample::Index>(), 2),
        ) {
            let trustees = threshold + extra;
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            let secret = rng.gen_biguint(2048);
            let shares = deal_secret_shares(&mut rng, threshold, trustees, &secret).unwrap();

            // Two rotations of the share list give two (usually different) k-subsets
            for pick in &picks {
                let start = pick.index(trustees);
                let subset: Vec<SecretShare> = (0..threshold)
                    .map(|i| shares[(start + i) % trustees].clone())
                    .collect();
                prop_assert_eq!(recover_secret(threshold, &subset).unwrap(), secret.clone());
            }
        }
    }
}
