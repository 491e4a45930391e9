use anonballot::*;
use std::env::var;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("anonballotd: {0} is not a valid value for {1}")]
    Invalid(String, &'static str),

    #[error("anonballotd: {name} must be at least {min}, got {value}")]
    TooSmall {
        name: &'static str,
        value: usize,
        min: usize,
    },

    #[error("anonballotd: threshold {threshold} exceeds {trustees} trustees")]
    ThresholdExceedsTrustees { threshold: usize, trustees: usize },

    #[error("anonballotd: {0}")]
    Custody(#[from] CustodyError),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub issuance: IssuanceSettings,
    pub guard: GuardSettings,
    pub record: RecordSettings,
    pub tally: TallySettings,
    pub rsa_bits: usize,
    pub sweep_interval: Duration,
    pub trustees: usize,
    pub threshold: usize,
    pub custody: CustodyProvider,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| var(name).ok())
    }

    /// Build a config from any variable source. Unset variables take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |name: &'static str, default: u64| -> Result<u64, ConfigError> {
            match lookup(name) {
                Some(val) => match val.trim().parse() {
                    Ok(parsed) => Ok(parsed),
                    Err(_) => Err(ConfigError::Invalid(val, name)),
                },
                None => Ok(default),
            }
        };
        let at_least = |name: &'static str, value: u64, min: usize| -> Result<usize, ConfigError> {
            let value = value as usize;
            if value < min {
                return Err(ConfigError::TooSmall { name, value, min });
            }
            Ok(value)
        };

        let session_ttl = at_least(
            "ANONBALLOT_SESSION_TTL_SECS",
            number("ANONBALLOT_SESSION_TTL_SECS", 1800)?,
            1,
        )?;
        let credential_ttl = at_least(
            "ANONBALLOT_CREDENTIAL_TTL_SECS",
            number("ANONBALLOT_CREDENTIAL_TTL_SECS", 7 * 24 * 3600)?,
            1,
        )?;
        let issuance = IssuanceSettings {
            session_ttl: chrono::Duration::seconds(session_ttl as i64),
            credential_ttl: chrono::Duration::seconds(credential_ttl as i64),
        };

        let guard = GuardSettings {
            lock_timeout: Duration::from_millis(number("ANONBALLOT_LOCK_TIMEOUT_MS", 2000)?),
            store_lock_attempts: at_least(
                "ANONBALLOT_STORE_LOCK_ATTEMPTS",
                number("ANONBALLOT_STORE_LOCK_ATTEMPTS", 3)?,
                1,
            )? as u32,
            store_lock_backoff: Duration::from_millis(number(
                "ANONBALLOT_STORE_LOCK_BACKOFF_MS",
                100,
            )?),
        };

        let record = RecordSettings {
            batch_size: at_least(
                "ANONBALLOT_MERKLE_BATCH_SIZE",
                number("ANONBALLOT_MERKLE_BATCH_SIZE", DEFAULT_MERKLE_BATCH_SIZE as u64)?,
                1,
            )?,
        };

        let tally = TallySettings {
            prime_bits: at_least(
                "ANONBALLOT_PAILLIER_PRIME_BITS",
                number("ANONBALLOT_PAILLIER_PRIME_BITS", MIN_PAILLIER_PRIME_BITS as u64)?,
                MIN_PAILLIER_PRIME_BITS,
            )?,
        };

        let rsa_bits = at_least(
            "ANONBALLOT_RSA_BITS",
            number("ANONBALLOT_RSA_BITS", MIN_RSA_BITS as u64)?,
            MIN_RSA_BITS,
        )?;

        let sweep_interval = Duration::from_secs(at_least(
            "ANONBALLOT_SWEEP_INTERVAL_SECS",
            number("ANONBALLOT_SWEEP_INTERVAL_SECS", 3600)?,
            1,
        )? as u64);

        let trustees = number("ANONBALLOT_TRUSTEES", 5)? as usize;
        let threshold = at_least("ANONBALLOT_THRESHOLD", number("ANONBALLOT_THRESHOLD", 3)?, 1)?;
        if threshold > trustees {
            return Err(ConfigError::ThresholdExceedsTrustees { threshold, trustees });
        }

        let custody = match lookup("ANONBALLOT_CUSTODY") {
            Some(name) => CustodyProvider::from_name(&name)?,
            None => CustodyProvider::Software,
        };

        Ok(Config {
            issuance,
            guard,
            record,
            tally,
            rsa_bits,
            sweep_interval,
            trustees,
            threshold,
            custody,
        })
    }

    /// Key mode for elections set up by this daemon
    pub fn key_mode(&self) -> KeyMode {
        if self.trustees > 1 {
            KeyMode::Threshold {
                trustees: self.trustees,
                threshold: self.threshold,
            }
        } else {
            KeyMode::SingleAuthority
        }
    }
}
