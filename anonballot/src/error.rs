use thiserror::Error;
use uuid::Uuid;

/// Error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("anonballot: protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("anonballot: invalid session: {0}")]
    Session(#[from] SessionError),

    #[error("anonballot: credential rejected: {0}")]
    Credential(#[from] CredentialError),

    #[error("anonballot: share error: {0}")]
    Share(#[from] ShareError),

    #[error("anonballot: chain integrity error: {0}")]
    ChainIntegrity(#[from] ChainIntegrityError),

    #[error("anonballot: store error: {0}")]
    Store(#[from] StoreError),

    #[error("anonballot: state error: {0}")]
    State(#[from] StateError),

    #[error("anonballot: key custody error: {0}")]
    Custody(#[from] CustodyError),

    #[error("anonballot: RSA error: {0}")]
    RSAError(#[from] rsa::errors::Error),

    #[error("anonballot: CBOR error serializing record payload: {0}")]
    CBORSerialization(#[from] serde_cbor::Error),
}

/// Coarse classification of an error, stable enough to log and match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ProtocolViolation,
    InvalidSession,
    CredentialRejected,
    ShareError,
    ChainIntegrity,
    LockContention,
    Storage,
    State,
    Custody,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ProtocolViolation => "protocol_violation",
            ErrorKind::InvalidSession => "invalid_session",
            ErrorKind::CredentialRejected => "credential_rejected",
            ErrorKind::ShareError => "share_error",
            ErrorKind::ChainIntegrity => "chain_integrity",
            ErrorKind::LockContention => "lock_contention",
            ErrorKind::Storage => "storage",
            ErrorKind::State => "state",
            ErrorKind::Custody => "custody",
            ErrorKind::Internal => "internal",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Protocol(_) => ErrorKind::ProtocolViolation,
            Error::Session(_) => ErrorKind::InvalidSession,
            Error::Credential(_) => ErrorKind::CredentialRejected,
            Error::Share(_) => ErrorKind::ShareError,
            Error::ChainIntegrity(_) => ErrorKind::ChainIntegrity,
            Error::Store(StoreError::LockContention) => ErrorKind::LockContention,
            Error::Store(_) => ErrorKind::Storage,
            Error::State(_) => ErrorKind::State,
            Error::Custody(_) => ErrorKind::Custody,
            Error::RSAError(_) | Error::CBORSerialization(_) => ErrorKind::Internal,
        }
    }

    /// The credential rejection reason, if this is a credential rejection.
    pub fn rejection(&self) -> Option<&CredentialError> {
        match self {
            Error::Credential(e) => Some(e),
            _ => None,
        }
    }
}

/// Violations of the cryptographic protocol
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("message is not less than the modulus")]
    MessageOutOfRange,

    #[error("blinding factor is not invertible modulo n")]
    BlindingFactorNotInvertible,

    #[error("could not draw an invertible blinding factor in {0} attempts")]
    BlindingFactorExhausted(u32),

    #[error("unblinded signature does not verify against the message")]
    InvalidSignature,

    #[error("plaintext is not less than the Paillier modulus")]
    PlaintextOutOfRange,

    #[error("ciphertext is not a unit modulo n^2")]
    CiphertextOutOfRange,

    #[error("value has no inverse modulo n")]
    NotInvertible,

    #[error("clock reading {0} is outside the nanosecond timestamp range")]
    TimestampOutOfRange(String),
}

/// A blind-signing session could not be used
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(Uuid),

    #[error("session {0} has expired")]
    Expired(Uuid),

    #[error("session {0} has already been used")]
    AlreadyUsed(Uuid),

    #[error("session {0} has not produced a blinded signature")]
    NotSigned(Uuid),

    #[error("session {0} belongs to a different election")]
    ElectionMismatch(Uuid),
}

/// Reasons a credential may be refused
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CredentialError {
    #[error("credential not found")]
    NotFound,

    #[error("credential is inactive")]
    Inactive,

    #[error("credential has already been spent")]
    AlreadySpent,

    #[error("credential has expired")]
    Expired,

    #[error("a credential was already issued for session {0} in election {1}")]
    Duplicate(Uuid, Uuid),

    #[error("timed out waiting for the credential lock")]
    LockTimeout,
}

impl CredentialError {
    /// Audit event type recorded when a consumption attempt is refused for this reason.
    pub fn audit_event(&self) -> &'static str {
        match self {
            CredentialError::NotFound => "TOKEN_NOT_FOUND",
            CredentialError::Inactive => "TOKEN_INACTIVE",
            CredentialError::AlreadySpent => "TOKEN_ALREADY_SPENT",
            CredentialError::Expired => "TOKEN_EXPIRED",
            CredentialError::Duplicate(_, _) => "TOKEN_DUPLICATE",
            CredentialError::LockTimeout => "TOKEN_LOCK_TIMEOUT",
        }
    }
}

/// Threshold key share errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShareError {
    #[error("insufficient shares: {required} required, {provided} provided")]
    Insufficient { required: usize, provided: usize },

    #[error("share from trustee {0} failed verification")]
    Invalid(u32),

    #[error("share index {0} supplied more than once")]
    DuplicateIndex(u32),

    #[error("threshold {threshold} is invalid for {trustees} trustees")]
    InvalidParameters { threshold: usize, trustees: usize },

    #[error("secret does not fit in the sharing field")]
    SecretTooLarge,
}

/// The public record failed verification
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainIntegrityError {
    #[error("entry {0} does not link to its predecessor")]
    BrokenLink(u64),

    #[error("entry {0} hash does not match its contents")]
    HashMismatch(u64),

    #[error("entry {0} custody signature is invalid")]
    InvalidSignature(u64),

    #[error("entry {0} not found")]
    EntryNotFound(String),

    #[error("sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    #[error("entry {0} is not yet covered by a Merkle root")]
    PendingBatch(String),
}

impl ChainIntegrityError {
    /// Sequence number of the first offending entry, where known
    pub fn sequence(&self) -> Option<u64> {
        match self {
            ChainIntegrityError::BrokenLink(s)
            | ChainIntegrityError::HashMismatch(s)
            | ChainIntegrityError::InvalidSignature(s) => Some(*s),
            ChainIntegrityError::SequenceGap { expected, .. } => Some(*expected),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store lock is held by another writer")]
    LockContention,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The election is not in a state that permits the operation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("election {0} not found")]
    UnknownElection(Uuid),

    #[error("election {0} is not open")]
    ElectionNotOpen(Uuid),

    #[error("election {0} is not closed")]
    ElectionNotClosed(Uuid),

    #[error("candidate {0} is not on the ballot")]
    UnknownCandidate(String),

    #[error("no tally keys configured for election {0}")]
    KeysNotConfigured(Uuid),

    #[error("tally keys already configured for election {0}")]
    KeysAlreadyConfigured(Uuid),

    #[error("election {0} uses threshold keys and must be decrypted by trustees")]
    ThresholdRequired(Uuid),

    #[error("election {0} has a single-authority key and no trustee shares")]
    NotThreshold(Uuid),

    #[error("election {0} has been tallied and its totals are frozen")]
    TallyStarted(Uuid),
}

/// Key custody failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CustodyError {
    #[error("key {0} not found")]
    KeyNotFound(String),

    #[error("sealing secret {0} failed")]
    Sealing(String),

    #[error("signing device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("unknown custody provider {0}")]
    UnknownProvider(String),
}
