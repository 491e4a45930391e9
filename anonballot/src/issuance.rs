use crate::*;
use chrono::Duration;
use num_bigint_dig::BigUint;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct IssuanceSettings {
    pub session_ttl: Duration,
    pub credential_ttl: Duration,
}

impl Default for IssuanceSettings {
    fn default() -> Self {
        IssuanceSettings {
            session_ttl: Duration::minutes(30),
            credential_ttl: Duration::days(7),
        }
    }
}

/// Issues anonymous credentials through the blind signature protocol.
///
/// Identity checks happen upstream and never reach this type: a session is tied
/// to an election and nothing else.
pub struct CredentialIssuer {
    key: BlindSigningKey,
    sessions: Arc<dyn SessionStore>,
    credentials: Arc<dyn CredentialStore>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    settings: IssuanceSettings,
}

impl CredentialIssuer {
    pub fn new(
        key: BlindSigningKey,
        sessions: Arc<dyn SessionStore>,
        credentials: Arc<dyn CredentialStore>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
        settings: IssuanceSettings,
    ) -> Self {
        CredentialIssuer {
            key,
            sessions,
            credentials,
            audit,
            clock,
            settings,
        }
    }

    pub fn public_key(&self) -> &BlindPublicKey {
        self.key.public_key()
    }

    /// Open a signing session and hand back its blinding factor
    pub fn start_session(&self, election_id: Uuid) -> Result<(Uuid, BigUint), Error> {
        let mut rng = rand::rngs::OsRng {};
        let blinding_factor = self.public_key().random_blinding_factor(&mut rng)?;
        let now = self.clock.now();

        let session = BlindSignSession {
            session_id: Uuid::new_v4(),
            election_id,
            blinding_factor: blinding_factor.clone(),
            created_at: now,
            expires_at: now + self.settings.session_ttl,
            used: false,
            blinded_signature: None,
        };
        let session_id = session.session_id;
        self.sessions.insert(session)?;

        tracing::debug!("started blind signing session for election {}", election_id);
        Ok((session_id, blinding_factor))
    }

    pub fn create_message(&self, election_id: Uuid, session_id: Uuid) -> Result<BigUint, Error> {
        let mut rng = rand::rngs::OsRng {};
        let now = self.clock.now();
        let nanos = now
            .timestamp_nanos_opt()
            .ok_or_else(|| ProtocolViolation::TimestampOutOfRange(now.to_rfc3339()))?;
        Ok(self
            .public_key()
            .create_message(&mut rng, election_id, session_id, nanos))
    }

    /// Sign a blinded message for a session. A session is signed at most once:
    /// marking it used and keeping the signature happen in one store update.
    pub fn sign_blinded(&self, session_id: Uuid, blinded: &BigUint) -> Result<BigUint, Error> {
        let blind_signature = self.key.sign_blinded(blinded)?;
        let now = self.clock.now();

        self.sessions.update(session_id, &mut |session| {
            if session.used {
                return Err(SessionError::AlreadyUsed(session_id));
            }
            if session.is_expired(now) {
                return Err(SessionError::Expired(session_id));
            }
            session.used = true;
            session.blinded_signature = Some(blind_signature.clone());
            Ok(())
        })?;

        // Only the fact that a session was signed is recorded, never the message
        tracing::info!("blind signature issued for a session");
        Ok(blind_signature)
    }

    /// Store the unblinded credential. The signature must verify, and the session
    /// must belong to the election and have been signed.
    pub fn issue_credential(
        &self,
        session_id: Uuid,
        election_id: Uuid,
        message: &BigUint,
        signature: &BigUint,
    ) -> Result<AnonymousCredential, Error> {
        let session = self
            .sessions
            .get(session_id)?
            .ok_or(SessionError::NotFound(session_id))?;
        if session.election_id != election_id {
            return Err(SessionError::ElectionMismatch(session_id).into());
        }
        if !session.used || session.blinded_signature.is_none() {
            return Err(SessionError::NotSigned(session_id).into());
        }
        if !self.public_key().verify(message, signature) {
            return Err(ProtocolViolation::InvalidSignature.into());
        }

        let now = self.clock.now();
        let credential = AnonymousCredential {
            token_id: AnonymousCredential::new_token_id(),
            election_id,
            session_id,
            blinding_factor_hash: sha256_hex(&session.blinding_factor.to_bytes_be()),
            message: message.clone(),
            blind_signature: signature.clone(),
            issued_at: now,
            expires_at: now + self.settings.credential_ttl,
            spent: false,
            active: true,
            spent_at: None,
        };
        self.credentials.insert(credential.clone())?;

        // The credential is live once stored. A failed append is logged by the
        // audit log and does not undo the issuance.
        let _ = self.audit.record(
            AuditEvent::new(ANONYMOUS_TOKEN_ISSUED, "CredentialIssuer", "issue_credential")
                .with("election_id", election_id.to_string()),
        );
        tracing::info!(
            "issued credential {} for election {}",
            mask_token(&credential.token_id),
            election_id
        );
        Ok(credential)
    }

    /// Run the whole protocol in process: session, message, blind, sign,
    /// unblind, verify and store.
    pub fn issue(&self, election_id: Uuid) -> Result<AnonymousCredential, Error> {
        let (session_id, r) = self.start_session(election_id)?;
        let message = self.create_message(election_id, session_id)?;
        let blinded = self.public_key().blind(&message, &r)?;
        let blind_signature = self.sign_blinded(session_id, &blinded)?;
        let signature = self.public_key().unblind(&blind_signature, &r)?;
        self.issue_credential(session_id, election_id, &message, &signature)
    }

    /// Drop sessions past their expiry
    pub fn expire_sessions(&self) -> Result<usize, Error> {
        let removed = self.sessions.remove_expired(self.clock.now())?;
        if removed > 0 {
            tracing::info!("removed {} expired signing sessions", removed);
        }
        Ok(removed)
    }
}
