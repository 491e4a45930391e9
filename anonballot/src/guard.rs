//! Single-use enforcement for anonymous credentials.

use crate::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct GuardSettings {
    /// Longest wait for the per-token lock, and for each storage lock attempt
    pub lock_timeout: Duration,
    pub store_lock_attempts: u32,
    pub store_lock_backoff: Duration,
}

impl Default for GuardSettings {
    fn default() -> Self {
        GuardSettings {
            lock_timeout: Duration::from_secs(2),
            store_lock_attempts: 3,
            store_lock_backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TokenStatistics {
    pub total: usize,
    pub spent: usize,
    pub available: usize,
    pub utilization: f64,
}

/// Guards credential consumption so each credential is accepted at most once.
///
/// Two locks are taken in turn: a process-local mutex per token, which only
/// keeps concurrent requests in this process from queueing on storage, and the
/// store's exclusive row lock, which is what actually serializes spends across
/// processes.
pub struct ConsumptionGuard {
    store: Arc<dyn CredentialStore>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    settings: GuardSettings,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConsumptionGuard {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
        settings: GuardSettings,
    ) -> Self {
        ConsumptionGuard {
            store,
            audit,
            clock,
            settings,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn token_lock(&self, token: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(token.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the token's lock entry unless another caller holds or waits on it.
    /// Clones are only taken under the map lock, so the count cannot grow here.
    fn release_lock(&self, token: &str, token_lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock();
        let idle = match locks.get(token) {
            Some(entry) => Arc::ptr_eq(entry, &token_lock) && Arc::strong_count(&token_lock) == 2,
            None => false,
        };
        if idle {
            locks.remove(token);
        }
    }

    fn forget_lock(&self, token: &str) {
        self.locks.lock().remove(token);
    }

    // Audit failures are logged by the audit log itself and never change the
    // outcome: the credential row is the record of truth for spends.
    fn audit(&self, event: AuditEvent) {
        let _ = self.audit.record(event);
    }

    fn token_event(
        &self,
        event_type: &str,
        operation: &str,
        token: &str,
        election_id: Uuid,
    ) -> AuditEvent {
        AuditEvent::new(event_type, "ConsumptionGuard", operation)
            .with("token", mask_token(token))
            .with("election_id", election_id.to_string())
    }

    /// Run one exclusive update, retrying while the storage lock is contended
    fn update_with_retry(
        &self,
        token: &str,
        apply: &mut dyn FnMut(&mut AnonymousCredential) -> Result<(), CredentialError>,
    ) -> Result<AnonymousCredential, Error> {
        let attempts = self.settings.store_lock_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .store
                .update_exclusive(token, self.settings.lock_timeout, apply)
            {
                Err(Error::Store(StoreError::LockContention)) if attempt < attempts => {
                    tracing::warn!(
                        "storage lock contended for {} (attempt {} of {})",
                        mask_token(token),
                        attempt,
                        attempts
                    );
                    std::thread::sleep(self.settings.store_lock_backoff);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Spend a credential. Succeeds at most once per credential, however many
    /// callers race for it.
    ///
    /// Rejections come back as `Error::Credential` with the first failing check,
    /// in order: not found (including a credential for another election),
    /// inactive, already spent, expired.
    pub fn consume(&self, token: &str, election_id: Uuid, context: &str) -> Result<(), Error> {
        let token_lock = self.token_lock(token);
        let result = self.consume_locked(&token_lock, token, election_id, context);
        self.release_lock(token, token_lock);
        result
    }

    fn consume_locked(
        &self,
        token_lock: &Mutex<()>,
        token: &str,
        election_id: Uuid,
        context: &str,
    ) -> Result<(), Error> {
        let _held = match token_lock.try_lock_for(self.settings.lock_timeout) {
            Some(guard) => guard,
            None => {
                tracing::warn!("timed out waiting for token lock on {}", mask_token(token));
                let event = CredentialError::LockTimeout.audit_event();
                self.audit(
                    self.token_event(event, "consume", token, election_id)
                        .with("context", context),
                );
                return Err(CredentialError::LockTimeout.into());
            }
        };

        let now = self.clock.now();
        let result = self.update_with_retry(token, &mut |credential| {
            if credential.election_id != election_id {
                return Err(CredentialError::NotFound);
            }
            credential.check(now)?;
            credential.spent = true;
            credential.spent_at = Some(now);
            Ok(())
        });

        match result {
            Ok(_) => {
                tracing::info!("credential {} consumed", mask_token(token));
                self.audit(
                    self.token_event(TOKEN_CONSUMED, "consume", token, election_id)
                        .with("context", context),
                );
                Ok(())
            }
            Err(Error::Credential(reason)) => {
                tracing::warn!("credential {} rejected: {}", mask_token(token), reason);
                self.audit(
                    self.token_event(reason.audit_event(), "consume", token, election_id)
                        .with("context", context),
                );
                Err(reason.into())
            }
            Err(e) => {
                tracing::error!("consuming {} failed: {}", mask_token(token), e);
                Err(e)
            }
        }
    }

    /// The same checks as `consume`, without taking locks or changing anything
    pub fn validate_without_consuming(&self, token: &str, election_id: Uuid) -> Result<(), Error> {
        let credential = match self.store.get(token)? {
            Some(c) if c.election_id == election_id => c,
            _ => return Err(CredentialError::NotFound.into()),
        };
        credential.check(self.clock.now())?;
        Ok(())
    }

    /// Administratively disable a credential, whatever its state
    pub fn revoke(&self, token: &str, reason: &str) -> Result<(), Error> {
        let now = self.clock.now();
        let revoked = self.update_with_retry(token, &mut |credential| {
            credential.active = false;
            credential.spent = true;
            if credential.spent_at.is_none() {
                credential.spent_at = Some(now);
            }
            Ok(())
        })?;
        self.forget_lock(token);

        tracing::warn!("credential {} revoked: {}", mask_token(token), reason);
        self.audit(
            self.token_event(TOKEN_REVOKED, "revoke", token, revoked.election_id)
                .with("reason", reason),
        );
        Ok(())
    }

    /// Deactivate every active credential past its expiry. Safe to run repeatedly.
    pub fn sweep_expired(&self) -> Result<usize, Error> {
        let now = self.clock.now();
        let mut processed = 0;

        for token in self.store.expired_active(now)? {
            let mut changed = false;
            let outcome = self.update_with_retry(&token, &mut |credential| {
                changed = credential.active && credential.expires_at < now;
                credential.active = false;
                Ok(())
            });
            match outcome {
                Ok(_) => {
                    if changed {
                        processed += 1;
                    }
                    self.forget_lock(&token);
                }
                // Leave contended rows for the next sweep
                Err(Error::Store(StoreError::LockContention)) => {
                    tracing::warn!("skipping {} during sweep, row is locked", mask_token(&token));
                }
                Err(e) => return Err(e),
            }
        }

        if processed > 0 {
            tracing::info!("deactivated {} expired credentials", processed);
            self.audit(
                AuditEvent::new(TOKEN_CLEANUP, "ConsumptionGuard", "sweep_expired")
                    .with("processed", processed),
            );
        }
        Ok(processed)
    }

    pub fn token_statistics(&self, election_id: Uuid) -> Result<TokenStatistics, Error> {
        let now = self.clock.now();
        let credentials = self.store.list_by_election(election_id)?;
        let total = credentials.len();
        let spent = credentials.iter().filter(|c| c.spent).count();
        let available = credentials.iter().filter(|c| c.is_valid(now)).count();
        let utilization = if total == 0 {
            0.0
        } else {
            spent as f64 / total as f64
        };
        Ok(TokenStatistics {
            total,
            spent,
            available,
            utilization,
        })
    }

    /// Credentials that could still be spent
    pub fn active_tokens(&self, election_id: Uuid) -> Result<Vec<AnonymousCredential>, Error> {
        let now = self.clock.now();
        Ok(self
            .store
            .list_by_election(election_id)?
            .into_iter()
            .filter(|c| c.is_valid(now))
            .collect())
    }

    /// Number of per-token lock entries currently in memory
    pub fn tracked_locks(&self) -> usize {
        self.locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use num_bigint_dig::BigUint;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Barrier;

    fn credential(election_id: Uuid, now: DateTime<Utc>) -> AnonymousCredential {
        AnonymousCredential {
            token_id: AnonymousCredential::new_token_id(),
            election_id,
            session_id: Uuid::new_v4(),
            blinding_factor_hash: sha256_hex(b"r"),
            message: BigUint::from(3u32),
            blind_signature: BigUint::from(5u32),
            issued_at: now,
            expires_at: now + ChronoDuration::days(7),
            spent: false,
            active: true,
            spent_at: None,
        }
    }

    struct Fixture {
        guard: Arc<ConsumptionGuard>,
        store: Arc<MemCredentialStore>,
        audit: Arc<AuditLog>,
        clock: Arc<ManualClock>,
        election_id: Uuid,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemCredentialStore::default());
            let audit = Arc::new(AuditLog::new(
                Arc::new(SoftwareCustody::new()),
                RecordSettings::default(),
            ));
            let clock = Arc::new(ManualClock::default());
            let guard = Arc::new(ConsumptionGuard::new(
                store.clone(),
                audit.clone(),
                clock.clone(),
                GuardSettings {
                    lock_timeout: Duration::from_millis(50),
                    store_lock_attempts: 3,
                    store_lock_backoff: Duration::from_millis(5),
                },
            ));
            Fixture {
                guard,
                store,
                audit,
                clock,
                election_id: Uuid::new_v4(),
            }
        }

        fn issue(&self) -> String {
            let c = credential(self.election_id, self.clock.now());
            let token = c.token_id.clone();
            self.store.insert(c).unwrap();
            token
        }
    }

    fn rejection(result: Result<(), Error>) -> CredentialError {
        match result {
            Err(Error::Credential(reason)) => reason,
            other => panic!("expected a credential rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_consume_twice() {
        let f = Fixture::new();
        let token = f.issue();

        f.guard.consume(&token, f.election_id, "vote").unwrap();
        assert_eq!(
            rejection(f.guard.consume(&token, f.election_id, "vote")),
            CredentialError::AlreadySpent
        );

        let stored = f.store.get(&token).unwrap().unwrap();
        assert!(stored.spent);
        assert_eq!(stored.spent_at, Some(f.clock.now()));

        assert_eq!(f.audit.events_of_type(TOKEN_CONSUMED).unwrap().len(), 1);
        assert_eq!(f.audit.events_of_type("TOKEN_ALREADY_SPENT").unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_consume_accepts_exactly_one() {
        let f = Fixture::new();
        let token = f.issue();
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let guard = f.guard.clone();
                let barrier = barrier.clone();
                let token = token.clone();
                let election_id = f.election_id;
                std::thread::spawn(move || {
                    barrier.wait();
                    guard.consume(&token, election_id, "race")
                })
            })
            .collect();

        let results: Vec<Result<(), Error>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let accepted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(accepted, 1);
        for result in results.into_iter().filter(|r| r.is_err()) {
            let reason = rejection(result);
            assert!(
                reason == CredentialError::AlreadySpent || reason == CredentialError::LockTimeout,
                "unexpected rejection {:?}",
                reason
            );
        }
    }

    #[test]
    fn test_rejection_reasons() {
        let f = Fixture::new();

        assert_eq!(
            rejection(f.guard.consume("AT_unknown", f.election_id, "vote")),
            CredentialError::NotFound
        );

        let other_election = f.issue();
        assert_eq!(
            rejection(f.guard.consume(&other_election, Uuid::new_v4(), "vote")),
            CredentialError::NotFound
        );

        let revoked = f.issue();
        f.guard.revoke(&revoked, "compromised").unwrap();
        assert_eq!(
            rejection(f.guard.consume(&revoked, f.election_id, "vote")),
            CredentialError::Inactive
        );

        let expiring = f.issue();
        f.clock.advance(ChronoDuration::days(8));
        assert_eq!(
            rejection(f.guard.consume(&expiring, f.election_id, "vote")),
            CredentialError::Expired
        );
        assert!(!f.store.get(&expiring).unwrap().unwrap().spent);
    }

    #[test]
    fn test_validate_without_consuming() {
        let f = Fixture::new();
        let token = f.issue();

        f.guard.validate_without_consuming(&token, f.election_id).unwrap();
        f.guard.validate_without_consuming(&token, f.election_id).unwrap();
        assert!(!f.store.get(&token).unwrap().unwrap().spent);

        f.guard.consume(&token, f.election_id, "vote").unwrap();
        assert_eq!(
            rejection(f.guard.validate_without_consuming(&token, f.election_id)),
            CredentialError::AlreadySpent
        );
    }

    #[test]
    fn test_revoke_is_unconditional() {
        let f = Fixture::new();
        let token = f.issue();
        f.guard.consume(&token, f.election_id, "vote").unwrap();
        let _waiting = f.guard.token_lock(&token);
        assert_eq!(f.guard.tracked_locks(), 1);

        f.guard.revoke(&token, "audit").unwrap();
        let stored = f.store.get(&token).unwrap().unwrap();
        assert!(!stored.active);
        assert!(stored.spent);
        assert_eq!(f.guard.tracked_locks(), 0);

        assert!(f.guard.revoke("AT_unknown", "audit").is_err());
    }

    #[test]
    fn test_lock_timeout_is_a_rejection() {
        let f = Fixture::new();
        let token = f.issue();

        let lock = f.guard.token_lock(&token);
        let _held = lock.lock();
        assert_eq!(
            rejection(f.guard.consume(&token, f.election_id, "vote")),
            CredentialError::LockTimeout
        );
        assert!(!f.store.get(&token).unwrap().unwrap().spent);
    }

    #[test]
    fn test_lock_entries_are_released() {
        let f = Fixture::new();
        for i in 0..1000 {
            let garbage = format!("AT_garbage_{}", i);
            assert_eq!(
                rejection(f.guard.consume(&garbage, f.election_id, "vote")),
                CredentialError::NotFound
            );
        }
        assert_eq!(f.guard.tracked_locks(), 0);

        let token = f.issue();
        f.guard.consume(&token, f.election_id, "vote").unwrap();
        f.guard.consume(&token, f.election_id, "vote").unwrap_err();
        assert_eq!(f.guard.tracked_locks(), 0);

        // An entry someone else still holds survives a timed-out attempt
        let other = f.issue();
        let lock = f.guard.token_lock(&other);
        let held = lock.lock();
        f.guard.consume(&other, f.election_id, "vote").unwrap_err();
        assert_eq!(f.guard.tracked_locks(), 1);
        drop(held);
        f.guard.consume(&other, f.election_id, "vote").unwrap();
        assert_eq!(f.guard.tracked_locks(), 1);
        drop(lock);
        f.guard.consume(&other, f.election_id, "vote").unwrap_err();
        assert_eq!(f.guard.tracked_locks(), 0);
    }

    #[test]
    fn test_sweep_expired() {
        let f = Fixture::new();
        let fresh = f.issue();
        let stale = f.issue();
        f.guard.consume(&fresh, f.election_id, "vote").unwrap();

        assert_eq!(f.guard.sweep_expired().unwrap(), 0);
        f.clock.advance(ChronoDuration::days(8));
        assert_eq!(f.guard.sweep_expired().unwrap(), 2);
        assert_eq!(f.guard.sweep_expired().unwrap(), 0);

        assert!(!f.store.get(&stale).unwrap().unwrap().active);
        assert_eq!(f.audit.events_of_type(TOKEN_CLEANUP).unwrap().len(), 1);
    }

    #[test]
    fn test_statistics() {
        let f = Fixture::new();
        let tokens: Vec<String> = (0..4).map(|_| f.issue()).collect();
        f.guard.consume(&tokens[0], f.election_id, "vote").unwrap();

        let stats = f.guard.token_statistics(f.election_id).unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.spent, 1);
        assert_eq!(stats.available, 3);
        assert!((stats.utilization - 0.25).abs() < f64::EPSILON);

        let active = f.guard.active_tokens(f.election_id).unwrap();
        assert_eq!(active.len(), 3);
        assert!(active.iter().all(|c| c.token_id != tokens[0]));

        let empty = f.guard.token_statistics(Uuid::new_v4()).unwrap();
        assert_eq!(empty.utilization, 0.0);
    }

    /// Reports storage contention a fixed number of times before delegating
    struct ContendedStore {
        inner: MemCredentialStore,
        failures: AtomicU32,
    }

    impl CredentialStore for ContendedStore {
        fn insert(&self, credential: AnonymousCredential) -> Result<(), Error> {
            self.inner.insert(credential)
        }

        fn get(&self, token_id: &str) -> Result<Option<AnonymousCredential>, StoreError> {
            self.inner.get(token_id)
        }

        fn find_by_session(
            &self,
            session_id: Uuid,
            election_id: Uuid,
        ) -> Result<Option<AnonymousCredential>, StoreError> {
            self.inner.find_by_session(session_id, election_id)
        }

        fn update_exclusive(
            &self,
            token_id: &str,
            wait: Duration,
            apply: &mut dyn FnMut(&mut AnonymousCredential) -> Result<(), CredentialError>,
        ) -> Result<AnonymousCredential, Error> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::LockContention.into());
            }
            self.inner.update_exclusive(token_id, wait, apply)
        }

        fn list_by_election(&self, election_id: Uuid) -> Result<Vec<AnonymousCredential>, StoreError> {
            self.inner.list_by_election(election_id)
        }

        fn expired_active(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
            self.inner.expired_active(now)
        }
    }

    fn contended_guard(failures: u32) -> (ConsumptionGuard, String, Uuid) {
        let store = Arc::new(ContendedStore {
            inner: MemCredentialStore::default(),
            failures: AtomicU32::new(failures),
        });
        let election_id = Uuid::new_v4();
        let c = credential(election_id, Utc::now());
        let token = c.token_id.clone();
        store.insert(c).unwrap();

        let guard = ConsumptionGuard::new(
            store,
            Arc::new(AuditLog::new(
                Arc::new(SoftwareCustody::new()),
                RecordSettings::default(),
            )),
            Arc::new(SystemClock),
            GuardSettings {
                lock_timeout: Duration::from_millis(50),
                store_lock_attempts: 3,
                store_lock_backoff: Duration::from_millis(1),
            },
        );
        (guard, token, election_id)
    }

    #[test]
    fn test_store_contention_is_retried() {
        let (guard, token, election_id) = contended_guard(2);
        guard.consume(&token, election_id, "vote").unwrap();
    }

    #[test]
    fn test_store_contention_gives_up() {
        let (guard, token, election_id) = contended_guard(3);
        let err = guard.consume(&token, election_id, "vote").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockContention);
        guard.validate_without_consuming(&token, election_id).unwrap();
    }
}
