use crate::*;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Persistence for issued credentials.
///
/// Implementations must make `update_exclusive` a true exclusive
/// read-modify-write of one row, visible to every process sharing the store.
pub trait CredentialStore: Send + Sync {
    /// Insert a new credential. Fails with `CredentialError::Duplicate` if one
    /// already exists for the same session and election.
    fn insert(&self, credential: AnonymousCredential) -> Result<(), Error>;

    fn get(&self, token_id: &str) -> Result<Option<AnonymousCredential>, StoreError>;

    fn find_by_session(
        &self,
        session_id: Uuid,
        election_id: Uuid,
    ) -> Result<Option<AnonymousCredential>, StoreError>;

    /// Lock the row for `token_id`, apply `apply` to a copy, and persist the copy
    /// only if `apply` succeeds. Waits at most `wait` for the row lock and fails
    /// with `StoreError::LockContention` after that.
    fn update_exclusive(
        &self,
        token_id: &str,
        wait: Duration,
        apply: &mut dyn FnMut(&mut AnonymousCredential) -> Result<(), CredentialError>,
    ) -> Result<AnonymousCredential, Error>;

    fn list_by_election(&self, election_id: Uuid) -> Result<Vec<AnonymousCredential>, StoreError>;

    /// Token ids of every active credential that expired before `now`
    fn expired_active(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError>;
}

/// A credential store held in process memory. Each row carries its own lock.
#[derive(Default)]
pub struct MemCredentialStore {
    rows: RwLock<HashMap<String, Arc<Mutex<AnonymousCredential>>>>,
    by_session: RwLock<HashMap<(Uuid, Uuid), String>>,
}

impl MemCredentialStore {
    fn row(&self, token_id: &str) -> Option<Arc<Mutex<AnonymousCredential>>> {
        self.rows.read().get(token_id).cloned()
    }

    fn snapshot(&self) -> Vec<AnonymousCredential> {
        let rows: Vec<_> = self.rows.read().values().cloned().collect();
        rows.iter().map(|row| row.lock().clone()).collect()
    }
}

impl CredentialStore for MemCredentialStore {
    fn insert(&self, credential: AnonymousCredential) -> Result<(), Error> {
        let key = (credential.session_id, credential.election_id);
        let mut by_session = self.by_session.write();
        if by_session.contains_key(&key) {
            return Err(CredentialError::Duplicate(key.0, key.1).into());
        }
        let mut rows = self.rows.write();
        by_session.insert(key, credential.token_id.clone());
        rows.insert(
            credential.token_id.clone(),
            Arc::new(Mutex::new(credential)),
        );
        Ok(())
    }

    fn get(&self, token_id: &str) -> Result<Option<AnonymousCredential>, StoreError> {
        Ok(self.row(token_id).map(|row| row.lock().clone()))
    }

    fn find_by_session(
        &self,
        session_id: Uuid,
        election_id: Uuid,
    ) -> Result<Option<AnonymousCredential>, StoreError> {
        let token_id = self
            .by_session
            .read()
            .get(&(session_id, election_id))
            .cloned();
        match token_id {
            Some(token_id) => self.get(&token_id),
            None => Ok(None),
        }
    }

    fn update_exclusive(
        &self,
        token_id: &str,
        wait: Duration,
        apply: &mut dyn FnMut(&mut AnonymousCredential) -> Result<(), CredentialError>,
    ) -> Result<AnonymousCredential, Error> {
        let row = self.row(token_id).ok_or(CredentialError::NotFound)?;
        let mut current = row.try_lock_for(wait).ok_or(StoreError::LockContention)?;

        let mut updated = current.clone();
        apply(&mut updated)?;
        *current = updated.clone();
        Ok(updated)
    }

    fn list_by_election(&self, election_id: Uuid) -> Result<Vec<AnonymousCredential>, StoreError> {
        let mut credentials: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|c| c.election_id == election_id)
            .collect();
        credentials.sort_by(|a, b| a.issued_at.cmp(&b.issued_at));
        Ok(credentials)
    }

    fn expired_active(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        Ok(self
            .snapshot()
            .into_iter()
            .filter(|c| c.active && c.expires_at < now)
            .map(|c| c.token_id)
            .collect())
    }
}

/// Persistence for blind-signing sessions
pub trait SessionStore: Send + Sync {
    fn insert(&self, session: BlindSignSession) -> Result<(), StoreError>;

    fn get(&self, session_id: Uuid) -> Result<Option<BlindSignSession>, StoreError>;

    /// Apply `apply` to the session atomically. Nothing is persisted if it fails.
    fn update(
        &self,
        session_id: Uuid,
        apply: &mut dyn FnMut(&mut BlindSignSession) -> Result<(), SessionError>,
    ) -> Result<BlindSignSession, Error>;

    /// Remove sessions that expired before `now`, returning how many went
    fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

#[derive(Default)]
pub struct MemSessionStore {
    inner: Mutex<HashMap<Uuid, BlindSignSession>>,
}

impl SessionStore for MemSessionStore {
    fn insert(&self, session: BlindSignSession) -> Result<(), StoreError> {
        self.inner.lock().insert(session.session_id, session);
        Ok(())
    }

    fn get(&self, session_id: Uuid) -> Result<Option<BlindSignSession>, StoreError> {
        Ok(self.inner.lock().get(&session_id).cloned())
    }

    fn update(
        &self,
        session_id: Uuid,
        apply: &mut dyn FnMut(&mut BlindSignSession) -> Result<(), SessionError>,
    ) -> Result<BlindSignSession, Error> {
        let mut sessions = self.inner.lock();
        let current = sessions
            .get_mut(&session_id)
            .ok_or(SessionError::NotFound(session_id))?;
        let mut updated = current.clone();
        apply(&mut updated)?;
        *current = updated.clone();
        Ok(updated)
    }

    fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut sessions = self.inner.lock();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        Ok(before - sessions.len())
    }
}

/// Append-only persistence for a hash-chained record
pub trait RecordStore<P>: Send + Sync {
    fn push(&self, entry: RecordEntry<P>) -> Result<(), StoreError>;

    fn get(&self, sequence: u64) -> Result<Option<RecordEntry<P>>, StoreError>;

    fn last(&self) -> Result<Option<RecordEntry<P>>, StoreError>;

    /// All entries in append order
    fn entries(&self) -> Result<Vec<RecordEntry<P>>, StoreError>;

    fn len(&self) -> Result<u64, StoreError>;
}

pub struct MemRecordStore<P> {
    entries: RwLock<Vec<RecordEntry<P>>>,
}

impl<P> Default for MemRecordStore<P> {
    fn default() -> Self {
        MemRecordStore {
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<P> MemRecordStore<P> {
    /// Overwrite a stored entry in place, bypassing the chain
    #[cfg(test)]
    pub(crate) fn overwrite(&self, entry: RecordEntry<P>) {
        let index = entry.sequence as usize;
        self.entries.write()[index] = entry;
    }
}

impl<P: Clone + Send + Sync> RecordStore<P> for MemRecordStore<P> {
    fn push(&self, entry: RecordEntry<P>) -> Result<(), StoreError> {
        let mut entries = self.entries.write();
        if entry.sequence != entries.len() as u64 {
            return Err(StoreError::Unavailable(format!(
                "out of order append: sequence {} after {} entries",
                entry.sequence,
                entries.len()
            )));
        }
        entries.push(entry);
        Ok(())
    }

    fn get(&self, sequence: u64) -> Result<Option<RecordEntry<P>>, StoreError> {
        Ok(self.entries.read().get(sequence as usize).cloned())
    }

    fn last(&self) -> Result<Option<RecordEntry<P>>, StoreError> {
        Ok(self.entries.read().last().cloned())
    }

    fn entries(&self) -> Result<Vec<RecordEntry<P>>, StoreError> {
        Ok(self.entries.read().clone())
    }

    fn len(&self) -> Result<u64, StoreError> {
        Ok(self.entries.read().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use num_bigint_dig::BigUint;

    fn credential(session_id: Uuid, election_id: Uuid) -> AnonymousCredential {
        let now = Utc::now();
        AnonymousCredential {
            token_id: AnonymousCredential::new_token_id(),
            election_id,
            session_id,
            blinding_factor_hash: sha256_hex(b"r"),
            message: BigUint::from(1u32),
            blind_signature: BigUint::from(1u32),
            issued_at: now,
            expires_at: now + ChronoDuration::days(7),
            spent: false,
            active: true,
            spent_at: None,
        }
    }

    #[test]
    fn test_unique_per_session_and_election() {
        let store = MemCredentialStore::default();
        let (session, election) = (Uuid::new_v4(), Uuid::new_v4());
        store.insert(credential(session, election)).unwrap();

        let err = store.insert(credential(session, election)).unwrap_err();
        assert_eq!(
            err.rejection(),
            Some(&CredentialError::Duplicate(session, election))
        );

        // Same session in another election is a different credential
        store.insert(credential(session, Uuid::new_v4())).unwrap();
        assert!(store.find_by_session(session, election).unwrap().is_some());
    }

    #[test]
    fn test_update_exclusive_is_all_or_nothing() {
        let store = MemCredentialStore::default();
        let c = credential(Uuid::new_v4(), Uuid::new_v4());
        let token = c.token_id.clone();
        store.insert(c).unwrap();

        let result = store.update_exclusive(&token, Duration::from_millis(10), &mut |c| {
            c.spent = true;
            Err(CredentialError::Expired)
        });
        assert!(result.is_err());
        assert!(!store.get(&token).unwrap().unwrap().spent);

        let updated = store
            .update_exclusive(&token, Duration::from_millis(10), &mut |c| {
                c.spent = true;
                Ok(())
            })
            .unwrap();
        assert!(updated.spent);
        assert!(store.get(&token).unwrap().unwrap().spent);

        let missing = store.update_exclusive("AT_missing", Duration::from_millis(10), &mut |_| Ok(()));
        assert_eq!(missing.unwrap_err().rejection(), Some(&CredentialError::NotFound));
    }

    #[test]
    fn test_update_exclusive_times_out_on_held_row() {
        let store = MemCredentialStore::default();
        let c = credential(Uuid::new_v4(), Uuid::new_v4());
        let token = c.token_id.clone();
        store.insert(c).unwrap();

        let row = store.row(&token).unwrap();
        let _held = row.lock();
        let err = store
            .update_exclusive(&token, Duration::from_millis(20), &mut |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockContention);
    }

    #[test]
    fn test_expired_active() {
        let store = MemCredentialStore::default();
        let c = credential(Uuid::new_v4(), Uuid::new_v4());
        let token = c.token_id.clone();
        store.insert(c).unwrap();

        assert!(store.expired_active(Utc::now()).unwrap().is_empty());
        let later = Utc::now() + ChronoDuration::days(8);
        assert_eq!(store.expired_active(later).unwrap(), vec![token]);
    }
}
