//! Append-only hash-chained records with Merkle batching.
//!
//! Every entry commits to its predecessor's hash, so rewriting any entry breaks
//! the link to everything appended after it. Entry hashes are also gathered into
//! a Merkle tree; each time `batch_size` new leaves have accumulated, the root
//! over all leaves so far is published and recorded on the entry that closed the
//! batch.

use crate::*;
use chrono::{DateTime, Utc};
use digest::Digest;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;

/// Previous hash of the first entry in every chain
pub const GENESIS_HASH: &str = "0";

pub const DEFAULT_MERKLE_BATCH_SIZE: usize = 10;

/// Content that can be appended to a [`HashChain`]
pub trait RecordPayload: Serialize + Clone + Send + Sync + 'static {
    /// Custody key that signs entries of this record
    const SIGNING_KEY: &'static str;

    /// Human readable name, for logs
    const RECORD_NAME: &'static str;
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RecordEntry<P> {
    pub sequence: u64,
    pub entry_hash: String,
    pub previous_hash: String,
    pub payload: P,
    pub timestamp: DateTime<Utc>,

    /// Merkle root in effect once this entry was appended
    pub merkle_root: Option<String>,

    #[serde(with = "hex")]
    pub signature: Vec<u8>,
}

impl<P: Serialize> RecordEntry<P> {
    /// Hash the entry's contents again, ignoring the stored `entry_hash`
    pub fn recompute_hash(&self) -> Result<String, Error> {
        compute_entry_hash(&self.payload, &self.previous_hash, self.sequence, self.timestamp)
    }
}

/// SHA-256 over the CBOR payload, the previous hash, the big-endian sequence
/// number and the big-endian millisecond timestamp.
pub fn compute_entry_hash<P: Serialize>(
    payload: &P,
    previous_hash: &str,
    sequence: u64,
    timestamp: DateTime<Utc>,
) -> Result<String, Error> {
    let payload = serde_cbor::to_vec(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(&payload);
    hasher.update(previous_hash.as_bytes());
    hasher.update(&sequence.to_be_bytes());
    hasher.update(&timestamp.timestamp_millis().to_be_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone)]
pub struct RecordSettings {
    pub batch_size: usize,
}

impl Default for RecordSettings {
    fn default() -> Self {
        RecordSettings {
            batch_size: DEFAULT_MERKLE_BATCH_SIZE,
        }
    }
}

/// An inclusion proof for one entry
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MerkleProof {
    pub leaf: String,
    pub siblings: Vec<String>,
    pub root: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MerkleStatus {
    Included,

    /// The entry is waiting for its batch to close
    Pending,

    Invalid,
}

/// Result of checking one entry
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EntryVerification {
    pub sequence: u64,
    pub entry_hash: String,
    pub hash_valid: bool,
    pub chain_valid: bool,
    pub signature_valid: bool,
    pub merkle: MerkleStatus,
}

impl EntryVerification {
    pub fn is_valid(&self) -> bool {
        self.hash_valid
            && self.chain_valid
            && self.signature_valid
            && self.merkle != MerkleStatus::Invalid
    }
}

/// Result of checking a whole record
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct IntegrityReport {
    pub total_entries: u64,
    pub chain_valid: bool,
    pub first_broken: Option<u64>,
    pub merkle_valid: bool,
    pub signatures_valid: bool,
    pub overall_integrity: bool,
    pub current_root: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RecordStatistics {
    pub total_entries: u64,
    pub pending_batch: usize,
    pub current_root: Option<String>,
    pub latest_hash: Option<String>,
}

#[derive(Default)]
struct ChainState {
    leaves: Vec<String>,
    positions: HashMap<String, usize>,
    committed: usize,
    root: Option<String>,
}

/// A hash-chained, Merkle-batched, custody-signed record
pub struct HashChain<P: RecordPayload> {
    store: Arc<dyn RecordStore<P>>,
    custody: Arc<dyn KeyCustody>,
    clock: Arc<dyn Clock>,
    settings: RecordSettings,
    state: Mutex<ChainState>,
}

impl<P: RecordPayload> HashChain<P> {
    /// A new record over an in-memory store
    pub fn new(custody: Arc<dyn KeyCustody>, settings: RecordSettings) -> Self {
        HashChain {
            store: Arc::new(MemRecordStore::default()),
            custody,
            clock: Arc::new(SystemClock),
            settings,
            state: Mutex::new(ChainState::default()),
        }
    }

    /// Open a record over an existing store, rebuilding the Merkle state from
    /// the stored entry hashes.
    pub fn open(
        store: Arc<dyn RecordStore<P>>,
        custody: Arc<dyn KeyCustody>,
        clock: Arc<dyn Clock>,
        settings: RecordSettings,
    ) -> Result<Self, Error> {
        let mut state = ChainState::default();
        for entry in store.entries()? {
            state.positions.insert(entry.entry_hash.clone(), state.leaves.len());
            state.leaves.push(entry.entry_hash);
        }
        let batch_size = settings.batch_size.max(1);
        state.committed = state.leaves.len() / batch_size * batch_size;
        state.root = merkle::merkle_root(&state.leaves[..state.committed]);

        Ok(HashChain {
            store,
            custody,
            clock,
            settings,
            state: Mutex::new(state),
        })
    }

    pub fn append(&self, payload: P) -> Result<RecordEntry<P>, Error> {
        let mut state = self.state.lock();

        let sequence = state.leaves.len() as u64;
        let previous_hash = self
            .store
            .last()?
            .map(|e| e.entry_hash)
            .unwrap_or_else(|| GENESIS_HASH.to_owned());
        let timestamp = self.clock.now();
        let entry_hash = compute_entry_hash(&payload, &previous_hash, sequence, timestamp)?;

        // Work out the batch outcome before anything is persisted
        let pending = state.leaves.len() + 1 - state.committed;
        let new_root = if pending >= self.settings.batch_size.max(1) {
            let mut leaves = state.leaves.clone();
            leaves.push(entry_hash.clone());
            merkle::merkle_root(&leaves)
        } else {
            None
        };

        let signature = self.custody.sign(P::SIGNING_KEY, entry_hash.as_bytes())?;

        let entry = RecordEntry {
            sequence,
            entry_hash: entry_hash.clone(),
            previous_hash,
            payload,
            timestamp,
            merkle_root: new_root.clone().or_else(|| state.root.clone()),
            signature,
        };
        self.store.push(entry.clone())?;

        let position = state.leaves.len();
        state.positions.insert(entry_hash.clone(), position);
        state.leaves.push(entry_hash);
        if let Some(root) = new_root {
            state.committed = state.leaves.len();
            tracing::debug!(
                "{} merkle root updated at {} leaves: {}",
                P::RECORD_NAME,
                state.committed,
                root
            );
            state.root = Some(root);
        }

        Ok(entry)
    }

    pub fn entry(&self, entry_hash: &str) -> Result<Option<RecordEntry<P>>, Error> {
        let position = self.state.lock().positions.get(entry_hash).copied();
        match position {
            Some(position) => Ok(self.store.get(position as u64)?),
            None => Ok(None),
        }
    }

    pub fn entries(&self) -> Result<Vec<RecordEntry<P>>, Error> {
        Ok(self.store.entries()?)
    }

    pub fn current_root(&self) -> Option<String> {
        self.state.lock().root.clone()
    }

    /// Sibling path from the entry's leaf to the current root.
    ///
    /// Entries whose batch has not closed yet are not covered by any root.
    pub fn generate_proof(&self, entry_hash: &str) -> Result<MerkleProof, Error> {
        let state = self.state.lock();
        let position = *state
            .positions
            .get(entry_hash)
            .ok_or_else(|| ChainIntegrityError::EntryNotFound(entry_hash.to_owned()))?;
        let root = match &state.root {
            Some(root) if position < state.committed => root.clone(),
            _ => return Err(ChainIntegrityError::PendingBatch(entry_hash.to_owned()).into()),
        };
        let siblings = merkle::inclusion_proof(&state.leaves[..state.committed], position)
            .ok_or_else(|| ChainIntegrityError::EntryNotFound(entry_hash.to_owned()))?;

        Ok(MerkleProof {
            leaf: entry_hash.to_owned(),
            siblings,
            root,
        })
    }

    pub fn verify_proof(leaf: &str, siblings: &[String], root: &str) -> bool {
        merkle::verify_inclusion(leaf, siblings, root)
    }

    /// Walk the chain in append order, stopping at the first entry that does not
    /// hash to its stored value or does not link to its predecessor.
    pub fn verify_chain_integrity(&self) -> Result<(), Error> {
        let entries = self.store.entries()?;
        if let Err(e) = check_chain(&entries, entries.len()) {
            tracing::error!("{} integrity check failed: {}", P::RECORD_NAME, e);
            return Err(e);
        }
        Ok(())
    }

    pub fn verify_entry_signature(&self, entry: &RecordEntry<P>) -> Result<bool, Error> {
        Ok(self
            .custody
            .verify(P::SIGNING_KEY, entry.entry_hash.as_bytes(), &entry.signature)?)
    }

    /// Check one entry: its hash, the chain up to and including it, its custody
    /// signature and its Merkle inclusion.
    pub fn verify_entry(&self, entry_hash: &str) -> Result<EntryVerification, Error> {
        let entry = self
            .entry(entry_hash)?
            .ok_or_else(|| ChainIntegrityError::EntryNotFound(entry_hash.to_owned()))?;

        let hash_valid = entry.recompute_hash()? == entry.entry_hash;
        let entries = self.store.entries()?;
        let chain_valid = check_chain(&entries, entry.sequence as usize + 1).is_ok();
        let signature_valid = self.verify_entry_signature(&entry)?;

        let merkle = match self.generate_proof(entry_hash) {
            Ok(proof) => {
                if Self::verify_proof(&proof.leaf, &proof.siblings, &proof.root) {
                    MerkleStatus::Included
                } else {
                    MerkleStatus::Invalid
                }
            }
            Err(Error::ChainIntegrity(ChainIntegrityError::PendingBatch(_))) => {
                MerkleStatus::Pending
            }
            Err(e) => return Err(e),
        };

        let verification = EntryVerification {
            sequence: entry.sequence,
            entry_hash: entry.entry_hash,
            hash_valid,
            chain_valid,
            signature_valid,
            merkle,
        };
        if !verification.is_valid() {
            tracing::error!(
                "{} entry {} failed verification: {:?}",
                P::RECORD_NAME,
                verification.sequence,
                verification
            );
        }
        Ok(verification)
    }

    /// Verify every entry and the Merkle roots recorded along the way
    pub fn verify_all(&self) -> Result<IntegrityReport, Error> {
        let entries = self.store.entries()?;

        let first_broken = match check_chain(&entries, entries.len()) {
            Ok(()) => None,
            Err(Error::ChainIntegrity(e)) => Some(e.sequence().unwrap_or(0)),
            Err(e) => return Err(e),
        };

        let mut signatures_valid = true;
        for entry in &entries {
            if !self.verify_entry_signature(entry)? {
                tracing::error!("{} entry {} has an invalid signature", P::RECORD_NAME, entry.sequence);
                signatures_valid = false;
            }
        }

        let merkle_valid = self.check_merkle_snapshots(&entries);
        let chain_valid = first_broken.is_none();
        let overall_integrity = chain_valid && merkle_valid && signatures_valid;
        if !overall_integrity {
            tracing::error!(
                "{} integrity compromised: chain_valid={} merkle_valid={} signatures_valid={}",
                P::RECORD_NAME,
                chain_valid,
                merkle_valid,
                signatures_valid
            );
        }

        Ok(IntegrityReport {
            total_entries: entries.len() as u64,
            chain_valid,
            first_broken,
            merkle_valid,
            signatures_valid,
            overall_integrity,
            current_root: self.current_root(),
        })
    }

    fn check_merkle_snapshots(&self, entries: &[RecordEntry<P>]) -> bool {
        let batch_size = self.settings.batch_size.max(1);
        let leaves: Vec<String> = entries.iter().map(|e| e.entry_hash.clone()).collect();

        let mut expected: Option<String> = None;
        for (index, entry) in entries.iter().enumerate() {
            if (index + 1) % batch_size == 0 {
                expected = merkle::merkle_root(&leaves[..=index]);
            }
            if entry.merkle_root != expected {
                tracing::error!(
                    "{} entry {} records an unexpected merkle root",
                    P::RECORD_NAME,
                    entry.sequence
                );
                return false;
            }
        }
        expected == self.current_root()
    }

    pub fn statistics(&self) -> Result<RecordStatistics, Error> {
        let state = self.state.lock();
        Ok(RecordStatistics {
            total_entries: state.leaves.len() as u64,
            pending_batch: state.leaves.len() - state.committed,
            current_root: state.root.clone(),
            latest_hash: state.leaves.last().cloned(),
        })
    }
}

/// Check the first `upto` entries
fn check_chain<P: Serialize>(entries: &[RecordEntry<P>], upto: usize) -> Result<(), Error> {
    let mut previous = GENESIS_HASH;
    for (index, entry) in entries.iter().take(upto).enumerate() {
        if entry.sequence != index as u64 {
            return Err(ChainIntegrityError::SequenceGap {
                expected: index as u64,
                found: entry.sequence,
            }
            .into());
        }
        if entry.previous_hash != previous {
            return Err(ChainIntegrityError::BrokenLink(entry.sequence).into());
        }
        if entry.recompute_hash()? != entry.entry_hash {
            return Err(ChainIntegrityError::HashMismatch(entry.sequence).into());
        }
        previous = &entry.entry_hash;
    }
    Ok(())
}
