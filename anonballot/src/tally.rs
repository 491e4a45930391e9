use crate::*;
use indexmap::IndexMap;
use num_bigint_dig::BigUint;
use num_traits::ToPrimitive;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TallySettings {
    pub prime_bits: usize,
}

impl Default for TallySettings {
    fn default() -> Self {
        TallySettings {
            prime_bits: MIN_PAILLIER_PRIME_BITS,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TallyResult {
    pub election_id: Uuid,
    pub total_votes: u64,

    /// Votes per candidate id, in ballot order
    pub totals: IndexMap<String, u64>,

    /// Every candidate sharing the highest count
    pub winners: Vec<String>,
    pub is_tie: bool,
    pub threshold_used: bool,
    pub shares_used: usize,
}

impl TallyResult {
    pub fn from_totals(
        election_id: Uuid,
        totals: IndexMap<String, u64>,
        threshold_used: bool,
        shares_used: usize,
    ) -> Self {
        let total_votes = totals.values().sum();
        let winners: Vec<String> = match totals.values().max() {
            Some(max) => totals
                .iter()
                .filter(|(_, count)| *count == max)
                .map(|(candidate, _)| candidate.clone())
                .collect(),
            None => Vec::new(),
        };
        let is_tie = winners.len() > 1;

        TallyResult {
            election_id,
            total_votes,
            totals,
            winners,
            is_tie,
            threshold_used,
            shares_used,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub total_trustees: usize,
    pub threshold: usize,
    pub available_shares: usize,
    pub can_decrypt: bool,
}

struct Accumulator {
    totals: IndexMap<String, Ciphertext>,
    ballots: u64,

    /// Set the first time the totals are read for a tally. No fold lands after it.
    frozen: bool,
    source_loaded: bool,
}

impl Accumulator {
    fn check(&self, public_key: &PaillierPublicKey, ballot: &Ballot) -> Result<(), Error> {
        if !self.totals.contains_key(&ballot.candidate_id) {
            return Err(StateError::UnknownCandidate(ballot.candidate_id.clone()).into());
        }
        public_key.validate(&ballot.ciphertext)?;
        Ok(())
    }

    /// Add a ballot that has already passed `check`
    fn fold(&mut self, public_key: &PaillierPublicKey, ballot: &Ballot) {
        if let Some(total) = self.totals.get_mut(&ballot.candidate_id) {
            *total = public_key.add(total, &ballot.ciphertext);
            self.ballots += 1;
        }
    }
}

/// Folds encrypted ballots into per-candidate accumulators and decrypts the
/// totals once the election has closed.
pub struct TallyEngine {
    elections: Arc<dyn ElectionSource>,
    custody: Arc<dyn KeyCustody>,
    audit: Arc<AuditLog>,
    settings: TallySettings,
    keys: RwLock<HashMap<Uuid, ElectionKeys>>,
    accumulators: RwLock<HashMap<Uuid, Arc<Mutex<Accumulator>>>>,
}

impl TallyEngine {
    pub fn new(
        elections: Arc<dyn ElectionSource>,
        custody: Arc<dyn KeyCustody>,
        audit: Arc<AuditLog>,
        settings: TallySettings,
    ) -> Self {
        TallyEngine {
            elections,
            custody,
            audit,
            settings,
            keys: RwLock::new(HashMap::new()),
            accumulators: RwLock::new(HashMap::new()),
        }
    }

    /// Generate the election's tally key and start every candidate at Encrypt(0)
    pub fn setup_election(&self, election_id: Uuid, mode: KeyMode) -> Result<ElectionKeys, Error> {
        let candidates = self
            .elections
            .candidates(election_id)
            .ok_or(StateError::UnknownElection(election_id))?;

        let mut keys = self.keys.write();
        if keys.contains_key(&election_id) {
            return Err(StateError::KeysAlreadyConfigured(election_id).into());
        }

        let mut rng = rand::rngs::OsRng {};
        let election_keys =
            generate_election_keys(&mut rng, &self.custody, election_id, mode, self.settings.prime_bits)?;

        let mut totals = IndexMap::new();
        for candidate in &candidates {
            let zero = election_keys.public_key.encrypt_u64(&mut rng, 0)?;
            totals.insert(candidate.id.clone(), zero);
        }
        self.accumulators.write().insert(
            election_id,
            Arc::new(Mutex::new(Accumulator {
                totals,
                ballots: 0,
                frozen: false,
                source_loaded: false,
            })),
        );
        keys.insert(election_id, election_keys.clone());

        let (trustees, threshold) = election_keys.threshold().unwrap_or((1, 1));
        self.audit.record(
            AuditEvent::new(ELECTION_KEYS_GENERATED, "TallyEngine", "setup_election")
                .with("election_id", election_id.to_string())
                .with("trustees", trustees)
                .with("threshold", threshold),
        )?;

        Ok(election_keys)
    }

    pub fn election_keys(&self, election_id: Uuid) -> Result<ElectionKeys, Error> {
        self.keys
            .read()
            .get(&election_id)
            .cloned()
            .ok_or_else(|| StateError::KeysNotConfigured(election_id).into())
    }

    pub fn public_key(&self, election_id: Uuid) -> Result<PaillierPublicKey, Error> {
        Ok(self.election_keys(election_id)?.public_key)
    }

    fn accumulator_handle(&self, election_id: Uuid) -> Result<Arc<Mutex<Accumulator>>, Error> {
        self.accumulators
            .read()
            .get(&election_id)
            .cloned()
            .ok_or_else(|| StateError::KeysNotConfigured(election_id).into())
    }

    fn require_open(&self, election_id: Uuid, accumulator: &Accumulator) -> Result<(), Error> {
        if accumulator.frozen {
            return Err(StateError::ElectionNotOpen(election_id).into());
        }
        self.elections.require_state(election_id, ElectionState::Open)?;
        Ok(())
    }

    /// Check that a ballot could be recorded right now, without recording it
    pub fn validate_ballot(&self, election_id: Uuid, ballot: &Ballot) -> Result<(), Error> {
        let public_key = self.public_key(election_id)?;
        let handle = self.accumulator_handle(election_id)?;
        let accumulator = handle.lock();
        self.require_open(election_id, &accumulator)?;
        accumulator.check(&public_key, ballot)
    }

    /// Fold a ballot into its candidate's accumulator. Only while the election is open.
    pub fn record_ballot(&self, election_id: Uuid, ballot: &Ballot) -> Result<(), Error> {
        self.record_ballot_with(election_id, ballot, || Ok(()))
    }

    /// Fold a ballot once `accept` succeeds.
    ///
    /// The election state and the ballot are checked, `accept` runs and the
    /// ballot is folded, all under the election's accumulator lock. A ballot
    /// rejected by the checks never reaches `accept`, and an accepted ballot
    /// is always in the totals the tally reads.
    pub fn record_ballot_with<T, F>(&self, election_id: Uuid, ballot: &Ballot, accept: F) -> Result<T, Error>
    where
        F: FnOnce() -> Result<T, Error>,
    {
        let public_key = self.public_key(election_id)?;
        let handle = self.accumulator_handle(election_id)?;

        let mut accumulator = handle.lock();
        self.require_open(election_id, &accumulator)?;
        accumulator.check(&public_key, ballot)?;
        let accepted = accept()?;
        accumulator.fold(&public_key, ballot);
        Ok(accepted)
    }

    /// Fold every ballot the election source holds, on an open or closed
    /// election whose totals have not been read yet. Ballots that fail
    /// validation are skipped and counted in the return value.
    ///
    /// The source is only folded once; the first tally loads it if this was
    /// never called. Only for ballots that did not arrive through `record_ballot`.
    pub fn load_ballots(&self, election_id: Uuid) -> Result<usize, Error> {
        match self.elections.election_state(election_id) {
            None => return Err(StateError::UnknownElection(election_id).into()),
            Some(ElectionState::Created) => {
                return Err(StateError::ElectionNotOpen(election_id).into())
            }
            Some(_) => {}
        }
        let public_key = self.public_key(election_id)?;
        let handle = self.accumulator_handle(election_id)?;

        let mut accumulator = handle.lock();
        if accumulator.frozen {
            return Err(StateError::TallyStarted(election_id).into());
        }
        Ok(self.fold_source(election_id, &public_key, &mut accumulator))
    }

    fn fold_source(
        &self,
        election_id: Uuid,
        public_key: &PaillierPublicKey,
        accumulator: &mut Accumulator,
    ) -> usize {
        if accumulator.source_loaded {
            return 0;
        }
        let mut loaded = 0;
        let mut rejected = 0;
        for ballot in self.elections.ballots(election_id) {
            match accumulator.check(public_key, &ballot) {
                Ok(()) => {
                    accumulator.fold(public_key, &ballot);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!("skipping ballot in election {}: {}", election_id, e);
                    rejected += 1;
                }
            }
        }
        accumulator.source_loaded = true;
        if loaded > 0 || rejected > 0 {
            tracing::info!(
                "loaded {} ballots for election {} from its source, {} rejected",
                loaded,
                election_id,
                rejected
            );
        }
        rejected
    }

    /// The encrypted per-candidate totals. Readable only once the election is closed.
    ///
    /// The first read loads any ballots still waiting in the election source
    /// and freezes the totals.
    pub fn accumulator(&self, election_id: Uuid) -> Result<IndexMap<String, Ciphertext>, Error> {
        self.elections
            .require_state(election_id, ElectionState::Closed)?;
        let public_key = self.public_key(election_id)?;
        let handle = self.accumulator_handle(election_id)?;

        let mut accumulator = handle.lock();
        if !accumulator.frozen {
            self.fold_source(election_id, &public_key, &mut accumulator);
            accumulator.frozen = true;
            tracing::debug!(
                "election {} totals frozen at {} ballots",
                election_id,
                accumulator.ballots
            );
        }
        Ok(accumulator.totals.clone())
    }

    /// Number of ballots folded so far
    pub fn ballots_recorded(&self, election_id: Uuid) -> Result<u64, Error> {
        Ok(self.accumulator_handle(election_id)?.lock().ballots)
    }

    /// Decrypt the totals with the single-authority key
    pub fn tally(&self, election_id: Uuid) -> Result<TallyResult, Error> {
        let totals = self.accumulator(election_id)?;
        let keys = self.election_keys(election_id)?;
        if keys.threshold().is_some() {
            return Err(StateError::ThresholdRequired(election_id).into());
        }

        let private_key = load_private_key(self.custody.as_ref(), election_id)?;
        let mut counts = IndexMap::new();
        for (candidate, ciphertext) in totals {
            counts.insert(candidate, to_count(private_key.decrypt(&ciphertext))?);
        }

        let result = TallyResult::from_totals(election_id, counts, false, 0);
        self.record_tally(&result)?;
        Ok(result)
    }

    /// Decrypt the totals with λ rebuilt from trustee shares
    pub fn threshold_tally(
        &self,
        election_id: Uuid,
        shares: &[TrusteeShare],
    ) -> Result<TallyResult, Error> {
        let totals = self.accumulator(election_id)?;
        let keys = self.election_keys(election_id)?;
        let (_, threshold) = keys
            .threshold()
            .ok_or(StateError::NotThreshold(election_id))?;

        let custodian = ShareCustodian::new(self.custody.clone());
        let decryptor = ThresholdDecryptor {
            election_id,
            public_key: &keys.public_key,
            threshold,
            custodian: &custodian,
        };

        let ciphertexts: Vec<&Ciphertext> = totals.values().collect();
        let plaintexts = match decryptor.decrypt_all(&ciphertexts, shares) {
            Ok(plaintexts) => plaintexts,
            Err(e) => {
                self.audit.record(
                    AuditEvent::new(THRESHOLD_DECRYPTION_FAILED, "TallyEngine", "threshold_tally")
                        .with("election_id", election_id.to_string())
                        .with("shares_provided", shares.len())
                        .with("reason", e.to_string()),
                )?;
                return Err(e);
            }
        };

        let mut counts = IndexMap::new();
        for (candidate, plaintext) in totals.keys().zip(plaintexts) {
            counts.insert(candidate.clone(), to_count(plaintext)?);
        }

        let result = TallyResult::from_totals(election_id, counts, true, shares.len());
        self.audit.record(
            AuditEvent::new(THRESHOLD_DECRYPTION_SUCCESS, "TallyEngine", "threshold_tally")
                .with("election_id", election_id.to_string())
                .with("shares_used", shares.len()),
        )?;
        self.record_tally(&result)?;
        Ok(result)
    }

    pub fn get_readiness(&self, election_id: Uuid) -> Result<Readiness, Error> {
        let keys = self.election_keys(election_id)?;
        let readiness = match keys.threshold() {
            Some((trustees, threshold)) => {
                let available = ShareCustodian::new(self.custody.clone())
                    .available_shares(election_id, trustees)?;
                Readiness {
                    total_trustees: trustees,
                    threshold,
                    available_shares: available,
                    can_decrypt: available >= threshold,
                }
            }
            None => {
                let present = self
                    .custody
                    .retrieve_secret(&private_key_custody_id(election_id))?
                    .is_some();
                Readiness {
                    total_trustees: 1,
                    threshold: 1,
                    available_shares: present as usize,
                    can_decrypt: present,
                }
            }
        };
        Ok(readiness)
    }

    fn record_tally(&self, result: &TallyResult) -> Result<(), Error> {
        tracing::info!(
            "election {} tallied: {} votes, winners {:?}",
            result.election_id,
            result.total_votes,
            result.winners
        );
        self.audit.record(
            AuditEvent::new(ELECTION_TALLIED, "TallyEngine", "tally")
                .with("election_id", result.election_id.to_string())
                .with("total_votes", result.total_votes)
                .with("is_tie", result.is_tie)
                .with("threshold_used", result.threshold_used),
        )?;
        Ok(())
    }
}

fn to_count(plaintext: BigUint) -> Result<u64, Error> {
    plaintext
        .to_u64()
        .ok_or_else(|| ProtocolViolation::PlaintextOutOfRange.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn totals(pairs: &[(&str, u64)]) -> IndexMap<String, u64> {
        pairs.iter().map(|(c, n)| (c.to_string(), *n)).collect()
    }

    fn engine() -> (TallyEngine, Arc<MemElectionSource>, Uuid) {
        let custody: Arc<dyn KeyCustody> = Arc::new(SoftwareCustody::new());
        let audit = Arc::new(AuditLog::new(custody.clone(), RecordSettings::default()));
        let elections = Arc::new(MemElectionSource::default());
        let id = elections.create(
            "Board seat",
            vec![Candidate::new("A", "Alice"), Candidate::new("B", "Bob")],
        );
        let engine = TallyEngine::new(
            elections.clone(),
            custody,
            audit,
            TallySettings { prime_bits: 128 },
        );
        engine.setup_election(id, KeyMode::SingleAuthority).unwrap();
        (engine, elections, id)
    }

    fn ballot(engine: &TallyEngine, id: Uuid, candidate: &str) -> Ballot {
        let public_key = engine.public_key(id).unwrap();
        Ballot {
            candidate_id: candidate.to_owned(),
            ciphertext: public_key.encrypt_u64(&mut rand::thread_rng(), 1).unwrap(),
        }
    }

    #[test]
    fn test_tally_folds_source_ballots() {
        let (engine, elections, id) = engine();
        for candidate in &["A", "A", "B", "A", "B", "C"] {
            elections.add_ballot(id, ballot(&engine, id, candidate));
        }
        elections.set_state(id, ElectionState::Closed).unwrap();

        let result = engine.tally(id).unwrap();
        assert_eq!(result.totals, totals(&[("A", 3), ("B", 2)]));
        assert_eq!(result.winners, vec!["A".to_owned()]);
        assert_eq!(engine.ballots_recorded(id).unwrap(), 5);

        // A second tally reads the same frozen totals
        assert_eq!(engine.tally(id).unwrap().totals, result.totals);
        assert!(matches!(
            engine.load_ballots(id),
            Err(Error::State(StateError::TallyStarted(_)))
        ));
    }

    #[test]
    fn test_load_ballots_only_once() {
        let (engine, elections, id) = engine();
        assert!(matches!(
            engine.load_ballots(id),
            Err(Error::State(StateError::ElectionNotOpen(_)))
        ));

        elections.set_state(id, ElectionState::Open).unwrap();
        elections.add_ballot(id, ballot(&engine, id, "A"));
        elections.add_ballot(id, ballot(&engine, id, "A"));
        assert_eq!(engine.load_ballots(id).unwrap(), 0);
        engine.record_ballot(id, &ballot(&engine, id, "B")).unwrap();
        assert_eq!(engine.load_ballots(id).unwrap(), 0);

        elections.set_state(id, ElectionState::Closed).unwrap();
        let result = engine.tally(id).unwrap();
        assert_eq!(result.totals, totals(&[("A", 2), ("B", 1)]));
    }

    #[test]
    fn test_totals_frozen_after_first_read() {
        let (engine, elections, id) = engine();
        elections.set_state(id, ElectionState::Open).unwrap();
        engine.record_ballot(id, &ballot(&engine, id, "A")).unwrap();

        elections.set_state(id, ElectionState::Closed).unwrap();
        engine.accumulator(id).unwrap();

        // Reopening the election does not reopen the totals
        elections.set_state(id, ElectionState::Open).unwrap();
        let late = ballot(&engine, id, "B");
        assert!(matches!(
            engine.validate_ballot(id, &late),
            Err(Error::State(StateError::ElectionNotOpen(_)))
        ));
        let mut accepted = false;
        let err = engine
            .record_ballot_with(id, &late, || {
                accepted = true;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, Error::State(StateError::ElectionNotOpen(_))));
        assert!(!accepted);

        elections.set_state(id, ElectionState::Closed).unwrap();
        assert_eq!(engine.tally(id).unwrap().totals, totals(&[("A", 1), ("B", 0)]));
    }

    #[test]
    fn test_winners() {
        let id = Uuid::new_v4();
        let result = TallyResult::from_totals(id, totals(&[("A", 3), ("B", 2)]), false, 0);
        assert_eq!(result.total_votes, 5);
        assert_eq!(result.winners, vec!["A".to_owned()]);
        assert!(!result.is_tie);

        let tied = TallyResult::from_totals(id, totals(&[("A", 2), ("B", 2)]), false, 0);
        assert_eq!(tied.winners, vec!["A".to_owned(), "B".to_owned()]);
        assert!(tied.is_tie);

        let empty = TallyResult::from_totals(id, IndexMap::new(), false, 0);
        assert!(empty.winners.is_empty());
        assert!(!empty.is_tie);
    }
}
