use crate::*;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElectionState {
    Created,
    Open,
    Closed,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Election {
    pub id: Uuid,
    pub title: String,

    /// Candidates in ballot order. Tally totals keep this order.
    pub candidates: Vec<Candidate>,
    pub state: ElectionState,
}

/// Where elections and their ballots come from.
///
/// The lifecycle belongs to whoever implements this; the core only reads it.
pub trait ElectionSource: Send + Sync {
    fn election_state(&self, election_id: Uuid) -> Option<ElectionState>;

    fn candidates(&self, election_id: Uuid) -> Option<Vec<Candidate>>;

    /// Every ballot cast in the election
    fn ballots(&self, election_id: Uuid) -> Vec<Ballot>;

    fn require_state(&self, election_id: Uuid, expected: ElectionState) -> Result<(), StateError> {
        match self.election_state(election_id) {
            None => Err(StateError::UnknownElection(election_id)),
            Some(state) if state == expected => Ok(()),
            Some(_) => match expected {
                ElectionState::Closed => Err(StateError::ElectionNotClosed(election_id)),
                _ => Err(StateError::ElectionNotOpen(election_id)),
            },
        }
    }
}

/// A simple election source held in memory
#[derive(Default)]
pub struct MemElectionSource {
    elections: RwLock<HashMap<Uuid, Election>>,
    ballots: RwLock<HashMap<Uuid, Vec<Ballot>>>,
}

impl MemElectionSource {
    pub fn create(&self, title: &str, candidates: Vec<Candidate>) -> Uuid {
        let election = Election {
            id: Uuid::new_v4(),
            title: title.to_owned(),
            candidates,
            state: ElectionState::Created,
        };
        let id = election.id;
        self.elections.write().insert(id, election);
        id
    }

    pub fn set_state(&self, election_id: Uuid, state: ElectionState) -> Result<(), StateError> {
        let mut elections = self.elections.write();
        let election = elections
            .get_mut(&election_id)
            .ok_or(StateError::UnknownElection(election_id))?;
        election.state = state;
        Ok(())
    }

    pub fn add_ballot(&self, election_id: Uuid, ballot: Ballot) {
        self.ballots
            .write()
            .entry(election_id)
            .or_insert_with(Vec::new)
            .push(ballot);
    }

    pub fn get(&self, election_id: Uuid) -> Option<Election> {
        self.elections.read().get(&election_id).cloned()
    }
}

impl ElectionSource for MemElectionSource {
    fn election_state(&self, election_id: Uuid) -> Option<ElectionState> {
        self.elections.read().get(&election_id).map(|e| e.state)
    }

    fn candidates(&self, election_id: Uuid) -> Option<Vec<Candidate>> {
        self.elections
            .read()
            .get(&election_id)
            .map(|e| e.candidates.clone())
    }

    fn ballots(&self, election_id: Uuid) -> Vec<Ballot> {
        self.ballots
            .read()
            .get(&election_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_state() {
        let source = MemElectionSource::default();
        let id = source.create("Board", vec![Candidate::new("A", "Alice")]);

        assert_eq!(
            source.require_state(id, ElectionState::Closed),
            Err(StateError::ElectionNotClosed(id))
        );
        assert_eq!(
            source.require_state(id, ElectionState::Open),
            Err(StateError::ElectionNotOpen(id))
        );

        source.set_state(id, ElectionState::Open).unwrap();
        source.require_state(id, ElectionState::Open).unwrap();

        let missing = Uuid::new_v4();
        assert_eq!(
            source.require_state(missing, ElectionState::Open),
            Err(StateError::UnknownElection(missing))
        );
    }
}
