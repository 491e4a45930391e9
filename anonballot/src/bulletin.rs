use crate::*;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A cast ballot as published on the bulletin board.
///
/// Only the hash of the ciphertext is posted, never the candidate it was cast for.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BallotPost {
    pub election_id: Uuid,
    pub tracking_code: Uuid,
    pub ballot_hash: String,
    pub posted_at: DateTime<Utc>,
}

impl RecordPayload for BallotPost {
    const SIGNING_KEY: &'static str = BULLETIN_BOARD_KEY;
    const RECORD_NAME: &'static str = "bulletin board";
}

/// Outcome of checking a voter's receipt against the board
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiptStatus {
    /// Hash, chain link, signature and Merkle inclusion all check out
    FullyVerified,

    /// Sound so far, but the entry's Merkle batch has not closed yet
    PendingInclusion,
    VerificationFailed,
    EntryNotFound,
}

/// The public record of cast ballots
pub type BulletinBoard = HashChain<BallotPost>;

impl HashChain<BallotPost> {
    /// Publish a ballot under a fresh tracking code
    pub fn post_ballot(
        &self,
        election_id: Uuid,
        ballot: &Ballot,
    ) -> Result<RecordEntry<BallotPost>, Error> {
        let post = BallotPost {
            election_id,
            tracking_code: Uuid::new_v4(),
            ballot_hash: ballot.ciphertext.hash_hex(),
            posted_at: Utc::now(),
        };
        self.append(post)
    }

    pub fn find_by_tracking_code(
        &self,
        tracking_code: Uuid,
    ) -> Result<Option<RecordEntry<BallotPost>>, Error> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|e| e.payload.tracking_code == tracking_code))
    }

    pub fn election_posts(&self, election_id: Uuid) -> Result<Vec<RecordEntry<BallotPost>>, Error> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.payload.election_id == election_id)
            .collect())
    }

    /// Check that the entry behind `tracking_code` is the one the voter was
    /// handed, and that it is still intact.
    pub fn verify_receipt(
        &self,
        tracking_code: Uuid,
        expected_hash: &str,
    ) -> Result<ReceiptStatus, Error> {
        let entry = match self.find_by_tracking_code(tracking_code)? {
            Some(entry) => entry,
            None => return Ok(ReceiptStatus::EntryNotFound),
        };
        if entry.entry_hash != expected_hash {
            tracing::warn!("receipt {} does not match the posted entry", tracking_code);
            return Ok(ReceiptStatus::VerificationFailed);
        }

        let verification = self.verify_entry(&entry.entry_hash)?;
        let status = if !(verification.hash_valid
            && verification.chain_valid
            && verification.signature_valid)
        {
            ReceiptStatus::VerificationFailed
        } else {
            match verification.merkle {
                MerkleStatus::Included => ReceiptStatus::FullyVerified,
                MerkleStatus::Pending => ReceiptStatus::PendingInclusion,
                MerkleStatus::Invalid => ReceiptStatus::VerificationFailed,
            }
        };
        Ok(status)
    }

    /// Integrity report over the whole board
    pub fn verify_board(&self) -> Result<IntegrityReport, Error> {
        self.verify_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint_dig::BigUint;
    use std::sync::Arc;

    fn board(batch_size: usize) -> (BulletinBoard, Arc<MemRecordStore<BallotPost>>) {
        let store = Arc::new(MemRecordStore::default());
        let board = BulletinBoard::open(
            store.clone(),
            Arc::new(SoftwareCustody::new()),
            Arc::new(SystemClock),
            RecordSettings { batch_size },
        )
        .unwrap();
        (board, store)
    }

    fn ballot(value: u32) -> Ballot {
        Ballot {
            candidate_id: "A".to_owned(),
            ciphertext: Ciphertext(BigUint::from(value)),
        }
    }

    #[test]
    fn test_receipts() {
        let (board, _) = board(2);
        let election_id = Uuid::new_v4();

        let first = board.post_ballot(election_id, &ballot(11)).unwrap();
        assert_eq!(
            board
                .verify_receipt(first.payload.tracking_code, &first.entry_hash)
                .unwrap(),
            ReceiptStatus::PendingInclusion
        );

        let second = board.post_ballot(election_id, &ballot(13)).unwrap();
        for entry in &[&first, &second] {
            assert_eq!(
                board
                    .verify_receipt(entry.payload.tracking_code, &entry.entry_hash)
                    .unwrap(),
                ReceiptStatus::FullyVerified
            );
        }

        assert_eq!(
            board
                .verify_receipt(first.payload.tracking_code, &second.entry_hash)
                .unwrap(),
            ReceiptStatus::VerificationFailed
        );
        assert_eq!(
            board.verify_receipt(Uuid::new_v4(), &first.entry_hash).unwrap(),
            ReceiptStatus::EntryNotFound
        );
    }

    #[test]
    fn test_posts_hide_the_candidate() {
        let (board, _) = board(10);
        let entry = board.post_ballot(Uuid::new_v4(), &ballot(11)).unwrap();
        let posted = serde_json::to_string(&entry.payload).unwrap();
        assert!(!posted.contains("candidate"));
        assert_eq!(entry.payload.ballot_hash, ballot(11).ciphertext.hash_hex());
    }

    #[test]
    fn test_election_posts() {
        let (board, _) = board(10);
        let (one, two) = (Uuid::new_v4(), Uuid::new_v4());
        board.post_ballot(one, &ballot(1)).unwrap();
        board.post_ballot(two, &ballot(2)).unwrap();
        board.post_ballot(one, &ballot(3)).unwrap();

        assert_eq!(board.election_posts(one).unwrap().len(), 2);
        assert_eq!(board.election_posts(two).unwrap().len(), 1);
        assert!(board.verify_board().unwrap().overall_integrity);
    }

    #[test]
    fn test_tampered_post_fails_receipt() {
        let (board, store) = board(2);
        let election_id = Uuid::new_v4();
        let entry = board.post_ballot(election_id, &ballot(11)).unwrap();
        board.post_ballot(election_id, &ballot(13)).unwrap();

        let mut forged = entry.clone();
        forged.payload.ballot_hash = ballot(17).ciphertext.hash_hex();
        store.overwrite(forged);

        assert_eq!(
            board
                .verify_receipt(entry.payload.tracking_code, &entry.entry_hash)
                .unwrap(),
            ReceiptStatus::VerificationFailed
        );
        assert!(!board.verify_board().unwrap().overall_integrity);
    }
}
