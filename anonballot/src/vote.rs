use crate::*;
use std::sync::Arc;
use uuid::Uuid;

/// What a voter keeps after casting: enough to find and check their ballot on
/// the bulletin board, and nothing that identifies them.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BallotReceipt {
    pub tracking_code: Uuid,
    pub entry_hash: String,
}

/// Accepts ballots cast with anonymous credentials
pub struct VotingService {
    guard: Arc<ConsumptionGuard>,
    board: Arc<BulletinBoard>,
    tally: Arc<TallyEngine>,
    audit: Arc<AuditLog>,
}

impl VotingService {
    pub fn new(
        guard: Arc<ConsumptionGuard>,
        board: Arc<BulletinBoard>,
        tally: Arc<TallyEngine>,
        audit: Arc<AuditLog>,
    ) -> Self {
        VotingService {
            guard,
            board,
            tally,
            audit,
        }
    }

    /// Cast `ballot` in `election_id`, spending the credential `token`.
    ///
    /// The election state and the ballot are checked before the credential is
    /// touched, so a malformed ballot or a closed election never costs the
    /// voter their credential. Checking, spending, posting and folding all
    /// happen under the election's accumulator lock, so a ballot on the board
    /// is always one the tally counts.
    pub fn cast_ballot(
        &self,
        token: &str,
        election_id: Uuid,
        ballot: &Ballot,
    ) -> Result<BallotReceipt, Error> {
        let (entry, root_before) = self.tally.record_ballot_with(election_id, ballot, || {
            self.guard.consume(token, election_id, "cast_ballot")?;

            // The credential is spent from here on
            let root_before = self.board.current_root();
            let entry = self.board.post_ballot(election_id, ballot).map_err(|e| {
                tracing::error!(
                    "credential {} spent but ballot not posted: {}",
                    mask_token(token),
                    e
                );
                e
            })?;
            Ok((entry, root_before))
        })?;

        if entry.merkle_root.is_some() && entry.merkle_root != root_before {
            let _ = self.audit.record(
                AuditEvent::new(MERKLE_ROOT_UPDATED, "VotingService", "cast_ballot")
                    .with("record", BallotPost::RECORD_NAME)
                    .with("sequence", entry.sequence)
                    .with("root", entry.merkle_root.clone().unwrap_or_default()),
            );
        }
        let _ = self.audit.record(
            AuditEvent::new(VOTE_CAST, "VotingService", "cast_ballot")
                .with("election_id", election_id.to_string()),
        );

        tracing::info!("ballot cast in election {}", election_id);
        Ok(BallotReceipt {
            tracking_code: entry.payload.tracking_code,
            entry_hash: entry.entry_hash,
        })
    }

    pub fn verify_receipt(&self, receipt: &BallotReceipt) -> Result<ReceiptStatus, Error> {
        self.board
            .verify_receipt(receipt.tracking_code, &receipt.entry_hash)
    }
}
