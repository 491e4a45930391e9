//! Periodic jobs. Nothing here schedules itself; the daemon calls `run` on a timer.

use crate::*;
use std::sync::Arc;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub credentials_deactivated: usize,
    pub sessions_removed: usize,
}

/// Retires expired credentials and signing sessions
pub struct ExpirySweeper {
    guard: Arc<ConsumptionGuard>,
    issuer: Arc<CredentialIssuer>,
}

impl ExpirySweeper {
    pub fn new(guard: Arc<ConsumptionGuard>, issuer: Arc<CredentialIssuer>) -> Self {
        ExpirySweeper { guard, issuer }
    }

    pub fn run(&self) -> Result<SweepSummary, Error> {
        Ok(SweepSummary {
            credentials_deactivated: self.guard.sweep_expired()?,
            sessions_removed: self.issuer.expire_sessions()?,
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IntegrityStatus {
    pub bulletin_board: IntegrityReport,
    pub audit_log: IntegrityReport,
}

impl IntegrityStatus {
    pub fn is_intact(&self) -> bool {
        self.bulletin_board.overall_integrity && self.audit_log.overall_integrity
    }
}

/// Re-verifies both records and raises the alarm when either is compromised
pub struct IntegrityMonitor {
    board: Arc<BulletinBoard>,
    audit: Arc<AuditLog>,
}

impl IntegrityMonitor {
    pub fn new(board: Arc<BulletinBoard>, audit: Arc<AuditLog>) -> Self {
        IntegrityMonitor { board, audit }
    }

    pub fn run(&self) -> Result<IntegrityStatus, Error> {
        let status = IntegrityStatus {
            bulletin_board: self.board.verify_all()?,
            audit_log: self.audit.verify_all()?,
        };

        for (record, report) in &[
            (BallotPost::RECORD_NAME, &status.bulletin_board),
            (AuditEvent::RECORD_NAME, &status.audit_log),
        ] {
            if report.overall_integrity {
                continue;
            }
            tracing::error!(
                "INTEGRITY ALARM: {} compromised (first broken entry {:?})",
                record,
                report.first_broken
            );
            // Written even when the audit log is the compromised record
            let _ = self.audit.record(
                AuditEvent::new(CHAIN_INTEGRITY_FAILURE, "IntegrityMonitor", "run")
                    .with("record", *record)
                    .with("chain_valid", report.chain_valid)
                    .with("merkle_valid", report.merkle_valid)
                    .with("signatures_valid", report.signatures_valid)
                    .with("first_broken", serde_json::json!(report.first_broken)),
            );
        }

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint_dig::BigUint;
    use uuid::Uuid;

    #[test]
    fn test_monitor_raises_alarm() {
        let custody: Arc<dyn KeyCustody> = Arc::new(SoftwareCustody::new());
        let store = Arc::new(MemRecordStore::default());
        let board = Arc::new(
            BulletinBoard::open(
                store.clone(),
                custody.clone(),
                Arc::new(SystemClock),
                RecordSettings::default(),
            )
            .unwrap(),
        );
        let audit = Arc::new(AuditLog::new(custody, RecordSettings::default()));
        let monitor = IntegrityMonitor::new(board.clone(), audit.clone());

        let ballot = Ballot {
            candidate_id: "A".to_owned(),
            ciphertext: Ciphertext(BigUint::from(7u32)),
        };
        let election_id = Uuid::new_v4();
        let first = board.post_ballot(election_id, &ballot).unwrap();
        board.post_ballot(election_id, &ballot).unwrap();

        assert!(monitor.run().unwrap().is_intact());
        assert!(audit.events_of_type(CHAIN_INTEGRITY_FAILURE).unwrap().is_empty());

        let mut forged = first;
        forged.payload.election_id = Uuid::new_v4();
        store.overwrite(forged);

        let status = monitor.run().unwrap();
        assert!(!status.is_intact());
        assert_eq!(status.bulletin_board.first_broken, Some(0));
        assert!(status.audit_log.overall_integrity);

        let alarms = audit.events_of_type(CHAIN_INTEGRITY_FAILURE).unwrap();
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].data["record"], "bulletin board");
    }
}
