use crate::config::Config;
use anonballot::*;
use std::sync::Arc;

/// The stores the scheduled tasks work over. A deployment hands in the same
/// stores its voting front end writes to.
pub struct Storage {
    pub credentials: Arc<dyn CredentialStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub audit: Arc<dyn RecordStore<AuditEvent>>,
    pub board: Arc<dyn RecordStore<BallotPost>>,
}

impl Storage {
    pub fn in_memory() -> Self {
        Storage {
            credentials: Arc::new(MemCredentialStore::default()),
            sessions: Arc::new(MemSessionStore::default()),
            audit: Arc::new(MemRecordStore::default()),
            board: Arc::new(MemRecordStore::default()),
        }
    }
}

/// The core components the scheduled tasks drive
pub struct Services {
    pub custody: Arc<dyn KeyCustody>,
    pub sweeper: ExpirySweeper,
    pub monitor: IntegrityMonitor,
}

impl Services {
    pub fn new(config: &Config, storage: &Storage) -> Result<Self, Error> {
        let custody = config.custody.build();
        Self::with_custody(config, storage, custody)
    }

    pub fn with_custody(
        config: &Config,
        storage: &Storage,
        custody: Arc<dyn KeyCustody>,
    ) -> Result<Self, Error> {
        if !custody.health_check() {
            return Err(CustodyError::DeviceUnavailable("health check failed".to_owned()).into());
        }

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let audit = Arc::new(AuditLog::open(
            storage.audit.clone(),
            custody.clone(),
            clock.clone(),
            config.record.clone(),
        )?);
        let board = Arc::new(BulletinBoard::open(
            storage.board.clone(),
            custody.clone(),
            clock.clone(),
            config.record.clone(),
        )?);

        tracing::info!("generating {}-bit blind signing key", config.rsa_bits);
        let mut rng = rand::rngs::OsRng {};
        let signing_key = BlindSigningKey::generate(&mut rng, config.rsa_bits)?;

        let issuer = Arc::new(CredentialIssuer::new(
            signing_key,
            storage.sessions.clone(),
            storage.credentials.clone(),
            audit.clone(),
            clock.clone(),
            config.issuance.clone(),
        ));
        let guard = Arc::new(ConsumptionGuard::new(
            storage.credentials.clone(),
            audit.clone(),
            clock,
            config.guard.clone(),
        ));

        Ok(Services {
            custody,
            sweeper: ExpirySweeper::new(guard, issuer),
            monitor: IntegrityMonitor::new(board, audit),
        })
    }
}

/// One pass of the periodic jobs: expiry sweep, then integrity verification
pub fn run_tasks(services: &Services) {
    match services.sweeper.run() {
        Ok(summary) => tracing::info!(
            "expiry sweep: {} credentials deactivated, {} sessions removed",
            summary.credentials_deactivated,
            summary.sessions_removed
        ),
        Err(e) => tracing::error!("expiry sweep failed [{}]: {}", e.kind().as_str(), e),
    }

    match services.monitor.run() {
        Ok(status) if status.is_intact() => {
            tracing::info!(
                "records intact: {} board entries, {} audit entries",
                status.bulletin_board.total_entries,
                status.audit_log.total_entries
            );
        }
        // The monitor has already raised the alarm; keep the full report in the log
        Ok(status) => match serde_json::to_string(&status) {
            Ok(report) => tracing::error!("integrity report: {}", report),
            Err(e) => tracing::error!("could not serialize integrity report: {}", e),
        },
        Err(e) => tracing::error!("integrity check failed [{}]: {}", e.kind().as_str(), e),
    }

    if !services.custody.health_check() {
        tracing::error!("key custody failed its health check");
    }
}
