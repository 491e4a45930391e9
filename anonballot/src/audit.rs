use crate::*;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value;

pub const TOKEN_CONSUMED: &str = "TOKEN_CONSUMED";
pub const TOKEN_REVOKED: &str = "TOKEN_REVOKED";
pub const TOKEN_CLEANUP: &str = "TOKEN_CLEANUP";
pub const ANONYMOUS_TOKEN_ISSUED: &str = "ANONYMOUS_TOKEN_ISSUED";
pub const VOTE_CAST: &str = "VOTE_CAST";
pub const ELECTION_KEYS_GENERATED: &str = "ELECTION_KEYS_GENERATED";
pub const ELECTION_TALLIED: &str = "ELECTION_TALLIED";
pub const THRESHOLD_DECRYPTION_SUCCESS: &str = "THRESHOLD_DECRYPTION_SUCCESS";
pub const THRESHOLD_DECRYPTION_FAILED: &str = "THRESHOLD_DECRYPTION_FAILED";
pub const CHAIN_INTEGRITY_FAILURE: &str = "CHAIN_INTEGRITY_FAILURE";
pub const MERKLE_ROOT_UPDATED: &str = "MERKLE_ROOT_UPDATED";

/// A system event, as recorded in the audit log
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AuditEvent {
    pub event_type: String,
    pub service: String,
    pub operation: String,
    pub data: IndexMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(event_type: &str, service: &str, operation: &str) -> Self {
        AuditEvent {
            event_type: event_type.to_owned(),
            service: service.to_owned(),
            operation: operation.to_owned(),
            data: IndexMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with<V: Into<Value>>(mut self, key: &str, value: V) -> Self {
        self.data.insert(key.to_owned(), value.into());
        self
    }
}

impl RecordPayload for AuditEvent {
    const SIGNING_KEY: &'static str = AUDIT_LOG_KEY;
    const RECORD_NAME: &'static str = "audit log";
}

/// The system-wide audit log
pub type AuditLog = HashChain<AuditEvent>;

impl HashChain<AuditEvent> {
    /// Append an event. Failures are returned, and also logged since callers on
    /// rejection paths have nowhere else to report them.
    pub fn record(&self, event: AuditEvent) -> Result<RecordEntry<AuditEvent>, Error> {
        let event_type = event.event_type.clone();
        self.append(event).map_err(|e| {
            tracing::error!("failed to append {} audit event: {}", event_type, e);
            e
        })
    }

    pub fn events_of_type(&self, event_type: &str) -> Result<Vec<AuditEvent>, Error> {
        Ok(self
            .entries()?
            .into_iter()
            .map(|e| e.payload)
            .filter(|e| e.event_type == event_type)
            .collect())
    }
}
