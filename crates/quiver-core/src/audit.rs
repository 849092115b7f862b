//! Structured security-event reporting.
//!
//! Every engine operation, success or failure, emits exactly one
//! [`AuditEvent`] to the configured [`AuditSink`]. Events are the only
//! externally observable trace of crypto operations and therefore never
//! carry key material, plaintext, or passphrases: ids, counts, durations,
//! and taxonomy codes only.

use std::sync::{Arc, Mutex};

/// Kind of operation an audit event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEventKind {
    /// Identity key pair generation.
    KeyGeneration,
    /// Signed pre-key generation/rotation.
    SignedPreKeyGeneration,
    /// One-time pre-key batch generation.
    OneTimePreKeyGeneration,
    /// Public bundle retrieval.
    BundleFetch,
    /// X3DH session establishment.
    Exchange,
    /// Message encryption.
    Encrypt,
    /// Message decryption.
    Decrypt,
    /// Session deletion.
    SessionDelete,
    /// Peer identity verification.
    TrustVerification,
    /// Rotation-scheduler run.
    Rotation,
    /// Backup creation.
    BackupCreate,
    /// Backup restore.
    BackupRestore,
}

/// One structured security event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    /// What happened.
    pub kind: AuditEventKind,
    /// User the operation ran for.
    pub user_id: String,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Taxonomy code on failure.
    pub error_code: Option<String>,
    /// Wall-clock duration of the operation.
    pub duration_ms: u64,
    /// Peer address, for session-scoped operations.
    pub peer: Option<String>,
    /// Key or backup id, where one was involved.
    pub key_id: Option<u64>,
    /// Batch size or message length, where meaningful.
    pub count: Option<u64>,
}

/// Receives audit events from the engine.
///
/// Implementations must tolerate concurrent callers; the engine never
/// retries or buffers, so a sink that drops events drops them silently.
pub trait AuditSink: Send + Sync {
    /// Record one event.
    fn record(&self, event: AuditEvent);
}

/// In-memory sink for tests and local inspection.
///
/// Clones share the same underlying buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events.
    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Events of one kind, in arrival order.
    pub fn events_of(&self, kind: AuditEventKind) -> Vec<AuditEvent> {
        self.events().into_iter().filter(|e| e.kind == kind).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: AuditEventKind, success: bool) -> AuditEvent {
        AuditEvent {
            kind,
            user_id: "alice".to_string(),
            success,
            error_code: None,
            duration_ms: 1,
            peer: None,
            key_id: None,
            count: None,
        }
    }

    #[test]
    fn records_in_order() {
        let sink = MemoryAuditSink::new();
        sink.record(event(AuditEventKind::KeyGeneration, true));
        sink.record(event(AuditEventKind::Encrypt, false));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, AuditEventKind::KeyGeneration);
        assert_eq!(events[1].kind, AuditEventKind::Encrypt);
    }

    #[test]
    fn clones_share_the_buffer() {
        let sink = MemoryAuditSink::new();
        let other = sink.clone();

        sink.record(event(AuditEventKind::Exchange, true));
        assert_eq!(other.events().len(), 1);
    }

    #[test]
    fn filters_by_kind() {
        let sink = MemoryAuditSink::new();
        sink.record(event(AuditEventKind::Encrypt, true));
        sink.record(event(AuditEventKind::Decrypt, true));
        sink.record(event(AuditEventKind::Encrypt, false));

        assert_eq!(sink.events_of(AuditEventKind::Encrypt).len(), 2);
        assert_eq!(sink.events_of(AuditEventKind::Decrypt).len(), 1);
    }
}
