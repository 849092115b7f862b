//! Quiver key-lifecycle and secure-session engine.
//!
//! The operational layer over [`quiver_crypto`]: key generation with
//! at-rest sealing, single-use enforcement for one-time pre-keys, X3DH
//! session establishment, Double Ratchet messaging over persisted sessions,
//! scheduled rotation, and passphrase-protected backup with one-time
//! restore.
//!
//! # Architecture
//!
//! ```text
//! Engine (audit, tracing, error taxonomy)
//!   ├── IdentityKeyManager ──┐
//!   ├── PreKeyManager ───────┤
//!   ├── KeyExchangeEngine ───┼── KeyVault (sealed private material)
//!   ├── RatchetCipher ───────┤        │
//!   ├── RotationScheduler ───┤        ▼
//!   └── BackupService ───────┴── KeyStore (atomic conditional updates)
//! ```
//!
//! Correctness comes from protocol invariants enforced at the store
//! boundary, not inspection:
//!
//! - one-time pre-key consumption is a single compare-and-set: at most one
//!   caller ever succeeds per key id
//! - exactly one signed pre-key is active per device; the swap commits
//!   atomically
//! - sessions advance through optimistic versioning; ratchet state never
//!   rolls backward
//! - private key material exists in plaintext only inside one operation's
//!   scope and never reaches logs, audit events, or return values

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod audit;
pub mod backup;
pub mod cipher;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod identity;
pub mod prekeys;
pub mod records;
pub mod rotation;
pub mod store;
pub mod trust;
pub mod vault;

pub use audit::{AuditEvent, AuditEventKind, AuditSink, MemoryAuditSink};
pub use backup::RestoreSummary;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::EngineError;
pub use exchange::ExchangeReceipt;
pub use identity::PublicIdentity;
pub use records::{
    BackupInfo, PeerAddress, RotationEntry, RotationKind, SessionStatus, TrustLevel,
};
pub use rotation::RotationPolicy;
pub use store::{KeyStore, MemoryStore, StoreError};
pub use vault::KeyVault;
