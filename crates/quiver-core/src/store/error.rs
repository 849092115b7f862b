//! Storage error types.
//!
//! Split by what the caller can do about them: `NotFound`/`AlreadyExists`/
//! `AlreadyUsed`/`VersionConflict` are expected conditional-update outcomes
//! the managers translate into the engine taxonomy, while `Serialization`
//! and `Io` are genuine store failures.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The requested record does not exist.
    #[error("{entity} not found")]
    NotFound {
        /// Entity kind that was missing.
        entity: &'static str,
    },

    /// A record already exists where an insert required absence.
    #[error("{entity} already exists")]
    AlreadyExists {
        /// Entity kind that collided.
        entity: &'static str,
    },

    /// A single-use record was already consumed.
    ///
    /// This is the losing side of the compare-and-set that enforces
    /// exactly-once consumption.
    #[error("{entity} {id} already used")]
    AlreadyUsed {
        /// Entity kind that was contested.
        entity: &'static str,
        /// Id of the contested record.
        id: u64,
    },

    /// An optimistic update lost: the stored version moved on.
    #[error("version conflict: expected {expected}, found {found}")]
    VersionConflict {
        /// Version the caller read.
        expected: u64,
        /// Version actually stored.
        found: u64,
    },

    /// Encoding or decoding stored data failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Underlying storage system failure.
    #[error("I/O error: {0}")]
    Io(String),
}
