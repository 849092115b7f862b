//! Error types for cryptographic primitives.
//!
//! Verification failures carry no detail beyond the failing check so that
//! callers cannot leak anything an attacker could use to distinguish failure
//! modes. Randomness failures are separated because they indicate an
//! environment problem, not an attack.

use thiserror::Error;

/// Errors that can occur in cryptographic primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The operating system's secure random source was unavailable.
    #[error("secure randomness unavailable")]
    RandomnessUnavailable,

    /// A public key, signature, or secret had an invalid encoding.
    #[error("invalid {what} encoding")]
    InvalidKeyMaterial {
        /// What failed to decode (e.g. "public key", "signature").
        what: &'static str,
    },

    /// A signature did not verify against the claimed public key.
    ///
    /// Never retried: a bad signature cannot become valid, and retrying
    /// may mask an active attack.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// AEAD open failed: wrong key, wrong nonce, or tampered ciphertext.
    ///
    /// The underlying tag comparison is constant-time, so the reason is
    /// deliberately not distinguished.
    #[error("decryption failed")]
    DecryptFailed,

    /// A ratchet was asked for a message key it has already advanced past
    /// and no skipped key was buffered for it.
    #[error("message key unavailable: chain at {current}, requested {requested}")]
    MessageKeyUnavailable {
        /// Current receiving-chain counter.
        current: u32,
        /// Counter the message claimed.
        requested: u32,
    },

    /// A message would require skipping more keys than the buffer allows.
    #[error("skip limit exceeded: chain at {current}, requested {requested}")]
    SkipLimitExceeded {
        /// Current receiving-chain counter.
        current: u32,
        /// Counter the message claimed.
        requested: u32,
    },

    /// The passphrase KDF rejected its parameters.
    #[error("passphrase key derivation failed")]
    PassphraseKdfFailed,
}
