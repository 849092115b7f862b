//! Quiver Cryptographic Primitives
//!
//! Cryptographic building blocks for the Quiver key-lifecycle engine. Pure
//! functions and value types with deterministic outputs; callers provide
//! random bytes, which keeps every primitive testable with a seeded RNG.
//!
//! # Key Lifecycle
//!
//! Sessions are established asynchronously from published key bundles and
//! then ratchet a fresh key per message:
//!
//! ```text
//! Identity keys + Pre-key bundle
//!        │
//!        ▼
//! X3DH → Session Secret (per peer pair)
//!        │
//!        ▼
//! Double Ratchet → Message Keys (one per message)
//!        │
//!        ▼
//! AEAD Encryption → Ciphertext
//! ```
//!
//! Message keys are used for exactly one encryption operation and discarded;
//! chain keys are overwritten on every step.
//!
//! # Security
//!
//! Forward Secrecy:
//! - Chain advancement: old chain keys are zeroized after deriving the next
//! - One-time pre-keys: consumed exactly once, enforced by the caller's store
//! - Message key disposal: keys are zeroized immediately after single use
//!
//! Authenticity:
//! - Signed pre-keys carry an Ed25519 signature by the identity key; bundle
//!   verification fails closed before any agreement is computed
//! - XChaCha20-Poly1305 AEAD with the message header bound as associated
//!   data; the tag comparison is constant-time
//!
//! Post-Compromise Security:
//! - Every direction change in a conversation mixes a fresh DH output into
//!   the root key, healing a transient compromise

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod password;
pub mod ratchet;
pub mod x3dh;

pub use aead::{NONCE_LEN, TAG_LEN};
pub use error::CryptoError;
pub use keys::{
    DhKeyPair, KEY_LEN, SIGNATURE_LEN, SigningKeyPair, generate_registration_id, verify_signature,
};
pub use ratchet::{MAX_SKIP, RatchetHeader, RatchetMessage, RatchetState};
pub use x3dh::{Initiation, PreKeyBundle};
