//! At-rest protection for private key bytes.
//!
//! The vault is the sole holder of the wrapping key (provisioned by an
//! external KMS collaborator) and the only component that sees private key
//! material in plaintext. Everything it returns is wrapped in `Zeroizing`,
//! and nothing retains unsealed bytes beyond one operation's scope.
//!
//! Each sealed blob is bound to its record identity through the AEAD
//! associated data, so a blob copied onto a different record fails to open.

use quiver_crypto::aead;
use rand::{CryptoRng, RngCore};
use zeroize::{Zeroize, Zeroizing};

use crate::error::EngineError;

/// Seals and opens private key bytes under the external wrapping key.
pub struct KeyVault {
    wrapping_key: [u8; 32],
}

impl Clone for KeyVault {
    fn clone(&self) -> Self {
        Self { wrapping_key: self.wrapping_key }
    }
}

impl Drop for KeyVault {
    fn drop(&mut self) {
        self.wrapping_key.zeroize();
    }
}

impl KeyVault {
    /// Create a vault around a provisioned wrapping key.
    pub fn new(wrapping_key: [u8; 32]) -> Self {
        Self { wrapping_key }
    }

    /// Seal secret bytes for storage, bound to `aad`.
    pub fn seal(
        &self,
        aad: &str,
        secret: &[u8],
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<Vec<u8>, EngineError> {
        aead::seal(&self.wrapping_key, aad.as_bytes(), secret, rng).map_err(|_| {
            EngineError::KeyGenerationFailure { reason: "sealing randomness unavailable".into() }
        })
    }

    /// Open a sealed blob. Failure means the wrapping key is wrong or the
    /// blob was tampered with or moved; fatal for the record, surfaced as
    /// a storage failure since no retry can help.
    pub fn open(&self, aad: &str, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, EngineError> {
        aead::open(&self.wrapping_key, aad.as_bytes(), blob)
            .map(Zeroizing::new)
            .map_err(|_| EngineError::StorageFailure {
                detail: format!("sealed record unreadable: {aad}"),
            })
    }

    /// Open a sealed blob that must be exactly 32 bytes.
    pub fn open_key(&self, aad: &str, blob: &[u8]) -> Result<Zeroizing<[u8; 32]>, EngineError> {
        let bytes = self.open(aad, blob)?;
        let mut key = Zeroizing::new([0u8; 32]);
        if bytes.len() != 32 {
            return Err(EngineError::StorageFailure {
                detail: format!("sealed record has wrong length: {aad}"),
            });
        }
        key.copy_from_slice(&bytes);
        Ok(key)
    }
}

/// AAD for a sealed identity secret.
pub(crate) fn identity_aad(user_id: &str) -> String {
    format!("identity:{user_id}")
}

/// AAD for a sealed signed-pre-key secret.
pub(crate) fn signed_pre_key_aad(user_id: &str, key_id: u32) -> String {
    format!("spk:{user_id}:{key_id}")
}

/// AAD for a sealed one-time-pre-key secret.
pub(crate) fn one_time_pre_key_aad(user_id: &str, key_id: u32) -> String {
    format!("otp:{user_id}:{key_id}")
}

/// AAD for a sealed session ratchet state.
pub(crate) fn session_aad(owner: &str, peer: &crate::records::PeerAddress) -> String {
    format!("session:{owner}:{peer}")
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let vault = KeyVault::new([7u8; 32]);
        let sealed = vault.seal("identity:alice", b"secret bytes", &mut OsRng).unwrap();

        assert_ne!(sealed, b"secret bytes");
        let opened = vault.open("identity:alice", &sealed).unwrap();
        assert_eq!(opened.as_slice(), b"secret bytes");
    }

    #[test]
    fn blob_is_bound_to_its_record() {
        let vault = KeyVault::new([7u8; 32]);
        let sealed = vault.seal(&identity_aad("alice"), b"secret", &mut OsRng).unwrap();

        let result = vault.open(&identity_aad("mallory"), &sealed);
        assert!(matches!(result, Err(EngineError::StorageFailure { .. })));
    }

    #[test]
    fn wrong_wrapping_key_fails() {
        let vault = KeyVault::new([7u8; 32]);
        let sealed = vault.seal("aad", b"secret", &mut OsRng).unwrap();

        let other = KeyVault::new([8u8; 32]);
        assert!(other.open("aad", &sealed).is_err());
    }

    #[test]
    fn open_key_enforces_length() {
        let vault = KeyVault::new([7u8; 32]);
        let sealed = vault.seal("aad", &[1u8; 16], &mut OsRng).unwrap();

        let result = vault.open_key("aad", &sealed);
        assert!(matches!(result, Err(EngineError::StorageFailure { .. })));
    }
}
