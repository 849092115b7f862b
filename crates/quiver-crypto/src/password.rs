//! Passphrase-based key derivation for backups.
//!
//! Argon2id with the crate defaults (19 MiB, 2 iterations), a random
//! 16-byte salt per backup. The derived key is independent of any account
//! credential and feeds XChaCha20-Poly1305 in [`crate::aead`].

use argon2::Argon2;
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Salt length for backup key derivation.
pub const SALT_LEN: usize = 16;

/// Generate a fresh random salt.
pub fn generate_salt(rng: &mut (impl RngCore + CryptoRng)) -> Result<[u8; SALT_LEN], CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    rng.try_fill_bytes(&mut salt).map_err(|_| CryptoError::RandomnessUnavailable)?;
    Ok(salt)
}

/// Derive a 32-byte encryption key from a passphrase and salt.
pub fn derive_backup_key(
    passphrase: &str,
    salt: &[u8; SALT_LEN],
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut key = Zeroizing::new([0u8; 32]);
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, key.as_mut())
        .map_err(|_| CryptoError::PassphraseKdfFailed)?;
    Ok(key)
}
