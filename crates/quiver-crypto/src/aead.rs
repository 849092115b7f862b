//! Authenticated encryption with `XChaCha20-Poly1305`.
//!
//! Two entry points: [`seal`]/[`open`] bundle a random 24-byte nonce into the
//! blob for at-rest use (sealed private keys, backups), while
//! [`encrypt_with_nonce`]/[`decrypt_with_nonce`] take the nonce explicitly
//! for wire messages that carry it in their envelope. The Poly1305 tag
//! comparison inside the AEAD is constant-time, so failures are
//! indistinguishable by timing.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use rand_core::{CryptoRng, RngCore};

use crate::error::CryptoError;

/// XChaCha20 nonce size in bytes.
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag size in bytes.
pub const TAG_LEN: usize = 16;

/// Encrypt `plaintext`, prepending a fresh random nonce to the output.
///
/// The associated data is authenticated but not encrypted; callers bind the
/// blob to its storage identity through it, so a sealed blob moved to a
/// different record fails to open.
pub fn seal(
    key: &[u8; 32],
    aad: &[u8],
    plaintext: &[u8],
    rng: &mut (impl RngCore + CryptoRng),
) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    rng.try_fill_bytes(&mut nonce).map_err(|_| CryptoError::RandomnessUnavailable)?;

    let ciphertext = encrypt_with_nonce(key, &nonce, aad, plaintext);

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypt a blob produced by [`seal`] under the same key and AAD.
pub fn open(key: &[u8; 32], aad: &[u8], blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::DecryptFailed);
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(nonce_bytes);
    decrypt_with_nonce(key, &nonce, aad, ciphertext)
}

/// Encrypt with an explicit nonce. The nonce must never repeat per key;
/// message keys are single-use, sealed blobs use [`seal`].
pub fn encrypt_with_nonce(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let payload = Payload { msg: plaintext, aad };

    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(nonce), payload) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };
    ciphertext
}

/// Decrypt with an explicit nonce.
pub fn decrypt_with_nonce(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let payload = Payload { msg: ciphertext, aad };

    cipher.decrypt(XNonce::from_slice(nonce), payload).map_err(|_| CryptoError::DecryptFailed)
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key = [0x42u8; 32];
        let blob = seal(&key, b"record:1", b"private key bytes", &mut OsRng).unwrap();
        let opened = open(&key, b"record:1", &blob).unwrap();
        assert_eq!(opened, b"private key bytes");
    }

    #[test]
    fn open_rejects_wrong_key() {
        let blob = seal(&[1u8; 32], b"aad", b"secret", &mut OsRng).unwrap();
        assert_eq!(open(&[2u8; 32], b"aad", &blob), Err(CryptoError::DecryptFailed));
    }

    #[test]
    fn open_rejects_wrong_aad() {
        let key = [1u8; 32];
        let blob = seal(&key, b"session:alice:bob", b"secret", &mut OsRng).unwrap();
        assert_eq!(open(&key, b"session:alice:carol", &blob), Err(CryptoError::DecryptFailed));
    }

    #[test]
    fn open_rejects_any_flipped_byte() {
        let key = [1u8; 32];
        let blob = seal(&key, b"aad", b"secret payload", &mut OsRng).unwrap();

        for i in 0..blob.len() {
            let mut tampered = blob.clone();
            tampered[i] ^= 0x01;
            assert_eq!(
                open(&key, b"aad", &tampered),
                Err(CryptoError::DecryptFailed),
                "flipped byte {i} must fail authentication"
            );
        }
    }

    #[test]
    fn open_rejects_truncated_blob() {
        assert_eq!(open(&[0u8; 32], b"", &[0u8; 10]), Err(CryptoError::DecryptFailed));
    }

    #[test]
    fn seal_is_randomized() {
        let key = [7u8; 32];
        let a = seal(&key, b"aad", b"same plaintext", &mut OsRng).unwrap();
        let b = seal(&key, b"aad", b"same plaintext", &mut OsRng).unwrap();
        assert_ne!(a, b, "fresh nonce must randomize the blob");
    }

    #[test]
    fn explicit_nonce_round_trip() {
        let key = [9u8; 32];
        let nonce = [5u8; NONCE_LEN];

        let ciphertext = encrypt_with_nonce(&key, &nonce, b"header", b"hello");
        assert_eq!(ciphertext.len(), 5 + TAG_LEN);

        let plaintext = decrypt_with_nonce(&key, &nonce, b"header", &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello");
    }
}
