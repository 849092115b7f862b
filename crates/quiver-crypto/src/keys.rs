//! Key pair generation for the Curve25519 suite.
//!
//! Two kinds of key pairs exist: X25519 Diffie-Hellman pairs (identity DH
//! half, signed pre-keys, one-time pre-keys, ratchet keys) and Ed25519
//! signing pairs (the identity half that signs pre-keys). All generation
//! takes a caller-provided RNG so tests can be deterministic, and surfaces
//! randomness failure instead of panicking.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::{CryptoRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Length of an encoded public key or secret key, both curves.
pub const KEY_LEN: usize = 32;

/// Length of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Fill a 32-byte seed from the RNG, mapping failure to [`CryptoError`].
fn random_seed(rng: &mut (impl RngCore + CryptoRng)) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut seed = Zeroizing::new([0u8; 32]);
    rng.try_fill_bytes(seed.as_mut()).map_err(|_| CryptoError::RandomnessUnavailable)?;
    Ok(seed)
}

/// An X25519 Diffie-Hellman key pair.
///
/// The secret zeroizes on drop (via `StaticSecret`). Secret bytes only leave
/// this type through [`secret_bytes`](Self::secret_bytes), which callers must
/// seal before persisting.
pub struct DhKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl DhKeyPair {
    /// Generate a fresh key pair from the given RNG.
    pub fn generate(rng: &mut (impl RngCore + CryptoRng)) -> Result<Self, CryptoError> {
        let seed = random_seed(rng)?;
        Ok(Self::from_secret_bytes(*seed))
    }

    /// Reconstruct a key pair from stored secret bytes.
    ///
    /// X25519 clamps internally, so any 32 bytes form a valid secret.
    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Encoded public key.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Secret bytes for sealing. Zeroizes when the wrapper drops.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// X25519 shared secret with a peer's encoded public key.
    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> Zeroizing<[u8; 32]> {
        let their_public = PublicKey::from(*their_public);
        Zeroizing::new(self.secret.diffie_hellman(&their_public).to_bytes())
    }
}

/// An Ed25519 signing key pair.
///
/// Signs signed-pre-key public halves; the verifying half is the peer-visible
/// identity anchor used for trust comparison.
pub struct SigningKeyPair {
    signing: SigningKey,
}

impl SigningKeyPair {
    /// Generate a fresh signing pair from the given RNG.
    pub fn generate(rng: &mut (impl RngCore + CryptoRng)) -> Result<Self, CryptoError> {
        let seed = random_seed(rng)?;
        Ok(Self::from_secret_bytes(*seed))
    }

    /// Reconstruct a signing pair from stored seed bytes.
    pub fn from_secret_bytes(seed: [u8; 32]) -> Self {
        Self { signing: SigningKey::from_bytes(&seed) }
    }

    /// Encoded verifying (public) key.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Seed bytes for sealing. Zeroizes when the wrapper drops.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }
}

/// Verify an Ed25519 signature over `message` with an encoded public key.
///
/// Fails closed: any decoding problem or mismatch yields
/// [`CryptoError::SignatureInvalid`], indistinguishable to the caller.
pub fn verify_signature(
    public: &[u8; 32],
    message: &[u8],
    signature: &[u8; SIGNATURE_LEN],
) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(public).map_err(|_| CryptoError::SignatureInvalid)?;
    let signature = Signature::from_bytes(signature);
    key.verify(message, &signature).map_err(|_| CryptoError::SignatureInvalid)
}

/// Generate a 14-bit registration id in `1..=16383`.
pub fn generate_registration_id(
    rng: &mut (impl RngCore + CryptoRng),
) -> Result<u16, CryptoError> {
    let mut bytes = [0u8; 2];
    rng.try_fill_bytes(&mut bytes).map_err(|_| CryptoError::RandomnessUnavailable)?;
    let id = u16::from_be_bytes(bytes) & 0x3FFF;
    Ok(id.max(1))
}
