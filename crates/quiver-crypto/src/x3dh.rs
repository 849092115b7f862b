//! X3DH asynchronous key agreement.
//!
//! The initiator combines its identity DH key and a fresh ephemeral key with
//! the recipient's published bundle; the recipient mirrors the computation
//! from its private halves. Both arrive at the same shared secret:
//!
//! ```text
//! DH1 = DH(identity_initiator, signed_pre_key_recipient)
//! DH2 = DH(ephemeral,          identity_recipient)
//! DH3 = DH(ephemeral,          signed_pre_key_recipient)
//! DH4 = DH(ephemeral,          one_time_pre_key_recipient)   (if present)
//! SK  = HKDF(0xFF*32 || DH1 || DH2 || DH3 [|| DH4])
//! ```
//!
//! The signed pre-key's signature is verified against the recipient's
//! identity signing key before any DH is computed; a forged bundle fails
//! closed.

use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::{
    error::CryptoError,
    kdf,
    keys::{DhKeyPair, SIGNATURE_LEN, verify_signature},
};

/// A recipient's published key bundle.
///
/// All fields are public halves; the bundle travels as plain data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyBundle {
    /// Ed25519 identity signing key (the trust anchor).
    pub identity_signing_key: [u8; 32],
    /// X25519 identity DH key.
    pub identity_dh_key: [u8; 32],
    /// 14-bit registration id.
    pub registration_id: u16,
    /// Id of the active signed pre-key.
    pub signed_pre_key_id: u32,
    /// Public half of the active signed pre-key.
    pub signed_pre_key: [u8; 32],
    /// Ed25519 signature over `signed_pre_key` by the identity signing key.
    pub signed_pre_key_signature: [u8; SIGNATURE_LEN],
    /// One unused one-time pre-key, if any remain.
    pub one_time_pre_key: Option<(u32, [u8; 32])>,
}

impl PreKeyBundle {
    /// Verify the signed pre-key signature against the bundle's identity key.
    pub fn verify(&self) -> Result<(), CryptoError> {
        verify_signature(
            &self.identity_signing_key,
            &self.signed_pre_key,
            &self.signed_pre_key_signature,
        )
    }
}

/// Output of the initiator side of the handshake.
pub struct Initiation {
    /// The derived session secret.
    pub shared_secret: Zeroizing<[u8; 32]>,
    /// Ephemeral public key the recipient needs to mirror the computation.
    pub ephemeral_public: [u8; 32],
}

/// Perform the initiator side of X3DH against a verified bundle.
///
/// Verifies the bundle's signature first and fails closed with
/// [`CryptoError::SignatureInvalid`]: this is the MITM defense, so the
/// error is surfaced distinctly and must never be retried.
pub fn initiate(
    our_identity_dh: &DhKeyPair,
    bundle: &PreKeyBundle,
    rng: &mut (impl RngCore + CryptoRng),
) -> Result<Initiation, CryptoError> {
    bundle.verify()?;

    let ephemeral = DhKeyPair::generate(rng)?;

    let dh1 = our_identity_dh.diffie_hellman(&bundle.signed_pre_key);
    let dh2 = ephemeral.diffie_hellman(&bundle.identity_dh_key);
    let dh3 = ephemeral.diffie_hellman(&bundle.signed_pre_key);

    let shared_secret = match bundle.one_time_pre_key {
        Some((_, one_time_public)) => {
            let dh4 = ephemeral.diffie_hellman(&one_time_public);
            kdf::derive_handshake_secret(&[&dh1, &dh2, &dh3, &dh4])
        },
        None => kdf::derive_handshake_secret(&[&dh1, &dh2, &dh3]),
    };

    Ok(Initiation { shared_secret, ephemeral_public: ephemeral.public_bytes() })
}

/// Perform the recipient side of X3DH from its private halves.
///
/// `one_time_pre_key` must be the private half matching the key the
/// initiator used, or `None` if the bundle carried none.
pub fn respond(
    our_identity_dh: &DhKeyPair,
    our_signed_pre_key: &DhKeyPair,
    our_one_time_pre_key: Option<&DhKeyPair>,
    their_identity_dh_key: &[u8; 32],
    their_ephemeral_public: &[u8; 32],
) -> Zeroizing<[u8; 32]> {
    let dh1 = our_signed_pre_key.diffie_hellman(their_identity_dh_key);
    let dh2 = our_identity_dh.diffie_hellman(their_ephemeral_public);
    let dh3 = our_signed_pre_key.diffie_hellman(their_ephemeral_public);

    match our_one_time_pre_key {
        Some(one_time) => {
            let dh4 = one_time.diffie_hellman(their_ephemeral_public);
            kdf::derive_handshake_secret(&[&dh1, &dh2, &dh3, &dh4])
        },
        None => kdf::derive_handshake_secret(&[&dh1, &dh2, &dh3]),
    }
}
