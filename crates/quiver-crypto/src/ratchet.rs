//! Double Ratchet session state and transitions.
//!
//! State is an immutable value: [`encrypt`](RatchetState::encrypt) and
//! [`decrypt`](RatchetState::decrypt) return a *new* state alongside their
//! output, and the caller persists it separately. A failed decryption
//! returns an error and no state, so an authentication failure can never
//! advance or roll back a persisted ratchet.
//!
//! # Security Properties
//!
//! - Forward secrecy: chain keys are overwritten on every step and zeroized
//!   on drop
//! - Post-compromise security: each direction change mixes a fresh DH output
//!   into the root key
//! - Reordering tolerance: up to [`MAX_SKIP`] message keys are buffered per
//!   chain transition and discarded on use or overflow

use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{
    aead,
    error::CryptoError,
    kdf,
    keys::DhKeyPair,
};

/// Maximum number of message keys to skip over in one receive.
pub const MAX_SKIP: u32 = 1000;

/// Maximum number of buffered skipped keys; oldest are discarded beyond this.
const MAX_BUFFERED_KEYS: usize = 1000;

/// Per-message header, sent in the clear and authenticated as AAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current ratchet public key.
    pub ratchet_key: [u8; 32],
    /// Position in the sender's current sending chain.
    pub counter: u32,
    /// Length of the sender's previous sending chain.
    pub previous_counter: u32,
}

impl RatchetHeader {
    /// Canonical encoding, bound to the ciphertext as associated data.
    pub fn aad_bytes(&self) -> [u8; 40] {
        let mut aad = [0u8; 40];
        aad[..32].copy_from_slice(&self.ratchet_key);
        aad[32..36].copy_from_slice(&self.counter.to_be_bytes());
        aad[36..40].copy_from_slice(&self.previous_counter.to_be_bytes());
        aad
    }
}

/// An encrypted message produced by [`RatchetState::encrypt`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    /// Clear header, authenticated via AAD.
    pub header: RatchetHeader,
    /// Random XChaCha20 nonce.
    pub nonce: [u8; aead::NONCE_LEN],
    /// Ciphertext including the Poly1305 tag.
    pub ciphertext: Vec<u8>,
}

/// A message key buffered for an out-of-order message.
#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    /// Ratchet key of the chain the key belongs to.
    ratchet_key: [u8; 32],
    /// Position within that chain.
    counter: u32,
    /// The buffered message key.
    message_key: [u8; 32],
}

impl Drop for SkippedKey {
    fn drop(&mut self) {
        self.message_key.zeroize();
    }
}

/// Double Ratchet session state.
///
/// Serializable so callers can seal it for persistence; every secret field
/// zeroizes on drop. Counters only move forward: transitions produce a new
/// value and never mutate the input.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetState {
    root_key: [u8; 32],
    our_ratchet_secret: [u8; 32],
    our_ratchet_public: [u8; 32],
    their_ratchet_key: Option<[u8; 32]>,
    send_chain_key: [u8; 32],
    send_counter: u32,
    previous_send_counter: u32,
    recv_chain_key: Option<[u8; 32]>,
    recv_counter: u32,
    skipped: Vec<SkippedKey>,
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.our_ratchet_secret.zeroize();
        self.send_chain_key.zeroize();
        if let Some(ref mut key) = self.recv_chain_key {
            key.zeroize();
        }
    }
}

impl RatchetState {
    /// Initialize the initiator side after X3DH.
    ///
    /// `their_ratchet_key` is the recipient's signed pre-key, which doubles
    /// as its first ratchet key.
    pub fn initiator(
        shared_secret: &[u8; 32],
        their_ratchet_key: &[u8; 32],
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<Self, CryptoError> {
        let our = DhKeyPair::generate(rng)?;
        let dh = our.diffie_hellman(their_ratchet_key);
        let (root_key, send_chain_key) = kdf::derive_root_step(shared_secret, &dh);

        Ok(Self {
            root_key: *root_key,
            our_ratchet_secret: *our.secret_bytes(),
            our_ratchet_public: our.public_bytes(),
            their_ratchet_key: Some(*their_ratchet_key),
            send_chain_key: *send_chain_key,
            send_counter: 0,
            previous_send_counter: 0,
            recv_chain_key: None,
            recv_counter: 0,
            skipped: Vec::new(),
        })
    }

    /// Initialize the recipient side after X3DH.
    ///
    /// `our_signed_pre_key` is the pre-key the initiator ratcheted against;
    /// `their_ratchet_key` is the initiator's advertised ratchet key. The
    /// recipient performs its DH step immediately, so either side may send
    /// first.
    pub fn responder(
        shared_secret: &[u8; 32],
        our_signed_pre_key: &DhKeyPair,
        their_ratchet_key: &[u8; 32],
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<Self, CryptoError> {
        let dh_recv = our_signed_pre_key.diffie_hellman(their_ratchet_key);
        let (root_key, recv_chain_key) = kdf::derive_root_step(shared_secret, &dh_recv);

        let our = DhKeyPair::generate(rng)?;
        let dh_send = our.diffie_hellman(their_ratchet_key);
        let (root_key, send_chain_key) = kdf::derive_root_step(&root_key, &dh_send);

        Ok(Self {
            root_key: *root_key,
            our_ratchet_secret: *our.secret_bytes(),
            our_ratchet_public: our.public_bytes(),
            their_ratchet_key: Some(*their_ratchet_key),
            send_chain_key: *send_chain_key,
            send_counter: 0,
            previous_send_counter: 0,
            recv_chain_key: Some(*recv_chain_key),
            recv_counter: 0,
            skipped: Vec::new(),
        })
    }

    /// Our current ratchet public key, advertised in message headers.
    pub fn our_ratchet_public(&self) -> [u8; 32] {
        self.our_ratchet_public
    }

    /// Number of messages encrypted on the current sending chain.
    pub fn send_counter(&self) -> u32 {
        self.send_counter
    }

    /// Number of skipped message keys currently buffered.
    pub fn buffered_key_count(&self) -> usize {
        self.skipped.len()
    }

    /// Encrypt `plaintext`, advancing the sending chain.
    ///
    /// Returns the successor state and the message; the caller must persist
    /// the successor before releasing the ciphertext.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<(Self, RatchetMessage), CryptoError> {
        let (next_chain, message_key) = kdf::advance_chain(&self.send_chain_key);

        let header = RatchetHeader {
            ratchet_key: self.our_ratchet_public,
            counter: self.send_counter,
            previous_counter: self.previous_send_counter,
        };

        let mut nonce = [0u8; aead::NONCE_LEN];
        rng.try_fill_bytes(&mut nonce).map_err(|_| CryptoError::RandomnessUnavailable)?;

        let ciphertext =
            aead::encrypt_with_nonce(&message_key, &nonce, &header.aad_bytes(), plaintext);

        let mut next = self.clone();
        next.send_chain_key = *next_chain;
        next.send_counter += 1;

        Ok((next, RatchetMessage { header, nonce, ciphertext }))
    }

    /// Decrypt a message, advancing receiving state as needed.
    ///
    /// Handles three cases: a buffered skipped key, a message on the current
    /// chain (skipping forward if needed), and a message that opens a new
    /// chain (performing the DH ratchet step, which needs the RNG for the
    /// replacement sending key).
    ///
    /// On any failure the state is unchanged; the error carries no
    /// successor, so a forged message cannot move the ratchet.
    pub fn decrypt(
        &self,
        message: &RatchetMessage,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<(Self, Vec<u8>), CryptoError> {
        let header = &message.header;
        let aad = header.aad_bytes();
        let mut next = self.clone();

        // Out-of-order message for which a key was buffered.
        if let Some(index) = next
            .skipped
            .iter()
            .position(|s| s.ratchet_key == header.ratchet_key && s.counter == header.counter)
        {
            let skipped = next.skipped.remove(index);
            let plaintext = aead::decrypt_with_nonce(
                &skipped.message_key,
                &message.nonce,
                &aad,
                &message.ciphertext,
            )?;
            return Ok((next, plaintext));
        }

        if next.their_ratchet_key != Some(header.ratchet_key) {
            next.buffer_skipped_keys(header.previous_counter)?;
            next.dh_ratchet_step(&header.ratchet_key, rng)?;
        }

        if header.counter < next.recv_counter {
            // Behind the chain with no buffered key: the key is gone and the
            // ratchet never rolls backward to recreate it.
            return Err(CryptoError::MessageKeyUnavailable {
                current: next.recv_counter,
                requested: header.counter,
            });
        }
        next.buffer_skipped_keys(header.counter)?;

        let Some(recv_chain) = next.recv_chain_key else {
            return Err(CryptoError::DecryptFailed);
        };
        let (next_chain, message_key) = kdf::advance_chain(&recv_chain);
        let plaintext = aead::decrypt_with_nonce(
            &message_key,
            &message.nonce,
            &aad,
            &message.ciphertext,
        )?;

        next.recv_chain_key = Some(*next_chain);
        next.recv_counter += 1;
        Ok((next, plaintext))
    }

    /// Advance the receiving chain up to `until`, buffering each key.
    fn buffer_skipped_keys(&mut self, until: u32) -> Result<(), CryptoError> {
        let Some(mut chain) = self.recv_chain_key else {
            return Ok(());
        };
        if until.saturating_sub(self.recv_counter) > MAX_SKIP {
            return Err(CryptoError::SkipLimitExceeded {
                current: self.recv_counter,
                requested: until,
            });
        }
        let Some(their_ratchet_key) = self.their_ratchet_key else {
            return Ok(());
        };

        while self.recv_counter < until {
            let (next_chain, message_key) = kdf::advance_chain(&chain);
            self.skipped.push(SkippedKey {
                ratchet_key: their_ratchet_key,
                counter: self.recv_counter,
                message_key: *message_key,
            });
            chain.zeroize();
            chain = *next_chain;
            self.recv_counter += 1;
        }
        self.recv_chain_key = Some(chain);

        // Bounded buffer: oldest keys go first.
        while self.skipped.len() > MAX_BUFFERED_KEYS {
            self.skipped.remove(0);
        }
        Ok(())
    }

    /// Perform a DH ratchet step against a newly seen remote ratchet key.
    fn dh_ratchet_step(
        &mut self,
        their_new_key: &[u8; 32],
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Result<(), CryptoError> {
        self.previous_send_counter = self.send_counter;
        self.send_counter = 0;
        self.recv_counter = 0;
        self.their_ratchet_key = Some(*their_new_key);

        let our = DhKeyPair::from_secret_bytes(self.our_ratchet_secret);
        let dh_recv = our.diffie_hellman(their_new_key);
        let (root_key, recv_chain_key) = kdf::derive_root_step(&self.root_key, &dh_recv);
        self.recv_chain_key = Some(*recv_chain_key);

        let replacement = DhKeyPair::generate(rng)?;
        let dh_send = replacement.diffie_hellman(their_new_key);
        let (root_key, send_chain_key) = kdf::derive_root_step(&root_key, &dh_send);

        self.root_key.zeroize();
        self.root_key = *root_key;
        self.send_chain_key.zeroize();
        self.send_chain_key = *send_chain_key;
        self.our_ratchet_secret.zeroize();
        self.our_ratchet_secret = *replacement.secret_bytes();
        self.our_ratchet_public = replacement.public_bytes();
        Ok(())
    }
}
