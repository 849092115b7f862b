//! Key derivation for the handshake and ratchet chains.
//!
//! Three derivations, each with its own domain-separation label:
//!
//! - handshake secret: HKDF-SHA256 over the concatenated DH outputs
//! - root step: HKDF-SHA256 keyed by the current root key, fed a DH output
//! - chain step: HMAC-SHA256 with distinct labels for the next chain key and
//!   the message key

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Info label for deriving the handshake shared secret.
const HANDSHAKE_LABEL: &[u8] = b"quiverHandshakeV1";

/// Info label for the root-key step.
const ROOT_LABEL: &[u8] = b"quiverRatchetRootV1";

/// Label for deriving the next chain key.
const CHAIN_LABEL: &[u8] = b"chain";

/// Label for deriving a message key.
const MESSAGE_LABEL: &[u8] = b"message";

/// Derive the session shared secret from concatenated DH outputs.
///
/// The input is prefixed with 32 bytes of 0xFF so that the first block of
/// key material can never collide with a raw DH output.
pub fn derive_handshake_secret(dh_outputs: &[&[u8; 32]]) -> Zeroizing<[u8; 32]> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(32 + dh_outputs.len() * 32));
    ikm.extend_from_slice(&[0xFF; 32]);
    for dh in dh_outputs {
        ikm.extend_from_slice(dh.as_slice());
    }

    let hkdf = Hkdf::<Sha256>::new(None, &ikm);
    let mut secret = Zeroizing::new([0u8; 32]);
    let Ok(()) = hkdf.expand(HANDSHAKE_LABEL, secret.as_mut()) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    secret
}

/// Advance the root key with a fresh DH output.
///
/// Returns the new root key and the chain key seeded for the new direction.
pub fn derive_root_step(
    root_key: &[u8; 32],
    dh_output: &[u8; 32],
) -> (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>) {
    let hkdf = Hkdf::<Sha256>::new(Some(root_key), dh_output);
    let mut okm = Zeroizing::new([0u8; 64]);
    let Ok(()) = hkdf.expand(ROOT_LABEL, okm.as_mut()) else {
        unreachable!("64 bytes is a valid HKDF-SHA256 output length");
    };

    let mut new_root = Zeroizing::new([0u8; 32]);
    let mut chain_key = Zeroizing::new([0u8; 32]);
    new_root.copy_from_slice(&okm[..32]);
    chain_key.copy_from_slice(&okm[32..]);
    (new_root, chain_key)
}

/// Advance a chain key one step.
///
/// Returns the next chain key and the message key for the current position.
/// The caller overwrites the old chain key, which is what gives the chain
/// its forward secrecy.
pub fn advance_chain(chain_key: &[u8; 32]) -> (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>) {
    (hmac_label(chain_key, CHAIN_LABEL), hmac_label(chain_key, MESSAGE_LABEL))
}

fn hmac_label(key: &[u8; 32], label: &[u8]) -> Zeroizing<[u8; 32]> {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac.update(label);
    let result = mac.finalize().into_bytes();

    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&result);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_secret_is_deterministic() {
        let dh1 = [1u8; 32];
        let dh2 = [2u8; 32];

        let a = derive_handshake_secret(&[&dh1, &dh2]);
        let b = derive_handshake_secret(&[&dh1, &dh2]);
        assert_eq!(*a, *b);
    }

    #[test]
    fn handshake_secret_depends_on_every_input() {
        let dh1 = [1u8; 32];
        let dh2 = [2u8; 32];
        let dh3 = [3u8; 32];

        let three = derive_handshake_secret(&[&dh1, &dh2, &dh3]);
        let two = derive_handshake_secret(&[&dh1, &dh2]);
        let reordered = derive_handshake_secret(&[&dh2, &dh1, &dh3]);

        assert_ne!(*three, *two);
        assert_ne!(*three, *reordered);
    }

    #[test]
    fn root_step_separates_root_and_chain() {
        let root = [7u8; 32];
        let dh = [9u8; 32];

        let (new_root, chain) = derive_root_step(&root, &dh);
        assert_ne!(*new_root, *chain);
        assert_ne!(*new_root, root);
    }

    #[test]
    fn root_step_is_deterministic() {
        let root = [7u8; 32];
        let dh = [9u8; 32];

        let (r1, c1) = derive_root_step(&root, &dh);
        let (r2, c2) = derive_root_step(&root, &dh);
        assert_eq!(*r1, *r2);
        assert_eq!(*c1, *c2);
    }

    #[test]
    fn chain_advance_produces_distinct_keys() {
        let chain = [3u8; 32];

        let (next, message) = advance_chain(&chain);
        assert_ne!(*next, *message);
        assert_ne!(*next, chain);
        assert_ne!(*message, chain);
    }

    #[test]
    fn chain_sequence_has_no_short_cycle() {
        let mut chain = Zeroizing::new([0u8; 32]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let (next, message) = advance_chain(&chain);
            assert!(seen.insert(*message), "message keys must not repeat");
            chain = next;
        }
    }
}
