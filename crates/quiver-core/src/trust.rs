//! Peer identity trust bookkeeping.
//!
//! Trust-on-first-use: the first identity key observed for a peer is pinned
//! as `Untrusted`. An explicit verification promotes it to `Trusted`. If a
//! later observation shows a different key, the record flips to `Changed`,
//! the MITM detector, and encryption to that peer is blocked until the
//! owner re-verifies.

use crate::{
    clock::Clock,
    error::EngineError,
    records::{PeerAddress, TrustLevel, TrustRecord},
    store::KeyStore,
};

/// Current trust level for a peer; `Untrusted` if never observed.
pub fn trust_level<S: KeyStore>(
    store: &S,
    owner: &str,
    peer: &PeerAddress,
) -> Result<TrustLevel, EngineError> {
    Ok(store.trust(owner, peer)?.map_or(TrustLevel::Untrusted, |r| r.level))
}

/// Record an observation of a peer's identity key.
///
/// Pins the key on first sight; flips the record to `Changed` when the
/// observed key differs from the pinned one. Returns the resulting level.
pub fn observe_peer_identity<S: KeyStore>(
    store: &S,
    owner: &str,
    peer: &PeerAddress,
    observed_key: [u8; 32],
) -> Result<TrustLevel, EngineError> {
    match store.trust(owner, peer)? {
        None => {
            store.put_trust(TrustRecord {
                owner_user_id: owner.to_string(),
                peer: peer.clone(),
                peer_identity_key: observed_key,
                level: TrustLevel::Untrusted,
                verified_at_ms: None,
            })?;
            Ok(TrustLevel::Untrusted)
        },
        Some(record) if record.peer_identity_key == observed_key => Ok(record.level),
        Some(mut record) => {
            if record.level != TrustLevel::Changed {
                tracing::warn!(
                    owner,
                    peer = %peer,
                    "peer identity key changed; blocking until re-verified"
                );
            }
            // The pinned key stays: re-verification compares against what
            // the owner last accepted.
            record.level = TrustLevel::Changed;
            store.put_trust(record)?;
            Ok(TrustLevel::Changed)
        },
    }
}

/// Explicitly verify a peer: pin its *current* identity key and promote the
/// record to `Trusted`. This is the only path out of `Changed`.
pub fn mark_verified<S: KeyStore, C: Clock>(
    store: &S,
    clock: &C,
    owner: &str,
    peer: &PeerAddress,
) -> Result<(), EngineError> {
    let identity = store
        .identity(&peer.user_id)?
        .ok_or_else(|| EngineError::KeysNotFound { user_id: peer.user_id.clone() })?;

    store.put_trust(TrustRecord {
        owner_user_id: owner.to_string(),
        peer: peer.clone(),
        peer_identity_key: identity.signing_public,
        level: TrustLevel::Trusted,
        verified_at_ms: Some(clock.now_ms()),
    })?;

    tracing::info!(owner, peer = %peer, "peer identity verified");
    Ok(())
}
