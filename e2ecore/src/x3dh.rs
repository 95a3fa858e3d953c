//
// Copyright 2020 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Pre-key agreement between an initiator holding a peer's bundle and the
//! peer accepting the resulting handshake.
//!
//! The shared secret is the concatenation of up to four DH outputs. Each term is
//! keyed by the sorted pair of public keys it combines and the terms are sorted
//! by that key before hashing, so both sides derive the same root key no matter
//! which role they computed a term in.

use std::cmp::Ordering;

use log::debug;
use rand::{CryptoRng, Rng};
use zeroize::Zeroize;

use crate::bundle::ValidBundle;
use crate::crypto;
use crate::curve::{AGREEMENT_LENGTH, KeyPair, PrivateKey, PublicKey};
use crate::device::DeviceAddress;
use crate::error::{ProtocolError, Result};
use crate::identity::IdentityKeyPair;
use crate::keys::{ChainKey, RootKey};
use crate::protocol::HandshakeMessage;
use crate::session::{InitialParameters, Session};

const DISCONTINUITY_BYTES: [u8; 32] = [0xFFu8; 32];
const AGREEMENT_INFO: &[u8] = b"ConnectE2eeX3DH";
const MAX_TERMS: usize = 4;

/// One DH output with the public keys that produced it.
pub struct AgreementTerm {
    low: PublicKey,
    high: PublicKey,
    secret: [u8; AGREEMENT_LENGTH],
}

impl AgreementTerm {
    pub fn compute(
        our_private: &PrivateKey,
        our_public: &PublicKey,
        their_public: &PublicKey,
    ) -> Self {
        let (low, high) = if our_public <= their_public {
            (*our_public, *their_public)
        } else {
            (*their_public, *our_public)
        };
        Self {
            low,
            high,
            secret: our_private.calculate_agreement(their_public),
        }
    }

    fn ordering_key(&self) -> (&PublicKey, &PublicKey) {
        (&self.low, &self.high)
    }
}

impl Drop for AgreementTerm {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Root key and first chain key from a set of DH terms. Input order does not
/// matter. `supersedes` is bound into the HKDF info.
pub fn derive_initial_keys(
    terms: &mut [AgreementTerm],
    supersedes: Option<&PublicKey>,
) -> (RootKey, ChainKey) {
    terms.sort_by(|a, b| match a.ordering_key().cmp(&b.ordering_key()) {
        Ordering::Equal => a.secret.cmp(&b.secret),
        other => other,
    });

    let mut secrets = [0u8; 32 + MAX_TERMS * AGREEMENT_LENGTH];
    let mut secrets_len = 0usize;
    secrets[..32].copy_from_slice(&DISCONTINUITY_BYTES);
    secrets_len += 32;
    for term in terms.iter().take(MAX_TERMS) {
        secrets[secrets_len..secrets_len + AGREEMENT_LENGTH].copy_from_slice(&term.secret);
        secrets_len += AGREEMENT_LENGTH;
    }

    let mut info = [0u8; AGREEMENT_INFO.len() + 32];
    info[..AGREEMENT_INFO.len()].copy_from_slice(AGREEMENT_INFO);
    let info_len = match supersedes {
        Some(base_key) => {
            info[AGREEMENT_INFO.len()..].copy_from_slice(base_key.as_bytes());
            info.len()
        }
        None => AGREEMENT_INFO.len(),
    };

    let mut derived = [0u8; 64];
    crypto::hkdf_sha256(None, &secrets[..secrets_len], &info[..info_len], &mut derived);
    secrets.zeroize();

    let mut root = [0u8; 32];
    root.copy_from_slice(&derived[..32]);
    let mut chain = [0u8; 32];
    chain.copy_from_slice(&derived[32..]);
    derived.zeroize();

    (RootKey::new(root), ChainKey::new(chain, 0))
}

/// Runs the agreement against a validated bundle. The returned handshake must
/// reach the peer with the first message. `supersedes` names the base key of
/// an earlier session with this peer that the new one replaces.
pub fn initiate_session<R: Rng + CryptoRng>(
    local_identity: &IdentityKeyPair,
    peer: DeviceAddress,
    bundle: &ValidBundle,
    supersedes: Option<PublicKey>,
    csprng: &mut R,
) -> Result<(Session, HandshakeMessage)> {
    let ephemeral = KeyPair::generate(csprng);
    let their_identity = bundle.identity_key().public_key();
    let their_signed_pre_key = bundle.signed_pre_key().public_key;
    let one_time_pre_key = bundle.select_one_time_pre_key();

    let mut terms = Vec::with_capacity(MAX_TERMS);
    terms.push(AgreementTerm::compute(
        local_identity.private_key(),
        local_identity.public_key(),
        &their_signed_pre_key,
    ));
    terms.push(AgreementTerm::compute(
        &ephemeral.private_key,
        &ephemeral.public_key,
        their_identity,
    ));
    terms.push(AgreementTerm::compute(
        &ephemeral.private_key,
        &ephemeral.public_key,
        &their_signed_pre_key,
    ));
    if let Some(one_time) = &one_time_pre_key {
        terms.push(AgreementTerm::compute(
            &ephemeral.private_key,
            &ephemeral.public_key,
            &one_time.public_key,
        ));
    }
    let (root_key, chain_key) = derive_initial_keys(&mut terms, supersedes.as_ref());

    let handshake = HandshakeMessage {
        identity_key: *local_identity.identity_key(),
        ephemeral_key: ephemeral.public_key,
        signed_pre_key_id: bundle.signed_pre_key().key_id,
        one_time_pre_key_id: one_time_pre_key.map(|k| k.key_id),
        supersedes,
    };

    debug!(
        "Initiating session with {} (signed pre-key {}, one-time pre-key {:?})",
        peer, handshake.signed_pre_key_id, handshake.one_time_pre_key_id
    );

    let params = InitialParameters {
        local_identity_key: *local_identity.identity_key(),
        peer_identity_key: *bundle.identity_key(),
        peer,
        root_key,
        chain_key,
    };
    let sending_ratchet = KeyPair::generate(csprng);
    let session = Session::new_initiator(params, handshake, their_signed_pre_key, sending_ratchet);
    Ok((session, handshake))
}

/// Mirrors [`initiate_session`] on the receiving device. The caller resolves
/// the pre-key ids of the handshake to private keys; a referenced one-time
/// pre-key that could not be resolved is an error.
pub fn accept_session(
    local_identity: &IdentityKeyPair,
    peer: DeviceAddress,
    handshake: &HandshakeMessage,
    signed_pre_key: &KeyPair,
    one_time_pre_key: Option<&KeyPair>,
) -> Result<Session> {
    if let (Some(id), None) = (handshake.one_time_pre_key_id, one_time_pre_key) {
        return Err(ProtocolError::UnknownPreKeyId(id));
    }

    let their_identity = handshake.identity_key.public_key();
    let their_ephemeral = &handshake.ephemeral_key;

    let mut terms = Vec::with_capacity(MAX_TERMS);
    terms.push(AgreementTerm::compute(
        &signed_pre_key.private_key,
        &signed_pre_key.public_key,
        their_identity,
    ));
    terms.push(AgreementTerm::compute(
        local_identity.private_key(),
        local_identity.public_key(),
        their_ephemeral,
    ));
    terms.push(AgreementTerm::compute(
        &signed_pre_key.private_key,
        &signed_pre_key.public_key,
        their_ephemeral,
    ));
    if let (Some(_), Some(one_time)) = (handshake.one_time_pre_key_id, one_time_pre_key) {
        terms.push(AgreementTerm::compute(
            &one_time.private_key,
            &one_time.public_key,
            their_ephemeral,
        ));
    }
    let (root_key, chain_key) = derive_initial_keys(&mut terms, handshake.supersedes.as_ref());

    debug!(
        "Accepting session from {} (signed pre-key {}, one-time pre-key {:?})",
        peer, handshake.signed_pre_key_id, handshake.one_time_pre_key_id
    );

    let params = InitialParameters {
        local_identity_key: *local_identity.identity_key(),
        peer_identity_key: handshake.identity_key,
        peer,
        root_key,
        chain_key,
    };
    Ok(Session::new_acceptor(
        params,
        handshake,
        signed_pre_key.clone(),
    ))
}

/// Outcome of two devices initiating towards each other at the same time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tiebreak {
    /// Our handshake wins; the peer will adopt our session.
    KeepLocal,
    /// The peer's handshake wins; replace our session with the accepted one.
    AcceptPeer,
}

/// The handshake whose `(identity key, ephemeral key)` sorts lower wins. Both
/// devices evaluate this with swapped arguments and reach the same session.
pub fn resolve_simultaneous(local: &HandshakeMessage, peer: &HandshakeMessage) -> Tiebreak {
    if peer.tiebreak_key() < local.tiebreak_key() {
        Tiebreak::AcceptPeer
    } else {
        Tiebreak::KeepLocal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BundleValidator;
    use crate::prekey::{OneTimePreKeyRecord, PreKeyBundle, SignedPreKeyRecord};

    const NOW: i64 = 1_750_000_000;

    struct Device {
        identity: IdentityKeyPair,
        signed: SignedPreKeyRecord,
        one_time: Vec<OneTimePreKeyRecord>,
    }

    impl Device {
        fn new(one_time: u32) -> Self {
            let mut csprng = rand::rng();
            let identity = IdentityKeyPair::generate(&mut csprng);
            let signed = SignedPreKeyRecord::generate(1, &identity, NOW, &mut csprng);
            let one_time = (0..one_time)
                .map(|i| OneTimePreKeyRecord::generate(7 + i, &mut csprng))
                .collect();
            Self {
                identity,
                signed,
                one_time,
            }
        }

        fn bundle(&self) -> ValidBundle {
            let bundle = PreKeyBundle {
                identity_key: *self.identity.identity_key(),
                signed_pre_key: self.signed.public(),
                one_time_pre_keys: self.one_time.iter().map(|k| k.public()).collect(),
            };
            BundleValidator::default().validate(bundle, NOW).unwrap()
        }

        fn accept(&self, handshake: &HandshakeMessage) -> Result<Session> {
            let one_time = handshake.one_time_pre_key_id.and_then(|id| {
                self.one_time
                    .iter()
                    .find(|k| k.key_id == id)
                    .map(|k| &k.key_pair)
            });
            accept_session(
                &self.identity,
                DeviceAddress::new("alice", "1"),
                handshake,
                &self.signed.key_pair,
                one_time,
            )
        }
    }

    fn term_pairs() -> Vec<(KeyPair, KeyPair)> {
        let mut csprng = rand::rng();
        (0..4)
            .map(|_| (KeyPair::generate(&mut csprng), KeyPair::generate(&mut csprng)))
            .collect()
    }

    #[test]
    fn derivation_is_independent_of_term_order_and_role() {
        let pairs = term_pairs();
        let mut forward: Vec<_> = pairs
            .iter()
            .map(|(a, b)| AgreementTerm::compute(&a.private_key, &a.public_key, &b.public_key))
            .collect();
        let mut mirrored: Vec<_> = pairs
            .iter()
            .rev()
            .map(|(a, b)| AgreementTerm::compute(&b.private_key, &b.public_key, &a.public_key))
            .collect();

        let (root_a, chain_a) = derive_initial_keys(&mut forward, None);
        let (root_b, chain_b) = derive_initial_keys(&mut mirrored, None);
        assert_eq!(root_a, root_b);
        assert_eq!(chain_a, chain_b);
    }

    #[test]
    fn derivation_depends_on_every_term() {
        let pairs = term_pairs();
        let mut all: Vec<_> = pairs
            .iter()
            .map(|(a, b)| AgreementTerm::compute(&a.private_key, &a.public_key, &b.public_key))
            .collect();
        let mut fewer: Vec<_> = pairs[..3]
            .iter()
            .map(|(a, b)| AgreementTerm::compute(&a.private_key, &a.public_key, &b.public_key))
            .collect();
        assert_ne!(
            derive_initial_keys(&mut all, None).0,
            derive_initial_keys(&mut fewer, None).0
        );
    }

    #[test]
    fn initiate_and_accept_agree() {
        let alice = Device::new(0);
        let bob = Device::new(1);
        let mut csprng = rand::rng();

        let (session_a, handshake) = initiate_session(
            &alice.identity,
            DeviceAddress::new("bob", "1"),
            &bob.bundle(),
            None,
            &mut csprng,
        )
        .unwrap();
        assert_eq!(handshake.one_time_pre_key_id, Some(7));
        assert_eq!(session_a.pending_handshake(), Some(&handshake));

        let session_b = bob.accept(&handshake).unwrap();
        assert_eq!(session_a.session_id(), session_b.session_id());
        assert_eq!(session_b.base_key(), &handshake.ephemeral_key);
        assert!(!session_b.is_unacknowledged());
        assert_eq!(session_b.one_time_pre_key_id(), Some(7));
    }

    #[test]
    fn degraded_bundle_uses_three_terms() {
        let alice = Device::new(0);
        let bob = Device::new(0);
        let bundle = bob.bundle();
        assert!(bundle.degraded());

        let (session_a, handshake) = initiate_session(
            &alice.identity,
            DeviceAddress::new("bob", "1"),
            &bundle,
            None,
            &mut rand::rng(),
        )
        .unwrap();
        assert_eq!(handshake.one_time_pre_key_id, None);
        assert_eq!(
            bob.accept(&handshake).unwrap().session_id(),
            session_a.session_id()
        );
    }

    #[test]
    fn missing_one_time_key_is_unknown() {
        let alice = Device::new(0);
        let bob = Device::new(1);
        let (_, handshake) = initiate_session(
            &alice.identity,
            DeviceAddress::new("bob", "1"),
            &bob.bundle(),
            None,
            &mut rand::rng(),
        )
        .unwrap();

        let result = accept_session(
            &bob.identity,
            DeviceAddress::new("alice", "1"),
            &handshake,
            &bob.signed.key_pair,
            None,
        );
        assert_eq!(result.err(), Some(ProtocolError::UnknownPreKeyId(7)));
    }

    #[test]
    fn wrong_signed_pre_key_diverges() {
        let alice = Device::new(0);
        let bob = Device::new(0);
        let (session_a, handshake) = initiate_session(
            &alice.identity,
            DeviceAddress::new("bob", "1"),
            &bob.bundle(),
            None,
            &mut rand::rng(),
        )
        .unwrap();

        let stale = KeyPair::generate(&mut rand::rng());
        let session_b = accept_session(
            &bob.identity,
            DeviceAddress::new("alice", "1"),
            &handshake,
            &stale,
            None,
        )
        .unwrap();
        assert_ne!(session_a.session_id(), session_b.session_id());
    }

    #[test]
    fn superseded_base_key_is_bound_to_the_agreement() {
        let alice = Device::new(0);
        let bob = Device::new(0);
        let old_base_key = KeyPair::generate(&mut rand::rng()).public_key;
        let (session_a, handshake) = initiate_session(
            &alice.identity,
            DeviceAddress::new("bob", "1"),
            &bob.bundle(),
            Some(old_base_key),
            &mut rand::rng(),
        )
        .unwrap();
        assert_eq!(handshake.supersedes, Some(old_base_key));
        assert_eq!(
            bob.accept(&handshake).unwrap().session_id(),
            session_a.session_id()
        );

        let mut stripped = handshake;
        stripped.supersedes = None;
        assert_ne!(
            bob.accept(&stripped).unwrap().session_id(),
            session_a.session_id()
        );
    }

    #[test]
    fn simultaneous_initiation_converges() {
        let alice = Device::new(1);
        let bob = Device::new(1);
        let mut csprng = rand::rng();

        let (session_a, handshake_a) = initiate_session(
            &alice.identity,
            DeviceAddress::new("bob", "1"),
            &bob.bundle(),
            None,
            &mut csprng,
        )
        .unwrap();
        let (session_b, handshake_b) = initiate_session(
            &bob.identity,
            DeviceAddress::new("alice", "1"),
            &alice.bundle(),
            None,
            &mut csprng,
        )
        .unwrap();

        let at_alice = match resolve_simultaneous(&handshake_a, &handshake_b) {
            Tiebreak::KeepLocal => session_a,
            Tiebreak::AcceptPeer => alice.accept(&handshake_b).unwrap(),
        };
        let at_bob = match resolve_simultaneous(&handshake_b, &handshake_a) {
            Tiebreak::KeepLocal => session_b,
            Tiebreak::AcceptPeer => bob.accept(&handshake_a).unwrap(),
        };
        assert_eq!(at_alice.session_id(), at_bob.session_id());
        assert_ne!(
            resolve_simultaneous(&handshake_a, &handshake_b),
            resolve_simultaneous(&handshake_b, &handshake_a)
        );
    }
}
