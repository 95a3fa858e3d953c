//
// Copyright 2020 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Root, chain and message keys of the ratchet.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{self, NONCE_SIZE};
use crate::curve::{PrivateKey, PublicKey};

const ROOT_INFO: &[u8] = b"ConnectE2eeRatchet";
const MESSAGE_KEYS_INFO: &[u8] = b"ConnectE2eeMessageKeys";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct MessageKeys {
    cipher_key: [u8; 32],
    nonce: [u8; NONCE_SIZE],
    counter: u32,
}

impl MessageKeys {
    pub fn derive_keys(seed: &[u8], counter: u32) -> Self {
        let mut okm = [0u8; 32 + NONCE_SIZE];
        crypto::hkdf_sha256(None, seed, MESSAGE_KEYS_INFO, &mut okm);

        let mut cipher_key = [0u8; 32];
        cipher_key.copy_from_slice(&okm[..32]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&okm[32..]);
        okm.zeroize();

        MessageKeys {
            cipher_key,
            nonce,
            counter,
        }
    }

    #[inline]
    pub fn cipher_key(&self) -> &[u8; 32] {
        &self.cipher_key
    }

    #[inline]
    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }

    #[inline]
    pub fn counter(&self) -> u32 {
        self.counter
    }
}

impl fmt::Debug for MessageKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageKeys")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

/// Symmetric chain. `index` is the number of message keys already taken from it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ChainKey {
    key: [u8; 32],
    index: u32,
}

impl ChainKey {
    const MESSAGE_KEY_SEED: [u8; 1] = [0x01u8];
    const CHAIN_KEY_SEED: [u8; 1] = [0x02u8];

    pub fn new(key: [u8; 32], index: u32) -> Self {
        Self { key, index }
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn next_chain_key(&self) -> Self {
        Self {
            key: self.calculate_base_material(Self::CHAIN_KEY_SEED),
            index: self.index + 1,
        }
    }

    /// Message keys bound to this chain key's index.
    pub fn message_keys(&self) -> MessageKeys {
        let mut seed = self.calculate_base_material(Self::MESSAGE_KEY_SEED);
        let keys = MessageKeys::derive_keys(&seed, self.index);
        seed.zeroize();
        keys
    }

    fn calculate_base_material(&self, seed: [u8; 1]) -> [u8; 32] {
        crypto::hmac_sha256(&self.key, &seed)
    }
}

impl fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainKey")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RootKey {
    key: [u8; 32],
}

impl RootKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// DH ratchet step: mixes `DH(ours, theirs)` into the root key and starts a
    /// fresh chain.
    pub fn create_chain(
        &self,
        their_ratchet_key: &PublicKey,
        our_ratchet_key: &PrivateKey,
    ) -> (RootKey, ChainKey) {
        let mut shared_secret = our_ratchet_key.calculate_agreement(their_ratchet_key);
        let mut derived = [0u8; 64];
        crypto::hkdf_sha256(Some(&self.key), &shared_secret, ROOT_INFO, &mut derived);
        shared_secret.zeroize();

        let mut root = [0u8; 32];
        root.copy_from_slice(&derived[..32]);
        let mut chain = [0u8; 32];
        chain.copy_from_slice(&derived[32..]);
        derived.zeroize();

        (RootKey { key: root }, ChainKey { key: chain, index: 0 })
    }

    /// Non-secret fingerprint, suitable for comparing two ends of a session.
    pub fn fingerprint(&self) -> [u8; 32] {
        crypto::sha256(&self.key)
    }
}

impl fmt::Debug for RootKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RootKey({})", hex::encode(&self.fingerprint()[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::KeyPair;

    #[test]
    fn chain_advances_deterministically() {
        let chain = ChainKey::new([3u8; 32], 0);
        let a = chain.next_chain_key();
        let b = chain.next_chain_key();
        assert_eq!(a, b);
        assert_eq!(a.index(), 1);
        assert_ne!(a.message_keys(), chain.message_keys());
        assert_eq!(a.message_keys().counter(), 1);
    }

    #[test]
    fn message_keys_differ_from_chain_material() {
        let chain = ChainKey::new([9u8; 32], 4);
        let keys = chain.message_keys();
        assert_ne!(keys.cipher_key(), &chain.next_chain_key().key);
        assert_eq!(keys.counter(), 4);
    }

    #[test]
    fn create_chain_agrees_on_both_sides() {
        let mut csprng = rand::rng();
        let ours = KeyPair::generate(&mut csprng);
        let theirs = KeyPair::generate(&mut csprng);
        let root = RootKey::new([5u8; 32]);

        let (root_a, chain_a) = root.create_chain(&theirs.public_key, &ours.private_key);
        let (root_b, chain_b) = root.create_chain(&ours.public_key, &theirs.private_key);

        assert_eq!(root_a, root_b);
        assert_eq!(chain_a, chain_b);
        assert_ne!(root_a, root);
        assert_eq!(chain_a.index(), 0);
    }

    #[test]
    fn debug_output_hides_secrets() {
        let chain = ChainKey::new([0xAB; 32], 2);
        let rendered = format!("{chain:?}");
        assert!(!rendered.contains("171"));
        assert!(rendered.contains("index: 2"));
    }
}
