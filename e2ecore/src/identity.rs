//
// Copyright 2020-2022 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::fmt;

use rand::{CryptoRng, Rng};
use serde::{Deserialize, Serialize};

use crate::curve::{KeyPair, PrivateKey, PublicKey, Signature};

/// Public half of a device's long-term identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    public_key: PublicKey,
}

impl IdentityKey {
    pub fn new(public_key: PublicKey) -> Self {
        Self { public_key }
    }

    #[inline]
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.public_key.as_bytes()
    }

    pub fn verify(&self, message: &[&[u8]], signature: &Signature) -> bool {
        self.public_key.verify_signature(message, signature)
    }
}

impl From<PublicKey> for IdentityKey {
    fn from(public_key: PublicKey) -> Self {
        Self { public_key }
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({})", self.public_key)
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.public_key, f)
    }
}

/// Long-term identity keypair. Never leaves the device.
#[derive(Clone, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    identity_key: IdentityKey,
    private_key: PrivateKey,
}

impl IdentityKeyPair {
    pub fn new(identity_key: IdentityKey, private_key: PrivateKey) -> Self {
        Self {
            identity_key,
            private_key,
        }
    }

    pub fn generate<R: CryptoRng + Rng>(csprng: &mut R) -> Self {
        let keypair = KeyPair::generate(csprng);

        Self {
            identity_key: keypair.public_key.into(),
            private_key: keypair.private_key,
        }
    }

    #[inline]
    pub fn identity_key(&self) -> &IdentityKey {
        &self.identity_key
    }

    #[inline]
    pub fn public_key(&self) -> &PublicKey {
        self.identity_key.public_key()
    }

    #[inline]
    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    pub fn sign<R: CryptoRng + Rng>(&self, message: &[&[u8]], csprng: &mut R) -> Signature {
        self.private_key.calculate_signature(csprng, message)
    }
}

impl From<KeyPair> for IdentityKeyPair {
    fn from(pair: KeyPair) -> Self {
        Self {
            identity_key: pair.public_key.into(),
            private_key: pair.private_key,
        }
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("identity_key", &self.identity_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let mut csprng = rand::rng();
        let identity = IdentityKeyPair::generate(&mut csprng);
        let signature = identity.sign(&[b"payload"], &mut csprng);

        assert!(identity.identity_key().verify(&[b"payload"], &signature));
        assert!(!identity.identity_key().verify(&[b"payloaD"], &signature));
    }

    #[test]
    fn private_key_matches_identity() {
        let identity = IdentityKeyPair::generate(&mut rand::rng());
        assert_eq!(&identity.private_key().public_key(), identity.public_key());
    }
}
