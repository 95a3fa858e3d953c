//! Signed and one-time pre-keys, and the bundle a device publishes.

use rand::{CryptoRng, Rng};
use serde::{Deserialize, Serialize};

use crate::curve::{KeyPair, PublicKey, Signature};
use crate::identity::{IdentityKey, IdentityKeyPair};

pub type PreKeyId = u32;
pub type SignedPreKeyId = u32;

/// Bytes covered by a signed pre-key signature: id and creation time are bound
/// to the key so neither can be swapped by the directory.
pub fn signed_payload(key_id: SignedPreKeyId, created_at: i64, public_key: &PublicKey) -> [u8; 44] {
    let mut out = [0u8; 44];
    out[..4].copy_from_slice(&key_id.to_be_bytes());
    out[4..12].copy_from_slice(&created_at.to_be_bytes());
    out[12..].copy_from_slice(public_key.as_bytes());
    out
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    pub key_id: SignedPreKeyId,
    pub public_key: PublicKey,
    pub signature: Signature,
    /// Unix seconds.
    pub created_at: i64,
}

impl SignedPreKey {
    pub fn verify(&self, identity_key: &IdentityKey) -> bool {
        let payload = signed_payload(self.key_id, self.created_at, &self.public_key);
        identity_key.verify(&[&payload], &self.signature)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKey {
    pub key_id: PreKeyId,
    pub public_key: PublicKey,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub identity_key: IdentityKey,
    pub signed_pre_key: SignedPreKey,
    pub one_time_pre_keys: Vec<OneTimePreKey>,
}

/// Locally held signed pre-key with its private half.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    pub key_id: SignedPreKeyId,
    pub key_pair: KeyPair,
    pub signature: Signature,
    pub created_at: i64,
    /// Set when a newer key replaced this one.
    pub retired_at: Option<i64>,
}

impl SignedPreKeyRecord {
    pub fn generate<R: CryptoRng + Rng>(
        key_id: SignedPreKeyId,
        identity: &IdentityKeyPair,
        created_at: i64,
        csprng: &mut R,
    ) -> Self {
        let key_pair = KeyPair::generate(csprng);
        let payload = signed_payload(key_id, created_at, &key_pair.public_key);
        let signature = identity.sign(&[&payload], csprng);
        Self {
            key_id,
            key_pair,
            signature,
            created_at,
            retired_at: None,
        }
    }

    pub fn public(&self) -> SignedPreKey {
        SignedPreKey {
            key_id: self.key_id,
            public_key: self.key_pair.public_key,
            signature: self.signature,
            created_at: self.created_at,
        }
    }

    /// Still usable for accepting handshakes at `now`.
    pub fn accepts_at(&self, now: i64, grace_secs: i64) -> bool {
        match self.retired_at {
            None => true,
            Some(retired_at) => now <= retired_at.saturating_add(grace_secs),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OneTimePreKeyRecord {
    pub key_id: PreKeyId,
    pub key_pair: KeyPair,
}

impl OneTimePreKeyRecord {
    pub fn generate<R: CryptoRng + Rng>(key_id: PreKeyId, csprng: &mut R) -> Self {
        Self {
            key_id,
            key_pair: KeyPair::generate(csprng),
        }
    }

    pub fn public(&self) -> OneTimePreKey {
        OneTimePreKey {
            key_id: self.key_id,
            public_key: self.key_pair.public_key,
        }
    }
}
