//
// Copyright 2020-2021 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Curve25519 keys used for both X25519 agreement and XEdDSA signatures.
//!
//! Identity keys are plain X25519 keys. Signatures are computed with XEdDSA so a
//! single keypair can sign pre-keys and take part in the key agreement.
//! See <https://signal.org/docs/specifications/xeddsa/>.

use std::cmp::Ordering;
use std::fmt;

use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::{self, Scalar};
use rand::{CryptoRng, Rng};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_big_array::BigArray;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use thiserror::Error;
use x25519_dalek::StaticSecret;

pub const PRIVATE_KEY_LENGTH: usize = 32;
pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const SIGNATURE_LENGTH: usize = 64;
pub const AGREEMENT_LENGTH: usize = 32;

/// XEdDSA hash prefix: 0xFE followed by 31 bytes of 0xFF.
static XEDDSA_HASH_PREFIX: [u8; 32] = [
    0xFE, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

fn scalar_from_hash(hash: Sha512) -> Scalar {
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&hash.finalize());
    Scalar::from_bytes_mod_order_wide(&wide)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CurveError {
    #[error("bad key length <{0}>, expected {PUBLIC_KEY_LENGTH}")]
    BadKeyLength(usize),
    #[error("bad signature length <{0}>, expected {SIGNATURE_LENGTH}")]
    BadSignatureLength(usize),
}

/// X25519 public key (Montgomery u-coordinate).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CurveError> {
        <[u8; PUBLIC_KEY_LENGTH]>::try_from(bytes)
            .map(Self)
            .map_err(|_| CurveError::BadKeyLength(bytes.len()))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verifies an XEdDSA signature over the concatenation of `message` pieces.
    pub fn verify_signature(&self, message: &[&[u8]], signature: &Signature) -> bool {
        let signature = signature.as_bytes();
        let mont_point = MontgomeryPoint(self.0);
        let ed_pub_key_point =
            match mont_point.to_edwards((signature[SIGNATURE_LENGTH - 1] & 0b1000_0000_u8) >> 7) {
                Some(x) => x,
                None => return false,
            };
        let cap_a = ed_pub_key_point.compress();
        let mut cap_r = [0u8; 32];
        cap_r.copy_from_slice(&signature[..32]);
        let mut s = [0u8; 32];
        s.copy_from_slice(&signature[32..]);
        s[31] &= 0b0111_1111_u8;
        if (s[31] & 0b1110_0000_u8) != 0 {
            return false;
        }
        let minus_cap_a = -ed_pub_key_point;

        let mut hash = Sha512::new();
        hash.update(&cap_r[..]);
        hash.update(cap_a.as_bytes());
        for message_piece in message {
            hash.update(message_piece);
        }
        let h = scalar_from_hash(hash);

        let cap_r_check_point = EdwardsPoint::vartime_double_scalar_mul_basepoint(
            &h,
            &minus_cap_a,
            &Scalar::from_bytes_mod_order(s),
        );
        let cap_r_check = cap_r_check_point.compress();

        bool::from(cap_r_check.as_bytes().ct_eq(&cap_r))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short fingerprint, enough for logs.
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// 64-byte XEdDSA signature. The sign bit of the Edwards key travels in the most
/// significant bit of the last byte.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "BigArray")] [u8; SIGNATURE_LENGTH]);

impl Signature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CurveError> {
        <[u8; SIGNATURE_LENGTH]>::try_from(bytes)
            .map(Self)
            .map_err(|_| CurveError::BadSignatureLength(bytes.len()))
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; SIGNATURE_LENGTH] {
        self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(self.0))
    }
}

/// X25519 private key with the Edwards values XEdDSA needs cached up front.
#[derive(Clone)]
pub struct PrivateKey {
    secret: StaticSecret,
    scalar: Scalar,
    ed_public_key: CompressedEdwardsY,
    sign_bit: u8,
}

impl PrivateKey {
    fn compute_edwards_cache(secret: &StaticSecret) -> (Scalar, CompressedEdwardsY, u8) {
        let scalar = Scalar::from_bytes_mod_order(secret.to_bytes());
        let ed_public_key = (&scalar * ED25519_BASEPOINT_TABLE).compress();
        let sign_bit = ed_public_key.as_bytes()[31] & 0b1000_0000_u8;
        (scalar, ed_public_key, sign_bit)
    }

    pub fn generate<R>(csprng: &mut R) -> Self
    where
        R: CryptoRng + Rng,
    {
        let mut bytes = [0u8; PRIVATE_KEY_LENGTH];
        csprng.fill_bytes(&mut bytes);
        Self::from(bytes)
    }

    pub fn calculate_agreement(&self, their_public_key: &PublicKey) -> [u8; AGREEMENT_LENGTH] {
        *self
            .secret
            .diffie_hellman(&x25519_dalek::PublicKey::from(their_public_key.to_bytes()))
            .as_bytes()
    }

    /// Calculates an XEdDSA signature over the concatenation of `message` pieces.
    pub fn calculate_signature<R>(&self, csprng: &mut R, message: &[&[u8]]) -> Signature
    where
        R: CryptoRng + Rng,
    {
        let mut random_bytes = [0u8; 64];
        csprng.fill_bytes(&mut random_bytes);

        let key_data = self.secret.to_bytes();

        // r = hash1(a || M || Z)
        let mut hash1 = Sha512::new();
        hash1.update(&XEDDSA_HASH_PREFIX[..]);
        hash1.update(&key_data[..]);
        for message_piece in message {
            hash1.update(message_piece);
        }
        hash1.update(&random_bytes[..]);

        let r = scalar_from_hash(hash1);
        let cap_r = (&r * ED25519_BASEPOINT_TABLE).compress();

        // h = hash(R || A || M)
        let mut hash = Sha512::new();
        hash.update(cap_r.as_bytes());
        hash.update(self.ed_public_key.as_bytes());
        for message_piece in message {
            hash.update(message_piece);
        }

        let h = scalar_from_hash(hash);
        let s = (h * self.scalar) + r;

        let mut result = [0u8; SIGNATURE_LENGTH];
        result[..32].copy_from_slice(cap_r.as_bytes());
        result[32..].copy_from_slice(s.as_bytes());
        result[SIGNATURE_LENGTH - 1] &= 0b0111_1111_u8;
        result[SIGNATURE_LENGTH - 1] |= self.sign_bit;
        Signature(result)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(*x25519_dalek::PublicKey::from(&self.secret).as_bytes())
    }

    pub fn to_bytes(&self) -> [u8; PRIVATE_KEY_LENGTH] {
        self.secret.to_bytes()
    }
}

impl From<[u8; PRIVATE_KEY_LENGTH]> for PrivateKey {
    fn from(private_key: [u8; PRIVATE_KEY_LENGTH]) -> Self {
        let secret = StaticSecret::from(scalar::clamp_integer(private_key));
        let (scalar, ed_public_key, sign_bit) = Self::compute_edwards_cache(&secret);
        PrivateKey {
            secret,
            scalar,
            ed_public_key,
            sign_bit,
        }
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey").field("secret", &"***").finish()
    }
}

impl Serialize for PrivateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Serialize::serialize(&self.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        <[u8; PRIVATE_KEY_LENGTH] as Deserialize>::deserialize(deserializer).map(PrivateKey::from)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub private_key: PrivateKey,
}

impl KeyPair {
    pub fn generate<R: CryptoRng + Rng>(csprng: &mut R) -> Self {
        Self::from_private_key(PrivateKey::generate(csprng))
    }

    pub fn from_private_key(private_key: PrivateKey) -> Self {
        Self {
            public_key: private_key.public_key(),
            private_key,
        }
    }

    pub fn calculate_agreement(&self, their_public_key: &PublicKey) -> [u8; AGREEMENT_LENGTH] {
        self.private_key.calculate_agreement(their_public_key)
    }

    pub fn calculate_signature<R: CryptoRng + Rng>(
        &self,
        message: &[&[u8]],
        csprng: &mut R,
    ) -> Signature {
        self.private_key.calculate_signature(csprng, message)
    }
}
