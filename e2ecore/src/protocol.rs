//
// Copyright 2020-2021 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Messages carried by the transport.

use serde::{Deserialize, Serialize};

use crate::curve::PublicKey;
use crate::error::{ProtocolError, Result};
use crate::identity::IdentityKey;
use crate::prekey::{PreKeyId, SignedPreKeyId};

pub const MESSAGE_VERSION: u8 = 1;
pub const HEADER_LENGTH: usize = 32 + 4 + 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub ratchet_key: PublicKey,
    pub counter: u32,
    /// Length of the sender's previous sending chain.
    pub previous_counter: u32,
}

impl MessageHeader {
    /// Canonical bytes authenticated as associated data.
    pub fn to_bytes(&self) -> [u8; HEADER_LENGTH] {
        let mut out = [0u8; HEADER_LENGTH];
        out[..32].copy_from_slice(self.ratchet_key.as_bytes());
        out[32..36].copy_from_slice(&self.counter.to_be_bytes());
        out[36..].copy_from_slice(&self.previous_counter.to_be_bytes());
        out
    }
}

/// Key agreement data the initiator attaches until the peer answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandshakeMessage {
    pub identity_key: IdentityKey,
    pub ephemeral_key: PublicKey,
    pub signed_pre_key_id: SignedPreKeyId,
    pub one_time_pre_key_id: Option<PreKeyId>,
    /// Base key of the session the initiator deliberately replaces. Mixed into
    /// the key derivation, so it cannot be altered in transit.
    pub supersedes: Option<PublicKey>,
}

impl HandshakeMessage {
    /// Ordering key used to break simultaneous initiation.
    pub fn tiebreak_key(&self) -> ([u8; 32], [u8; 32]) {
        (*self.identity_key.as_bytes(), *self.ephemeral_key.as_bytes())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub handshake: Option<HandshakeMessage>,
    pub header: MessageHeader,
    pub ciphertext: Vec<u8>,
}

impl EncryptedMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = vec![MESSAGE_VERSION];
        out.extend(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&version, body) = bytes
            .split_first()
            .ok_or(ProtocolError::InvalidMessage("empty message"))?;
        if version != MESSAGE_VERSION {
            return Err(ProtocolError::InvalidMessage("unsupported message version"));
        }
        let (message, read): (Self, usize) =
            bincode::serde::decode_from_slice(body, bincode::config::standard())?;
        if read != body.len() {
            return Err(ProtocolError::InvalidMessage("trailing bytes"));
        }
        Ok(message)
    }
}
