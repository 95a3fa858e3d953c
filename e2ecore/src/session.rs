//
// Copyright 2020-2022 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Per-peer-device ratchet state.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::consts::{MAX_ARCHIVED_SESSIONS, MAX_SKIPPED_MESSAGE_KEYS};
use crate::curve::{KeyPair, PublicKey};
use crate::device::DeviceAddress;
use crate::error::Result;
use crate::identity::IdentityKey;
use crate::keys::{ChainKey, MessageKeys, RootKey};
use crate::prekey::PreKeyId;
use crate::protocol::HandshakeMessage;

/// Bounded cache of message keys for messages that were skipped over. The
/// oldest entry is evicted first.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SkippedMessageKeys {
    entries: VecDeque<(PublicKey, MessageKeys)>,
}

impl SkippedMessageKeys {
    pub fn insert(&mut self, ratchet_key: PublicKey, keys: MessageKeys, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.entries.len() >= capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((ratchet_key, keys));
    }

    /// Removes and returns the key, so it can only ever be used once.
    pub fn take(&mut self, ratchet_key: &PublicKey, counter: u32) -> Option<MessageKeys> {
        let position = self
            .entries
            .iter()
            .position(|(key, keys)| key == ratchet_key && keys.counter() == counter)?;
        self.entries.remove(position).map(|(_, keys)| keys)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub(crate) local_identity_key: IdentityKey,
    pub(crate) peer_identity_key: IdentityKey,
    pub(crate) peer: DeviceAddress,
    pub(crate) root_key: RootKey,
    pub(crate) sending_chain: ChainKey,
    pub(crate) receiving_chain: Option<ChainKey>,
    pub(crate) sending_ratchet_key_pair: KeyPair,
    pub(crate) peer_ratchet_key: Option<PublicKey>,
    pub(crate) previous_sending_counter: u32,
    pub(crate) pending_dh_ratchet: bool,
    pub(crate) skipped_message_keys: SkippedMessageKeys,
    pub(crate) base_key: PublicKey,
    pub(crate) pending_handshake: Option<HandshakeMessage>,
    /// Our own handshake, kept after the peer acknowledged it.
    pub(crate) local_handshake: Option<HandshakeMessage>,
    pub(crate) one_time_pre_key_id: Option<PreKeyId>,
    pub(crate) session_id: [u8; 32],
}

impl Session {
    pub fn peer(&self) -> &DeviceAddress {
        &self.peer
    }

    pub fn local_identity_key(&self) -> &IdentityKey {
        &self.local_identity_key
    }

    pub fn peer_identity_key(&self) -> &IdentityKey {
        &self.peer_identity_key
    }

    /// Ephemeral key of the agreement that produced this session.
    pub fn base_key(&self) -> &PublicKey {
        &self.base_key
    }

    /// Fingerprint of the initial root key. Equal on both ends of a session.
    pub fn session_id(&self) -> &[u8; 32] {
        &self.session_id
    }

    /// Handshake still attached to outgoing messages, initiator side only.
    pub fn pending_handshake(&self) -> Option<&HandshakeMessage> {
        self.pending_handshake.as_ref()
    }

    /// Whether this side initiated and has not yet heard back from the peer.
    pub fn is_unacknowledged(&self) -> bool {
        self.pending_handshake.is_some()
    }

    /// Handshake this side sent when it initiated the session, acknowledged
    /// or not. `None` for sessions accepted from the peer.
    pub fn local_handshake(&self) -> Option<&HandshakeMessage> {
        self.local_handshake.as_ref()
    }

    pub fn one_time_pre_key_id(&self) -> Option<PreKeyId> {
        self.one_time_pre_key_id
    }

    pub fn send_message_counter(&self) -> u32 {
        self.sending_chain.index()
    }

    pub fn receive_message_counter(&self) -> u32 {
        self.receiving_chain.as_ref().map_or(0, ChainKey::index)
    }

    pub fn previous_sending_counter(&self) -> u32 {
        self.previous_sending_counter
    }

    pub fn pending_dh_ratchet(&self) -> bool {
        self.pending_dh_ratchet
    }

    pub fn sending_ratchet_key(&self) -> &PublicKey {
        &self.sending_ratchet_key_pair.public_key
    }

    pub fn peer_ratchet_key(&self) -> Option<&PublicKey> {
        self.peer_ratchet_key.as_ref()
    }

    pub fn skipped_message_keys(&self) -> usize {
        self.skipped_message_keys.len()
    }

    pub(crate) fn remember_skipped(
        &mut self,
        ratchet_key: PublicKey,
        keys: MessageKeys,
        capacity: usize,
    ) {
        self.skipped_message_keys.insert(ratchet_key, keys, capacity);
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let (session, _): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(session)
    }

    /// Initial state of the side that fetched the bundle.
    pub(crate) fn new_initiator(
        params: InitialParameters,
        handshake: HandshakeMessage,
        peer_signed_pre_key: PublicKey,
        sending_ratchet_key_pair: KeyPair,
    ) -> Self {
        let (root_key, sending_chain) = params
            .root_key
            .create_chain(&peer_signed_pre_key, &sending_ratchet_key_pair.private_key);
        Self {
            local_identity_key: params.local_identity_key,
            peer_identity_key: params.peer_identity_key,
            peer: params.peer,
            session_id: params.root_key.fingerprint(),
            root_key,
            sending_chain,
            // The acceptor's first chain runs under its signed pre-key.
            receiving_chain: Some(params.chain_key),
            sending_ratchet_key_pair,
            peer_ratchet_key: Some(peer_signed_pre_key),
            previous_sending_counter: 0,
            pending_dh_ratchet: false,
            skipped_message_keys: SkippedMessageKeys::default(),
            base_key: handshake.ephemeral_key,
            pending_handshake: Some(handshake),
            local_handshake: Some(handshake),
            one_time_pre_key_id: handshake.one_time_pre_key_id,
        }
    }

    /// Initial state of the side that received a handshake.
    pub(crate) fn new_acceptor(
        params: InitialParameters,
        handshake: &HandshakeMessage,
        signed_pre_key_pair: KeyPair,
    ) -> Self {
        Self {
            local_identity_key: params.local_identity_key,
            peer_identity_key: params.peer_identity_key,
            peer: params.peer,
            session_id: params.root_key.fingerprint(),
            root_key: params.root_key,
            sending_chain: params.chain_key,
            receiving_chain: None,
            sending_ratchet_key_pair: signed_pre_key_pair,
            peer_ratchet_key: None,
            previous_sending_counter: 0,
            pending_dh_ratchet: false,
            skipped_message_keys: SkippedMessageKeys::default(),
            base_key: handshake.ephemeral_key,
            pending_handshake: None,
            local_handshake: None,
            one_time_pre_key_id: handshake.one_time_pre_key_id,
        }
    }
}

/// Everything stored for one peer device: the active session and a few
/// superseded ones, newest first.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    current: Option<Session>,
    previous: VecDeque<Session>,
    /// Base key of the session dropped by [`SessionRecord::forget`].
    forgotten_base_key: Option<PublicKey>,
}

impl SessionRecord {
    pub fn new(session: Session) -> Self {
        Self {
            current: Some(session),
            previous: VecDeque::new(),
            forgotten_base_key: None,
        }
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Session> {
        self.current.as_mut()
    }

    pub fn has_current(&self) -> bool {
        self.current.is_some()
    }

    pub fn previous(&self) -> impl Iterator<Item = &Session> {
        self.previous.iter()
    }

    pub fn previous_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.previous.iter_mut()
    }

    /// Installs `session` as current and archives the one it replaces.
    pub fn promote(&mut self, session: Session) {
        self.forgotten_base_key = None;
        if let Some(old) = self.current.replace(session) {
            self.archive(old);
        }
    }

    /// Drops every session but remembers the base key of the current one, so
    /// the next handshake can name the session it replaces.
    pub fn forget(&mut self) {
        if let Some(current) = self.current.take() {
            self.forgotten_base_key = Some(current.base_key);
        }
        self.previous.clear();
    }

    /// Base key a new handshake towards this peer supersedes.
    pub fn superseded_base_key(&self) -> Option<PublicKey> {
        self.current
            .as_ref()
            .map(|session| session.base_key)
            .or(self.forgotten_base_key)
    }

    /// Keeps `session` only for decrypting messages already in flight.
    pub fn archive(&mut self, session: Session) {
        self.previous.push_front(session);
        self.previous.truncate(MAX_ARCHIVED_SESSIONS);
    }

    pub fn find_by_base_key(&mut self, base_key: &PublicKey) -> Option<&mut Session> {
        if let Some(current) = self.current.as_mut()
            && current.base_key() == base_key
        {
            return Some(current);
        }
        self.previous
            .iter_mut()
            .find(|session| session.base_key() == base_key)
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.previous.is_empty() && self.forgotten_base_key.is_none()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let (record, _): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(record)
    }
}

/// Output of the key agreement plus the identities it binds.
pub(crate) struct InitialParameters {
    pub local_identity_key: IdentityKey,
    pub peer_identity_key: IdentityKey,
    pub peer: DeviceAddress,
    pub root_key: RootKey,
    pub chain_key: ChainKey,
}
