//
// Copyright 2020-2022 Signal Messenger, LLC.
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Per-message symmetric ratchet plus the DH ratchet.
//!
//! The DH ratchet runs lazily: a message under a new peer ratchet key only
//! derives the new receiving chain and flags the session. The next outgoing
//! message generates our new ratchet key pair.

use log::{debug, trace};
use rand::{CryptoRng, Rng};

use crate::consts::{MAX_FORWARD_JUMP, MAX_SKIPPED_MESSAGE_KEYS};
use crate::crypto;
use crate::curve::{KeyPair, PublicKey};
use crate::error::{DecryptionFailure, ProtocolError, Result};
use crate::identity::IdentityKey;
use crate::keys::MessageKeys;
use crate::protocol::{EncryptedMessage, HEADER_LENGTH, MessageHeader};
use crate::session::Session;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RatchetEngine {
    max_skipped_message_keys: usize,
    max_forward_jump: u32,
}

impl Default for RatchetEngine {
    fn default() -> Self {
        Self::new(MAX_SKIPPED_MESSAGE_KEYS, MAX_FORWARD_JUMP)
    }
}

impl RatchetEngine {
    pub fn new(max_skipped_message_keys: usize, max_forward_jump: u32) -> Self {
        Self {
            max_skipped_message_keys,
            max_forward_jump,
        }
    }

    pub fn encrypt<R: Rng + CryptoRng>(
        &self,
        session: &mut Session,
        plaintext: &[u8],
        csprng: &mut R,
    ) -> Result<EncryptedMessage> {
        if session.pending_dh_ratchet {
            let peer_ratchet_key = session
                .peer_ratchet_key
                .ok_or(ProtocolError::SessionNotEstablished)?;
            let our_new_key = KeyPair::generate(csprng);
            let (root_key, sending_chain) = session
                .root_key
                .create_chain(&peer_ratchet_key, &our_new_key.private_key);
            session.previous_sending_counter = session.sending_chain.index();
            session.root_key = root_key;
            session.sending_chain = sending_chain;
            session.sending_ratchet_key_pair = our_new_key;
            session.pending_dh_ratchet = false;
            debug!(
                "Sending DH ratchet step for {}, new ratchet key {}",
                session.peer, session.sending_ratchet_key_pair.public_key
            );
        }

        let next_chain = session.sending_chain.next_chain_key();
        let message_keys = next_chain.message_keys();
        session.sending_chain = next_chain;

        let header = MessageHeader {
            ratchet_key: session.sending_ratchet_key_pair.public_key,
            counter: message_keys.counter(),
            previous_counter: session.previous_sending_counter,
        };
        let ad = associated_data(
            &session.local_identity_key,
            &session.peer_identity_key,
            &header,
        );
        let ciphertext = crypto::aes_256_gcm_encrypt(
            message_keys.cipher_key(),
            message_keys.nonce(),
            plaintext,
            &ad,
        )?;

        trace!("Encrypted message {} for {}", header.counter, session.peer);

        Ok(EncryptedMessage {
            handshake: session.pending_handshake,
            header,
            ciphertext,
        })
    }

    /// Decrypts on a copy of the session and writes it back only on success,
    /// so a failed message leaves no trace in the ratchet state.
    pub fn decrypt(
        &self,
        session: &mut Session,
        header: &MessageHeader,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let mut working = session.clone();
        let plaintext = self.decrypt_in_place(&mut working, header, ciphertext)?;
        // Any authenticated reply means the peer holds the session.
        working.pending_handshake = None;
        *session = working;
        Ok(plaintext)
    }

    fn decrypt_in_place(
        &self,
        session: &mut Session,
        header: &MessageHeader,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        if header.counter == 0 {
            return Err(DecryptionFailure::ZeroCounter.into());
        }

        let message_keys = match session
            .skipped_message_keys
            .take(&header.ratchet_key, header.counter)
        {
            Some(keys) => {
                debug!(
                    "Using cached message key {} from {}",
                    header.counter, session.peer
                );
                keys
            }
            None => {
                if session.peer_ratchet_key != Some(header.ratchet_key) {
                    self.receiving_dh_ratchet(session, header)?;
                }
                self.advance_receiving_chain(session, header)?
            }
        };

        let ad = associated_data(
            &session.peer_identity_key,
            &session.local_identity_key,
            header,
        );
        let plaintext = crypto::aes_256_gcm_decrypt(
            message_keys.cipher_key(),
            message_keys.nonce(),
            ciphertext,
            &ad,
        )?;

        trace!("Decrypted message {} from {}", header.counter, session.peer);
        Ok(plaintext)
    }

    fn receiving_dh_ratchet(&self, session: &mut Session, header: &MessageHeader) -> Result<()> {
        // Keep the tail of the chain the peer just closed.
        if let Some(old_key) = session.peer_ratchet_key
            && session.receiving_chain.is_some()
        {
            self.skip_message_keys(session, old_key, header.previous_counter)?;
        }

        let (root_key, receiving_chain) = session.root_key.create_chain(
            &header.ratchet_key,
            &session.sending_ratchet_key_pair.private_key,
        );
        session.root_key = root_key;
        session.receiving_chain = Some(receiving_chain);
        session.peer_ratchet_key = Some(header.ratchet_key);
        session.pending_dh_ratchet = true;

        debug!(
            "Receiving DH ratchet step for {}, peer ratchet key {}",
            session.peer, header.ratchet_key
        );
        Ok(())
    }

    /// Caches message keys of the current receiving chain up to and including
    /// `until`.
    fn skip_message_keys(
        &self,
        session: &mut Session,
        ratchet_key: PublicKey,
        until: u32,
    ) -> Result<()> {
        let Some(mut chain) = session.receiving_chain.clone() else {
            return Err(ProtocolError::SessionNotEstablished);
        };
        if until <= chain.index() {
            return Ok(());
        }
        let jump = until - chain.index();
        if jump > self.max_forward_jump {
            return Err(DecryptionFailure::TooFarInFuture {
                jump,
                limit: self.max_forward_jump,
            }
            .into());
        }
        while chain.index() < until {
            chain = chain.next_chain_key();
            session.remember_skipped(
                ratchet_key,
                chain.message_keys(),
                self.max_skipped_message_keys,
            );
        }
        session.receiving_chain = Some(chain);
        Ok(())
    }

    fn advance_receiving_chain(
        &self,
        session: &mut Session,
        header: &MessageHeader,
    ) -> Result<MessageKeys> {
        let current = session
            .receiving_chain
            .as_ref()
            .map(|chain| chain.index())
            .ok_or(ProtocolError::SessionNotEstablished)?;
        if header.counter <= current {
            return Err(DecryptionFailure::DuplicateOrEvicted {
                counter: header.counter,
            }
            .into());
        }

        self.skip_message_keys(session, header.ratchet_key, header.counter - 1)?;

        let chain = session
            .receiving_chain
            .as_ref()
            .ok_or(ProtocolError::SessionNotEstablished)?
            .next_chain_key();
        let message_keys = chain.message_keys();
        session.receiving_chain = Some(chain);
        Ok(message_keys)
    }
}

fn associated_data(
    sender: &IdentityKey,
    receiver: &IdentityKey,
    header: &MessageHeader,
) -> [u8; 64 + HEADER_LENGTH] {
    let mut ad = [0u8; 64 + HEADER_LENGTH];
    ad[..32].copy_from_slice(sender.as_bytes());
    ad[32..64].copy_from_slice(receiver.as_bytes());
    ad[64..].copy_from_slice(&header.to_bytes());
    ad
}
