//! Signed and one-time pre-key lifecycle.

use std::collections::BTreeMap;
use std::sync::Arc;

use e2ecore::{
    KeyPair, OneTimePreKeyRecord, PreKeyBundle, PreKeyId, ProtocolError, SignedPreKey,
    SignedPreKeyId, SignedPreKeyRecord,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};

use crate::clock::Clock;
use crate::config::ClientConfig;
use crate::error::{E2eeError, Result};
use crate::identity::IdentityStore;
use crate::store::keys;
use crate::store::traits::{self, Backend};

/// Posted when the one-time pool drops below the low watermark.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplenishRequest {
    pub pool_size: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PreKeyState {
    next_signed_pre_key_id: SignedPreKeyId,
    next_one_time_pre_key_id: PreKeyId,
    /// Oldest first; at most one entry is not retired.
    signed: Vec<SignedPreKeyRecord>,
    one_time: BTreeMap<PreKeyId, OneTimePreKeyRecord>,
}

impl Default for PreKeyState {
    fn default() -> Self {
        Self {
            next_signed_pre_key_id: 1,
            next_one_time_pre_key_id: 1,
            signed: Vec::new(),
            one_time: BTreeMap::new(),
        }
    }
}

impl PreKeyState {
    fn current_signed(&self) -> Option<&SignedPreKeyRecord> {
        self.signed.iter().rev().find(|r| r.retired_at.is_none())
    }
}

pub struct PreKeyManager {
    identity: Arc<IdentityStore>,
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    config: ClientConfig,
    /// `None` until loaded from the backend.
    state: Mutex<Option<PreKeyState>>,
    replenish_tx: mpsc::Sender<ReplenishRequest>,
    replenish_rx: Mutex<Option<mpsc::Receiver<ReplenishRequest>>>,
}

impl PreKeyManager {
    pub fn new(
        identity: Arc<IdentityStore>,
        backend: Arc<dyn Backend>,
        clock: Arc<dyn Clock>,
        config: ClientConfig,
    ) -> Self {
        // One pending request is enough; later ones coalesce into it.
        let (replenish_tx, replenish_rx) = mpsc::channel(1);
        Self {
            identity,
            backend,
            clock,
            config,
            state: Mutex::new(None),
            replenish_tx,
            replenish_rx: Mutex::new(Some(replenish_rx)),
        }
    }

    /// Hands out the replenish request receiver. Only the first caller gets it.
    pub async fn take_replenish_receiver(&self) -> Option<mpsc::Receiver<ReplenishRequest>> {
        self.replenish_rx.lock().await.take()
    }

    async fn load_state<'a>(
        &self,
        slot: &'a mut Option<PreKeyState>,
    ) -> Result<&'a mut PreKeyState> {
        if slot.is_none() {
            let loaded = traits::load::<PreKeyState>(self.backend.as_ref(), keys::PRE_KEYS)
                .await?
                .unwrap_or_default();
            *slot = Some(loaded);
        }
        Ok(slot.get_or_insert_with(PreKeyState::default))
    }

    async fn persist(&self, state: &PreKeyState) -> Result<()> {
        traits::save(self.backend.as_ref(), keys::PRE_KEYS, state).await?;
        Ok(())
    }

    /// Generates and signs a new signed pre-key; the previous one is retired
    /// but still accepted until its grace period ends. Nothing changes unless
    /// the new state is persisted.
    pub async fn rotate_signed_pre_key(&self) -> Result<SignedPreKey> {
        let identity = self.identity.current_identity().await?;
        let mut guard = self.state.lock().await;
        let state = self.load_state(&mut guard).await?;

        let now = self.clock.unix_seconds();
        let mut next = state.clone();
        let key_id = next.next_signed_pre_key_id;
        next.next_signed_pre_key_id = key_id
            .checked_add(1)
            .ok_or(E2eeError::PreKeyIdsExhausted)?;
        let record = SignedPreKeyRecord::generate(key_id, &identity, now, &mut rand::rng());
        for old in next.signed.iter_mut().filter(|r| r.retired_at.is_none()) {
            old.retired_at = Some(now);
        }
        let public = record.public();
        next.signed.push(record);

        self.persist(&next).await?;
        *state = next;
        info!("Rotated signed pre-key, new id {}", key_id);
        Ok(public)
    }

    /// Tops the one-time pool up to `target_pool_size`. Returns how many keys
    /// were generated.
    pub async fn replenish_one_time_pre_keys(&self, target_pool_size: u32) -> Result<usize> {
        let mut guard = self.state.lock().await;
        let state = self.load_state(&mut guard).await?;

        let missing = (target_pool_size as usize).saturating_sub(state.one_time.len());
        if missing == 0 {
            return Ok(0);
        }
        let mut next = state.clone();
        {
            let mut csprng = rand::rng();
            for _ in 0..missing {
                let key_id = next.next_one_time_pre_key_id;
                next.next_one_time_pre_key_id = key_id
                    .checked_add(1)
                    .ok_or(E2eeError::PreKeyIdsExhausted)?;
                next.one_time
                    .insert(key_id, OneTimePreKeyRecord::generate(key_id, &mut csprng));
            }
        }

        self.persist(&next).await?;
        *state = next;
        info!(
            "Generated {} one-time pre-keys, pool size {}",
            missing,
            state.one_time.len()
        );
        Ok(missing)
    }

    /// The bundle peers need to reach this device: identity key, the current
    /// signed pre-key and every unconsumed one-time pre-key.
    pub async fn publishable_bundle(&self) -> Result<PreKeyBundle> {
        let identity = self.identity.identity_key().await?;
        let mut guard = self.state.lock().await;
        let state = self.load_state(&mut guard).await?;

        let now = self.clock.unix_seconds();
        let signed = state
            .current_signed()
            .filter(|r| now - r.created_at <= self.config.signed_pre_key_lifetime_secs)
            .ok_or(E2eeError::NoSignedPreKey)?;

        Ok(PreKeyBundle {
            identity_key: identity,
            signed_pre_key: signed.public(),
            one_time_pre_keys: state.one_time.values().map(|r| r.public()).collect(),
        })
    }

    /// Private half of an unconsumed one-time pre-key, without consuming it.
    pub async fn one_time_pre_key_pair(&self, key_id: PreKeyId) -> Result<KeyPair> {
        let mut guard = self.state.lock().await;
        let state = self.load_state(&mut guard).await?;
        state
            .one_time
            .get(&key_id)
            .map(|r| r.key_pair.clone())
            .ok_or_else(|| ProtocolError::UnknownPreKeyId(key_id).into())
    }

    /// Removes a one-time pre-key for good. The removal is persisted before the
    /// lock is released, so two concurrent callers can never both get the key.
    pub async fn consume_one_time_pre_key(&self, key_id: PreKeyId) -> Result<OneTimePreKeyRecord> {
        let mut guard = self.state.lock().await;
        let state = self.load_state(&mut guard).await?;

        let Some(record) = state.one_time.remove(&key_id) else {
            warn!("One-time pre-key {} unknown or already used", key_id);
            return Err(ProtocolError::UnknownPreKeyId(key_id).into());
        };
        if let Err(e) = self.persist(state).await {
            state.one_time.insert(key_id, record);
            return Err(e);
        }
        debug!(
            "Consumed one-time pre-key {}, {} left",
            key_id,
            state.one_time.len()
        );

        let pool_size = state.one_time.len();
        if pool_size < self.config.one_time_pre_key_low_watermark as usize {
            match self.replenish_tx.try_send(ReplenishRequest { pool_size }) {
                Ok(()) => debug!("Requested one-time pre-key replenishment at {}", pool_size),
                Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!("Replenish request dropped, nobody is listening")
                }
            }
        }
        Ok(record)
    }

    /// Private half of a signed pre-key that may still accept handshakes.
    pub async fn signed_pre_key_pair(&self, key_id: SignedPreKeyId) -> Result<KeyPair> {
        let mut guard = self.state.lock().await;
        let state = self.load_state(&mut guard).await?;

        let now = self.clock.unix_seconds();
        state
            .signed
            .iter()
            .find(|r| r.key_id == key_id)
            .filter(|r| r.accepts_at(now, self.config.signed_pre_key_grace_secs))
            .map(|r| r.key_pair.clone())
            .ok_or_else(|| ProtocolError::UnknownSignedPreKeyId(key_id).into())
    }

    /// Drops retired signed pre-keys whose grace period has ended.
    pub async fn prune_retired(&self) -> Result<usize> {
        let mut guard = self.state.lock().await;
        let state = self.load_state(&mut guard).await?;

        let now = self.clock.unix_seconds();
        let grace = self.config.signed_pre_key_grace_secs;
        let mut next = state.clone();
        next.signed.retain(|r| r.accepts_at(now, grace));
        let pruned = state.signed.len() - next.signed.len();
        if pruned > 0 {
            self.persist(&next).await?;
            *state = next;
            info!("Pruned {} retired signed pre-keys", pruned);
        }
        Ok(pruned)
    }

    /// Whether the current signed pre-key is missing or due for rotation.
    pub async fn needs_rotation(&self) -> Result<bool> {
        let mut guard = self.state.lock().await;
        let state = self.load_state(&mut guard).await?;
        let now = self.clock.unix_seconds();
        Ok(match state.current_signed() {
            Some(current) => now - current.created_at >= self.config.signed_pre_key_rotation_secs,
            None => true,
        })
    }

    pub async fn one_time_pool_size(&self) -> Result<usize> {
        let mut guard = self.state.lock().await;
        Ok(self.load_state(&mut guard).await?.one_time.len())
    }

    /// Forgets every pre-key. Id counters keep counting so no id is ever
    /// reissued.
    pub async fn reset(&self) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = self.load_state(&mut guard).await?;
        let next = PreKeyState {
            signed: Vec::new(),
            one_time: BTreeMap::new(),
            ..state.clone()
        };
        self.persist(&next).await?;
        *state = next;
        info!("Cleared all pre-keys");
        Ok(())
    }
}
