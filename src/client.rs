use std::sync::{Arc, Weak};
use std::time::Duration;

use e2ecore::{
    BundleValidator, DeviceAddress, EncryptedMessage, HandshakeMessage, IdentityKey,
    PreKeyBundle, ProtocolError, RatchetEngine, Session, SessionRecord, Tiebreak,
    accept_session, initiate_session, resolve_simultaneous,
};
use futures_util::future::join_all;
use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::ClientConfig;
use crate::directory::{Directory, DirectoryClient};
use crate::error::{E2eeError, Result};
use crate::identity::IdentityStore;
use crate::prekeys::PreKeyManager;
use crate::session_store::{SessionGuard, SessionStore};
use crate::store::{Backend, InMemoryBackend};

/// What one [`Client::run_maintenance`] pass changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub rotated: bool,
    pub pruned: usize,
    pub replenished: usize,
}

impl MaintenanceReport {
    fn bundle_changed(&self) -> bool {
        self.rotated || self.replenished > 0
    }
}

/// Outcome of [`Client::establish_session`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EstablishedSession {
    pub session_id: [u8; 32],
    /// The peer's bundle had no one-time pre-key, so the agreement has weaker
    /// replay protection until the first reply.
    pub degraded: bool,
}

enum Placement {
    /// The peer came back with a different identity key.
    Replace,
    Promote,
    Archive,
}

/// One device's end-to-end encryption endpoint.
pub struct Client {
    address: DeviceAddress,
    config: ClientConfig,
    clock: Arc<dyn Clock>,
    engine: RatchetEngine,
    validator: BundleValidator,
    identity: Arc<IdentityStore>,
    prekeys: Arc<PreKeyManager>,
    sessions: SessionStore,
    directory: DirectoryClient,
}

impl Client {
    pub fn builder(address: DeviceAddress) -> ClientBuilder {
        ClientBuilder::new(address)
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn identity_key(&self) -> Result<IdentityKey> {
        self.identity.identity_key().await
    }

    /// Brings the device to a publishable state: identity, a fresh signed
    /// pre-key, a full one-time pool, and the bundle pushed to the directory.
    /// Safe to call again after a restart.
    pub async fn provision(&self) -> Result<IdentityKey> {
        let identity = self.identity.provision().await?;
        if self.prekeys.needs_rotation().await? {
            self.prekeys.rotate_signed_pre_key().await?;
        }
        self.prekeys
            .replenish_one_time_pre_keys(self.config.one_time_pre_key_target)
            .await?;
        self.publish_bundle().await?;
        info!("Device {} provisioned", self.address);
        Ok(*identity.identity_key())
    }

    pub async fn publish_bundle(&self) -> Result<()> {
        let bundle = self.prekeys.publishable_bundle().await?;
        let count = bundle.one_time_pre_keys.len();
        self.directory
            .publish(&self.address, bundle, self.config.directory_timeout())
            .await?;
        debug!(
            "Published bundle for {} with {} one-time pre-keys",
            self.address, count
        );
        Ok(())
    }

    pub async fn one_time_pool_size(&self) -> Result<usize> {
        self.prekeys.one_time_pool_size().await
    }

    /// Fetches the peer's bundle and starts a session with it. Uses the
    /// configured directory timeout.
    pub async fn establish_session(&self, peer: &DeviceAddress) -> Result<EstablishedSession> {
        self.establish_session_with_timeout(peer, self.config.directory_timeout())
            .await
    }

    pub async fn establish_session_with_timeout(
        &self,
        peer: &DeviceAddress,
        timeout: Duration,
    ) -> Result<EstablishedSession> {
        let bundle = self.directory.fetch(peer, timeout).await?;
        self.establish_session_with_bundle(peer, bundle).await
    }

    /// Starts a session from an already fetched bundle.
    pub async fn establish_session_with_bundle(
        &self,
        peer: &DeviceAddress,
        bundle: PreKeyBundle,
    ) -> Result<EstablishedSession> {
        let bundle = self.validator.validate(bundle, self.clock.unix_seconds())?;
        let degraded = bundle.degraded();
        if degraded {
            warn!(
                "Bundle for {} has no one-time pre-keys, continuing without one",
                peer
            );
        }
        let identity = self.identity.current_identity().await?;

        let mut guard = self.sessions.lock(peer).await?;
        // The peer adopts the new session over the one named here even if our
        // handshake would lose a simultaneous initiation.
        let supersedes = guard.record().superseded_base_key();
        let (session, _) = initiate_session(
            &identity,
            peer.clone(),
            &bundle,
            supersedes,
            &mut rand::rng(),
        )?;
        let session_id = *session.session_id();
        let record = guard.record_mut();
        match record.current() {
            Some(current) if current.peer_identity_key() != session.peer_identity_key() => {
                warn!(
                    "Identity of {} changed from {} to {}, dropping old sessions",
                    peer,
                    current.peer_identity_key(),
                    session.peer_identity_key()
                );
                *record = SessionRecord::new(session);
            }
            _ => record.promote(session),
        }
        guard.commit().await?;

        info!(
            "Session {} initiated with {}",
            hex::encode(&session_id[..8]),
            peer
        );
        Ok(EstablishedSession {
            session_id,
            degraded,
        })
    }

    /// Establishes sessions with several devices concurrently. Each peer gets
    /// its own result.
    pub async fn establish_sessions(
        &self,
        peers: &[DeviceAddress],
    ) -> Vec<(DeviceAddress, Result<EstablishedSession>)> {
        join_all(peers.iter().map(|peer| async move {
            let result = self.establish_session(peer).await;
            (peer.clone(), result)
        }))
        .await
    }

    /// Encrypts for the peer's current session and returns wire bytes.
    pub async fn encrypt(&self, peer: &DeviceAddress, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut guard = self.sessions.lock(peer).await?;
        let session = guard
            .record_mut()
            .current_mut()
            .ok_or(ProtocolError::SessionNotEstablished)?;
        let message = self.engine.encrypt(session, plaintext, &mut rand::rng())?;
        let bytes = message.encode()?;
        guard.commit().await?;
        Ok(bytes)
    }

    /// Decrypts wire bytes from the peer. A message carrying a handshake may
    /// create a session. A failed decryption leaves every session untouched.
    pub async fn decrypt(&self, peer: &DeviceAddress, bytes: &[u8]) -> Result<Vec<u8>> {
        let message = EncryptedMessage::decode(bytes)?;
        let mut guard = self.sessions.lock(peer).await?;
        let plaintext = match &message.handshake {
            Some(handshake) => {
                self.decrypt_with_handshake(&mut guard, handshake, &message)
                    .await?
            }
            None => self.decrypt_with_existing(guard.record_mut(), &message)?,
        };
        guard.commit().await?;
        Ok(plaintext)
    }

    async fn decrypt_with_handshake(
        &self,
        guard: &mut SessionGuard,
        handshake: &HandshakeMessage,
        message: &EncryptedMessage,
    ) -> Result<Vec<u8>> {
        if let Some(session) = guard.record_mut().find_by_base_key(&handshake.ephemeral_key) {
            return Ok(self
                .engine
                .decrypt(session, &message.header, &message.ciphertext)?);
        }

        let identity = self.identity.current_identity().await?;
        let signed_pre_key = self
            .prekeys
            .signed_pre_key_pair(handshake.signed_pre_key_id)
            .await?;
        let one_time_pre_key = match handshake.one_time_pre_key_id {
            Some(key_id) => Some(self.prekeys.one_time_pre_key_pair(key_id).await?),
            None => None,
        };
        let mut accepted = accept_session(
            &identity,
            guard.address().clone(),
            handshake,
            &signed_pre_key,
            one_time_pre_key.as_ref(),
        )?;
        let plaintext = self
            .engine
            .decrypt(&mut accepted, &message.header, &message.ciphertext)?;

        // Only an authenticated handshake may burn a one-time pre-key. If
        // another session consumed it meanwhile, this one loses.
        if let Some(key_id) = handshake.one_time_pre_key_id {
            self.prekeys.consume_one_time_pre_key(key_id).await?;
        }

        self.place_accepted(guard.record_mut(), handshake, accepted);
        Ok(plaintext)
    }

    fn place_accepted(
        &self,
        record: &mut SessionRecord,
        handshake: &HandshakeMessage,
        accepted: Session,
    ) {
        let placement = match record.current() {
            Some(current) if current.peer_identity_key() != accepted.peer_identity_key() => {
                warn!(
                    "Identity of {} changed from {} to {}, dropping old sessions",
                    accepted.peer(),
                    current.peer_identity_key(),
                    accepted.peer_identity_key()
                );
                Placement::Replace
            }
            Some(current) if handshake.supersedes.as_ref() == Some(current.base_key()) => {
                Placement::Promote
            }
            // Our own handshake stays the reference after the peer replied, so
            // a losing one that arrives late is still archived.
            Some(current) => match current.local_handshake() {
                Some(local) => match resolve_simultaneous(local, handshake) {
                    Tiebreak::KeepLocal => Placement::Archive,
                    Tiebreak::AcceptPeer => Placement::Promote,
                },
                None => Placement::Promote,
            },
            None => Placement::Promote,
        };

        let short_id = hex::encode(&accepted.session_id()[..8]);
        match placement {
            Placement::Replace => *record = SessionRecord::new(accepted),
            Placement::Promote => record.promote(accepted),
            Placement::Archive => {
                debug!(
                    "Simultaneous initiation with {}, keeping our own session",
                    accepted.peer()
                );
                record.archive(accepted);
                return;
            }
        }
        info!("Session {} accepted from {}", short_id, handshake.identity_key);
    }

    fn decrypt_with_existing(
        &self,
        record: &mut SessionRecord,
        message: &EncryptedMessage,
    ) -> Result<Vec<u8>> {
        let mut first_error = None;
        if let Some(current) = record.current_mut() {
            match self
                .engine
                .decrypt(current, &message.header, &message.ciphertext)
            {
                Ok(plaintext) => return Ok(plaintext),
                Err(e) => first_error = Some(e),
            }
        }
        for session in record.previous_mut() {
            if let Ok(plaintext) = self
                .engine
                .decrypt(session, &message.header, &message.ciphertext)
            {
                debug!("Decrypted with an archived session of {}", session.peer());
                return Ok(plaintext);
            }
        }
        Err(first_error
            .unwrap_or(ProtocolError::SessionNotEstablished)
            .into())
    }

    pub async fn has_session(&self, peer: &DeviceAddress) -> Result<bool> {
        self.sessions.has_session(peer).await
    }

    /// Fingerprint of the current session with `peer`, equal on both devices.
    pub async fn session_id(&self, peer: &DeviceAddress) -> Result<[u8; 32]> {
        let guard = self.sessions.lock(peer).await?;
        guard
            .session()
            .map(|session| *session.session_id())
            .ok_or_else(|| ProtocolError::SessionNotEstablished.into())
    }

    /// Forgets every session with `peer`. The next message needs a new
    /// agreement.
    pub async fn reset_session(&self, peer: &DeviceAddress) -> Result<()> {
        let mut guard = self.sessions.lock(peer).await?;
        guard.record_mut().forget();
        guard.commit().await?;
        info!("Session with {} reset", peer);
        Ok(())
    }

    /// Replaces the identity and wipes all sessions and pre-keys, then
    /// publishes a fresh bundle.
    pub async fn reregister(&self) -> Result<IdentityKey> {
        let identity = self.identity.reregister().await?;
        self.sessions.clear_all().await?;
        self.prekeys.reset().await?;
        self.prekeys.rotate_signed_pre_key().await?;
        self.prekeys
            .replenish_one_time_pre_keys(self.config.one_time_pre_key_target)
            .await?;
        self.publish_bundle().await?;
        Ok(*identity.identity_key())
    }

    /// Rotates the signed pre-key when due, prunes retired ones and tops up
    /// the one-time pool. Republishes the bundle if it changed.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        if self.prekeys.needs_rotation().await? {
            self.prekeys.rotate_signed_pre_key().await?;
            report.rotated = true;
        }
        report.pruned = self.prekeys.prune_retired().await?;
        report.replenished = self
            .prekeys
            .replenish_one_time_pre_keys(self.config.one_time_pre_key_target)
            .await?;
        if report.bundle_changed() {
            self.publish_bundle().await?;
        }
        debug!("Maintenance for {}: {:?}", self.address, report);
        Ok(report)
    }

    /// Starts a task that refills and republishes the one-time pool whenever
    /// it runs low. Returns `None` if one is already running. The task ends
    /// when the client is dropped.
    pub async fn spawn_replenisher(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut requests = self.prekeys.take_replenish_receiver().await?;
        let client: Weak<Self> = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let Some(client) = client.upgrade() else {
                    break;
                };
                debug!(
                    "One-time pool of {} down to {}, replenishing",
                    client.address, request.pool_size
                );
                let target = client.config.one_time_pre_key_target;
                match client.prekeys.replenish_one_time_pre_keys(target).await {
                    Ok(0) => {}
                    Ok(_) => {
                        if let Err(e) = client.publish_bundle().await {
                            warn!("Failed to republish bundle after replenishing: {e}");
                        }
                    }
                    Err(e) => warn!("Failed to replenish one-time pre-keys: {e}"),
                }
            }
            debug!("Replenisher stopped");
        }))
    }
}

pub struct ClientBuilder {
    address: DeviceAddress,
    config: ClientConfig,
    backend: Option<Arc<dyn Backend>>,
    directory: Option<Arc<dyn Directory>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ClientBuilder {
    fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            config: ClientConfig::default(),
            backend: None,
            directory: None,
            clock: None,
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Storage for identity, pre-keys and sessions. Defaults to memory.
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Arc<Client>> {
        let directory = self
            .directory
            .ok_or_else(|| E2eeError::Config("a directory is required".to_string()))?;
        let config = self.config;
        if config.one_time_pre_key_low_watermark > config.one_time_pre_key_target {
            return Err(E2eeError::Config(format!(
                "low watermark {} exceeds pool target {}",
                config.one_time_pre_key_low_watermark, config.one_time_pre_key_target
            )));
        }
        if config.signed_pre_key_rotation_secs > config.signed_pre_key_lifetime_secs {
            return Err(E2eeError::Config(
                "signed pre-keys would expire before rotation".to_string(),
            ));
        }

        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(InMemoryBackend::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let identity = Arc::new(IdentityStore::new(backend.clone()));
        let prekeys = Arc::new(PreKeyManager::new(
            identity.clone(),
            backend.clone(),
            clock.clone(),
            config.clone(),
        ));

        Ok(Arc::new(Client {
            address: self.address,
            engine: config.ratchet_engine(),
            validator: BundleValidator::new(config.freshness_policy()),
            config,
            clock,
            identity,
            prekeys,
            sessions: SessionStore::new(backend),
            directory: DirectoryClient::new(directory),
        }))
    }
}
