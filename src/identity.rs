use std::sync::Arc;

use e2ecore::{IdentityKey, IdentityKeyPair, ProtocolError, Signature};
use log::{info, warn};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::store::keys;
use crate::store::traits::{self, Backend};

/// Owns the device's long-term identity keypair.
pub struct IdentityStore {
    backend: Arc<dyn Backend>,
    cached: RwLock<Option<IdentityKeyPair>>,
}

impl IdentityStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            cached: RwLock::new(None),
        }
    }

    /// Creates the identity on first call; later calls return the stored one.
    pub async fn provision(&self) -> Result<IdentityKeyPair> {
        let mut cached = self.cached.write().await;
        if let Some(identity) = cached.as_ref() {
            return Ok(identity.clone());
        }
        if let Some(identity) =
            traits::load::<IdentityKeyPair>(self.backend.as_ref(), keys::IDENTITY).await?
        {
            *cached = Some(identity.clone());
            return Ok(identity);
        }

        let identity = IdentityKeyPair::generate(&mut rand::rng());
        traits::save(self.backend.as_ref(), keys::IDENTITY, &identity).await?;
        info!("Provisioned identity {}", identity.identity_key());
        *cached = Some(identity.clone());
        Ok(identity)
    }

    pub async fn current_identity(&self) -> Result<IdentityKeyPair> {
        if let Some(identity) = self.cached.read().await.as_ref() {
            return Ok(identity.clone());
        }
        let mut cached = self.cached.write().await;
        match traits::load::<IdentityKeyPair>(self.backend.as_ref(), keys::IDENTITY).await? {
            Some(identity) => {
                *cached = Some(identity.clone());
                Ok(identity)
            }
            None => Err(ProtocolError::IdentityUnavailable.into()),
        }
    }

    pub async fn identity_key(&self) -> Result<IdentityKey> {
        Ok(*self.current_identity().await?.identity_key())
    }

    pub async fn sign(&self, message: &[u8]) -> Result<Signature> {
        let identity = self.current_identity().await?;
        Ok(identity.sign(&[message], &mut rand::rng()))
    }

    pub fn verify(identity_key: &IdentityKey, message: &[u8], signature: &Signature) -> bool {
        identity_key.verify(&[message], signature)
    }

    /// Replaces the identity. Every session and pre-key signed by the old one
    /// becomes useless; the caller is responsible for wiping them.
    pub async fn reregister(&self) -> Result<IdentityKeyPair> {
        let mut cached = self.cached.write().await;
        let identity = IdentityKeyPair::generate(&mut rand::rng());
        traits::save(self.backend.as_ref(), keys::IDENTITY, &identity).await?;
        if let Some(old) = cached.as_ref() {
            warn!(
                "Re-registered: identity {} replaced by {}",
                old.identity_key(),
                identity.identity_key()
            );
        } else {
            info!("Registered identity {}", identity.identity_key());
        }
        *cached = Some(identity.clone());
        Ok(identity)
    }
}
