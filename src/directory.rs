//! Pre-key bundle directory: where bundles are published and fetched.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use e2ecore::{DeviceAddress, PreKeyBundle};
use log::debug;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    #[error("directory request timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn publish(
        &self,
        device: &DeviceAddress,
        bundle: PreKeyBundle,
    ) -> Result<(), DirectoryError>;

    async fn fetch(&self, device: &DeviceAddress) -> Result<PreKeyBundle, DirectoryError>;
}

/// Bounds every directory call with a timeout. Dropping the returned future
/// cancels the request.
#[derive(Clone)]
pub struct DirectoryClient {
    inner: Arc<dyn Directory>,
}

impl DirectoryClient {
    pub fn new(inner: Arc<dyn Directory>) -> Self {
        Self { inner }
    }

    pub async fn publish(
        &self,
        device: &DeviceAddress,
        bundle: PreKeyBundle,
        timeout: Duration,
    ) -> Result<(), DirectoryError> {
        tokio::time::timeout(timeout, self.inner.publish(device, bundle))
            .await
            .map_err(|_| DirectoryError::Timeout(timeout))?
    }

    pub async fn fetch(
        &self,
        device: &DeviceAddress,
        timeout: Duration,
    ) -> Result<PreKeyBundle, DirectoryError> {
        tokio::time::timeout(timeout, self.inner.fetch(device))
            .await
            .map_err(|_| DirectoryError::Timeout(timeout))?
    }
}

/// In-process directory. Like a real server it hands out each one-time pre-key
/// to a single fetch only.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    bundles: Arc<RwLock<HashMap<DeviceAddress, PreKeyBundle>>>,
    unavailable: Arc<AtomicBool>,
    delay_ms: Arc<AtomicU64>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with `Unavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delays every call, to exercise timeouts.
    pub fn set_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Bundle as currently stored, without consuming anything.
    pub async fn peek(&self, device: &DeviceAddress) -> Option<PreKeyBundle> {
        self.bundles.read().await.get(device).cloned()
    }

    async fn simulate_network(&self) -> Result<(), DirectoryError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable(
                "directory is offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn publish(
        &self,
        device: &DeviceAddress,
        bundle: PreKeyBundle,
    ) -> Result<(), DirectoryError> {
        self.simulate_network().await?;
        debug!(
            "Directory stored bundle for {} with {} one-time pre-keys",
            device,
            bundle.one_time_pre_keys.len()
        );
        self.bundles.write().await.insert(device.clone(), bundle);
        Ok(())
    }

    async fn fetch(&self, device: &DeviceAddress) -> Result<PreKeyBundle, DirectoryError> {
        self.simulate_network().await?;
        let mut bundles = self.bundles.write().await;
        let stored = bundles
            .get_mut(device)
            .ok_or_else(|| DirectoryError::Unavailable(format!("no bundle for {device}")))?;

        let one_time = if stored.one_time_pre_keys.is_empty() {
            Vec::new()
        } else {
            vec![stored.one_time_pre_keys.remove(0)]
        };
        Ok(PreKeyBundle {
            identity_key: stored.identity_key,
            signed_pre_key: stored.signed_pre_key.clone(),
            one_time_pre_keys: one_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use e2ecore::{IdentityKeyPair, OneTimePreKeyRecord, SignedPreKeyRecord};

    fn bundle(one_time: u32) -> PreKeyBundle {
        let mut csprng = rand::rng();
        let identity = IdentityKeyPair::generate(&mut csprng);
        PreKeyBundle {
            identity_key: *identity.identity_key(),
            signed_pre_key: SignedPreKeyRecord::generate(1, &identity, 0, &mut csprng).public(),
            one_time_pre_keys: (1..=one_time)
                .map(|id| OneTimePreKeyRecord::generate(id, &mut csprng).public())
                .collect(),
        }
    }

    #[tokio::test]
    async fn fetch_hands_out_each_one_time_key_once() {
        let directory = MemoryDirectory::new();
        let device = DeviceAddress::new("bob", "1");
        directory.publish(&device, bundle(2)).await.unwrap();

        let first = directory.fetch(&device).await.unwrap();
        let second = directory.fetch(&device).await.unwrap();
        let third = directory.fetch(&device).await.unwrap();

        assert_eq!(first.one_time_pre_keys[0].key_id, 1);
        assert_eq!(second.one_time_pre_keys[0].key_id, 2);
        assert!(third.one_time_pre_keys.is_empty());
    }

    #[tokio::test]
    async fn unknown_device_is_unavailable() {
        let directory = MemoryDirectory::new();
        let result = directory.fetch(&DeviceAddress::new("nobody", "1")).await;
        assert!(matches!(result, Err(DirectoryError::Unavailable(_))));
    }

    #[tokio::test]
    async fn offline_directory_is_unavailable() {
        let directory = MemoryDirectory::new();
        directory.set_unavailable(true);
        let result = directory
            .publish(&DeviceAddress::new("bob", "1"), bundle(0))
            .await;
        assert!(matches!(result, Err(DirectoryError::Unavailable(_))));
    }

    #[tokio::test]
    async fn oversized_delay_saturates() {
        let directory = MemoryDirectory::new();
        let device = DeviceAddress::new("bob", "1");
        directory.publish(&device, bundle(1)).await.unwrap();
        directory.set_delay(Duration::MAX);
        assert_eq!(directory.delay_ms.load(Ordering::SeqCst), u64::MAX);

        let client = DirectoryClient::new(Arc::new(directory.clone()));
        let result = client.fetch(&device, Duration::from_millis(20)).await;
        assert_eq!(result, Err(DirectoryError::Timeout(Duration::from_millis(20))));
    }

    #[tokio::test]
    async fn client_times_out_slow_directory() {
        let directory = MemoryDirectory::new();
        let device = DeviceAddress::new("bob", "1");
        directory.publish(&device, bundle(1)).await.unwrap();
        directory.set_delay(Duration::from_millis(500));

        let client = DirectoryClient::new(Arc::new(directory.clone()));
        let result = client.fetch(&device, Duration::from_millis(20)).await;
        assert_eq!(result, Err(DirectoryError::Timeout(Duration::from_millis(20))));
        directory.set_delay(Duration::ZERO);

        // The cancelled fetch never reached the stored bundle.
        assert_eq!(
            directory.peek(&device).await.unwrap().one_time_pre_keys.len(),
            1
        );
    }
}
