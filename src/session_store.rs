//! Per-peer session records with one lock per peer device.

use std::sync::Arc;

use dashmap::DashMap;
use e2ecore::{DeviceAddress, Session, SessionRecord};
use log::{debug, info};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::Result;
use crate::store::keys;
use crate::store::traits::{self, Backend};

#[derive(Default)]
struct Slot {
    loaded: bool,
    record: SessionRecord,
}

type Slots = DashMap<DeviceAddress, Arc<Mutex<Slot>>>;

pub struct SessionStore {
    backend: Arc<dyn Backend>,
    slots: Arc<Slots>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            slots: Arc::new(DashMap::new()),
        }
    }

    fn slot(&self, address: &DeviceAddress) -> Arc<Mutex<Slot>> {
        // Clone the Arc out so no map shard stays locked across an await.
        self.slots
            .entry(address.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Slot::default())))
            .value()
            .clone()
    }

    /// Waits for exclusive access to the peer's record. Changes made through
    /// the guard only take effect on [`SessionGuard::commit`].
    pub async fn lock(&self, address: &DeviceAddress) -> Result<SessionGuard> {
        let mut slot = self.slot(address).lock_owned().await;
        if !slot.loaded {
            let key = keys::session(address);
            if let Some(record) =
                traits::load::<SessionRecord>(self.backend.as_ref(), &key).await?
            {
                debug!("Loaded session record for {}", address);
                slot.record = record;
            }
            slot.loaded = true;
        }
        let working = slot.record.clone();
        Ok(SessionGuard {
            address: address.clone(),
            backend: self.backend.clone(),
            slots: self.slots.clone(),
            slot,
            working,
        })
    }

    pub async fn has_session(&self, address: &DeviceAddress) -> Result<bool> {
        Ok(self.lock(address).await?.record().has_current())
    }

    /// Deletes every stored record, including ones never loaded in this process.
    pub async fn clear_all(&self) -> Result<usize> {
        let slots: Vec<_> = self
            .slots
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for slot in slots {
            let mut slot = slot.lock().await;
            slot.record = SessionRecord::default();
            slot.loaded = true;
        }
        // Slots still held elsewhere keep their entry.
        self.slots.retain(|_, slot| Arc::strong_count(slot) > 1);

        let stored = self.backend.keys_with_prefix(keys::SESSION_PREFIX).await?;
        for key in &stored {
            self.backend.delete(key).await?;
        }
        info!("Deleted {} session records", stored.len());
        Ok(stored.len())
    }
}

/// Exclusive, transactional view of one peer's sessions.
pub struct SessionGuard {
    address: DeviceAddress,
    backend: Arc<dyn Backend>,
    slots: Arc<Slots>,
    slot: OwnedMutexGuard<Slot>,
    working: SessionRecord,
}

impl SessionGuard {
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn record(&self) -> &SessionRecord {
        &self.working
    }

    pub fn record_mut(&mut self) -> &mut SessionRecord {
        &mut self.working
    }

    pub fn session(&self) -> Option<&Session> {
        self.working.current()
    }

    /// Persists the working copy, then publishes it to other lock holders.
    /// An empty record deletes the stored entry.
    pub async fn commit(mut self) -> Result<()> {
        let key = keys::session(&self.address);
        if self.working.is_empty() {
            self.backend.delete(&key).await?;
        } else {
            traits::save(self.backend.as_ref(), &key, &self.working).await?;
        }
        self.slot.record = std::mem::take(&mut self.working);
        Ok(())
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.slot.record.is_empty() {
            return;
        }
        // The map and this guard hold the only references: nobody else is
        // waiting on the lock, so the slot can go.
        self.slots
            .remove_if(&self.address, |_, slot| Arc::strong_count(slot) == 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBackend;
    use e2ecore::{BundleValidator, IdentityKeyPair, SignedPreKeyRecord, initiate_session};

    fn session_for(peer: &DeviceAddress) -> Session {
        let mut csprng = rand::rng();
        let local = IdentityKeyPair::generate(&mut csprng);
        let remote = IdentityKeyPair::generate(&mut csprng);
        let bundle = e2ecore::PreKeyBundle {
            identity_key: *remote.identity_key(),
            signed_pre_key: SignedPreKeyRecord::generate(1, &remote, 100, &mut csprng).public(),
            one_time_pre_keys: Vec::new(),
        };
        let valid = BundleValidator::default().validate(bundle, 100).unwrap();
        initiate_session(&local, peer.clone(), &valid, None, &mut csprng)
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn dropped_guard_discards_changes() {
        let store = SessionStore::new(Arc::new(InMemoryBackend::new()));
        let bob = DeviceAddress::new("bob", "1");

        let mut guard = store.lock(&bob).await.unwrap();
        guard.record_mut().promote(session_for(&bob));
        drop(guard);
        assert!(!store.has_session(&bob).await.unwrap());

        let mut guard = store.lock(&bob).await.unwrap();
        guard.record_mut().promote(session_for(&bob));
        guard.commit().await.unwrap();
        assert!(store.has_session(&bob).await.unwrap());
    }

    #[tokio::test]
    async fn committed_record_reloads_from_backend() {
        let backend = Arc::new(InMemoryBackend::new());
        let bob = DeviceAddress::new("bob", "1");
        let session = session_for(&bob);
        let id = *session.session_id();

        let store = SessionStore::new(backend.clone());
        let mut guard = store.lock(&bob).await.unwrap();
        guard.record_mut().promote(session);
        guard.commit().await.unwrap();

        let reopened = SessionStore::new(backend);
        let guard = reopened.lock(&bob).await.unwrap();
        assert_eq!(guard.session().unwrap().session_id(), &id);
    }

    #[tokio::test]
    async fn peers_do_not_share_a_lock() {
        let store = SessionStore::new(Arc::new(InMemoryBackend::new()));
        let bob = DeviceAddress::new("bob", "1");
        let carol = DeviceAddress::new("carol", "1");

        let _held = store.lock(&bob).await.unwrap();
        let other = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            store.lock(&carol),
        )
        .await;
        assert!(other.is_ok());

        let same = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            store.lock(&bob),
        )
        .await;
        assert!(same.is_err());
    }

    #[tokio::test]
    async fn clear_all_removes_loaded_and_stored_records() {
        let backend = Arc::new(InMemoryBackend::new());
        let bob = DeviceAddress::new("bob", "1");
        let carol = DeviceAddress::new("carol", "2");

        let writer = SessionStore::new(backend.clone());
        for peer in [&bob, &carol] {
            let mut guard = writer.lock(peer).await.unwrap();
            guard.record_mut().promote(session_for(peer));
            guard.commit().await.unwrap();
        }

        let store = SessionStore::new(backend.clone());
        assert!(store.has_session(&bob).await.unwrap());
        assert_eq!(store.clear_all().await.unwrap(), 2);
        assert!(!store.has_session(&bob).await.unwrap());
        assert!(!store.has_session(&carol).await.unwrap());
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn unknown_peers_leave_no_slot_behind() {
        let store = SessionStore::new(Arc::new(InMemoryBackend::new()));
        for n in 0..10 {
            let peer = DeviceAddress::new("stranger", n.to_string());
            assert!(!store.has_session(&peer).await.unwrap());
        }
        assert!(store.slots.is_empty());
    }

    #[tokio::test]
    async fn committing_an_empty_record_drops_the_slot() {
        let store = SessionStore::new(Arc::new(InMemoryBackend::new()));
        let bob = DeviceAddress::new("bob", "1");

        let mut guard = store.lock(&bob).await.unwrap();
        guard.record_mut().promote(session_for(&bob));
        guard.commit().await.unwrap();
        assert_eq!(store.slots.len(), 1);

        let mut guard = store.lock(&bob).await.unwrap();
        *guard.record_mut() = SessionRecord::default();
        guard.commit().await.unwrap();
        assert!(store.slots.is_empty());
        assert!(!store.has_session(&bob).await.unwrap());
    }

    #[tokio::test]
    async fn waiting_lock_keeps_the_slot() {
        let store = Arc::new(SessionStore::new(Arc::new(InMemoryBackend::new())));
        let bob = DeviceAddress::new("bob", "1");

        let first = store.lock(&bob).await.unwrap();
        let waiter = {
            let store = store.clone();
            let bob = bob.clone();
            tokio::spawn(async move {
                let mut guard = store.lock(&bob).await.unwrap();
                guard.record_mut().promote(session_for(&bob));
                guard.commit().await.unwrap();
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(first);
        waiter.await.unwrap();
        assert!(store.has_session(&bob).await.unwrap());
        assert_eq!(store.slots.len(), 1);
    }

    #[tokio::test]
    async fn clear_all_forgets_every_slot() {
        let store = SessionStore::new(Arc::new(InMemoryBackend::new()));
        for peer in ["bob", "carol"] {
            let peer = DeviceAddress::new(peer, "1");
            let mut guard = store.lock(&peer).await.unwrap();
            guard.record_mut().promote(session_for(&peer));
            guard.commit().await.unwrap();
        }
        assert_eq!(store.slots.len(), 2);
        store.clear_all().await.unwrap();
        assert!(store.slots.is_empty());
    }
}
