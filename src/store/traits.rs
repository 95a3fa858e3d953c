use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::store::error::{Result, StoreError};

/// Byte-oriented key/value storage. The crate owns every value's encoding.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Reads and decodes `key`, `None` when absent.
pub(crate) async fn load<T: DeserializeOwned>(
    backend: &dyn Backend,
    key: &str,
) -> Result<Option<T>> {
    match backend.get(key).await? {
        Some(bytes) => decode(&bytes).map(Some),
        None => Ok(None),
    }
}

pub(crate) async fn save<T: Serialize>(backend: &dyn Backend, key: &str, value: &T) -> Result<()> {
    let bytes = encode(value)?;
    backend.put(key, &bytes).await
}
