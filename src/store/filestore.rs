use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::store::error::{Result, StoreError};
use crate::store::traits::Backend;

/// One file per key under a base directory.
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    pub async fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let base_path = path.into();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Keys are hex encoded so any key maps to a valid, reversible file name.
    fn path_for(&self, key: &str) -> PathBuf {
        self.base_path.join(hex::encode(key))
    }

    fn key_for(file_name: &str) -> Option<String> {
        hex::decode(file_name)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }
}

#[async_trait]
impl Backend for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        // Write then rename so readers never observe a torn value.
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value).await?;
        fs::rename(&tmp, &path).await.map_err(StoreError::from)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        fs::remove_file(self.path_for(key))
            .await
            .or_else(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(e)
                }
            })
            .map_err(StoreError::from)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut dir = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let file_name = entry.file_name();
            let Some(key) = file_name.to_str().and_then(Self::key_for) else {
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::new(dir.path()).await.unwrap();
            store.put("session:bob.1", b"record").await.unwrap();
            store.put("identity", b"keys").await.unwrap();
        }

        let store = FileStore::new(dir.path()).await.unwrap();
        assert_eq!(
            store.get("session:bob.1").await.unwrap(),
            Some(b"record".to_vec())
        );
        assert_eq!(
            store.keys_with_prefix("session:").await.unwrap(),
            vec!["session:bob.1".to_string()]
        );

        store.delete("session:bob.1").await.unwrap();
        store.delete("session:bob.1").await.unwrap();
        assert_eq!(store.get("session:bob.1").await.unwrap(), None);
    }
}
