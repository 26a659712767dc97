use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use zeroize::Zeroizing;

use super::files::SecureStorage;
use crate::error::SecurityResult;
use crate::security::{EnvelopeCodec, RawCategory};

/// Device-bound blobs on top of [`SecureStorage`]: everything written here is
/// readable without the master key, but only on this install.
#[derive(Debug, Clone)]
pub struct RawStore {
    storage: SecureStorage,
    codec: Arc<EnvelopeCodec>,
}

impl RawStore {
    pub fn new(storage: SecureStorage, codec: Arc<EnvelopeCodec>) -> Self {
        Self { storage, codec }
    }

    pub fn storage(&self) -> &SecureStorage {
        &self.storage
    }

    pub async fn put_bytes(&self, key: &str, category: RawCategory, bytes: &[u8]) -> SecurityResult<()> {
        let sealed = self.codec.seal_raw(category, bytes)?;
        self.storage.write(key, &sealed).await
    }

    /// `Ok(None)` if the file is absent; an authentication error if it exists
    /// but does not open.
    pub async fn get_bytes(&self, key: &str, category: RawCategory) -> SecurityResult<Option<Zeroizing<Vec<u8>>>> {
        match self.storage.read(key).await? {
            Some(sealed) => Ok(Some(self.codec.open_raw(category, &sealed)?)),
            None => Ok(None),
        }
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, category: RawCategory, value: &T) -> SecurityResult<()> {
        let json = Zeroizing::new(serde_json::to_vec(value)?);
        self.put_bytes(key, category, &json).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str, category: RawCategory) -> SecurityResult<Option<T>> {
        match self.get_bytes(key, category).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn exists(&self, key: &str) -> SecurityResult<bool> {
        self.storage.exists(key).await
    }

    pub async fn remove(&self, key: &str) -> SecurityResult<bool> {
        self.storage.secure_delete(key).await
    }
}
