//! Master password record on disk.
//!
//! Three device-bound files make up the record:
//! - `master_salt.enc`: the 32-byte Argon2id salt.
//! - `master_kdf.enc`: the cost parameters in effect when the password was set.
//! - `master_token.enc`: the verification token, a fixed marker sealed under
//!   a sub-key of the derived master key.
//!
//! Unlock succeeds iff a re-derived key opens the token to the marker.

use std::sync::Arc;

use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::{SecurityError, SecurityResult};
use crate::security::{DerivedKey, EnvelopeCodec, KdfParams, KeyRef, Purpose, RawCategory};
use crate::storage::RawStore;

/// Salt size in bytes (256 bits)
pub const SALT_SIZE: usize = 32;

const SALT_KEY: &str = "master_salt";
const KDF_KEY: &str = "master_kdf";
const TOKEN_KEY: &str = "master_token";

const TOKEN_MARKER: &[u8] = b"vaultward:master-token:v1";

/// Everything needed to re-derive and check a master key.
pub struct MasterRecord {
    pub salt: Zeroizing<[u8; SALT_SIZE]>,
    pub params: KdfParams,
    pub token: Vec<u8>,
}

impl std::fmt::Debug for MasterRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterRecord")
            .field("salt", &"[REDACTED]")
            .field("params", &self.params)
            .field("token_len", &self.token.len())
            .finish()
    }
}

/// Reads and writes the master password record.
#[derive(Debug, Clone)]
pub struct MasterPasswordFiles {
    raw: RawStore,
    codec: Arc<EnvelopeCodec>,
}

impl MasterPasswordFiles {
    pub fn new(raw: RawStore, codec: Arc<EnvelopeCodec>) -> Self {
        Self { raw, codec }
    }

    /// Fresh random salt.
    pub fn generate_salt() -> Zeroizing<[u8; SALT_SIZE]> {
        let mut salt = Zeroizing::new([0u8; SALT_SIZE]);
        rand::rng().fill_bytes(&mut salt[..]);
        salt
    }

    /// Whether a master password has been set (and not wiped).
    pub async fn is_configured(&self) -> SecurityResult<bool> {
        Ok(self.raw.exists(TOKEN_KEY).await? && self.raw.exists(SALT_KEY).await?)
    }

    /// Seal the verification token under `key`.
    pub fn seal_token(&self, key: &DerivedKey) -> SecurityResult<Vec<u8>> {
        self.codec
            .seal(KeyRef::ephemeral(key.as_bytes()), Purpose::MasterToken, TOKEN_MARKER)
    }

    /// Whether `key` opens `token` to the expected marker.
    pub fn token_matches(&self, key: &DerivedKey, token: &[u8]) -> bool {
        match self
            .codec
            .open(KeyRef::ephemeral(key.as_bytes()), Purpose::MasterToken, token)
        {
            Ok(marker) => marker.len() == TOKEN_MARKER.len() && bool::from(marker.ct_eq(TOKEN_MARKER)),
            Err(_) => false,
        }
    }

    /// Persist a new record. The token is written last so a crash part-way
    /// leaves the vault unconfigured rather than half-configured.
    pub async fn store(&self, salt: &[u8; SALT_SIZE], params: &KdfParams, token: &[u8]) -> SecurityResult<()> {
        self.raw.put_bytes(SALT_KEY, RawCategory::SaltStorage, salt).await?;
        self.raw.put_json(KDF_KEY, RawCategory::KeyStorage, params).await?;
        self.raw.put_bytes(TOKEN_KEY, RawCategory::MasterToken, token).await?;
        info!("Stored master password record");
        Ok(())
    }

    /// Load the record. `Ok(None)` if no password is configured.
    ///
    /// # Errors
    /// Any corruption or device mismatch surfaces as the same authentication
    /// failure a wrong password would produce.
    pub async fn load(&self) -> SecurityResult<Option<MasterRecord>> {
        let Some(token) = self.raw.get_bytes(TOKEN_KEY, RawCategory::MasterToken).await? else {
            return Ok(None);
        };
        let salt_bytes = self
            .raw
            .get_bytes(SALT_KEY, RawCategory::SaltStorage)
            .await?
            .ok_or_else(SecurityError::auth_failed)?;
        let salt: [u8; SALT_SIZE] = salt_bytes
            .as_slice()
            .try_into()
            .map_err(|_| SecurityError::auth_failed())?;

        // Records written before parameters were persisted used the defaults.
        let params = self
            .raw
            .get_json::<KdfParams>(KDF_KEY, RawCategory::KeyStorage)
            .await?
            .unwrap_or_default();
        params.validate().map_err(|_| SecurityError::auth_failed())?;

        debug!("Loaded master password record");
        Ok(Some(MasterRecord {
            salt: Zeroizing::new(salt),
            params,
            token: token.to_vec(),
        }))
    }

    /// Securely delete the record.
    pub async fn destroy(&self) -> SecurityResult<()> {
        // Token first: without it the vault reads as unconfigured.
        self.raw.remove(TOKEN_KEY).await?;
        self.raw.remove(SALT_KEY).await?;
        self.raw.remove(KDF_KEY).await?;
        info!("Destroyed master password record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{DeviceFingerprint, KeyDerivationEngine};
    use crate::storage::SecureStorage;

    async fn files(dir: &std::path::Path) -> MasterPasswordFiles {
        let codec = Arc::new(EnvelopeCodec::new(DeviceFingerprint::from_bytes([1; 32])).unwrap());
        let storage = SecureStorage::open(dir).await.unwrap();
        MasterPasswordFiles::new(RawStore::new(storage, codec.clone()), codec)
    }

    fn derive(password: &[u8], salt: &[u8]) -> DerivedKey {
        KeyDerivationEngine::new(KdfParams::insecure_for_tests())
            .derive_key_blocking(password, salt)
            .unwrap()
    }

    #[tokio::test]
    async fn test_store_load_verify() {
        let dir = tempfile::tempdir().unwrap();
        let files = files(dir.path()).await;
        assert!(!files.is_configured().await.unwrap());
        assert!(files.load().await.unwrap().is_none());

        let salt = MasterPasswordFiles::generate_salt();
        let params = KdfParams::insecure_for_tests();
        let key = derive(b"Str0ng!Pass", &salt[..]);
        let token = files.seal_token(&key).unwrap();
        files.store(&salt, &params, &token).await.unwrap();
        assert!(files.is_configured().await.unwrap());

        let record = files.load().await.unwrap().unwrap();
        assert_eq!(record.params, params);
        assert_eq!(*record.salt, *salt);

        let again = derive(b"Str0ng!Pass", &record.salt[..]);
        assert!(files.token_matches(&again, &record.token));
        let wrong = derive(b"wrong", &record.salt[..]);
        assert!(!files.token_matches(&wrong, &record.token));
    }

    #[tokio::test]
    async fn test_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let files = files(dir.path()).await;
        let salt = MasterPasswordFiles::generate_salt();
        let token = files.seal_token(&derive(b"pw", &salt[..])).unwrap();
        files
            .store(&salt, &KdfParams::insecure_for_tests(), &token)
            .await
            .unwrap();

        files.destroy().await.unwrap();
        assert!(!files.is_configured().await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_salt_is_auth_failure() {
        let dir = tempfile::tempdir().unwrap();
        let files = files(dir.path()).await;
        let salt = MasterPasswordFiles::generate_salt();
        let token = files.seal_token(&derive(b"pw", &salt[..])).unwrap();
        files
            .store(&salt, &KdfParams::insecure_for_tests(), &token)
            .await
            .unwrap();

        let storage = SecureStorage::open(dir.path()).await.unwrap();
        let mut bytes = storage.read(SALT_KEY).await.unwrap().unwrap();
        bytes[40] ^= 1;
        storage.write(SALT_KEY, &bytes).await.unwrap();

        let err = files.load().await.unwrap_err();
        assert_eq!(err.to_string(), SecurityError::auth_failed().to_string());
    }
}
