//! Password-based key derivation.
//!
//! [`KeyDerivationEngine`] turns a master password and salt into a 256-bit
//! [`DerivedKey`] using Argon2id. Derivation is CPU- and memory-heavy, so the
//! async entry point runs it on tokio's blocking pool; callers on the UI or
//! event thread must use [`KeyDerivationEngine::derive_key`] and await it.

mod argon2id;
mod blake2b_long;
mod params;

pub use argon2id::{Argon2id, ARGON2_VERSION};
pub use blake2b_long::blake2b_long;
pub use params::{KdfParams, DEFAULT_OUTPUT_LEN};

use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{SecurityError, SecurityResult};

/// A 256-bit key with automatic zeroization on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    key: [u8; 32],
}

impl DerivedKey {
    /// Copy a 32-byte slice into a new key.
    pub fn from_slice(slice: &[u8]) -> SecurityResult<Self> {
        let key: [u8; 32] = slice.try_into().map_err(|_| {
            SecurityError::InvalidInput(format!("key must be 32 bytes, got {}", slice.len()))
        })?;
        Ok(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log the actual key material
        f.debug_struct("DerivedKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Derives master keys from passwords.
#[derive(Debug, Clone, Copy)]
pub struct KeyDerivationEngine {
    params: KdfParams,
}

impl KeyDerivationEngine {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    /// Derive synchronously. Blocks the calling thread for the full cost.
    pub fn derive_key_blocking(&self, password: &[u8], salt: &[u8]) -> SecurityResult<DerivedKey> {
        if self.params.output_len != DEFAULT_OUTPUT_LEN {
            return Err(SecurityError::InvalidInput(format!(
                "master keys are {} bytes, params ask for {}",
                DEFAULT_OUTPUT_LEN, self.params.output_len
            )));
        }
        let bytes = Argon2id::new(self.params).derive(password, salt)?;
        debug!(
            "Derived {}-byte key (t={}, m={} KiB, p={})",
            bytes.len(),
            self.params.iterations,
            self.params.memory_kib,
            self.params.parallelism
        );
        DerivedKey::from_slice(&bytes)
    }

    /// Derive on the blocking pool and await the result.
    pub async fn derive_key(&self, password: &[u8], salt: &[u8]) -> SecurityResult<DerivedKey> {
        let engine = *self;
        let password = Zeroizing::new(password.to_vec());
        let salt = salt.to_vec();

        tokio::task::spawn_blocking(move || engine.derive_key_blocking(&password, &salt))
            .await
            .map_err(|e| {
                SecurityError::CryptographicFailure(format!("key derivation task failed: {}", e))
            })?
    }
}

impl Default for KeyDerivationEngine {
    fn default() -> Self {
        Self::new(KdfParams::default())
    }
}
