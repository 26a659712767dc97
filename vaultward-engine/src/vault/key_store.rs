//! Custody of the live master key.
//!
//! At most one key is live. It sits in a [`SecureBuffer`] (pages locked on a
//! best-effort basis) and is only reachable through a scoped borrow in
//! [`MasterKeyStore::with_key`]. Replacing or clearing the key always wipes
//! the previous buffer first.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{SecurityError, SecurityResult};
use crate::security::{DerivedKey, KeyRef, LockPolicy, SecureBuffer};

struct LiveKey {
    generation: u64,
    buffer: SecureBuffer,
}

/// Single-writer custodian of the master key.
pub struct MasterKeyStore {
    live: Mutex<Option<LiveKey>>,
    next_generation: AtomicU64,
}

impl MasterKeyStore {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(None),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Install `key`, wiping any previous one. Returns the key's generation.
    ///
    /// Memory locking is best effort here: the key is still wiped on every
    /// release path if the pages cannot be pinned.
    pub async fn set_key(&self, key: DerivedKey) -> SecurityResult<u64> {
        let buffer = SecureBuffer::with_policy(key.as_bytes(), LockPolicy::BestEffort)?;
        drop(key);
        if !buffer.is_memory_locked() {
            warn!("Master key pages could not be locked in memory");
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut live = self.live.lock().await;
        if let Some(previous) = live.take() {
            previous.buffer.clear();
            debug!("Wiped previous master key (generation {})", previous.generation);
        }
        *live = Some(LiveKey { generation, buffer });

        info!("Master key set (generation {})", generation);
        Ok(generation)
    }

    pub async fn has_key(&self) -> bool {
        self.live
            .lock()
            .await
            .as_ref()
            .is_some_and(|k| !k.buffer.is_cleared())
    }

    /// Wipe and drop the key. Returns whether a key was live.
    pub async fn clear_key(&self) -> bool {
        let previous = self.live.lock().await.take();
        match previous {
            Some(live) => {
                live.buffer.clear();
                info!("Master key cleared");
                true
            }
            None => false,
        }
    }

    /// Run `f` with a borrowed view of the key.
    ///
    /// # Errors
    /// `SessionExpired` if no key is live; `AlreadyCleared` or
    /// `AccessLimitExceeded` from the underlying buffer.
    pub async fn with_key<R>(
        &self,
        f: impl FnOnce(KeyRef<'_>) -> SecurityResult<R>,
    ) -> SecurityResult<R> {
        let live = self.live.lock().await;
        let live = live.as_ref().ok_or(SecurityError::SessionExpired)?;
        let generation = live.generation;
        live.buffer
            .with_bytes(|bytes| f(KeyRef::new(generation, bytes)))?
    }
}

impl Default for MasterKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MasterKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKeyStore")
            .field("key", &"[REDACTED]")
            .finish()
    }
}
