//! Encrypted audit log.
//!
//! Append-only, newest last, trimmed to the most recent [`MAX_ENTRIES`]. The
//! whole log is sealed under the master key's audit sub-key and rewritten on
//! every append. While the vault is locked entries accumulate in memory and
//! reach disk with the next append after unlock.

use std::collections::{HashSet, VecDeque};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::SecurityResult;
use crate::security::{EnvelopeCodec, Purpose};
use crate::storage::SecureStorage;
use crate::vault::MasterKeyStore;

/// Maximum audit entries kept
pub const MAX_ENTRIES: usize = 10_000;

const FILE_KEY: &str = "audit_log";

/// Severity of an audit entry. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Warning,
    Security,
    Critical,
}

impl AuditLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditLevel::Info => "info",
            AuditLevel::Warning => "warning",
            AuditLevel::Security => "security",
            AuditLevel::Critical => "critical",
        }
    }
}

impl FromStr for AuditLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(AuditLevel::Info),
            "warning" => Ok(AuditLevel::Warning),
            "security" => Ok(AuditLevel::Security),
            "critical" => Ok(AuditLevel::Critical),
            other => Err(format!("unknown audit level {:?}", other)),
        }
    }
}

/// Single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: AuditLevel,
    pub message: String,
}

/// Stored shape. The level stays a string so entries written by a newer
/// build with levels this one does not know are dropped, not fatal.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    id: Uuid,
    timestamp: DateTime<Utc>,
    level: String,
    message: String,
}

impl From<&AuditEntry> for StoredEntry {
    fn from(entry: &AuditEntry) -> Self {
        Self {
            id: entry.id,
            timestamp: entry.timestamp,
            level: entry.level.as_str().to_string(),
            message: entry.message.clone(),
        }
    }
}

struct LogState {
    entries: VecDeque<AuditEntry>,
    /// Entries exist that have not been sealed to disk.
    dirty: bool,
}

/// Append-only audit log.
pub struct AuditLog {
    storage: SecureStorage,
    codec: Arc<EnvelopeCodec>,
    keys: Arc<MasterKeyStore>,
    capacity: usize,
    state: Mutex<LogState>,
}

impl AuditLog {
    pub fn new(storage: SecureStorage, codec: Arc<EnvelopeCodec>, keys: Arc<MasterKeyStore>) -> Self {
        Self::with_capacity(storage, codec, keys, MAX_ENTRIES)
    }

    pub fn with_capacity(
        storage: SecureStorage,
        codec: Arc<EnvelopeCodec>,
        keys: Arc<MasterKeyStore>,
        capacity: usize,
    ) -> Self {
        Self {
            storage,
            codec,
            keys,
            capacity: capacity.max(1),
            state: Mutex::new(LogState {
                entries: VecDeque::new(),
                dirty: false,
            }),
        }
    }

    /// Append an entry and persist if a master key is live. Persistence
    /// failures are logged, never returned: auditing must not break the
    /// operation being audited.
    pub async fn record(&self, level: AuditLevel, message: impl Into<String>) {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level,
            message: message.into(),
        };
        match level {
            AuditLevel::Info => info!(audit = true, "{}", entry.message),
            AuditLevel::Warning => warn!(audit = true, "{}", entry.message),
            AuditLevel::Security => warn!(audit = true, security = true, "{}", entry.message),
            AuditLevel::Critical => error!(audit = true, "{}", entry.message),
        }

        let mut state = self.state.lock().await;
        state.entries.push_back(entry);
        while state.entries.len() > self.capacity {
            state.entries.pop_front();
        }
        state.dirty = true;

        if let Err(e) = self.persist_locked(&mut state).await {
            warn!("Failed to persist audit log: {}", e);
        }
    }

    /// Merge the sealed log from disk with entries recorded while locked.
    /// Call after unlock.
    pub async fn reload(&self) -> SecurityResult<usize> {
        let Some(sealed) = self.storage.read(FILE_KEY).await? else {
            return Ok(0);
        };
        let plaintext = self
            .keys
            .with_key(|key| self.codec.open(key, Purpose::AuditLog, &sealed))
            .await?;
        let stored: Vec<StoredEntry> = serde_json::from_slice(&plaintext)?;

        let total = stored.len();
        let loaded: Vec<AuditEntry> = stored
            .into_iter()
            .filter_map(|s| {
                let level = AuditLevel::from_str(&s.level).ok()?;
                Some(AuditEntry {
                    id: s.id,
                    timestamp: s.timestamp,
                    level,
                    message: s.message,
                })
            })
            .collect();
        if loaded.len() < total {
            debug!("Dropped {} audit entries with unknown levels", total - loaded.len());
        }

        let mut state = self.state.lock().await;
        let on_disk: HashSet<Uuid> = loaded.iter().map(|e| e.id).collect();
        let pending: Vec<AuditEntry> = state
            .entries
            .drain(..)
            .filter(|e| !on_disk.contains(&e.id))
            .collect();
        let has_pending = !pending.is_empty();

        let mut merged: Vec<AuditEntry> = loaded.into_iter().chain(pending).collect();
        merged.sort_by_key(|e| e.timestamp);
        let skip = merged.len().saturating_sub(self.capacity);
        state.entries = merged.into_iter().skip(skip).collect();
        state.dirty = has_pending;

        let count = state.entries.len();
        if has_pending {
            self.persist_locked(&mut state).await?;
        }
        debug!("Audit log reloaded with {} entries", count);
        Ok(count)
    }

    /// Entries at or above `min_level`, newest last, at most `limit`.
    pub async fn entries(&self, limit: usize, min_level: AuditLevel) -> Vec<AuditEntry> {
        let state = self.state.lock().await;
        let matching: Vec<&AuditEntry> = state
            .entries
            .iter()
            .filter(|e| e.level >= min_level)
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn persist_locked(&self, state: &mut LogState) -> SecurityResult<()> {
        if !state.dirty || !self.keys.has_key().await {
            return Ok(());
        }
        let stored: Vec<StoredEntry> = state.entries.iter().map(StoredEntry::from).collect();
        let json = zeroize::Zeroizing::new(serde_json::to_vec(&stored)?);
        let sealed = self
            .keys
            .with_key(|key| self.codec.seal(key, Purpose::AuditLog, &json))
            .await?;
        self.storage.write(FILE_KEY, &sealed).await?;
        state.dirty = false;
        Ok(())
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{DerivedKey, DeviceFingerprint};

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: SecureStorage,
        codec: Arc<EnvelopeCodec>,
        keys: Arc<MasterKeyStore>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = SecureStorage::open(dir.path()).await.unwrap();
        let codec = Arc::new(EnvelopeCodec::new(DeviceFingerprint::from_bytes([4; 32])).unwrap());
        Fixture {
            _dir: dir,
            storage,
            codec,
            keys: Arc::new(MasterKeyStore::new()),
        }
    }

    fn log(f: &Fixture, capacity: usize) -> AuditLog {
        AuditLog::with_capacity(f.storage.clone(), f.codec.clone(), f.keys.clone(), capacity)
    }

    async fn unlock(f: &Fixture) {
        f.keys
            .set_key(DerivedKey::from_slice(&[8; 32]).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ring_keeps_newest() {
        let f = fixture().await;
        let log = log(&f, 3);
        for i in 0..5 {
            log.record(AuditLevel::Info, format!("event {}", i)).await;
        }
        let entries = log.entries(10, AuditLevel::Info).await;
        let messages: Vec<_> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["event 2", "event 3", "event 4"]);
    }

    #[tokio::test]
    async fn test_level_filter_and_limit() {
        let f = fixture().await;
        let log = log(&f, 100);
        log.record(AuditLevel::Info, "a").await;
        log.record(AuditLevel::Critical, "b").await;
        log.record(AuditLevel::Warning, "c").await;
        log.record(AuditLevel::Security, "d").await;

        let serious = log.entries(10, AuditLevel::Security).await;
        assert_eq!(serious.len(), 2);
        let last_one = log.entries(1, AuditLevel::Info).await;
        assert_eq!(last_one[0].message, "d");
    }

    #[tokio::test]
    async fn test_locked_entries_persist_after_unlock() {
        let f = fixture().await;
        let log = log(&f, 100);
        log.record(AuditLevel::Warning, "while locked").await;
        assert!(!f.storage.exists(FILE_KEY).await.unwrap());

        unlock(&f).await;
        log.record(AuditLevel::Info, "unlocked").await;
        assert!(f.storage.exists(FILE_KEY).await.unwrap());

        // A fresh log instance reloads both entries.
        let reloaded = AuditLog::with_capacity(f.storage.clone(), f.codec.clone(), f.keys.clone(), 100);
        assert_eq!(reloaded.reload().await.unwrap(), 2);
        let entries = reloaded.entries(10, AuditLevel::Info).await;
        assert_eq!(entries[0].message, "while locked");
        assert_eq!(entries[1].message, "unlocked");
    }

    #[tokio::test]
    async fn test_unknown_levels_are_filtered() {
        let f = fixture().await;
        unlock(&f).await;

        let json = serde_json::json!([
            {"id": Uuid::new_v4(), "timestamp": Utc::now(), "level": "info", "message": "kept"},
            {"id": Uuid::new_v4(), "timestamp": Utc::now(), "level": "debug", "message": "dropped"}
        ]);
        let bytes = serde_json::to_vec(&json).unwrap();
        let sealed = f
            .keys
            .with_key(|key| f.codec.seal(key, Purpose::AuditLog, &bytes))
            .await
            .unwrap();
        f.storage.write(FILE_KEY, &sealed).await.unwrap();

        let log = log(&f, 100);
        assert_eq!(log.reload().await.unwrap(), 1);
        assert_eq!(log.entries(10, AuditLevel::Info).await[0].message, "kept");
    }

    #[tokio::test]
    async fn test_reload_without_key_fails() {
        let f = fixture().await;
        f.storage.write(FILE_KEY, b"whatever").await.unwrap();
        let log = log(&f, 100);
        assert!(log.reload().await.is_err());
    }
}
