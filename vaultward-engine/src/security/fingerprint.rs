//! Per-install device fingerprint.
//!
//! The fingerprint is SHA-256 over a handful of semi-stable host signals plus
//! a random 32-byte install salt persisted in the data directory. It is mixed
//! into the associated data of every ciphertext and seeds the device-bound
//! raw-storage keys, so sealed files do not open on another machine.

use std::path::Path;

use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{SecurityError, SecurityResult};
use crate::storage::write_private_file;

/// Install salt size in bytes.
pub const INSTALL_SALT_SIZE: usize = 32;

/// File holding the install salt.
pub const INSTALL_SALT_FILE: &str = "install_salt.bin";

const DOMAIN: &[u8] = b"vaultward.device-fingerprint.v1";

/// Host signals that feed the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSignals {
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub machine_id: String,
    pub user: String,
}

impl DeviceSignals {
    /// Collect signals from the running host. Missing signals become empty.
    pub async fn collect() -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut machine_id = String::new();
        for candidate in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
            if let Ok(id) = tokio::fs::read_to_string(candidate).await {
                machine_id = id.trim().to_string();
                break;
            }
        }

        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();

        Self {
            hostname,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            machine_id,
            user,
        }
    }
}

/// SHA-256 device binding value.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DeviceFingerprint([u8; 32]);

impl DeviceFingerprint {
    /// Hash `signals` together with the install salt.
    pub fn from_signals(signals: &DeviceSignals, install_salt: &[u8; INSTALL_SALT_SIZE]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(DOMAIN);
        for field in [
            &signals.hostname,
            &signals.os,
            &signals.arch,
            &signals.machine_id,
            &signals.user,
        ] {
            hasher.update((field.len() as u32).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        hasher.update(install_salt);
        Self(hasher.finalize().into())
    }

    /// Use a precomputed fingerprint (tests, migration tooling).
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute the fingerprint for this host and data directory, creating the
    /// install salt on first use.
    pub async fn for_install(data_dir: &Path) -> SecurityResult<Self> {
        let salt = get_or_create_install_salt(data_dir).await?;
        let signals = DeviceSignals::collect().await;
        let fingerprint = Self::from_signals(&signals, &salt);
        debug!("Device fingerprint {}", fingerprint.short_hex());
        Ok(fingerprint)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Associated data for a category: `label || fingerprint`.
    pub fn bind(&self, label: &[u8]) -> Vec<u8> {
        let mut aad = Vec::with_capacity(label.len() + self.0.len());
        aad.extend_from_slice(label);
        aad.extend_from_slice(&self.0);
        aad
    }

    /// First 8 hex characters, for logs.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Debug for DeviceFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceFingerprint({}…)", self.short_hex())
    }
}

/// Load the install salt or create a fresh one.
///
/// Deleting this file changes the fingerprint and makes every device-bound
/// file unreadable, which is exactly what a full wipe relies on.
async fn get_or_create_install_salt(data_dir: &Path) -> SecurityResult<[u8; INSTALL_SALT_SIZE]> {
    let path = data_dir.join(INSTALL_SALT_FILE);

    if tokio::fs::try_exists(&path).await? {
        let bytes = tokio::fs::read(&path).await?;
        let salt: [u8; INSTALL_SALT_SIZE] = bytes.as_slice().try_into().map_err(|_| {
            SecurityError::IntegrityCheckFailed(format!(
                "install salt has {} bytes, expected {}",
                bytes.len(),
                INSTALL_SALT_SIZE
            ))
        })?;
        return Ok(salt);
    }

    let mut salt = [0u8; INSTALL_SALT_SIZE];
    rand::rng().fill_bytes(&mut salt);
    write_private_file(&path, &salt).await?;
    info!("Generated new install salt");
    Ok(salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals() -> DeviceSignals {
        DeviceSignals {
            hostname: "host".into(),
            os: "linux".into(),
            arch: "x86_64".into(),
            machine_id: "abc".into(),
            user: "alice".into(),
        }
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let salt = [3u8; 32];
        assert_eq!(
            DeviceFingerprint::from_signals(&signals(), &salt),
            DeviceFingerprint::from_signals(&signals(), &salt)
        );
    }

    #[test]
    fn test_fingerprint_depends_on_salt_and_signals() {
        let base = DeviceFingerprint::from_signals(&signals(), &[3u8; 32]);
        assert_ne!(base, DeviceFingerprint::from_signals(&signals(), &[4u8; 32]));

        let mut other = signals();
        other.hostname = "other-host".into();
        assert_ne!(base, DeviceFingerprint::from_signals(&other, &[3u8; 32]));
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        let mut a = signals();
        a.hostname = "ab".into();
        a.os = "c".into();
        let mut b = signals();
        b.hostname = "a".into();
        b.os = "bc".into();
        assert_ne!(
            DeviceFingerprint::from_signals(&a, &[0u8; 32]),
            DeviceFingerprint::from_signals(&b, &[0u8; 32])
        );
    }

    #[test]
    fn test_bind_prefixes_label() {
        let fp = DeviceFingerprint::from_bytes([7u8; 32]);
        let aad = fp.bind(b"settings");
        assert_eq!(&aad[..8], b"settings");
        assert_eq!(&aad[8..], &[7u8; 32]);
    }

    #[tokio::test]
    async fn test_install_salt_persists() {
        let dir = tempfile::tempdir().unwrap();
        let first = get_or_create_install_salt(dir.path()).await.unwrap();
        let second = get_or_create_install_salt(dir.path()).await.unwrap();
        assert_eq!(first, second);

        let a = DeviceFingerprint::for_install(dir.path()).await.unwrap();
        let b = DeviceFingerprint::for_install(dir.path()).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_corrupt_install_salt_rejected() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(INSTALL_SALT_FILE), b"short")
            .await
            .unwrap();
        assert!(get_or_create_install_salt(dir.path()).await.is_err());
    }
}
