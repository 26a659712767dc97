use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{error, info};

use crate::error::{SecurityError, SecurityResult};
use crate::security::{DeviceFingerprint, RawCategory};
use crate::storage::RawStore;

const FILE_KEY: &str = "integrity";
const DOMAIN: &[u8] = b"vaultward.integrity.v1";

/// Result of comparing the running build against the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStatus {
    /// No record existed; one was written.
    Baselined,
    Verified,
    /// Record differs or could not be opened.
    Mismatch,
}

impl IntegrityStatus {
    pub fn is_verified(self) -> bool {
        !matches!(self, IntegrityStatus::Mismatch)
    }
}

/// Hash over fingerprint + app version + build, stored once and compared on
/// every launch. A mismatch is reported, not acted on.
#[derive(Debug, Clone)]
pub struct IntegrityVerifier {
    raw: RawStore,
    expected: [u8; 32],
}

impl IntegrityVerifier {
    pub fn new(raw: RawStore, fingerprint: &DeviceFingerprint, app_version: &str, build: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(DOMAIN);
        hasher.update(fingerprint.as_bytes());
        for field in [app_version, build] {
            hasher.update((field.len() as u32).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        Self {
            raw,
            expected: hasher.finalize().into(),
        }
    }

    pub async fn verify(&self) -> SecurityResult<IntegrityStatus> {
        let stored = match self.raw.get_bytes(FILE_KEY, RawCategory::Integrity).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                self.baseline().await?;
                return Ok(IntegrityStatus::Baselined);
            }
            Err(SecurityError::CryptographicFailure(_)) => {
                error!("Integrity record does not open on this device");
                return Ok(IntegrityStatus::Mismatch);
            }
            Err(e) => return Err(e),
        };

        if bool::from(stored.as_slice().ct_eq(&self.expected[..])) {
            info!("Integrity check passed");
            Ok(IntegrityStatus::Verified)
        } else {
            error!("Integrity check failed: build or device changed since baseline");
            Ok(IntegrityStatus::Mismatch)
        }
    }

    /// Store the record for the running build, replacing any previous one.
    pub async fn baseline(&self) -> SecurityResult<()> {
        self.raw
            .put_bytes(FILE_KEY, RawCategory::Integrity, &self.expected)
            .await?;
        info!("Integrity baseline recorded");
        Ok(())
    }
}
