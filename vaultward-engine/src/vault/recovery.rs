//! Single-use recovery codes.
//!
//! Codes look like `7K2M-QX9D-04HT` (Crockford base32, 60 bits each). Only a
//! salted SHA-256 digest of each code is stored, device-bound, in
//! `recovery_codes.enc`. Redeeming a code marks it used; the caller decides
//! what a redemption unlocks.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::{Choice, ConstantTimeEq};
use tracing::{info, warn};

use crate::error::SecurityResult;
use crate::security::RawCategory;
use crate::storage::RawStore;

/// Codes issued per batch.
pub const RECOVERY_CODE_COUNT: usize = 8;

const CODE_CHARS: usize = 12;
const GROUP: usize = 4;
const CODE_SALT_SIZE: usize = 16;
const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const FILE_KEY: &str = "recovery_codes";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCode {
    #[serde(with = "hex")]
    salt: Vec<u8>,
    #[serde(with = "hex")]
    digest: Vec<u8>,
    used: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecoveryFile {
    created_at: DateTime<Utc>,
    codes: Vec<StoredCode>,
}

/// Issues and redeems recovery codes.
#[derive(Debug, Clone)]
pub struct RecoveryCodes {
    raw: RawStore,
}

impl RecoveryCodes {
    pub fn new(raw: RawStore) -> Self {
        Self { raw }
    }

    /// Issue a fresh batch, replacing any previous one. The plaintext codes
    /// are returned once and never stored.
    pub async fn generate(&self, now: DateTime<Utc>) -> SecurityResult<Vec<String>> {
        let mut plain = Vec::with_capacity(RECOVERY_CODE_COUNT);
        let mut stored = Vec::with_capacity(RECOVERY_CODE_COUNT);

        for _ in 0..RECOVERY_CODE_COUNT {
            let mut raw = [0u8; CODE_CHARS];
            let mut salt = vec![0u8; CODE_SALT_SIZE];
            rand::rng().fill_bytes(&mut raw);
            rand::rng().fill_bytes(&mut salt);

            // 32 divides 256, so masking keeps the distribution uniform.
            let chars: String = raw
                .iter()
                .map(|b| ALPHABET[(b & 0x1f) as usize] as char)
                .collect();
            let digest = digest_code(&salt, &chars);

            plain.push(format_code(&chars));
            stored.push(StoredCode {
                salt,
                digest,
                used: false,
            });
        }

        let file = RecoveryFile {
            created_at: now,
            codes: stored,
        };
        self.raw
            .put_json(FILE_KEY, RawCategory::RecoveryCodes, &file)
            .await?;
        info!("Issued {} recovery codes", RECOVERY_CODE_COUNT);
        Ok(plain)
    }

    /// Unused codes left. Zero if none were issued.
    pub async fn remaining(&self) -> SecurityResult<usize> {
        Ok(self
            .load()
            .await?
            .map(|f| f.codes.iter().filter(|c| !c.used).count())
            .unwrap_or(0))
    }

    /// Consume `code` if it matches an unused entry. Every stored digest is
    /// compared so timing does not reveal which slot matched.
    pub async fn redeem(&self, code: &str) -> SecurityResult<bool> {
        let Some(normalized) = normalize_code(code) else {
            return Ok(false);
        };
        let Some(mut file) = self.load().await? else {
            return Ok(false);
        };

        let mut matched: Option<usize> = None;
        for (i, stored) in file.codes.iter().enumerate() {
            let candidate = digest_code(&stored.salt, &normalized);
            let hit: Choice = candidate.ct_eq(&stored.digest) & Choice::from(u8::from(!stored.used));
            if bool::from(hit) {
                matched = Some(i);
            }
        }

        let Some(index) = matched else {
            warn!("Recovery code rejected");
            return Ok(false);
        };
        file.codes[index].used = true;
        self.raw
            .put_json(FILE_KEY, RawCategory::RecoveryCodes, &file)
            .await?;
        info!("Recovery code redeemed");
        Ok(true)
    }

    async fn load(&self) -> SecurityResult<Option<RecoveryFile>> {
        self.raw.get_json(FILE_KEY, RawCategory::RecoveryCodes).await
    }
}

fn digest_code(salt: &[u8], normalized: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(normalized.as_bytes());
    hasher.finalize().to_vec()
}

fn format_code(chars: &str) -> String {
    chars
        .as_bytes()
        .chunks(GROUP)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect::<Vec<_>>()
        .join("-")
}

/// Upper-case, drop separators, fold Crockford look-alikes.
fn normalize_code(input: &str) -> Option<String> {
    let mut out = String::with_capacity(CODE_CHARS);
    for c in input.chars() {
        if c == '-' || c.is_whitespace() {
            continue;
        }
        let c = match c.to_ascii_uppercase() {
            'O' => '0',
            'I' | 'L' => '1',
            other => other,
        };
        if !c.is_ascii() || !ALPHABET.contains(&(c as u8)) {
            return None;
        }
        out.push(c);
    }
    (out.len() == CODE_CHARS).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{DeviceFingerprint, EnvelopeCodec};
    use crate::storage::SecureStorage;
    use std::sync::Arc;

    async fn codes(dir: &std::path::Path) -> RecoveryCodes {
        let storage = SecureStorage::open(dir).await.unwrap();
        let codec = EnvelopeCodec::new(DeviceFingerprint::from_bytes([9; 32])).unwrap();
        RecoveryCodes::new(RawStore::new(storage, Arc::new(codec)))
    }

    #[test]
    fn test_code_format() {
        assert_eq!(format_code("ABCDEFGHJKMN"), "ABCD-EFGH-JKMN");
        assert_eq!(normalize_code("abcd efgh-jkmn").as_deref(), Some("ABCDEFGHJKMN"));
        assert_eq!(normalize_code("OIL0-0000-0000").as_deref(), Some("011000000000"));
        assert!(normalize_code("ABCD-EFGH").is_none());
        assert!(normalize_code("ABCD-EFGH-JKMU").is_none());
    }

    #[tokio::test]
    async fn test_generate_and_redeem_once() {
        let dir = tempfile::tempdir().unwrap();
        let codes = codes(dir.path()).await;
        assert_eq!(codes.remaining().await.unwrap(), 0);

        let issued = codes.generate(Utc::now()).await.unwrap();
        assert_eq!(issued.len(), RECOVERY_CODE_COUNT);
        assert!(issued.iter().all(|c| c.len() == 14));
        assert_eq!(codes.remaining().await.unwrap(), RECOVERY_CODE_COUNT);

        assert!(codes.redeem(&issued[3].to_lowercase()).await.unwrap());
        assert!(!codes.redeem(&issued[3]).await.unwrap());
        assert_eq!(codes.remaining().await.unwrap(), RECOVERY_CODE_COUNT - 1);
    }

    #[tokio::test]
    async fn test_unknown_code_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let codes = codes(dir.path()).await;
        codes.generate(Utc::now()).await.unwrap();
        assert!(!codes.redeem("0000-0000-0000").await.unwrap());
        assert!(!codes.redeem("not a code").await.unwrap());
    }

    #[tokio::test]
    async fn test_regenerate_invalidates_old_batch() {
        let dir = tempfile::tempdir().unwrap();
        let codes = codes(dir.path()).await;
        let old = codes.generate(Utc::now()).await.unwrap();
        codes.generate(Utc::now()).await.unwrap();
        assert!(!codes.redeem(&old[0]).await.unwrap());
    }
}
