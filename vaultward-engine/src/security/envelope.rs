//! Authenticated encryption for everything persisted by the engine.
//!
//! Two layers:
//!
//! - **Master-key blobs.** A per-purpose sub-key is derived from the master
//!   key with HKDF-SHA256 (salt = SHA-256 of the purpose label, info = the
//!   label) and cached for the lifetime of that master key. The blob is
//!   `[12-byte nonce][ciphertext][16-byte tag]` with AAD = purpose label
//!   followed by the device fingerprint.
//! - **Raw blobs.** Files that must be readable before a master key exists
//!   (verification token, salt, policy) are sealed under a key derived from
//!   the device fingerprint and prefixed with a 32-byte HMAC over the sealed
//!   bytes. The MAC is checked in constant time before the AEAD is touched.
//!
//! Every open failure, whatever its cause, is the same
//! [`SecurityError::CryptographicFailure`].

use std::collections::HashMap;
use std::sync::Mutex;

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::fingerprint::DeviceFingerprint;
use super::secure_buffer::MAX_BUFFER_SIZE;
use crate::error::{SecurityError, SecurityResult};

type HmacSha256 = Hmac<Sha256>;

/// Nonce size for AES-GCM (96 bits = 12 bytes)
pub const NONCE_SIZE: usize = 12;
/// GCM authentication tag size.
pub const TAG_SIZE: usize = 16;
/// HMAC-SHA256 prefix on raw blobs.
pub const HMAC_SIZE: usize = 32;

/// Plaintext bound for entries and settings.
pub const MAX_ENTRY_PLAINTEXT: usize = 4 * 1024;
/// Ciphertext bound for entries and settings.
pub const MAX_ENTRY_CIPHERTEXT: usize = 8 * 1024;
/// Plaintext bound for the audit log blob.
pub const MAX_LOG_PLAINTEXT: usize = 4 * 1024 * 1024;
/// Plaintext bound for raw blobs.
pub const MAX_RAW_PLAINTEXT: usize = 64 * 1024;

const MIN_SALT_LEN: usize = 16;
const MAX_SALT_LEN: usize = 64;
const GENERAL_INFO: &[u8] = b"vaultward.general.v1";
const GENERAL_AAD: &[u8] = b"general";
const RAW_KEY_SALT: &[u8] = b"vaultward.raw-storage.v1";

/// What a master-key blob is used for. Each purpose gets its own sub-key and
/// its own AAD label, so blobs cannot be swapped between purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Settings,
    EntryBinding,
    AuditLog,
    MasterToken,
}

impl Purpose {
    fn info(self) -> &'static [u8] {
        match self {
            Purpose::Settings => b"vaultward.settings.v1",
            Purpose::EntryBinding => b"vaultward.entry-binding.v1",
            Purpose::AuditLog => b"vaultward.audit-log.v1",
            Purpose::MasterToken => b"vaultward.master-token.v1",
        }
    }

    fn aad_label(self) -> &'static [u8] {
        match self {
            Purpose::Settings => b"settings",
            Purpose::EntryBinding => b"entry-binding",
            Purpose::AuditLog => b"audit-log",
            Purpose::MasterToken => b"master-token",
        }
    }

    fn max_plaintext(self) -> usize {
        match self {
            Purpose::AuditLog => MAX_LOG_PLAINTEXT,
            _ => MAX_ENTRY_PLAINTEXT,
        }
    }

    fn max_ciphertext(self) -> usize {
        match self {
            Purpose::AuditLog => MAX_LOG_PLAINTEXT + NONCE_SIZE + TAG_SIZE,
            _ => MAX_ENTRY_CIPHERTEXT,
        }
    }
}

/// Device-bound blob categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawCategory {
    MasterToken,
    SaltStorage,
    KeyStorage,
    SecurityPolicy,
    Integrity,
    DeadMan,
    RecoveryCodes,
}

impl RawCategory {
    fn aad_label(self) -> &'static [u8] {
        match self {
            RawCategory::MasterToken => b"raw:master-token",
            RawCategory::SaltStorage => b"raw:salt-storage",
            RawCategory::KeyStorage => b"raw:key-storage",
            RawCategory::SecurityPolicy => b"raw:security-policy",
            RawCategory::Integrity => b"raw:integrity",
            RawCategory::DeadMan => b"raw:dead-man",
            RawCategory::RecoveryCodes => b"raw:recovery-codes",
        }
    }
}

/// Borrowed view of a master key.
///
/// `generation` identifies the key for sub-key caching: the key store bumps it
/// on every `set_key`. Generation 0 marks a candidate key that must not be
/// cached (for example while a password is still being verified).
#[derive(Clone, Copy)]
pub struct KeyRef<'a> {
    generation: u64,
    bytes: &'a [u8],
}

impl<'a> KeyRef<'a> {
    pub fn new(generation: u64, bytes: &'a [u8]) -> Self {
        Self { generation, bytes }
    }

    pub fn ephemeral(bytes: &'a [u8]) -> Self {
        Self::new(0, bytes)
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

struct SubKeyCache {
    generation: u64,
    keys: HashMap<Purpose, Zeroizing<[u8; 32]>>,
}

/// Sealing and opening of every persisted blob.
pub struct EnvelopeCodec {
    fingerprint: DeviceFingerprint,
    raw_key: Zeroizing<[u8; 32]>,
    raw_mac_key: Zeroizing<[u8; 32]>,
    subkeys: Mutex<SubKeyCache>,
}

impl EnvelopeCodec {
    pub fn new(fingerprint: DeviceFingerprint) -> SecurityResult<Self> {
        let salt = Sha256::digest(RAW_KEY_SALT);
        let raw_key = hkdf_expand(fingerprint.as_bytes(), &salt, b"aead")?;
        let raw_mac_key = hkdf_expand(fingerprint.as_bytes(), &salt, b"hmac")?;

        Ok(Self {
            fingerprint,
            raw_key,
            raw_mac_key,
            subkeys: Mutex::new(SubKeyCache {
                generation: 0,
                keys: HashMap::new(),
            }),
        })
    }

    pub fn fingerprint(&self) -> &DeviceFingerprint {
        &self.fingerprint
    }

    /// Drop every cached sub-key. Called whenever the master key leaves memory.
    pub fn forget_subkeys(&self) {
        let mut cache = self.subkeys.lock().unwrap_or_else(|e| e.into_inner());
        cache.keys.clear();
        cache.generation = 0;
    }

    fn purpose_key(&self, key: KeyRef<'_>, purpose: Purpose) -> SecurityResult<Zeroizing<[u8; 32]>> {
        let derive = || {
            let salt = Sha256::digest(purpose.info());
            hkdf_expand(key.bytes, &salt, purpose.info())
        };

        if key.generation == 0 {
            return derive();
        }

        let mut cache = self.subkeys.lock().unwrap_or_else(|e| e.into_inner());
        if cache.generation != key.generation {
            cache.keys.clear();
            cache.generation = key.generation;
        }
        if let Some(subkey) = cache.keys.get(&purpose) {
            return Ok(subkey.clone());
        }
        let subkey = derive()?;
        cache.keys.insert(purpose, subkey.clone());
        debug!("Derived sub-key for {:?}", purpose);
        Ok(subkey)
    }

    /// Seal a master-key blob for `purpose`.
    pub fn seal(&self, key: KeyRef<'_>, purpose: Purpose, plaintext: &[u8]) -> SecurityResult<Vec<u8>> {
        if plaintext.len() > purpose.max_plaintext() {
            return Err(SecurityError::InvalidInput(format!(
                "plaintext of {} bytes exceeds the {} byte limit",
                plaintext.len(),
                purpose.max_plaintext()
            )));
        }
        let subkey = self.purpose_key(key, purpose)?;
        let aad = self.fingerprint.bind(purpose.aad_label());
        seal_combined(&subkey[..], plaintext, &aad)
    }

    /// Open a master-key blob for `purpose`.
    pub fn open(&self, key: KeyRef<'_>, purpose: Purpose, combined: &[u8]) -> SecurityResult<Zeroizing<Vec<u8>>> {
        if combined.len() > purpose.max_ciphertext() {
            return Err(SecurityError::InvalidInput(format!(
                "ciphertext of {} bytes exceeds the {} byte limit",
                combined.len(),
                purpose.max_ciphertext()
            )));
        }
        let subkey = self.purpose_key(key, purpose)?;
        let aad = self.fingerprint.bind(purpose.aad_label());
        open_combined(&subkey[..], combined, &aad)
    }

    /// Seal with a caller-supplied salt and optional AAD. The key is
    /// HKDF(master, salt); the AAD is `(aad or "general") || fingerprint`.
    pub fn seal_with_salt(
        &self,
        key: KeyRef<'_>,
        salt: &[u8],
        aad: Option<&[u8]>,
        plaintext: &[u8],
    ) -> SecurityResult<Vec<u8>> {
        validate_salt(salt)?;
        if plaintext.len() > MAX_BUFFER_SIZE {
            return Err(SecurityError::InvalidInput(format!(
                "plaintext of {} bytes exceeds the {} byte limit",
                plaintext.len(),
                MAX_BUFFER_SIZE
            )));
        }
        let subkey = hkdf_expand(key.bytes, salt, GENERAL_INFO)?;
        let aad = self.fingerprint.bind(aad.unwrap_or(GENERAL_AAD));
        seal_combined(&subkey[..], plaintext, &aad)
    }

    /// Inverse of [`EnvelopeCodec::seal_with_salt`].
    pub fn open_with_salt(
        &self,
        key: KeyRef<'_>,
        salt: &[u8],
        aad: Option<&[u8]>,
        combined: &[u8],
    ) -> SecurityResult<Zeroizing<Vec<u8>>> {
        validate_salt(salt)?;
        if combined.len() > MAX_BUFFER_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(SecurityError::InvalidInput(
                "ciphertext exceeds the size limit".into(),
            ));
        }
        let subkey = hkdf_expand(key.bytes, salt, GENERAL_INFO)?;
        let aad = self.fingerprint.bind(aad.unwrap_or(GENERAL_AAD));
        open_combined(&subkey[..], combined, &aad)
    }

    /// Seal a device-bound blob: `HMAC(32) || nonce || ciphertext || tag`.
    pub fn seal_raw(&self, category: RawCategory, plaintext: &[u8]) -> SecurityResult<Vec<u8>> {
        if plaintext.len() > MAX_RAW_PLAINTEXT {
            return Err(SecurityError::InvalidInput(format!(
                "raw plaintext of {} bytes exceeds the {} byte limit",
                plaintext.len(),
                MAX_RAW_PLAINTEXT
            )));
        }
        let aad = self.fingerprint.bind(category.aad_label());
        let combined = seal_combined(&self.raw_key[..], plaintext, &aad)?;
        let tag = self.raw_mac(&combined)?;

        let mut output = Vec::with_capacity(HMAC_SIZE + combined.len());
        output.extend_from_slice(&tag);
        output.extend(combined);
        Ok(output)
    }

    /// Open a device-bound blob. The MAC is verified first, in constant time.
    pub fn open_raw(&self, category: RawCategory, data: &[u8]) -> SecurityResult<Zeroizing<Vec<u8>>> {
        if data.len() < HMAC_SIZE + NONCE_SIZE + TAG_SIZE
            || data.len() > HMAC_SIZE + NONCE_SIZE + TAG_SIZE + MAX_RAW_PLAINTEXT
        {
            return Err(SecurityError::auth_failed());
        }
        let (tag, combined) = data.split_at(HMAC_SIZE);
        let expected = self.raw_mac(combined)?;
        if !bool::from(tag.ct_eq(&expected[..])) {
            warn!("Raw blob MAC mismatch ({:?})", category);
            return Err(SecurityError::auth_failed());
        }
        let aad = self.fingerprint.bind(category.aad_label());
        open_combined(&self.raw_key[..], combined, &aad)
    }

    fn raw_mac(&self, data: &[u8]) -> SecurityResult<[u8; HMAC_SIZE]> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.raw_mac_key[..])
            .map_err(|e| SecurityError::CryptographicFailure(format!("HMAC init: {}", e)))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().into())
    }
}

impl std::fmt::Debug for EnvelopeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCodec")
            .field("fingerprint", &self.fingerprint)
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

fn validate_salt(salt: &[u8]) -> SecurityResult<()> {
    if (MIN_SALT_LEN..=MAX_SALT_LEN).contains(&salt.len()) {
        Ok(())
    } else {
        Err(SecurityError::InvalidInput(format!(
            "salt must be {}..={} bytes, got {}",
            MIN_SALT_LEN,
            MAX_SALT_LEN,
            salt.len()
        )))
    }
}

fn hkdf_expand(ikm: &[u8], salt: &[u8], info: &[u8]) -> SecurityResult<Zeroizing<[u8; 32]>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(info, &mut okm[..])
        .map_err(|e| SecurityError::CryptographicFailure(format!("HKDF expand: {}", e)))?;
    Ok(okm)
}

/// AES-256-GCM seal. Output: `[nonce][ciphertext][tag]`.
pub(crate) fn seal_combined(key: &[u8], plaintext: &[u8], aad: &[u8]) -> SecurityResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| SecurityError::CryptographicFailure(format!("Invalid key: {}", e)))?;

    // Generate random nonce
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|e| SecurityError::CryptographicFailure(format!("Encryption failed: {}", e)))?;

    // Prepend nonce to ciphertext
    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend(ciphertext);
    Ok(output)
}

/// Inverse of [`seal_combined`]. Fails closed with one opaque error.
pub(crate) fn open_combined(key: &[u8], combined: &[u8], aad: &[u8]) -> SecurityResult<Zeroizing<Vec<u8>>> {
    if combined.len() < NONCE_SIZE + TAG_SIZE {
        return Err(SecurityError::auth_failed());
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| SecurityError::auth_failed())?;

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map(Zeroizing::new)
        .map_err(|_| SecurityError::auth_failed())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: [u8; 32] = [0x11; 32];

    fn codec(fp: u8) -> EnvelopeCodec {
        EnvelopeCodec::new(DeviceFingerprint::from_bytes([fp; 32])).unwrap()
    }

    fn key() -> KeyRef<'static> {
        KeyRef::new(1, &MASTER)
    }

    #[test]
    fn test_purpose_roundtrip() {
        let codec = codec(1);
        let sealed = codec.seal(key(), Purpose::Settings, b"dark-mode").unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + 9 + TAG_SIZE);
        let opened = codec.open(key(), Purpose::Settings, &sealed).unwrap();
        assert_eq!(&opened[..], b"dark-mode");
    }

    #[test]
    fn test_purposes_are_isolated() {
        let codec = codec(1);
        let sealed = codec.seal(key(), Purpose::Settings, b"x").unwrap();
        assert!(codec.open(key(), Purpose::EntryBinding, &sealed).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let codec = codec(1);
        let sealed = codec.seal(key(), Purpose::EntryBinding, b"secret").unwrap();
        let other = [0x22; 32];
        let err = codec
            .open(KeyRef::new(2, &other), Purpose::EntryBinding, &sealed)
            .unwrap_err();
        assert_eq!(err.to_string(), SecurityError::auth_failed().to_string());
    }

    #[test]
    fn test_subkey_cache_follows_generation() {
        let codec = codec(1);
        let sealed = codec.seal(key(), Purpose::Settings, b"x").unwrap();

        // Same generation number reused with a different key must not hit a
        // stale cache entry once the cache has been told to forget.
        codec.forget_subkeys();
        let other = [0x33; 32];
        assert!(codec
            .open(KeyRef::new(1, &other), Purpose::Settings, &sealed)
            .is_err());
        assert!(codec
            .open(KeyRef::new(5, &MASTER), Purpose::Settings, &sealed)
            .is_ok());
    }

    #[test]
    fn test_every_bit_flip_is_detected() {
        let codec = codec(1);
        let sealed = codec.seal(key(), Purpose::EntryBinding, b"hunter2").unwrap();
        for i in 0..sealed.len() {
            for bit in 0..8 {
                let mut tampered = sealed.clone();
                tampered[i] ^= 1 << bit;
                assert!(codec.open(key(), Purpose::EntryBinding, &tampered).is_err());
            }
        }
    }

    #[test]
    fn test_size_limits() {
        let codec = codec(1);
        assert!(codec
            .seal(key(), Purpose::EntryBinding, &[0u8; MAX_ENTRY_PLAINTEXT])
            .is_ok());
        assert!(matches!(
            codec.seal(key(), Purpose::EntryBinding, &[0u8; MAX_ENTRY_PLAINTEXT + 1]),
            Err(SecurityError::InvalidInput(_))
        ));
        assert!(matches!(
            codec.open(key(), Purpose::EntryBinding, &vec![0u8; MAX_ENTRY_CIPHERTEXT + 1]),
            Err(SecurityError::InvalidInput(_))
        ));
        assert!(codec.open(key(), Purpose::EntryBinding, &[0u8; 10]).is_err());
    }

    #[test]
    fn test_salted_roundtrip_and_aad_binding() {
        let codec = codec(1);
        let salt = [7u8; 32];
        let sealed = codec
            .seal_with_salt(key(), &salt, Some(b"entry"), b"hunter2")
            .unwrap();

        let opened = codec
            .open_with_salt(key(), &salt, Some(b"entry"), &sealed)
            .unwrap();
        assert_eq!(&opened[..], b"hunter2");

        assert!(codec
            .open_with_salt(key(), &salt, Some(b"other-aad"), &sealed)
            .is_err());
        assert!(codec.open_with_salt(key(), &salt, None, &sealed).is_err());

        let mut other_salt = salt;
        other_salt[0] ^= 1;
        assert!(codec
            .open_with_salt(key(), &other_salt, Some(b"entry"), &sealed)
            .is_err());
    }

    #[test]
    fn test_bad_salt_rejected() {
        let codec = codec(1);
        assert!(matches!(
            codec.seal_with_salt(key(), &[0u8; 4], None, b"x"),
            Err(SecurityError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_device_binding() {
        let a = codec(1);
        let b = codec(2);
        let sealed = a.seal(key(), Purpose::Settings, b"bound").unwrap();
        assert!(b.open(key(), Purpose::Settings, &sealed).is_err());

        let raw = a.seal_raw(RawCategory::SaltStorage, b"salt").unwrap();
        assert!(b.open_raw(RawCategory::SaltStorage, &raw).is_err());
    }

    #[test]
    fn test_raw_roundtrip_and_layout() {
        let codec = codec(1);
        let raw = codec.seal_raw(RawCategory::MasterToken, b"token").unwrap();
        assert_eq!(raw.len(), HMAC_SIZE + NONCE_SIZE + 5 + TAG_SIZE);
        assert_eq!(
            &codec.open_raw(RawCategory::MasterToken, &raw).unwrap()[..],
            b"token"
        );
        assert!(codec.open_raw(RawCategory::SaltStorage, &raw).is_err());
    }

    #[test]
    fn test_raw_tamper_in_mac_or_body() {
        let codec = codec(1);
        let raw = codec.seal_raw(RawCategory::SecurityPolicy, b"{}").unwrap();

        let mut bad_mac = raw.clone();
        bad_mac[0] ^= 0x80;
        let mut bad_body = raw.clone();
        let last = bad_body.len() - 1;
        bad_body[last] ^= 0x01;

        let e1 = codec.open_raw(RawCategory::SecurityPolicy, &bad_mac).unwrap_err();
        let e2 = codec.open_raw(RawCategory::SecurityPolicy, &bad_body).unwrap_err();
        assert_eq!(e1.to_string(), e2.to_string());
        assert!(codec.open_raw(RawCategory::SecurityPolicy, &raw[..20]).is_err());
    }
}
