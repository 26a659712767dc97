mod envelope;
mod fingerprint;
pub mod kdf;
mod password_policy;
mod secure_buffer;

pub use envelope::{
    EnvelopeCodec, KeyRef, Purpose, RawCategory, HMAC_SIZE, MAX_ENTRY_CIPHERTEXT,
    MAX_ENTRY_PLAINTEXT, NONCE_SIZE, TAG_SIZE,
};
pub use fingerprint::{DeviceFingerprint, DeviceSignals, INSTALL_SALT_FILE};
pub use kdf::{DerivedKey, KdfParams, KeyDerivationEngine};
pub use password_policy::check_password;
pub use secure_buffer::{BufferGuardian, LockPolicy, SecureBuffer, MAX_BUFFER_SIZE};
