//! Security engine for a local secrets vault.
//!
//! Build one [`SecurityEngine`] per process with [`SecurityEngine::open`] and
//! share it as `Arc<SecurityEngine>`. The engine derives the master key from
//! the user's password, keeps it in locked memory for the length of a
//! session, seals everything persisted under device-bound AES-256-GCM
//! envelopes and enforces the attempt, lockout and wipe policy.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the binary.

pub mod defense;
mod engine;
pub mod error;
pub mod events;
pub mod security;
pub mod session;
pub mod storage;
pub mod vault;

pub use defense::{AuditEntry, AuditLevel, TamperResponse};
pub use engine::{SecurityEngine, SecurityStatus, UnlockOutcome};
pub use error::{SecurityError, SecurityResult};
pub use events::{LifecycleSignal, LockReason, SecurityEvent, WipeReason};
pub use security::{DeviceFingerprint, KdfParams, SecureBuffer};
pub use session::{Clock, ManualClock, SystemClock};
pub use storage::{default_data_dir, EngineOptions, SecurityPolicy, DATA_DIR_ENV};
