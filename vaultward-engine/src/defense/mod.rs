//! Audit trail and the defensive monitors that run beside the vault.

mod anti_tamper;
mod audit;
mod dead_man;
mod integrity;

pub use anti_tamper::{
    AntiTamperMonitor, HostProbe, TamperHandler, TamperIndicator, TamperProbe, TamperResponse,
};
pub use audit::{AuditEntry, AuditLevel, AuditLog, MAX_ENTRIES};
pub use dead_man::{DeadManRecord, DeadManState, DeadManSwitch, MAX_WINDOW_DAYS};
pub use integrity::{IntegrityStatus, IntegrityVerifier};
