use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why the master key left memory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockReason {
    Manual,
    Timeout,
    Background,
    MemoryPressure,
    AppExit,
    TamperDetected,
    Wiped,
}

/// Why persisted secrets were destroyed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WipeReason {
    /// `max_attempts` consecutive failures.
    ConsecutiveFailures,
    /// `total_failures` reached the permanent lockout threshold.
    PermanentLockout,
    /// Dead-man's switch inactivity window elapsed.
    Inactivity,
    /// Explicit request from the operator.
    Requested,
}

/// Platform lifecycle signals delivered by the UI collaborator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleSignal {
    Foreground,
    Background,
    Suspend,
    MemoryPressure,
    Terminate,
}

impl LifecycleSignal {
    /// Whether this signal requires secrets to leave memory.
    pub fn requires_wipe(self) -> bool {
        !matches!(self, LifecycleSignal::Foreground)
    }

    pub(crate) fn lock_reason(self) -> LockReason {
        match self {
            LifecycleSignal::MemoryPressure => LockReason::MemoryPressure,
            LifecycleSignal::Terminate => LockReason::AppExit,
            _ => LockReason::Background,
        }
    }
}

/// Typed events published by the engine. The UI subscribes through
/// [`crate::SecurityEngine::subscribe`].
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecurityEvent {
    SessionStarted {
        at: DateTime<Utc>,
    },
    /// The session timed out; the key has been wiped and the UI should
    /// prompt for re-authentication.
    SessionExpired,
    Locked {
        reason: LockReason,
    },
    UnlockFailed {
        consecutive_failures: u32,
        total_failures: u32,
    },
    BackoffStarted {
        until: DateTime<Utc>,
    },
    VaultWiped {
        reason: WipeReason,
    },
    TamperDetected {
        indicator: String,
    },
    IntegrityMismatch,
    /// The dead-man's switch window elapsed and a wipe was performed.
    DeadManTriggered,
}
