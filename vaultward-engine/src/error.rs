//! Error taxonomy for the security engine.
//!
//! Every fallible operation in the crate returns [`SecurityResult`]. The
//! variants are deliberately coarse where detail would leak information: any
//! AEAD or HMAC mismatch surfaces as the same `CryptographicFailure` message,
//! whatever the underlying cause.

use thiserror::Error;

/// Message used for every authentication failure (tag mismatch, bad key,
/// truncated input). Callers must not be able to tell these apart.
pub(crate) const AUTH_FAILED: &str = "authentication failed";

/// Errors that can occur inside the security engine.
#[derive(Error, Debug)]
pub enum SecurityError {
    /// Sealing, opening or deriving key material failed.
    #[error("Cryptographic failure: {0}")]
    CryptographicFailure(String),

    /// Pages holding a secret could not be locked in memory.
    #[error("Memory protection failed: {0}")]
    MemoryProtectionFailed(String),

    /// Caller supplied malformed or out-of-bounds input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Too many attempts in a short window.
    ///
    /// `SecurityEngine::unlock` reports this state, and backoff, as
    /// `UnlockOutcome::RateLimited` / `UnlockOutcome::BackingOff` rather than
    /// as an error, since a refused attempt is an expected result. The
    /// variant keeps the code stable for callers that flatten outcomes into
    /// `{code, message}`.
    #[error("Rate limited, retry in {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    /// The password does not satisfy the configured policy.
    #[error("Weak password: {0}")]
    WeakPassword(String),

    /// A stored integrity record did not match the running build.
    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    /// A debugger was detected. Returned by every later unlock or setup
    /// attempt in the same process.
    #[error("Debugger detected")]
    DebuggerDetected,

    /// The session is missing or timed out; the key has been wiped.
    #[error("Session expired")]
    SessionExpired,

    /// No master password is configured (never set up, or wiped).
    #[error("Recovery required: {0}")]
    RecoveryRequired(String),

    /// The secure buffer has already been wiped.
    #[error("Buffer already cleared")]
    AlreadyCleared,

    /// The secure buffer exceeded its access ceiling and wiped itself.
    #[error("Access limit exceeded")]
    AccessLimitExceeded,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for engine operations.
pub type SecurityResult<T> = std::result::Result<T, SecurityError>;

impl SecurityError {
    /// The single, cause-agnostic authentication failure.
    pub(crate) fn auth_failed() -> Self {
        SecurityError::CryptographicFailure(AUTH_FAILED.into())
    }

    /// Stable machine-readable code for the UI collaborator.
    pub fn code(&self) -> &'static str {
        match self {
            SecurityError::CryptographicFailure(_) => "CRYPTOGRAPHIC_FAILURE",
            SecurityError::MemoryProtectionFailed(_) => "MEMORY_PROTECTION_FAILED",
            SecurityError::InvalidInput(_) => "INVALID_INPUT",
            SecurityError::RateLimited { .. } => "RATE_LIMITED",
            SecurityError::WeakPassword(_) => "WEAK_PASSWORD",
            SecurityError::IntegrityCheckFailed(_) => "INTEGRITY_CHECK_FAILED",
            SecurityError::DebuggerDetected => "DEBUGGER_DETECTED",
            SecurityError::SessionExpired => "SESSION_EXPIRED",
            SecurityError::RecoveryRequired(_) => "RECOVERY_REQUIRED",
            SecurityError::AlreadyCleared => "ALREADY_CLEARED",
            SecurityError::AccessLimitExceeded => "ACCESS_LIMIT_EXCEEDED",
            SecurityError::Io(_) => "IO_ERROR",
            SecurityError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

// ============================================================================
// Serialization for the UI boundary
// ============================================================================

impl serde::Serialize for SecurityError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("SecurityError", 2)?;
        state.serialize_field("code", self.code())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failures_are_indistinguishable() {
        let a = SecurityError::auth_failed();
        let b = SecurityError::auth_failed();
        assert_eq!(a.to_string(), b.to_string());
        assert_eq!(a.code(), "CRYPTOGRAPHIC_FAILURE");
    }

    #[test]
    fn test_security_error_serialization() {
        let err = SecurityError::RateLimited {
            retry_after_ms: 1500,
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("RATE_LIMITED"));
        assert!(json.contains("1500 ms"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: SecurityError = io.into();
        assert_eq!(err.code(), "IO_ERROR");
    }
}
