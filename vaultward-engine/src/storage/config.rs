use std::path::PathBuf;
use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::defense::TamperResponse;
use crate::error::{SecurityError, SecurityResult};
use crate::security::{DeviceFingerprint, KdfParams};
use crate::session::{Clock, SystemClock};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "VAULTWARD_DATA_DIR";

const APP_DIR_NAME: &str = "vaultward";

/// Persisted attempt, session and inactivity policy.
///
/// Stored device-bound (not under the master key) because the attempt gates
/// must be readable while the vault is locked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecurityPolicy {
    pub session_timeout_secs: u64,
    pub max_attempts: u32,
    pub permanent_lockout_threshold: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub min_attempt_interval_ms: u64,
    pub short_window_secs: u64,
    pub short_window_max: u32,
    pub long_window_secs: u64,
    pub long_window_max: u32,
    /// Idle time before the UI should lock. Zero disables.
    pub auto_lock_secs: u64,
    /// Idle time before the UI should close. Zero disables.
    pub auto_close_secs: u64,
    pub min_password_length: usize,
    pub dead_man_window_days: u32,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            session_timeout_secs: 900,
            max_attempts: 3,
            permanent_lockout_threshold: 10,
            backoff_base_ms: 3_000,
            backoff_cap_ms: 120_000,
            min_attempt_interval_ms: 1_500,
            short_window_secs: 60,
            short_window_max: 3,
            long_window_secs: 3_600,
            long_window_max: 10,
            auto_lock_secs: 300,
            auto_close_secs: 0,
            min_password_length: 8,
            dead_man_window_days: 90,
        }
    }
}

impl SecurityPolicy {
    /// Clamp every field into a range that is never weaker than what the
    /// engine is willing to enforce. Applied on load and before save.
    pub fn sanitized(mut self) -> Self {
        self.session_timeout_secs = self.session_timeout_secs.clamp(30, 24 * 3_600);
        self.max_attempts = self.max_attempts.clamp(1, 10);
        self.permanent_lockout_threshold = self
            .permanent_lockout_threshold
            .clamp(self.max_attempts, 100);
        self.backoff_base_ms = self.backoff_base_ms.clamp(500, 60_000);
        self.backoff_cap_ms = self.backoff_cap_ms.clamp(self.backoff_base_ms, 3_600_000);
        self.min_attempt_interval_ms = self.min_attempt_interval_ms.clamp(250, 60_000);
        self.short_window_secs = self.short_window_secs.clamp(10, 3_600);
        self.short_window_max = self.short_window_max.clamp(1, 20);
        self.long_window_secs = self.long_window_secs.clamp(self.short_window_secs, 86_400);
        self.long_window_max = self.long_window_max.clamp(self.short_window_max, 100);
        self.min_password_length = self.min_password_length.clamp(8, 1_024);
        self.dead_man_window_days = self.dead_man_window_days.clamp(1, 3_650);
        self
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::seconds(self.session_timeout_secs as i64)
    }

    /// Cool-down after `consecutive_failures` failures:
    /// `min(base * 2^(failures - 1), cap)`.
    pub fn backoff_for(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(31);
        let delay = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_cap_ms);
        Duration::milliseconds(delay as i64)
    }
}

/// Construction-time engine options. Not persisted.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub data_dir: PathBuf,
    /// Application version, fed to the integrity record.
    pub app_version: String,
    /// Build identifier, fed to the integrity record.
    pub build: String,
    /// Parameters used when a new master password is set.
    pub kdf_params: KdfParams,
    pub anti_tamper_enabled: bool,
    pub anti_tamper_interval: std::time::Duration,
    pub tamper_response: TamperResponse,
    pub clock: Arc<dyn Clock>,
    /// Replaces the host-derived fingerprint.
    pub fingerprint: Option<DeviceFingerprint>,
}

impl EngineOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            build: if cfg!(debug_assertions) { "debug" } else { "release" }.to_string(),
            kdf_params: KdfParams::default(),
            anti_tamper_enabled: !cfg!(debug_assertions),
            anti_tamper_interval: std::time::Duration::from_secs(5),
            tamper_response: TamperResponse::default(),
            clock: Arc::new(SystemClock),
            fingerprint: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_kdf_params(mut self, params: KdfParams) -> Self {
        self.kdf_params = params;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: DeviceFingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    pub fn with_anti_tamper(mut self, enabled: bool) -> Self {
        self.anti_tamper_enabled = enabled;
        self
    }
}

/// Default data directory: `$VAULTWARD_DATA_DIR`, then
/// `$XDG_DATA_HOME/vaultward`, then `$HOME/.local/share/vaultward`.
pub fn default_data_dir() -> SecurityResult<PathBuf> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    if let Some(xdg) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(xdg).join(APP_DIR_NAME));
    }
    if let Some(home) = std::env::var_os("HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(home)
            .join(".local")
            .join("share")
            .join(APP_DIR_NAME));
    }
    Err(SecurityError::InvalidInput(
        "Could not determine data directory".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_survive_sanitizing() {
        let policy = SecurityPolicy::default();
        assert_eq!(policy.clone().sanitized(), policy);
    }

    #[test]
    fn test_sanitize_never_weakens() {
        let policy = SecurityPolicy {
            max_attempts: 0,
            permanent_lockout_threshold: 1_000,
            backoff_base_ms: 0,
            min_password_length: 1,
            ..SecurityPolicy::default()
        }
        .sanitized();

        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.permanent_lockout_threshold, 100);
        assert_eq!(policy.backoff_base_ms, 500);
        assert_eq!(policy.min_password_length, 8);
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = SecurityPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::seconds(3));
        assert_eq!(policy.backoff_for(2), Duration::seconds(6));
        assert_eq!(policy.backoff_for(3), Duration::seconds(12));
        assert_eq!(policy.backoff_for(7), Duration::seconds(120));
        assert_eq!(policy.backoff_for(u32::MAX), Duration::seconds(120));
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let policy: SecurityPolicy = serde_json::from_str(r#"{"maxAttempts":5}"#).unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.session_timeout_secs, 900);
    }
}
