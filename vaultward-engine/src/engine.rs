//! `SecurityEngine`, the service context that wires every component together.
//!
//! One engine is built per process with [`SecurityEngine::open`] and shared as
//! `Arc<SecurityEngine>`. Each component keeps its own lock; engine methods
//! take them one at a time and never nest them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::defense::{
    AntiTamperMonitor, AuditEntry, AuditLevel, AuditLog, DeadManState, DeadManSwitch, HostProbe,
    IntegrityStatus, IntegrityVerifier, TamperHandler, TamperIndicator, TamperResponse,
};
use crate::error::{SecurityError, SecurityResult};
use crate::events::{LifecycleSignal, LockReason, SecurityEvent, WipeReason};
use crate::security::{
    check_password, BufferGuardian, DerivedKey, DeviceFingerprint, EnvelopeCodec,
    KeyDerivationEngine, Purpose, RawCategory, SecureBuffer,
};
use crate::session::{AttemptGate, FailureOutcome, RegisteredFailure, SessionCoordinator};
use crate::storage::{EngineOptions, RawStore, SecureStorage, SecurityPolicy};
use crate::vault::{MasterKeyStore, MasterPasswordFiles, MasterRecord, RecoveryCodes};

const POLICY_KEY: &str = "security_policy";
const SETTING_PREFIX: &str = "setting_";

/// Files a wipe leaves in place. Neither holds a secret.
const PRESERVED_ON_WIPE: &[&str] = &[POLICY_KEY, "integrity"];

/// Buffered events per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 64;

/// Exit status used when a debugger forces termination.
const TAMPER_EXIT_CODE: i32 = 70;

/// Result of an unlock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnlockOutcome {
    Unlocked,
    /// Wrong password; `remaining_attempts` before a wipe.
    #[serde(rename_all = "camelCase")]
    Rejected { remaining_attempts: u32 },
    #[serde(rename_all = "camelCase")]
    RateLimited { retry_after_ms: u64 },
    BackingOff { until: DateTime<Utc> },
    /// The failure crossed a lockout threshold and the vault was destroyed.
    Wiped { permanent: bool },
    /// The dead-man window had elapsed; the vault was destroyed instead of
    /// unlocked.
    DeadManTriggered,
    /// No master password is set.
    NotConfigured,
}

impl UnlockOutcome {
    pub fn is_unlocked(self) -> bool {
        matches!(self, UnlockOutcome::Unlocked)
    }
}

/// Snapshot of the engine's security state for the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityStatus {
    pub has_master_password: bool,
    pub has_key: bool,
    pub failed_attempts: u32,
    pub total_failed_attempts: u32,
    pub session_expired: bool,
    pub backoff_remaining_ms: u64,
    pub has_recovery_codes: bool,
    pub integrity_verified: bool,
    pub dead_man_switch_active: bool,
    pub days_until_auto_wipe: Option<i64>,
    pub anti_tamper_active: bool,
}

pub struct SecurityEngine {
    options: EngineOptions,
    storage: SecureStorage,
    codec: Arc<EnvelopeCodec>,
    raw: RawStore,
    keys: Arc<MasterKeyStore>,
    master: MasterPasswordFiles,
    recovery: RecoveryCodes,
    session: SessionCoordinator,
    policy: RwLock<SecurityPolicy>,
    audit: AuditLog,
    integrity: IntegrityVerifier,
    integrity_status: RwLock<IntegrityStatus>,
    dead_man: DeadManSwitch,
    monitor: AntiTamperMonitor,
    guardian: BufferGuardian,
    events: broadcast::Sender<SecurityEvent>,
    /// Serializes password setup and unlock attempts end to end.
    attempt_lock: Mutex<()>,
    /// Handle given to the anti-tamper monitor on each (re)start.
    this: Weak<SecurityEngine>,
    /// Set by `start_monitors`; the monitor only runs while unlocked.
    monitoring: AtomicBool,
    /// A debugger was seen. Unlocking is refused for the rest of the process.
    tampered: AtomicBool,
}

impl SecurityEngine {
    /// Build the engine over `options.data_dir` and run the launch checks:
    /// integrity verification, then dead-man evaluation.
    pub async fn open(options: EngineOptions) -> SecurityResult<Arc<Self>> {
        info!("Opening security engine at {:?}", options.data_dir);
        let storage = SecureStorage::open(options.data_dir.clone()).await?;

        let fingerprint = match options.fingerprint {
            Some(fingerprint) => fingerprint,
            None => DeviceFingerprint::for_install(&options.data_dir).await?,
        };
        let codec = Arc::new(EnvelopeCodec::new(fingerprint)?);
        let raw = RawStore::new(storage.clone(), codec.clone());
        let keys = Arc::new(MasterKeyStore::new());

        let session = SessionCoordinator::open(&options.data_dir, options.clock.clone()).await?;
        let policy = load_policy(&raw).await;
        let integrity =
            IntegrityVerifier::new(raw.clone(), &fingerprint, &options.app_version, &options.build);
        let monitor = AntiTamperMonitor::new(Arc::new(HostProbe), options.anti_tamper_interval);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let engine = Arc::new_cyclic(|this| Self {
            master: MasterPasswordFiles::new(raw.clone(), codec.clone()),
            recovery: RecoveryCodes::new(raw.clone()),
            dead_man: DeadManSwitch::new(raw.clone()),
            audit: AuditLog::new(storage.clone(), codec.clone(), keys.clone()),
            options,
            storage,
            codec,
            raw,
            keys,
            session,
            policy: RwLock::new(policy),
            integrity,
            integrity_status: RwLock::new(IntegrityStatus::Baselined),
            monitor,
            guardian: BufferGuardian::new(),
            events,
            attempt_lock: Mutex::new(()),
            this: this.clone(),
            monitoring: AtomicBool::new(false),
            tampered: AtomicBool::new(false),
        });

        engine.launch_checks().await?;
        Ok(engine)
    }

    async fn launch_checks(&self) -> SecurityResult<()> {
        let status = self.integrity.verify().await?;
        *self.integrity_status.write().await = status;
        if status == IntegrityStatus::Mismatch {
            self.audit
                .record(AuditLevel::Critical, "Integrity check failed at launch")
                .await;
            self.emit(SecurityEvent::IntegrityMismatch);
        }

        if !self.enforce_dead_man().await? {
            match self.dead_man.check_in(self.session.now()).await {
                Ok(true) => debug!("Dead-man check-in recorded at launch"),
                Ok(false) => {}
                Err(e) => warn!("Dead-man check-in failed: {}", e),
            }
        }
        Ok(())
    }

    /// Wipe if the dead-man window has elapsed. Returns whether it did.
    async fn enforce_dead_man(&self) -> SecurityResult<bool> {
        match self.dead_man.evaluate(self.session.now()).await {
            Ok(DeadManState::Expired) => {
                self.audit
                    .record(AuditLevel::Critical, "Dead-man switch window elapsed")
                    .await;
                self.wipe(WipeReason::Inactivity).await?;
                self.emit(SecurityEvent::DeadManTriggered);
                Ok(true)
            }
            Ok(DeadManState::Armed { days_remaining }) => {
                debug!("Dead-man switch armed, {} days remaining", days_remaining);
                Ok(false)
            }
            Ok(DeadManState::Disabled) => Ok(false),
            Err(e) => {
                warn!("Dead-man record unreadable, treating as disabled: {}", e);
                Ok(false)
            }
        }
    }

    fn refuse_if_tampered(&self) -> SecurityResult<()> {
        if self.tampered.load(Ordering::SeqCst) {
            return Err(SecurityError::DebuggerDetected);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Master password
    // ------------------------------------------------------------------

    /// First-time setup. Fails with `InvalidInput` if a password is already
    /// configured and with `WeakPassword` if the policy rejects it. On
    /// success the vault is unlocked.
    pub async fn set_master_password(&self, password: &[u8]) -> SecurityResult<()> {
        let _attempt = self.attempt_lock.lock().await;
        self.refuse_if_tampered()?;
        if self.master.is_configured().await? {
            return Err(SecurityError::InvalidInput(
                "a master password is already configured".into(),
            ));
        }
        let policy = self.security_policy().await;
        check_password(password, policy.min_password_length)?;

        let params = self.options.kdf_params;
        let salt = MasterPasswordFiles::generate_salt();
        let key = KeyDerivationEngine::new(params)
            .derive_key(password, &salt[..])
            .await?;
        let token = self.master.seal_token(&key)?;
        self.master.store(&salt, &params, &token).await?;

        // A fresh vault starts with clean counters.
        self.session.administrative_reset().await?;
        self.keys.set_key(key).await?;
        let state = self.session.start_session().await;
        self.after_unlock().await;

        self.audit
            .record(AuditLevel::Security, "Master password configured")
            .await;
        self.emit(SecurityEvent::SessionStarted {
            at: state.started_at,
        });
        Ok(())
    }

    pub async fn has_master_password(&self) -> SecurityResult<bool> {
        self.master.is_configured().await
    }

    /// Attempt to unlock with `password`.
    ///
    /// An elapsed dead-man window wipes before any gate runs. Then, in
    /// order: rate limiter, backoff, key derivation. A threshold-crossing
    /// failure wipes the vault before returning [`UnlockOutcome::Wiped`].
    /// Fails with `DebuggerDetected` once a debugger has been seen.
    pub async fn unlock(&self, password: &[u8]) -> SecurityResult<UnlockOutcome> {
        let _attempt = self.attempt_lock.lock().await;
        self.refuse_if_tampered()?;
        if !self.master.is_configured().await? {
            return Ok(UnlockOutcome::NotConfigured);
        }
        if self.enforce_dead_man().await? {
            return Ok(UnlockOutcome::DeadManTriggered);
        }

        let policy = self.security_policy().await;
        match self.session.gate_attempt(&policy).await {
            AttemptGate::Allowed => {}
            AttemptGate::RateLimited { retry_after } => {
                self.audit
                    .record(AuditLevel::Warning, "Unlock attempt rate limited")
                    .await;
                return Ok(UnlockOutcome::RateLimited {
                    retry_after_ms: retry_after.num_milliseconds().max(0) as u64,
                });
            }
            AttemptGate::BackingOff { until } => {
                return Ok(UnlockOutcome::BackingOff { until });
            }
        }

        let verified = match self.master.load().await {
            Ok(Some(record)) => self.derive_and_check(password, &record).await,
            Ok(None) => return Ok(UnlockOutcome::NotConfigured),
            Err(e) => {
                warn!("Master record could not be read: {}", e);
                None
            }
        };

        let Some(key) = verified else {
            return self.register_failed_attempt(&policy).await;
        };

        self.keys.set_key(key).await?;
        let state = self.session.record_success().await?;
        self.after_unlock().await;

        self.audit.record(AuditLevel::Info, "Vault unlocked").await;
        self.emit(SecurityEvent::SessionStarted {
            at: state.started_at,
        });
        Ok(UnlockOutcome::Unlocked)
    }

    /// Boolean form of [`SecurityEngine::unlock`].
    pub async fn verify_master_password(&self, password: &[u8]) -> bool {
        match self.unlock(password).await {
            Ok(outcome) => outcome.is_unlocked(),
            Err(e) => {
                error!("Unlock attempt failed: {}", e);
                false
            }
        }
    }

    /// Derive and check against the token. Every failure, including a
    /// derivation error, reads as a wrong password.
    async fn derive_and_check(&self, password: &[u8], record: &MasterRecord) -> Option<DerivedKey> {
        let key = match KeyDerivationEngine::new(record.params)
            .derive_key(password, &record.salt[..])
            .await
        {
            Ok(key) => key,
            Err(e) => {
                warn!("Key derivation failed during unlock: {}", e);
                return None;
            }
        };
        self.master
            .token_matches(&key, &record.token)
            .then_some(key)
    }

    /// Count a failure and act on it. The outcome is acted on even if the
    /// counters could not be saved; the save failure is logged and audited.
    async fn register_failed_attempt(&self, policy: &SecurityPolicy) -> SecurityResult<UnlockOutcome> {
        let RegisteredFailure {
            outcome,
            record,
            persisted,
        } = self.session.record_failure(policy).await;
        if let Err(e) = persisted {
            error!("Failed attempt not persisted, enforcing in memory: {}", e);
            self.audit
                .record(
                    AuditLevel::Critical,
                    format!("Attempt counters could not be saved: {}", e),
                )
                .await;
        }
        self.audit
            .record(
                AuditLevel::Security,
                format!(
                    "Failed unlock attempt ({} consecutive, {} total)",
                    record.consecutive_failures, record.total_failures
                ),
            )
            .await;
        self.emit(SecurityEvent::UnlockFailed {
            consecutive_failures: record.consecutive_failures,
            total_failures: record.total_failures,
        });

        match outcome {
            FailureOutcome::Backoff {
                until,
                remaining_attempts,
            } => {
                info!("Backing off until {}", until);
                self.emit(SecurityEvent::BackoffStarted { until });
                Ok(UnlockOutcome::Rejected { remaining_attempts })
            }
            FailureOutcome::Wipe { permanent } => {
                let reason = if permanent {
                    WipeReason::PermanentLockout
                } else {
                    WipeReason::ConsecutiveFailures
                };
                self.wipe(reason).await?;
                Ok(UnlockOutcome::Wiped { permanent })
            }
        }
    }

    /// Common tail of every unlock path.
    async fn after_unlock(&self) {
        if let Err(e) = self.audit.reload().await {
            warn!("Audit log could not be reloaded: {}", e);
        }
        match self.dead_man.check_in(self.session.now()).await {
            Ok(true) => debug!("Dead-man check-in recorded"),
            Ok(false) => {}
            Err(e) => warn!("Dead-man check-in failed: {}", e),
        }
        self.resume_monitors().await;
    }

    // ------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------

    /// Wipe the key and end the session.
    pub async fn lock(&self) -> bool {
        self.lock_with(LockReason::Manual).await
    }

    /// Whether a key is live and its session has not timed out.
    pub async fn is_unlocked(&self) -> bool {
        if !self.keys.has_key().await {
            return false;
        }
        let policy = self.security_policy().await;
        !self.session.is_expired(&policy).await
    }

    /// Lock if the session has timed out. Returns whether it did.
    pub async fn auto_lock_if_needed(&self) -> bool {
        if !self.keys.has_key().await {
            return false;
        }
        let policy = self.security_policy().await;
        if !self.session.is_expired(&policy).await {
            return false;
        }
        info!("Session expired after {} s of inactivity", policy.session_timeout_secs);
        let locked = self.lock_with(LockReason::Timeout).await;
        self.emit(SecurityEvent::SessionExpired);
        locked
    }

    async fn lock_with(&self, reason: LockReason) -> bool {
        // Audit first so the entry is sealed while the key is still live.
        if self.keys.has_key().await {
            self.audit
                .record(AuditLevel::Info, format!("Vault locked ({:?})", reason))
                .await;
        }
        let had_key = self.keys.clear_key().await;
        self.session.end_session().await;
        self.codec.forget_subkeys();
        // Halt rather than stop: this runs on the monitor's own task when a
        // debugger is detected.
        self.monitor.halt().await;
        if had_key {
            self.emit(SecurityEvent::Locked { reason });
        }
        had_key
    }

    /// Gate for every operation that needs the master key. Refreshes the
    /// session's activity timestamp on success.
    async fn require_session(&self) -> SecurityResult<()> {
        if !self.master.is_configured().await? {
            return Err(SecurityError::RecoveryRequired(
                "no master password is configured".into(),
            ));
        }
        if self.auto_lock_if_needed().await || !self.keys.has_key().await {
            return Err(SecurityError::SessionExpired);
        }
        self.session.touch().await;
        Ok(())
    }

    /// React to a platform lifecycle signal. Everything except `Foreground`
    /// clears the key and every registered buffer.
    pub async fn handle_lifecycle(&self, signal: LifecycleSignal) -> bool {
        if !signal.requires_wipe() {
            return false;
        }
        let cleared = self.guardian.handle(signal);
        let locked = self.lock_with(signal.lock_reason()).await;
        if signal == LifecycleSignal::Terminate {
            self.stop_monitors().await;
        }
        debug!(
            "Lifecycle {:?}: key cleared {}, {} buffers wiped",
            signal, locked, cleared
        );
        locked || cleared > 0
    }

    /// Track a caller-owned buffer so lifecycle signals wipe it.
    pub fn register_buffer(&self, buffer: &Arc<SecureBuffer>) {
        self.guardian.register(buffer);
    }

    // ------------------------------------------------------------------
    // Encryption
    // ------------------------------------------------------------------

    /// Seal `plaintext` under HKDF(master key, `salt`) with AAD bound to the
    /// device.
    pub async fn encrypt(&self, plaintext: &[u8], salt: &[u8], aad: Option<&[u8]>) -> SecurityResult<Vec<u8>> {
        self.require_session().await?;
        self.keys
            .with_key(|key| self.codec.seal_with_salt(key, salt, aad, plaintext))
            .await
    }

    pub async fn decrypt(
        &self,
        ciphertext: &[u8],
        salt: &[u8],
        aad: Option<&[u8]>,
    ) -> SecurityResult<Zeroizing<Vec<u8>>> {
        self.require_session().await?;
        self.keys
            .with_key(|key| self.codec.open_with_salt(key, salt, aad, ciphertext))
            .await
    }

    /// Seal a password entry under the entry-binding key.
    pub async fn encrypt_entry(&self, plaintext: &[u8]) -> SecurityResult<Vec<u8>> {
        self.require_session().await?;
        self.keys
            .with_key(|key| self.codec.seal(key, Purpose::EntryBinding, plaintext))
            .await
    }

    pub async fn decrypt_entry(&self, sealed: &[u8]) -> SecurityResult<Zeroizing<Vec<u8>>> {
        self.require_session().await?;
        self.keys
            .with_key(|key| self.codec.open(key, Purpose::EntryBinding, sealed))
            .await
    }

    // ------------------------------------------------------------------
    // Settings and policy
    // ------------------------------------------------------------------

    pub async fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> SecurityResult<()> {
        let file = setting_file(key);
        self.storage.path_for(&file)?;
        self.require_session().await?;

        let json = Zeroizing::new(serde_json::to_vec(value)?);
        let sealed = self
            .keys
            .with_key(|k| self.codec.seal(k, Purpose::Settings, &json))
            .await?;
        self.storage.write(&file, &sealed).await?;
        debug!("Stored setting {}", key);
        Ok(())
    }

    pub async fn get_setting<T: DeserializeOwned>(&self, key: &str) -> SecurityResult<Option<T>> {
        let file = setting_file(key);
        self.storage.path_for(&file)?;
        self.require_session().await?;

        let Some(sealed) = self.storage.read(&file).await? else {
            return Ok(None);
        };
        let json = self
            .keys
            .with_key(|k| self.codec.open(k, Purpose::Settings, &sealed))
            .await?;
        Ok(Some(serde_json::from_slice(&json)?))
    }

    pub async fn delete_setting(&self, key: &str) -> SecurityResult<bool> {
        let file = setting_file(key);
        self.storage.path_for(&file)?;
        self.require_session().await?;
        self.storage.secure_delete(&file).await
    }

    pub async fn security_policy(&self) -> SecurityPolicy {
        self.policy.read().await.clone()
    }

    /// Persist a new policy. Values are clamped before they take effect.
    pub async fn update_security_policy(&self, policy: SecurityPolicy) -> SecurityResult<SecurityPolicy> {
        self.require_session().await?;
        let policy = policy.sanitized();
        self.raw
            .put_json(POLICY_KEY, RawCategory::SecurityPolicy, &policy)
            .await?;
        *self.policy.write().await = policy.clone();
        self.audit
            .record(AuditLevel::Security, "Security policy updated")
            .await;
        Ok(policy)
    }

    // ------------------------------------------------------------------
    // Recovery, dead-man switch, audit, integrity
    // ------------------------------------------------------------------

    /// Issue a fresh batch of recovery codes, replacing any previous batch.
    pub async fn generate_recovery_codes(&self) -> SecurityResult<Vec<String>> {
        self.require_session().await?;
        let codes = self.recovery.generate(self.session.now()).await?;
        self.audit
            .record(AuditLevel::Security, "Recovery codes generated")
            .await;
        Ok(codes)
    }

    /// Consume a recovery code and reset every attempt counter. Works while
    /// locked.
    pub async fn redeem_recovery_code(&self, code: &str) -> SecurityResult<bool> {
        let _attempt = self.attempt_lock.lock().await;
        if !self.recovery.redeem(code).await? {
            self.audit
                .record(AuditLevel::Security, "Recovery code rejected")
                .await;
            return Ok(false);
        }
        self.session.administrative_reset().await?;
        self.audit
            .record(AuditLevel::Security, "Recovery code redeemed, attempt counters reset")
            .await;
        Ok(true)
    }

    /// Arm (with `window_days`, or the policy default) or disarm the
    /// dead-man switch.
    pub async fn configure_dead_man_switch(&self, enabled: bool, window_days: Option<u32>) -> SecurityResult<()> {
        self.require_session().await?;
        if enabled {
            let days = match window_days {
                Some(days) => days,
                None => self.security_policy().await.dead_man_window_days,
            };
            self.dead_man.enable(days, self.session.now()).await?;
            self.audit
                .record(AuditLevel::Security, format!("Dead-man switch armed ({} days)", days))
                .await;
        } else {
            self.dead_man.disable().await?;
            self.audit
                .record(AuditLevel::Security, "Dead-man switch disarmed")
                .await;
        }
        Ok(())
    }

    pub async fn audit_entries(&self, limit: usize, min_level: AuditLevel) -> SecurityResult<Vec<AuditEntry>> {
        self.require_session().await?;
        Ok(self.audit.entries(limit, min_level).await)
    }

    /// Accept the running build as the new integrity baseline.
    pub async fn reset_integrity_baseline(&self) -> SecurityResult<()> {
        self.require_session().await?;
        self.integrity.baseline().await?;
        *self.integrity_status.write().await = IntegrityStatus::Verified;
        self.audit
            .record(AuditLevel::Security, "Integrity baseline reset")
            .await;
        Ok(())
    }

    pub async fn integrity_status(&self) -> IntegrityStatus {
        *self.integrity_status.read().await
    }

    // ------------------------------------------------------------------
    // Status, events, wipe
    // ------------------------------------------------------------------

    /// Snapshot of the security state. An elapsed dead-man window is
    /// enforced (wiped) before the snapshot is taken.
    pub async fn get_security_status(&self) -> SecurityResult<SecurityStatus> {
        self.enforce_dead_man().await?;
        let has_master_password = self.master.is_configured().await?;
        let has_key = self.keys.has_key().await;
        let policy = self.security_policy().await;
        let session_expired = self.session.is_expired(&policy).await;
        let attempts = self.session.attempts().await;
        let backoff_remaining_ms = self
            .session
            .backoff_remaining()
            .await
            .map_or(0, |d| d.num_milliseconds().max(0) as u64);

        let has_recovery_codes = match self.recovery.remaining().await {
            Ok(n) => n > 0,
            Err(e) => {
                warn!("Recovery codes unreadable: {}", e);
                false
            }
        };

        let integrity_verified = self.integrity_status.read().await.is_verified();

        let (dead_man_switch_active, days_until_auto_wipe) =
            match self.dead_man.evaluate(self.session.now()).await {
                Ok(DeadManState::Armed { days_remaining }) => (true, Some(days_remaining)),
                Ok(DeadManState::Expired) => (true, Some(0)),
                Ok(DeadManState::Disabled) => (false, None),
                Err(e) => {
                    warn!("Dead-man record unreadable: {}", e);
                    (false, None)
                }
            };

        Ok(SecurityStatus {
            has_master_password,
            has_key,
            failed_attempts: attempts.consecutive_failures,
            total_failed_attempts: attempts.total_failures,
            session_expired,
            backoff_remaining_ms,
            has_recovery_codes,
            integrity_verified,
            dead_man_switch_active,
            days_until_auto_wipe,
            anti_tamper_active: self.monitor.is_running().await,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SecurityEvent) {
        if self.events.send(event).is_err() {
            debug!("No event subscribers");
        }
    }

    /// Irrecoverably destroy every secret: the live key, registered buffers
    /// and every stored blob except the policy and integrity records.
    /// Returns how many files were destroyed.
    ///
    /// A file that cannot be deleted does not stop the wipe. Every other
    /// file is still destroyed and the first failure is returned at the end.
    pub async fn wipe(&self, reason: WipeReason) -> SecurityResult<usize> {
        warn!("Wiping vault: {:?}", reason);
        self.lock_with(LockReason::Wiped).await;
        self.guardian.clear_all();

        // Master record first so even a partial wipe reads as unconfigured.
        let master = self.master.destroy().await;
        if let Err(e) = &master {
            error!("Master record could not be destroyed: {}", e);
        }
        let report = self
            .storage
            .secure_delete_all_except(PRESERVED_ON_WIPE)
            .await;

        let message = if report.failed.is_empty() && master.is_ok() {
            format!("Vault wiped ({:?}), {} files destroyed", reason, report.deleted)
        } else {
            let failed: Vec<&str> = report.failed.iter().map(|(key, _)| key.as_str()).collect();
            format!(
                "Vault wipe incomplete ({:?}), {} files destroyed, failed: {:?}",
                reason, report.deleted, failed
            )
        };
        self.audit.record(AuditLevel::Critical, message).await;
        self.emit(SecurityEvent::VaultWiped { reason });

        master?;
        let destroyed = report.into_result()?;
        info!("Wipe complete");
        Ok(destroyed)
    }

    // ------------------------------------------------------------------
    // Background monitors
    // ------------------------------------------------------------------

    /// Enable anti-tamper monitoring if the options allow it. The monitor
    /// polls while the vault is unlocked; locking halts it and the next
    /// unlock resumes it.
    pub async fn start_monitors(&self) {
        if !self.options.anti_tamper_enabled {
            debug!("Anti-tamper monitoring disabled");
            return;
        }
        self.monitoring.store(true, Ordering::SeqCst);
        if self.keys.has_key().await {
            self.resume_monitors().await;
        }
    }

    async fn resume_monitors(&self) {
        if !self.monitoring.load(Ordering::SeqCst) {
            return;
        }
        let handler: Weak<dyn TamperHandler> = self.this.clone();
        self.monitor.start(handler).await;
    }

    /// Disable monitoring and wait for the task to finish.
    pub async fn stop_monitors(&self) -> bool {
        self.monitoring.store(false, Ordering::SeqCst);
        self.monitor.stop().await
    }

    pub fn fingerprint(&self) -> &DeviceFingerprint {
        self.codec.fingerprint()
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }
}

#[async_trait]
impl TamperHandler for SecurityEngine {
    async fn on_tamper(&self, indicator: TamperIndicator) {
        self.emit(SecurityEvent::TamperDetected {
            indicator: indicator.to_string(),
        });

        match indicator {
            TamperIndicator::VirtualMachine(_) => {
                self.audit
                    .record(AuditLevel::Warning, format!("Tamper indicator: {}", indicator))
                    .await;
            }
            TamperIndicator::Debugger(_) => {
                self.audit
                    .record(AuditLevel::Critical, format!("Tamper indicator: {}", indicator))
                    .await;
                self.tampered.store(true, Ordering::SeqCst);
                self.lock_with(LockReason::TamperDetected).await;
                self.guardian.clear_all();
                if self.options.tamper_response == TamperResponse::WipeAndExit {
                    error!("{}, terminating", SecurityError::DebuggerDetected);
                    std::process::exit(TAMPER_EXIT_CODE);
                }
            }
        }
    }
}

impl std::fmt::Debug for SecurityEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityEngine")
            .field("data_dir", &self.options.data_dir)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

fn setting_file(key: &str) -> String {
    format!("{}{}", SETTING_PREFIX, key)
}

async fn load_policy(raw: &RawStore) -> SecurityPolicy {
    match raw
        .get_json::<SecurityPolicy>(POLICY_KEY, RawCategory::SecurityPolicy)
        .await
    {
        Ok(Some(policy)) => policy.sanitized(),
        Ok(None) => SecurityPolicy::default(),
        Err(e) => {
            warn!("Security policy unreadable, using defaults: {}", e);
            SecurityPolicy::default()
        }
    }
}
