//! End-to-end scenarios against a real data directory.

use std::path::Path;
use std::sync::Arc;

use vaultward_engine::security::LockPolicy;
use vaultward_engine::session::ATTEMPTS_FILE;
use vaultward_engine::{
    AuditLevel, DeviceFingerprint, EngineOptions, KdfParams, LifecycleSignal, LockReason,
    ManualClock, SecureBuffer, SecurityEngine, SecurityEvent, UnlockOutcome, WipeReason,
};

const PASSWORD: &[u8] = b"Str0ng!Pass";

fn options(dir: &Path, clock: &ManualClock, device: u8) -> EngineOptions {
    EngineOptions::new(dir)
        .with_clock(Arc::new(clock.clone()))
        .with_kdf_params(KdfParams::insecure_for_tests())
        .with_fingerprint(DeviceFingerprint::from_bytes([device; 32]))
        .with_anti_tamper(false)
}

async fn open(dir: &Path, clock: &ManualClock) -> Arc<SecurityEngine> {
    SecurityEngine::open(options(dir, clock, 1)).await.unwrap()
}

#[tokio::test]
async fn three_consecutive_failures_wipe_the_vault() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_now();
    let engine = open(dir.path(), &clock).await;

    engine.set_master_password(PASSWORD).await.unwrap();
    assert!(engine.verify_master_password(PASSWORD).await);
    let status = engine.get_security_status().await.unwrap();
    assert_eq!(status.failed_attempts, 0);

    // Ten seconds between attempts clears both the limiter interval and
    // every backoff so far.
    clock.advance_secs(10);
    assert!(!engine.verify_master_password(b"wrong").await);
    clock.advance_secs(10);
    assert!(!engine.verify_master_password(b"wrong").await);
    assert!(engine.has_master_password().await.unwrap());

    let mut events = engine.subscribe();
    clock.advance_secs(10);
    assert!(!engine.verify_master_password(b"wrong").await);
    assert!(!engine.has_master_password().await.unwrap());
    assert!(!engine.is_unlocked().await);

    let mut saw_wipe = false;
    while let Ok(event) = events.try_recv() {
        if event
            == (SecurityEvent::VaultWiped {
                reason: WipeReason::ConsecutiveFailures,
            })
        {
            saw_wipe = true;
        }
    }
    assert!(saw_wipe);
}

#[tokio::test]
async fn total_failures_across_sessions_trigger_permanent_wipe() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_now();
    let engine = open(dir.path(), &clock).await;
    engine.set_master_password(PASSWORD).await.unwrap();

    for round in 0..5 {
        clock.advance_secs(10);
        let first = engine.unlock(b"wrong").await.unwrap();
        assert_eq!(first, UnlockOutcome::Rejected { remaining_attempts: 2 });

        clock.advance_secs(10);
        let second = engine.unlock(b"wrong").await.unwrap();
        if round < 4 {
            assert_eq!(second, UnlockOutcome::Rejected { remaining_attempts: 1 });
            clock.advance_secs(10);
            assert_eq!(engine.unlock(PASSWORD).await.unwrap(), UnlockOutcome::Unlocked);
        } else {
            assert_eq!(second, UnlockOutcome::Wiped { permanent: true });
        }
    }

    assert!(!engine.has_master_password().await.unwrap());
    let status = engine.get_security_status().await.unwrap();
    assert_eq!(status.failed_attempts, 0);
    assert_eq!(status.total_failed_attempts, 10);
}

#[tokio::test]
async fn encrypt_decrypt_with_aad() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_now();
    let engine = open(dir.path(), &clock).await;
    engine.set_master_password(PASSWORD).await.unwrap();

    let salt = [0x5au8; 32];
    let sealed = engine
        .encrypt(b"hunter2", &salt, Some(&b"entry"[..]))
        .await
        .unwrap();
    let opened = engine.decrypt(&sealed, &salt, Some(&b"entry"[..])).await.unwrap();
    assert_eq!(&opened[..], b"hunter2");

    let err = engine
        .decrypt(&sealed, &salt, Some(&b"other-aad"[..]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CRYPTOGRAPHIC_FAILURE");

    let mut other_salt = salt;
    other_salt[0] ^= 1;
    assert!(engine
        .decrypt(&sealed, &other_salt, Some(&b"entry"[..]))
        .await
        .is_err());
}

#[tokio::test]
async fn entries_survive_lock_and_unlock() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_now();
    let engine = open(dir.path(), &clock).await;
    engine.set_master_password(PASSWORD).await.unwrap();

    let sealed = engine.encrypt_entry(b"totp-seed").await.unwrap();
    assert!(engine.lock().await);
    assert_eq!(
        engine.decrypt_entry(&sealed).await.unwrap_err().code(),
        "SESSION_EXPIRED"
    );

    clock.advance_secs(10);
    assert!(engine.verify_master_password(PASSWORD).await);
    assert_eq!(&engine.decrypt_entry(&sealed).await.unwrap()[..], b"totp-seed");
}

#[tokio::test]
async fn records_are_bound_to_the_device() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_now();
    let engine = open(dir.path(), &clock).await;
    engine.set_master_password(PASSWORD).await.unwrap();
    drop(engine);

    let elsewhere = SecurityEngine::open(options(dir.path(), &clock, 2))
        .await
        .unwrap();
    assert_eq!(
        elsewhere.unlock(PASSWORD).await.unwrap(),
        UnlockOutcome::Rejected { remaining_attempts: 2 }
    );
    let status = elsewhere.get_security_status().await.unwrap();
    assert!(!status.integrity_verified);
}

#[tokio::test]
async fn attempts_are_rate_limited_then_backed_off() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_now();
    let engine = open(dir.path(), &clock).await;
    engine.set_master_password(PASSWORD).await.unwrap();
    engine.lock().await;

    assert_eq!(
        engine.unlock(b"wrong").await.unwrap(),
        UnlockOutcome::Rejected { remaining_attempts: 2 }
    );
    assert!(matches!(
        engine.unlock(PASSWORD).await.unwrap(),
        UnlockOutcome::RateLimited { .. }
    ));

    clock.advance_secs(2);
    assert!(matches!(
        engine.unlock(PASSWORD).await.unwrap(),
        UnlockOutcome::BackingOff { .. }
    ));
    assert!(engine.get_security_status().await.unwrap().backoff_remaining_ms > 0);

    clock.advance_secs(10);
    assert_eq!(engine.unlock(PASSWORD).await.unwrap(), UnlockOutcome::Unlocked);
}

#[tokio::test]
async fn background_signal_clears_key_and_buffers() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_now();
    let engine = open(dir.path(), &clock).await;
    engine.set_master_password(PASSWORD).await.unwrap();

    let buffer = Arc::new(
        SecureBuffer::with_policy(b"clipboard secret", LockPolicy::BestEffort).unwrap(),
    );
    engine.register_buffer(&buffer);
    let mut events = engine.subscribe();

    assert!(!engine.handle_lifecycle(LifecycleSignal::Foreground).await);
    assert!(engine.is_unlocked().await);

    assert!(engine.handle_lifecycle(LifecycleSignal::Background).await);
    assert!(!engine.is_unlocked().await);
    assert!(buffer.is_cleared());
    assert_eq!(
        events.recv().await.unwrap(),
        SecurityEvent::Locked {
            reason: LockReason::Background
        }
    );
}

#[tokio::test]
async fn recovery_code_resets_counters_once() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_now();
    let engine = open(dir.path(), &clock).await;
    engine.set_master_password(PASSWORD).await.unwrap();

    let codes = engine.generate_recovery_codes().await.unwrap();
    assert_eq!(codes.len(), 8);
    assert!(engine.get_security_status().await.unwrap().has_recovery_codes);
    engine.lock().await;

    clock.advance_secs(10);
    engine.unlock(b"wrong").await.unwrap();
    clock.advance_secs(10);
    engine.unlock(b"wrong").await.unwrap();
    assert_eq!(engine.get_security_status().await.unwrap().total_failed_attempts, 2);

    assert!(engine.redeem_recovery_code(&codes[0].to_lowercase()).await.unwrap());
    let status = engine.get_security_status().await.unwrap();
    assert_eq!(status.failed_attempts, 0);
    assert_eq!(status.total_failed_attempts, 0);
    assert_eq!(status.backoff_remaining_ms, 0);

    assert!(!engine.redeem_recovery_code(&codes[0]).await.unwrap());
    assert!(!engine.redeem_recovery_code("AAAA-BBBB-CCCC").await.unwrap());
}

#[tokio::test]
async fn dead_man_switch_wipes_on_launch_after_window() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_now();
    let engine = open(dir.path(), &clock).await;
    engine.set_master_password(PASSWORD).await.unwrap();
    engine
        .configure_dead_man_switch(true, Some(30))
        .await
        .unwrap();

    let status = engine.get_security_status().await.unwrap();
    assert!(status.dead_man_switch_active);
    assert_eq!(status.days_until_auto_wipe, Some(30));
    drop(engine);

    // A launch inside the window checks in.
    clock.advance_secs(20 * 86_400);
    let engine = open(dir.path(), &clock).await;
    assert!(engine.has_master_password().await.unwrap());
    drop(engine);

    clock.advance_secs(31 * 86_400);
    let engine = open(dir.path(), &clock).await;
    assert!(!engine.has_master_password().await.unwrap());
    assert!(!engine.get_security_status().await.unwrap().dead_man_switch_active);
}

#[tokio::test]
async fn audit_log_persists_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_now();
    let engine = open(dir.path(), &clock).await;
    engine.set_master_password(PASSWORD).await.unwrap();
    engine.lock().await;
    drop(engine);

    let engine = open(dir.path(), &clock).await;
    assert_eq!(
        engine.audit_entries(10, AuditLevel::Info).await.unwrap_err().code(),
        "SESSION_EXPIRED"
    );
    assert_eq!(engine.unlock(PASSWORD).await.unwrap(), UnlockOutcome::Unlocked);

    let security = engine.audit_entries(100, AuditLevel::Security).await.unwrap();
    assert!(security
        .iter()
        .any(|e| e.message == "Master password configured"));
    let all = engine.audit_entries(100, AuditLevel::Info).await.unwrap();
    assert!(all.iter().any(|e| e.message == "Vault unlocked"));
}

#[tokio::test]
async fn dead_man_window_elapsing_while_open_wipes_on_unlock() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_now();
    let engine = open(dir.path(), &clock).await;
    engine.set_master_password(PASSWORD).await.unwrap();
    engine
        .configure_dead_man_switch(true, Some(30))
        .await
        .unwrap();
    engine.lock().await;

    clock.advance_secs(31 * 86_400);
    let mut events = engine.subscribe();
    assert_eq!(
        engine.unlock(PASSWORD).await.unwrap(),
        UnlockOutcome::DeadManTriggered
    );
    assert!(!engine.has_master_password().await.unwrap());
    assert!(!engine.is_unlocked().await);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&SecurityEvent::DeadManTriggered));
    assert!(seen.contains(&SecurityEvent::VaultWiped {
        reason: WipeReason::Inactivity
    }));
}

#[tokio::test]
async fn dead_man_window_elapsing_while_open_wipes_on_status() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_now();
    let engine = open(dir.path(), &clock).await;
    engine.set_master_password(PASSWORD).await.unwrap();
    engine
        .configure_dead_man_switch(true, Some(30))
        .await
        .unwrap();

    clock.advance_secs(31 * 86_400);
    let status = engine.get_security_status().await.unwrap();
    assert!(!status.has_master_password);
    assert!(!status.has_key);
    assert!(!status.dead_man_switch_active);
    assert_eq!(status.days_until_auto_wipe, None);
    assert_eq!(
        engine.unlock(PASSWORD).await.unwrap(),
        UnlockOutcome::NotConfigured
    );
}

#[tokio::test]
async fn lockout_wipes_even_when_counters_cannot_be_saved() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_now();
    let engine = open(dir.path(), &clock).await;
    engine.set_master_password(PASSWORD).await.unwrap();
    engine.lock().await;

    // A directory in place of the counter file makes every save fail.
    let counters = dir.path().join(ATTEMPTS_FILE);
    std::fs::remove_file(&counters).unwrap();
    std::fs::create_dir(&counters).unwrap();

    clock.advance_secs(10);
    assert_eq!(
        engine.unlock(b"wrong").await.unwrap(),
        UnlockOutcome::Rejected { remaining_attempts: 2 }
    );
    clock.advance_secs(10);
    assert_eq!(
        engine.unlock(b"wrong").await.unwrap(),
        UnlockOutcome::Rejected { remaining_attempts: 1 }
    );
    clock.advance_secs(10);
    assert_eq!(
        engine.unlock(b"wrong").await.unwrap(),
        UnlockOutcome::Wiped { permanent: false }
    );
    assert!(!engine.has_master_password().await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_unlocks_lose_no_counter_updates() {
    const ATTEMPTS: usize = 8;

    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_now();
    let engine = open(dir.path(), &clock).await;
    engine.set_master_password(PASSWORD).await.unwrap();
    engine.lock().await;

    let handles: Vec<_> = (0..ATTEMPTS)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.unlock(b"wrong").await.unwrap() })
        })
        .collect();

    let mut rejected = 0;
    let mut limited = 0;
    for handle in handles {
        match handle.await.unwrap() {
            UnlockOutcome::Rejected { .. } => rejected += 1,
            UnlockOutcome::RateLimited { .. } => limited += 1,
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    // The clock never moves, so only the first attempt gets past the limiter.
    assert_eq!(rejected, 1);
    assert_eq!(limited, ATTEMPTS - 1);
    let status = engine.get_security_status().await.unwrap();
    assert_eq!(status.total_failed_attempts, 1);
    assert_eq!(status.failed_attempts, 1);
}
