//! Session lifetime and unlock-attempt policy.
//!
//! [`SessionCoordinator`] owns three independently locked pieces of state:
//! the session timer, the persisted attempt counter and the rate limiter.
//! No method holds more than one of those locks at a time.

mod attempts;
mod clock;
mod rate_limit;
mod timer;

pub use attempts::{AttemptCounter, AttemptRecord, FailureOutcome, RegisteredFailure, ATTEMPTS_FILE};
pub use clock::{Clock, ManualClock, SystemClock};
pub use rate_limit::RateLimiter;
pub use timer::{SessionState, SessionTimer};

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::SecurityResult;
use crate::storage::SecurityPolicy;

/// Whether an unlock attempt may proceed to key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptGate {
    Allowed,
    RateLimited { retry_after: Duration },
    BackingOff { until: DateTime<Utc> },
}

/// Session timer + attempt counter + rate limiter.
#[derive(Debug)]
pub struct SessionCoordinator {
    clock: Arc<dyn Clock>,
    timer: Mutex<SessionTimer>,
    attempts: Mutex<AttemptCounter>,
    limiter: Mutex<RateLimiter>,
}

impl SessionCoordinator {
    pub async fn open(data_dir: &Path, clock: Arc<dyn Clock>) -> SecurityResult<Self> {
        let attempts = AttemptCounter::load(data_dir).await?;
        Ok(Self {
            clock,
            timer: Mutex::new(SessionTimer::new()),
            attempts: Mutex::new(attempts),
            limiter: Mutex::new(RateLimiter::new()),
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Rate limiter first, then backoff. An admitted attempt is recorded by
    /// the limiter.
    pub async fn gate_attempt(&self, policy: &SecurityPolicy) -> AttemptGate {
        let now = self.now();
        {
            let mut limiter = self.limiter.lock().await;
            if let Err(retry_after) = limiter.check_and_record(now, policy) {
                debug!("Unlock attempt rate limited for {} ms", retry_after.num_milliseconds());
                return AttemptGate::RateLimited { retry_after };
            }
        }

        let attempts = self.attempts.lock().await;
        match attempts.record().backoff_until {
            Some(until) if until > now => AttemptGate::BackingOff { until },
            _ => AttemptGate::Allowed,
        }
    }

    pub async fn record_failure(&self, policy: &SecurityPolicy) -> RegisteredFailure {
        let now = self.now();
        self.attempts.lock().await.register_failure(now, policy).await
    }

    /// Verified unlock: reset consecutive failures and limiter history, then
    /// start a session.
    pub async fn record_success(&self) -> SecurityResult<SessionState> {
        self.attempts.lock().await.register_success().await?;
        self.limiter.lock().await.reset();

        let state = self.timer.lock().await.start(self.now());
        info!("Session started");
        Ok(state)
    }

    /// Start a session without an attempt (first-time setup).
    pub async fn start_session(&self) -> SessionState {
        self.timer.lock().await.start(self.now())
    }

    /// Zero the attempt counter (including the total) and the limiter.
    pub async fn administrative_reset(&self) -> SecurityResult<()> {
        self.attempts.lock().await.administrative_reset().await?;
        self.limiter.lock().await.reset();
        info!("Attempt counters reset");
        Ok(())
    }

    /// End the session. Returns whether one was active.
    pub async fn end_session(&self) -> bool {
        self.timer.lock().await.end()
    }

    pub async fn touch(&self) -> bool {
        let now = self.now();
        self.timer.lock().await.touch(now)
    }

    /// Lazy expiry check. True also when no session exists.
    pub async fn is_expired(&self, policy: &SecurityPolicy) -> bool {
        let now = self.now();
        self.timer
            .lock()
            .await
            .is_expired(now, policy.session_timeout())
    }

    pub async fn attempts(&self) -> AttemptRecord {
        self.attempts.lock().await.record().clone()
    }

    pub async fn backoff_remaining(&self) -> Option<Duration> {
        let now = self.now();
        self.attempts.lock().await.backoff_remaining(now)
    }
}
