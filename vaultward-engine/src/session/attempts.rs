//! Failed-attempt bookkeeping.
//!
//! Persisted as plain JSON (`attempts.json`) next to the sealed files so the
//! counters survive restarts and stay readable while the vault is locked.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::SecurityResult;
use crate::storage::{write_private_file, SecurityPolicy};

/// File holding the counters.
pub const ATTEMPTS_FILE: &str = "attempts.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttemptRecord {
    /// Reset on verified unlock or wipe.
    pub consecutive_failures: u32,
    /// Only lowered by an administrative reset.
    pub total_failures: u32,
    pub backoff_until: Option<DateTime<Utc>>,
}

/// What a failed attempt led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Wait until `until` before the next attempt.
    Backoff {
        until: DateTime<Utc>,
        remaining_attempts: u32,
    },
    /// A wipe is due. `permanent` when the total threshold was reached.
    Wipe { permanent: bool },
}

/// A counted failure. The save result travels separately from the outcome
/// so a due wipe is never skipped because the counters could not be written.
#[derive(Debug)]
pub struct RegisteredFailure {
    pub outcome: FailureOutcome,
    pub record: AttemptRecord,
    pub persisted: SecurityResult<()>,
}

/// Persisted attempt counter.
#[derive(Debug)]
pub struct AttemptCounter {
    path: PathBuf,
    record: AttemptRecord,
}

impl AttemptCounter {
    /// Load the counters from `data_dir`. A missing file means no failures.
    pub async fn load(data_dir: &Path) -> SecurityResult<Self> {
        let path = data_dir.join(ATTEMPTS_FILE);
        let record = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(record) => record,
                Err(e) => {
                    error!("Attempt counter file is unreadable, starting over: {}", e);
                    AttemptRecord::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AttemptRecord::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(
            "Attempt counters: {} consecutive, {} total",
            record.consecutive_failures, record.total_failures
        );
        Ok(Self { path, record })
    }

    pub fn record(&self) -> &AttemptRecord {
        &self.record
    }

    /// Time left in the current cool-down, if any.
    pub fn backoff_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.record
            .backoff_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Count a failure and decide what it leads to.
    ///
    /// The permanent threshold is checked first: once `total_failures`
    /// reaches it a wipe is due regardless of the consecutive count. The
    /// in-memory counters are updated even when the save fails.
    pub async fn register_failure(&mut self, now: DateTime<Utc>, policy: &SecurityPolicy) -> RegisteredFailure {
        self.record.consecutive_failures = self.record.consecutive_failures.saturating_add(1);
        self.record.total_failures = self.record.total_failures.saturating_add(1);

        let outcome = if self.record.total_failures >= policy.permanent_lockout_threshold {
            self.record.consecutive_failures = 0;
            self.record.backoff_until = None;
            FailureOutcome::Wipe { permanent: true }
        } else if self.record.consecutive_failures >= policy.max_attempts {
            self.record.consecutive_failures = 0;
            self.record.backoff_until = None;
            FailureOutcome::Wipe { permanent: false }
        } else {
            let until = now + policy.backoff_for(self.record.consecutive_failures);
            self.record.backoff_until = Some(until);
            FailureOutcome::Backoff {
                until,
                remaining_attempts: policy.max_attempts - self.record.consecutive_failures,
            }
        };

        warn!(
            "Failed unlock attempt ({} consecutive, {} total)",
            self.record.consecutive_failures, self.record.total_failures
        );
        let persisted = self.save().await;
        if let Err(e) = &persisted {
            error!("Attempt counters could not be persisted: {}", e);
        }
        RegisteredFailure {
            outcome,
            record: self.record.clone(),
            persisted,
        }
    }

    /// Verified unlock: clear the consecutive count and any cool-down.
    pub async fn register_success(&mut self) -> SecurityResult<()> {
        if self.record.consecutive_failures == 0 && self.record.backoff_until.is_none() {
            return Ok(());
        }
        self.record.consecutive_failures = 0;
        self.record.backoff_until = None;
        self.save().await
    }

    /// Zero everything, including the total.
    pub async fn administrative_reset(&mut self) -> SecurityResult<()> {
        self.record = AttemptRecord::default();
        self.save().await
    }

    async fn save(&self) -> SecurityResult<()> {
        let json = serde_json::to_vec_pretty(&self.record)?;
        write_private_file(&self.path, &json).await
    }
}
