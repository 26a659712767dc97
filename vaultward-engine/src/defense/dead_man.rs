//! Dead-man's switch.
//!
//! When armed, every successful unlock (and every launch that does not trip
//! it) records a check-in. If the gap since the last check-in exceeds the
//! window, the next evaluation reports that a full wipe is due.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{SecurityError, SecurityResult};
use crate::security::RawCategory;
use crate::storage::RawStore;

const FILE_KEY: &str = "dead_man";

/// Longest window accepted, in days.
pub const MAX_WINDOW_DAYS: u32 = 3_650;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadManRecord {
    pub last_check_in: DateTime<Utc>,
    pub window_days: u32,
}

impl DeadManRecord {
    fn deadline(&self) -> DateTime<Utc> {
        self.last_check_in + Duration::days(self.window_days as i64)
    }
}

/// Where the switch stands at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadManState {
    Disabled,
    Armed { days_remaining: i64 },
    Expired,
}

#[derive(Debug, Clone)]
pub struct DeadManSwitch {
    raw: RawStore,
}

impl DeadManSwitch {
    pub fn new(raw: RawStore) -> Self {
        Self { raw }
    }

    /// Arm with `window_days`, checking in at `now`.
    pub async fn enable(&self, window_days: u32, now: DateTime<Utc>) -> SecurityResult<()> {
        if window_days == 0 || window_days > MAX_WINDOW_DAYS {
            return Err(SecurityError::InvalidInput(format!(
                "dead-man window must be 1..={} days",
                MAX_WINDOW_DAYS
            )));
        }
        let record = DeadManRecord {
            last_check_in: now,
            window_days,
        };
        self.raw
            .put_json(FILE_KEY, RawCategory::DeadMan, &record)
            .await?;
        info!("Dead-man switch armed ({} days)", window_days);
        Ok(())
    }

    pub async fn disable(&self) -> SecurityResult<()> {
        if self.raw.remove(FILE_KEY).await? {
            info!("Dead-man switch disarmed");
        }
        Ok(())
    }

    /// Record a check-in if armed. Returns whether one was recorded. An
    /// elapsed window is never renewed.
    pub async fn check_in(&self, now: DateTime<Utc>) -> SecurityResult<bool> {
        let Some(mut record) = self.load().await? else {
            return Ok(false);
        };
        if now > record.deadline() {
            warn!("Dead-man check-in refused, window already elapsed");
            return Ok(false);
        }
        if now > record.last_check_in {
            record.last_check_in = now;
            self.raw
                .put_json(FILE_KEY, RawCategory::DeadMan, &record)
                .await?;
        }
        Ok(true)
    }

    pub async fn evaluate(&self, now: DateTime<Utc>) -> SecurityResult<DeadManState> {
        let Some(record) = self.load().await? else {
            return Ok(DeadManState::Disabled);
        };
        let deadline = record.deadline();
        if now > deadline {
            warn!("Dead-man switch window elapsed (last check-in {})", record.last_check_in);
            return Ok(DeadManState::Expired);
        }
        Ok(DeadManState::Armed {
            days_remaining: (deadline - now).num_days(),
        })
    }

    async fn load(&self) -> SecurityResult<Option<DeadManRecord>> {
        self.raw.get_json(FILE_KEY, RawCategory::DeadMan).await
    }
}
