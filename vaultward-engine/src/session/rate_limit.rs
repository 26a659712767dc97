use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use crate::storage::SecurityPolicy;

/// Sliding-window limiter over unlock attempts.
///
/// Three gates, checked in order: a minimum interval since the previous
/// attempt, a short window and a long window. History older than the long
/// window is pruned on every check.
#[derive(Debug, Default)]
pub struct RateLimiter {
    history: VecDeque<DateTime<Utc>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit and record an attempt at `now`, or return how long to wait.
    pub fn check_and_record(&mut self, now: DateTime<Utc>, policy: &SecurityPolicy) -> Result<(), Duration> {
        self.check(now, policy)?;
        self.history.push_back(now);
        Ok(())
    }

    /// Whether an attempt at `now` would be admitted.
    pub fn check(&mut self, now: DateTime<Utc>, policy: &SecurityPolicy) -> Result<(), Duration> {
        let long_window = Duration::seconds(policy.long_window_secs as i64);
        while self
            .history
            .front()
            .is_some_and(|t| now - *t >= long_window)
        {
            self.history.pop_front();
        }

        if let Some(last) = self.history.back() {
            let min_interval = Duration::milliseconds(policy.min_attempt_interval_ms as i64);
            let elapsed = (now - *last).max(Duration::zero());
            if elapsed < min_interval {
                return Err(min_interval - elapsed);
            }
        }

        let short_window = Duration::seconds(policy.short_window_secs as i64);
        if let Some(wait) = window_wait(&self.history, now, short_window, policy.short_window_max) {
            return Err(wait);
        }
        if let Some(wait) = window_wait(&self.history, now, long_window, policy.long_window_max) {
            return Err(wait);
        }
        Ok(())
    }

    /// Forget all history (verified unlock or administrative reset).
    pub fn reset(&mut self) {
        self.history.clear();
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

/// If `max` attempts already fall inside `window`, the wait until the oldest
/// of them slides out.
fn window_wait(
    history: &VecDeque<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: Duration,
    max: u32,
) -> Option<Duration> {
    let in_window: Vec<&DateTime<Utc>> = history.iter().filter(|t| now - **t < window).collect();
    if (in_window.len() as u32) < max {
        return None;
    }
    // Oldest attempt that has to leave the window before one more fits.
    let oldest = in_window[in_window.len() - max as usize];
    Some((*oldest + window - now).max(Duration::milliseconds(1)))
}
