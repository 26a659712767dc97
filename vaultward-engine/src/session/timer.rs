use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// A live session. Exists only while a master key is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// `NoSession` / `Active` state machine. Expiry is evaluated lazily by the
/// caller; nothing here fires on its own.
#[derive(Debug, Default)]
pub struct SessionTimer {
    state: Option<SessionState>,
}

impl SessionTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> SessionState {
        let state = SessionState {
            started_at: now,
            last_activity: now,
        };
        self.state = Some(state);
        state
    }

    /// End the session. Returns whether one was active.
    pub fn end(&mut self) -> bool {
        self.state.take().is_some()
    }

    pub fn state(&self) -> Option<SessionState> {
        self.state
    }

    /// Record activity. `last_activity` never moves backwards, even if the
    /// clock does.
    pub fn touch(&mut self, now: DateTime<Utc>) -> bool {
        match self.state.as_mut() {
            Some(state) => {
                if now > state.last_activity {
                    state.last_activity = now;
                }
                true
            }
            None => false,
        }
    }

    /// True when there is no session or it has been idle longer than
    /// `timeout`.
    pub fn is_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match self.state {
            Some(state) => now - state.last_activity > timeout,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_session_is_expired() {
        let timer = SessionTimer::new();
        assert!(timer.state().is_none());
        assert!(timer.is_expired(Utc::now(), Duration::seconds(900)));
    }

    #[test]
    fn test_expiry_is_measured_from_last_activity() {
        let t0 = Utc::now();
        let timeout = Duration::seconds(900);
        let mut timer = SessionTimer::new();
        timer.start(t0);

        assert!(!timer.is_expired(t0 + Duration::seconds(900), timeout));
        assert!(timer.is_expired(t0 + Duration::seconds(901), timeout));

        timer.touch(t0 + Duration::seconds(600));
        assert!(!timer.is_expired(t0 + Duration::seconds(1400), timeout));
    }

    #[test]
    fn test_last_activity_is_monotone() {
        let t0 = Utc::now();
        let mut timer = SessionTimer::new();
        timer.start(t0);
        timer.touch(t0 + Duration::seconds(10));
        timer.touch(t0 + Duration::seconds(5));
        assert_eq!(
            timer.state().unwrap().last_activity,
            t0 + Duration::seconds(10)
        );
    }

    #[test]
    fn test_end() {
        let mut timer = SessionTimer::new();
        assert!(!timer.touch(Utc::now()));
        timer.start(Utc::now());
        assert!(timer.end());
        assert!(!timer.end());
        assert!(timer.state().is_none());
    }
}
