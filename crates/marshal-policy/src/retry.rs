use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// Decision for one (policy, target) trigger attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permit {
    /// Go ahead; `attempt` is 1-based within the current window.
    Allowed { attempt: u32 },
    /// Ceiling reached. `first` is true exactly once per suppression so the
    /// caller can emit a single manual-intervention event.
    Suppressed { first: bool },
}

struct RetryState {
    consecutive: u32,
    last_trigger: DateTime<Utc>,
    notified: bool,
}

/// Consecutive-trigger accounting per (policy, target). A success for the
/// target, or the reset window elapsing since the last trigger, clears the
/// counter and re-arms automatic action.
pub struct RetryLedger {
    max_retries: u32,
    reset_window: Duration,
    entries: Mutex<HashMap<(String, String), RetryState>>,
}

impl RetryLedger {
    pub fn new(max_retries: u32, retry_reset_seconds: u64) -> Self {
        Self {
            max_retries,
            reset_window: Duration::seconds(retry_reset_seconds as i64),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Count a trigger attempt and decide whether it may proceed.
    pub fn try_acquire(&self, policy: &str, target: &str, now: DateTime<Utc>) -> Permit {
        let mut entries = self.entries.lock();
        let key = (policy.to_string(), target.to_string());
        let state = entries.entry(key).or_insert(RetryState {
            consecutive: 0,
            last_trigger: now,
            notified: false,
        });

        if state.consecutive > 0 && now - state.last_trigger >= self.reset_window {
            state.consecutive = 0;
            state.notified = false;
        }

        if state.consecutive >= self.max_retries {
            let first = !state.notified;
            state.notified = true;
            return Permit::Suppressed { first };
        }

        state.consecutive += 1;
        state.last_trigger = now;
        Permit::Allowed { attempt: state.consecutive }
    }

    /// A success for the target re-arms it immediately.
    pub fn record_success(&self, policy: &str, target: &str) {
        self.entries
            .lock()
            .remove(&(policy.to_string(), target.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_ceiling_then_suppresses() {
        let ledger = RetryLedger::new(3, 1800);
        let now = Utc::now();
        assert_eq!(ledger.try_acquire("resume", "sess_1", now), Permit::Allowed { attempt: 1 });
        assert_eq!(ledger.try_acquire("resume", "sess_1", now), Permit::Allowed { attempt: 2 });
        assert_eq!(ledger.try_acquire("resume", "sess_1", now), Permit::Allowed { attempt: 3 });
        assert_eq!(ledger.try_acquire("resume", "sess_1", now), Permit::Suppressed { first: true });
        // Notification fires only once per suppression
        assert_eq!(ledger.try_acquire("resume", "sess_1", now), Permit::Suppressed { first: false });
    }

    #[test]
    fn targets_are_independent() {
        let ledger = RetryLedger::new(1, 1800);
        let now = Utc::now();
        assert_eq!(ledger.try_acquire("resume", "sess_1", now), Permit::Allowed { attempt: 1 });
        assert_eq!(ledger.try_acquire("resume", "sess_2", now), Permit::Allowed { attempt: 1 });
        assert_eq!(ledger.try_acquire("kill", "sess_1", now), Permit::Allowed { attempt: 1 });
    }

    #[test]
    fn success_rearms_target() {
        let ledger = RetryLedger::new(1, 1800);
        let now = Utc::now();
        ledger.try_acquire("resume", "sess_1", now);
        assert_eq!(ledger.try_acquire("resume", "sess_1", now), Permit::Suppressed { first: true });
        ledger.record_success("resume", "sess_1");
        assert_eq!(ledger.try_acquire("resume", "sess_1", now), Permit::Allowed { attempt: 1 });
    }

    #[test]
    fn window_expiry_resets_counter() {
        let ledger = RetryLedger::new(1, 600);
        let now = Utc::now();
        ledger.try_acquire("resume", "sess_1", now);
        assert_eq!(ledger.try_acquire("resume", "sess_1", now), Permit::Suppressed { first: true });
        let later = now + Duration::seconds(601);
        assert_eq!(ledger.try_acquire("resume", "sess_1", later), Permit::Allowed { attempt: 1 });
        // And the suppression notification is re-armed with it
        assert_eq!(
            ledger.try_acquire("resume", "sess_1", later),
            Permit::Suppressed { first: true }
        );
    }
}
