//! Per-identity registration cooldown.
//!
//! Detection ticks arrive faster than a ledger write completes, so the guard
//! records the acceptance timestamp as soon as the check passes. If the write
//! later fails, the caller hands the prior timestamp back through
//! [`CooldownGuard::release`].

use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Outcome of [`CooldownGuard::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// Registration may proceed. `prior` is the timestamp to restore on failure.
    Accepted { prior: Option<u64> },
    /// Last accepted registration is too recent.
    Rejected { remaining: Duration },
}

impl Acquire {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Acquire::Accepted { .. })
    }
}

/// Single source of truth for last-accepted registration times.
#[derive(Debug, Clone)]
pub struct CooldownGuard {
    window: Duration,
    last_accepted: HashMap<Uuid, u64>,
}

impl CooldownGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Check the window and, if open, claim it at `now_ms` in the same step.
    pub fn try_acquire(&mut self, identity: Uuid, now_ms: u64) -> Acquire {
        let prior = self.last_accepted.get(&identity).copied();
        if let Some(remaining) = prior.and_then(|last| self.remaining_since(last, now_ms)) {
            return Acquire::Rejected { remaining };
        }
        self.last_accepted.insert(identity, now_ms);
        Acquire::Accepted { prior }
    }

    /// Roll back an acceptance whose registration did not happen.
    pub fn release(&mut self, identity: Uuid, prior: Option<u64>) {
        match prior {
            Some(ts) => {
                self.last_accepted.insert(identity, ts);
            }
            None => {
                self.last_accepted.remove(&identity);
            }
        }
    }

    /// Time left before `identity` may register again, if any.
    pub fn remaining(&self, identity: Uuid, now_ms: u64) -> Option<Duration> {
        self.last_accepted
            .get(&identity)
            .and_then(|&last| self.remaining_since(last, now_ms))
    }

    /// Read-only copy of the last-accepted timestamps, for presentation.
    pub fn snapshot(&self) -> Vec<(Uuid, u64)> {
        let mut entries: Vec<_> = self.last_accepted.iter().map(|(k, v)| (*k, *v)).collect();
        entries.sort_by_key(|(_, ts)| std::cmp::Reverse(*ts));
        entries
    }

    fn remaining_since(&self, last: u64, now_ms: u64) -> Option<Duration> {
        // A clock that stepped backwards counts as zero elapsed.
        let elapsed = Duration::from_millis(now_ms.saturating_sub(last));
        (elapsed < self.window).then(|| self.window - elapsed)
    }
}

/// Whole seconds to show in a "wait N seconds" prompt.
pub fn wait_seconds(remaining: Duration) -> u64 {
    remaining.as_millis().div_ceil(1000) as u64
}
