use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Token identifying one accepted request's cooldown grant. A refund only
/// takes effect if the grant is still the most recent one for the user, so a
/// slow failure can never erase a newer request's cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownStamp(Instant);

/// Short-horizon per-user throttle. Purely in-memory: a process restart
/// clears all cooldowns, which is acceptable because the gate only exists for
/// short-term abuse prevention.
pub struct CooldownGate {
    window: Duration,
    last_accepted: DashMap<String, Instant>,
}

impl CooldownGate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: DashMap::new(),
        }
    }

    /// Remaining wait for `user`, or `None` if they may proceed now.
    pub fn check(&self, user: &str) -> Option<Duration> {
        let last = self.last_accepted.get(user)?;
        let elapsed = last.elapsed();
        if elapsed < self.window {
            Some(self.window - elapsed)
        } else {
            None
        }
    }

    /// Stamp `user` as having an accepted request right now.
    pub fn record(&self, user: &str) -> CooldownStamp {
        let now = Instant::now();
        self.last_accepted.insert(user.to_string(), now);
        CooldownStamp(now)
    }

    /// Give the cooldown back, but only if `stamp` is still the recorded
    /// grant (compare-and-remove).
    pub fn refund(&self, user: &str, stamp: CooldownStamp) {
        self.last_accepted
            .remove_if(user, |_, recorded| *recorded == stamp.0);
    }
}
