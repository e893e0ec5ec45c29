//! Per-user fixed-window rate limiting.
//!
//! Unlike a token bucket, a fixed window resets wholesale at `resetAt`
//! rather than refilling continuously; simpler to reason about for the one
//! route (`evaluate-extended`) that needs it, and in-process only — no
//! shared state across replicas.

use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tabd_types::UserId;
use tracing::debug;

struct WindowEntry {
    count: u32,
    reset_at_millis: i64,
}

/// Outcome of a [`RateLimiter::check`] call.
pub struct CheckOutcome {
    pub allowed: bool,
    pub retry_after: Option<Duration>,
}

pub struct RateLimiter {
    windows: DashMap<UserId, WindowEntry>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// `check(userId, max, windowMs)`: first request or expired window starts
    /// a fresh bucket; otherwise increments if under `max`, else denies with
    /// the remaining time on the current window.
    pub fn check(&self, user_id: &UserId, max: u32, window: Duration) -> CheckOutcome {
        let now = Utc::now().timestamp_millis();
        let mut entry = self.windows.entry(user_id.clone()).or_insert_with(|| WindowEntry {
            count: 0,
            reset_at_millis: 0,
        });

        if entry.reset_at_millis <= now {
            entry.count = 1;
            entry.reset_at_millis = now + window.as_millis() as i64;
            return CheckOutcome {
                allowed: true,
                retry_after: None,
            };
        }

        if entry.count < max {
            entry.count += 1;
            return CheckOutcome {
                allowed: true,
                retry_after: None,
            };
        }

        let retry_after_millis = (entry.reset_at_millis - now).max(0) as u64;
        CheckOutcome {
            allowed: false,
            retry_after: Some(Duration::from_millis(retry_after_millis)),
        }
    }

    /// Drop windows that have already expired. Run every 60s by the caller.
    pub fn sweep(&self) {
        let now = Utc::now().timestamp_millis();
        let before = self.windows.len();
        self.windows.retain(|_, entry| entry.reset_at_millis > now);
        let after = self.windows.len();
        if before != after {
            debug!(removed = before - after, remaining = after, "rate limiter sweep");
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    #[test]
    fn allows_up_to_max_then_denies() {
        let limiter = RateLimiter::new();
        let user = uid("u1");
        for _ in 0..3 {
            let outcome = limiter.check(&user, 3, Duration::from_secs(60));
            assert!(outcome.allowed);
        }
        let denied = limiter.check(&user, 3, Duration::from_secs(60));
        assert!(!denied.allowed);
        assert!(denied.retry_after.unwrap() > Duration::ZERO);
    }

    #[test]
    fn sweep_drops_expired_windows() {
        let limiter = RateLimiter::new();
        let user = uid("u1");
        limiter.windows.insert(
            user.clone(),
            WindowEntry {
                count: 1,
                reset_at_millis: 1,
            },
        );
        limiter.sweep();
        assert!(limiter.windows.get(&user).is_none());
    }
}
