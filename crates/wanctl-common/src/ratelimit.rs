//! Sliding-window rate limiter for router writes.
//!
//! Flash wear protection: the controller may push at most
//! `max_events` queue updates per window. `allow()` both answers and
//! records, so a granted permit is consumed atomically.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub struct RateLimiter {
    max_events: usize,
    window: Duration,
    events: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(max_events: usize, window: Duration) -> Self {
        RateLimiter {
            max_events,
            window,
            events: VecDeque::with_capacity(max_events),
        }
    }

    /// True if the event is permitted; the permit is recorded on true.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Permits currently unused in the window.
    pub fn remaining(&mut self) -> usize {
        self.expire(Instant::now());
        self.max_events.saturating_sub(self.events.len())
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        self.expire(now);
        if self.events.len() < self.max_events {
            self.events.push_back(now);
            true
        } else {
            false
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&front) = self.events.front() {
            if now.duration_since(front) >= self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-key warning suppressor: one log line per key per window.
///
/// A router outage fails every 50 ms cycle; without this the journal
/// fills with thousands of identical lines before an operator sees it.
pub struct BurstSuppressor {
    window: Duration,
    last: std::collections::HashMap<String, Instant>,
}

impl BurstSuppressor {
    pub fn new(window: Duration) -> Self {
        BurstSuppressor {
            window,
            last: std::collections::HashMap::new(),
        }
    }

    /// True when the caller should emit the log line for `key`.
    pub fn allow(&mut self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&mut self, key: &str, now: Instant) -> bool {
        match self.last.get(key) {
            Some(&prev) if now.duration_since(prev) < self.window => false,
            _ => {
                self.last.insert(key.to_string(), now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_then_denies() {
        let mut rl = RateLimiter::new(10, Duration::from_secs(60));
        let now = Instant::now();
        for _ in 0..10 {
            assert!(rl.allow_at(now));
        }
        // The 11th event inside the window is denied.
        assert!(!rl.allow_at(now));
        assert_eq!(rl.max_events.saturating_sub(rl.events.len()), 0);
    }

    #[test]
    fn window_expiry_frees_permits() {
        let mut rl = RateLimiter::new(2, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(rl.allow_at(t0));
        assert!(rl.allow_at(t0));
        assert!(!rl.allow_at(t0 + Duration::from_secs(30)));
        // 60 s after the first two events, both have expired.
        assert!(rl.allow_at(t0 + Duration::from_secs(60)));
    }

    #[test]
    fn exactly_at_window_boundary_expires() {
        let mut rl = RateLimiter::new(1, Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(rl.allow_at(t0));
        assert!(!rl.allow_at(t0 + Duration::from_secs(9)));
        assert!(rl.allow_at(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn denied_event_is_not_recorded() {
        let mut rl = RateLimiter::new(1, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(rl.allow_at(t0));
        assert!(!rl.allow_at(t0 + Duration::from_secs(1)));
        // The denial did not extend the window: the original permit
        // still expires on schedule.
        assert!(rl.allow_at(t0 + Duration::from_secs(60)));
    }

    #[test]
    fn suppressor_dedups_within_window() {
        let mut s = BurstSuppressor::new(Duration::from_secs(30));
        let t0 = Instant::now();
        assert!(s.allow_at("push-failed", t0));
        assert!(!s.allow_at("push-failed", t0 + Duration::from_secs(5)));
        // A different key is independent.
        assert!(s.allow_at("save-failed", t0 + Duration::from_secs(5)));
        // The window elapses and the key may log again.
        assert!(s.allow_at("push-failed", t0 + Duration::from_secs(30)));
    }
}
