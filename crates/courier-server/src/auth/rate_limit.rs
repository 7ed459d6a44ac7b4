//! Sliding-window rate limiter for WebSocket upgrade attempts.
//!
//! Each remote address keeps the timestamps of its recent attempts; an
//! attempt is refused once the window already holds `max_attempts`.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RateLimiter {
    max_attempts: u32,
    window: Duration,
    entries: HashMap<IpAddr, VecDeque<Instant>>,
}

impl RateLimiter {
    /// `max_attempts` per `window`. Zero attempts disables limiting.
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            entries: HashMap::new(),
        }
    }

    /// Upgrade attempts allowed per minute per address.
    pub fn per_minute(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::from_secs(60))
    }

    /// Record an attempt from `ip` if allowed. Returns `false` when limited.
    pub fn check_and_record(&mut self, ip: IpAddr) -> bool {
        self.check_and_record_at(ip, Instant::now())
    }

    fn check_and_record_at(&mut self, ip: IpAddr, now: Instant) -> bool {
        if self.max_attempts == 0 {
            return true;
        }
        let window = self.window;
        let attempts = self.entries.entry(ip).or_default();
        while attempts
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            attempts.pop_front();
        }

        if attempts.len() as u32 >= self.max_attempts {
            return false;
        }
        attempts.push_back(now);
        true
    }

    /// Drop addresses with no attempts left inside the window.
    pub fn gc(&mut self) -> usize {
        let now = Instant::now();
        let window = self.window;
        let before = self.entries.len();
        self.entries.retain(|_, attempts| {
            attempts.retain(|t| now.saturating_duration_since(*t) < window);
            !attempts.is_empty()
        });
        before - self.entries.len()
    }

    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}
