//! Per-IP rate limiting for public traffic
//!
//! Fixed window: each source IP gets `max_per_window` requests per window,
//! then 429 until the window rolls over.

use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Entries kept before a sweep of expired windows.
const SWEEP_THRESHOLD: usize = 10_000;

struct Window {
    started: Instant,
    count: u32,
}

pub struct RateLimiter {
    max_per_window: u32,
    window: Duration,
    hits: DashMap<IpAddr, Window>,
}

impl RateLimiter {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            hits: DashMap::new(),
        }
    }

    /// Record a request from `ip`. Returns false when the caller is over
    /// its budget for the current window.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();

        if self.hits.len() > SWEEP_THRESHOLD {
            let window = self.window;
            self.hits
                .retain(|_, slot| now.duration_since(slot.started) < window);
        }

        let mut slot = self.hits.entry(ip).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(slot.started) >= self.window {
            slot.started = now;
            slot.count = 0;
        }

        slot.count += 1;
        slot.count <= self.max_per_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, last])
    }

    #[test]
    fn test_allows_up_to_limit() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));

        assert!(limiter.check(ip(1)));
        assert!(limiter.check(ip(1)));
        assert!(limiter.check(ip(1)));
        assert!(!limiter.check(ip(1)));
    }

    #[test]
    fn test_ips_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));

        assert!(limiter.check(ip(1)));
        assert!(!limiter.check(ip(1)));
        assert!(limiter.check(ip(2)));
    }

    #[test]
    fn test_window_rolls_over() {
        let limiter = RateLimiter::new(1, Duration::from_millis(30));

        assert!(limiter.check(ip(1)));
        assert!(!limiter.check(ip(1)));

        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.check(ip(1)));
    }
}
