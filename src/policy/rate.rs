//! Rolling-window emission limit.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

/// Length of the rolling window.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Allows at most `limit` acquisitions in any rolling 60-second window.
///
/// Keeps one timestamp per acquisition still inside the window, so memory is
/// bounded by `limit`. A limit of zero disables the check.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    limit: u32,
    log: VecDeque<SystemTime>,
}

impl RateLimiter {
    /// Creates a limiter allowing `limit` events per minute.
    #[must_use]
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            log: VecDeque::new(),
        }
    }

    /// Returns true (and records the acquisition) if another event fits.
    pub fn try_acquire(&mut self, now: SystemTime) -> bool {
        if self.limit == 0 {
            return true;
        }

        while let Some(&oldest) = self.log.front() {
            // A clock that stepped backwards keeps entries alive
            let age = now.duration_since(oldest).unwrap_or(Duration::ZERO);
            if age < RATE_WINDOW {
                break;
            }
            self.log.pop_front();
        }

        if self.log.len() >= self.limit as usize {
            return false;
        }
        self.log.push_back(now);
        true
    }

    /// Acquisitions currently inside the window, as of the last call.
    #[must_use]
    pub fn in_window(&self) -> usize {
        self.log.len()
    }
}
