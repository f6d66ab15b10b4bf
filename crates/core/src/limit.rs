//! Sliding-window admission limiter.
//!
//! Both planes admit work on behalf of unauthenticated-ish network peers
//! (the controller keys on the caller address the ingress forwards), so the
//! limiter lives here rather than in either binary.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admitted,
    /// Over budget. The window frees a slot after `retry_after`.
    Limited { retry_after: Duration },
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted)
    }
}

/// Per-key sliding-window rate limiter.
///
/// Each key keeps the timestamps of its admissions inside the rolling
/// window, oldest first; stamps age out as they cross the window edge.
/// The table itself is bounded: when a new key would push it past
/// `max_tracked`, keys whose admissions have all aged out are swept, and
/// if the table is still full the new key is refused for a full window
/// instead of growing the map. A flood of unique keys therefore costs
/// bounded memory and cannot starve callers already being tracked.
pub struct RateLimiter {
    budget: usize,
    window: Duration,
    max_tracked: usize,
    entries: Mutex<HashMap<String, VecDeque<Instant>>>,
}

const DEFAULT_MAX_TRACKED: usize = 8192;

impl RateLimiter {
    /// Allow at most `budget` admissions per key per `window`.
    pub fn new(budget: usize, window: Duration) -> Self {
        Self {
            budget,
            window,
            max_tracked: DEFAULT_MAX_TRACKED,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cap the number of distinct keys kept in memory.
    pub fn with_max_tracked(mut self, max_tracked: usize) -> Self {
        self.max_tracked = max_tracked;
        self
    }

    /// Record an admission attempt for `key` and decide it.
    pub fn admit(&self, key: &str) -> Decision {
        let now = Instant::now();
        let window = self.window;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if entries.len() >= self.max_tracked && !entries.contains_key(key) {
            // Sweep keys whose newest admission has aged out
            entries.retain(|_, stamps| {
                stamps
                    .back()
                    .is_some_and(|t| now.duration_since(*t) < window)
            });
            if entries.len() >= self.max_tracked {
                return Decision::Limited {
                    retry_after: window,
                };
            }
        }

        let stamps = entries.entry(key.to_string()).or_default();
        while stamps
            .front()
            .is_some_and(|t| now.duration_since(*t) >= window)
        {
            stamps.pop_front();
        }

        if stamps.len() >= self.budget {
            let oldest = stamps.front().copied().unwrap_or(now);
            return Decision::Limited {
                retry_after: window.saturating_sub(now.duration_since(oldest)),
            };
        }

        stamps.push_back(now);
        Decision::Admitted
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
