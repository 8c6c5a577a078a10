//! Log throttling
//!
//! The health loop probes every camera every few seconds; a camera that
//! stays unplugged for an afternoon would otherwise repeat the same line
//! thousands of times. The throttler rate-limits per key and is cleared on
//! recovery so the next incident logs immediately.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Per-key rate limiter for repeated log lines
pub struct LogThrottler {
    last_logged: Mutex<HashMap<String, Instant>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: Mutex::new(HashMap::new()),
            interval,
        }
    }

    /// Whether a line for `key` may be logged now. Records the timestamp
    /// when it answers yes.
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut map = self.last_logged.lock();
        match map.get(key) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                map.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Forget a key. Called when the condition recovers, so the next
    /// occurrence logs without delay.
    pub fn clear(&self, key: &str) {
        self.last_logged.lock().remove(key);
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_call_passes_then_throttles() {
        let throttler = LogThrottler::new(Duration::from_secs(60));
        assert!(throttler.should_log("cam1"));
        assert!(!throttler.should_log("cam1"));
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::new(Duration::from_secs(60));
        assert!(throttler.should_log("cam1"));
        assert!(throttler.should_log("cam2"));
        assert!(!throttler.should_log("cam1"));
    }

    #[test]
    fn test_expiry() {
        let throttler = LogThrottler::new(Duration::from_millis(20));
        assert!(throttler.should_log("cam1"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(throttler.should_log("cam1"));
    }

    #[test]
    fn test_clear_rearms() {
        let throttler = LogThrottler::new(Duration::from_secs(60));
        assert!(throttler.should_log("cam1"));
        throttler.clear("cam1");
        assert!(throttler.should_log("cam1"));
    }
}
