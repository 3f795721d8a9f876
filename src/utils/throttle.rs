//! Rate limiting for repeated log lines
//!
//! The preview worker can fail on every frame (a stalled sensor, a display
//! sink that went away). [`LogThrottler`] lets one line per failure class
//! through per interval.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Per-key log rate limiter
///
/// ```rust
/// use capture_hal::utils::LogThrottler;
/// use std::time::Duration;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert!(throttler.should_log("acquire"));
/// assert!(!throttler.should_log("acquire"));
/// ```
pub struct LogThrottler {
    last_logged: RwLock<HashMap<String, Instant>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: RwLock::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns `true` when `key` has not been logged within the interval,
    /// and records the current time for it.
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();

        if let Some(last) = self.last_logged.read().get(key) {
            if now.duration_since(*last) < self.interval {
                return false;
            }
        }

        let mut map = self.last_logged.write();
        // Another thread may have logged between the two locks
        if let Some(last) = map.get(key) {
            if now.duration_since(*last) < self.interval {
                return false;
            }
        }
        map.insert(key.to_string(), now);
        true
    }

    /// Forget `key`, so its next failure is logged immediately.
    /// Call this when the condition recovers.
    pub fn clear(&self, key: &str) {
        self.last_logged.write().remove(key);
    }

    pub fn clear_all(&self) {
        self.last_logged.write().clear();
    }

    pub fn len(&self) -> usize {
        self.last_logged.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_logged.read().is_empty()
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// `tracing::warn!` gated by a [`LogThrottler`] key
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}

/// `tracing::error!` gated by a [`LogThrottler`] key
#[macro_export]
macro_rules! error_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::error!($($arg)*);
        }
    };
}

/// `tracing::info!` gated by a [`LogThrottler`] key
#[macro_export]
macro_rules! info_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::info!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_repeat_within_interval_is_suppressed() {
        let throttler = LogThrottler::new(Duration::from_millis(100));
        assert!(throttler.should_log("dequeue"));
        assert!(!throttler.should_log("dequeue"));

        thread::sleep(Duration::from_millis(150));
        assert!(throttler.should_log("dequeue"));
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("display"));
        assert!(throttler.should_log("record"));
        assert!(!throttler.should_log("display"));
        assert_eq!(throttler.len(), 2);
    }

    #[test]
    fn test_clear_after_recovery() {
        let throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("display"));
        throttler.clear("display");
        assert!(throttler.should_log("display"));

        throttler.clear_all();
        assert!(throttler.is_empty());
    }

    #[test]
    fn test_macros_consult_throttler() {
        let throttler = LogThrottler::default();
        warn_throttled!(throttler, "k", "first {}", 1);
        // Key is now recorded, so the second line is suppressed
        assert!(!throttler.should_log("k"));
        error_throttled!(throttler, "e", "error {}", 2);
        info_throttled!(throttler, "i", "info");
        assert_eq!(throttler.len(), 3);
    }
}
