//! Named fixed-window rate limiters.
//!
//! Multiple independent limiters gate execution starts and message sends.
//! The batch check verifies every window before consuming any of them, so a
//! rejection leaves all counters untouched and no partial side effects occur.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// One named limiter check: key, allowance, and window length
#[derive(Debug, Clone)]
pub struct LimitCheck {
    pub key: String,
    pub max: u32,
    pub window: Duration,
}

impl LimitCheck {
    pub fn new(key: impl Into<String>, max: u32, window: Duration) -> Self {
        Self {
            key: key.into(),
            max,
            window,
        }
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

/// In-memory fixed-window rate limiter keyed by limiter name
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and consume a single limiter
    pub async fn check(&self, check: &LimitCheck) -> bool {
        self.check_batch(std::slice::from_ref(check)).await.is_ok()
    }

    /// Atomically check several limiters; short-circuits on the first
    /// rejection and consumes nothing unless all pass. Returns the failing
    /// limiter key on rejection.
    pub async fn check_batch(&self, checks: &[LimitCheck]) -> Result<(), String> {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        // Verify pass: reset expired windows, reject before consuming
        for check in checks {
            let window = windows.entry(check.key.clone()).or_insert(Window {
                started: now,
                count: 0,
            });
            if now.duration_since(window.started) >= check.window {
                window.started = now;
                window.count = 0;
            }
            if window.count >= check.max {
                return Err(check.key.clone());
            }
        }

        // Consume pass
        for check in checks {
            if let Some(window) = windows.get_mut(&check.key) {
                window.count += 1;
            }
        }

        Ok(())
    }
}
