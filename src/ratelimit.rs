use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{PulseError, Result};

/// Fixed-window limiter: at most `limit` hits per key per `window`.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: Mutex<HashMap<String, (Instant, u32)>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, key: &str) -> Result<()> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Result<()> {
        // A zero limit disables limiting.
        if self.limit == 0 {
            return Ok(());
        }

        let mut windows = self.windows.lock();
        if windows.len() > 10_000 {
            let window = self.window;
            windows.retain(|_, (start, _)| now.duration_since(*start) < window);
        }

        let slot = windows.entry(key.to_string()).or_insert((now, 0));
        if now.duration_since(slot.0) >= self.window {
            *slot = (now, 0);
        }

        if slot.1 >= self.limit {
            let retry_in = self.window.saturating_sub(now.duration_since(slot.0));
            return Err(PulseError::RateLimited(retry_in.as_secs().max(1)));
        }
        slot.1 += 1;
        Ok(())
    }
}
