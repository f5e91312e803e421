//! # Request Throttle
//!
//! One shared minimum gap between consecutive CRM calls, no matter how many
//! tasks are calling. The lock is held while waiting, so callers queue up in
//! arrival order.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

#[derive(Debug)]
pub struct Throttle {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits until the next call is allowed and claims the slot.
    pub async fn acquire(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let ready = prev + self.min_interval;
            if Instant::now() < ready {
                sleep_until(ready).await;
            }
        }
        *last = Some(Instant::now());
    }
}
