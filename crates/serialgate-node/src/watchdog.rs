//! Sync watchdog -- single re-armable deadline for device liveness.
//!
//! Rearming replaces the pending deadline in place, so a stale expiry can
//! never fire after a newer one was installed.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep};

pub const DEFAULT_ATTEMPT_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_TIMEOUT_INTERVAL: Duration = Duration::from_millis(5000);

pub struct SyncWatchdog {
    sleep: Pin<Box<Sleep>>,
    attempt_interval: Duration,
    timeout_interval: Duration,
}

impl SyncWatchdog {
    /// New watchdog, armed with the short retry interval.
    pub fn new(attempt_interval: Duration, timeout_interval: Duration) -> Self {
        Self {
            sleep: Box::pin(tokio::time::sleep(attempt_interval)),
            attempt_interval,
            timeout_interval,
        }
    }

    /// Cancel the pending deadline and install one `interval` from now.
    pub fn arm(&mut self, interval: Duration) {
        self.sleep.as_mut().reset(Instant::now() + interval);
    }

    /// Device silent: probe again soon.
    pub fn arm_retry(&mut self) {
        self.arm(self.attempt_interval);
    }

    /// Device confirmed alive: push the deadline out.
    pub fn arm_steady(&mut self) {
        self.arm(self.timeout_interval);
    }

    /// Resolves when the current deadline passes. Cancel safe; must be
    /// rearmed after it fires or it resolves immediately again.
    pub async fn expired(&mut self) {
        self.sleep.as_mut().await
    }
}
