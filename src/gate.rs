//! Rate-limited call gate.
//!
//! Every completion call passes through a [`CallGate`]: at most
//! `max_concurrent` calls hold a permit at once, and consecutive calls
//! start at least `min_interval` apart. With the defaults (one permit,
//! no interval) calls are simply sequential.

use std::time::Duration;
use tokio::sync::{AcquireError, Mutex, Semaphore, SemaphorePermit};
use tokio::time::Instant;

use crate::config::RateLimitConfig;

pub struct CallGate {
    permits: Semaphore,
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

/// Held for the duration of one call.
pub struct GatePermit<'a> {
    _permit: SemaphorePermit<'a>,
}

impl CallGate {
    pub fn new(max_concurrent: usize, min_interval: Duration) -> Self {
        Self {
            permits: Semaphore::new(max_concurrent.max(1)),
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.max_concurrent,
            Duration::from_millis(config.min_interval_ms),
        )
    }

    /// Wait for a free slot and for the minimum interval to elapse.
    ///
    /// Fails only after [`CallGate::close`].
    pub async fn acquire(&self) -> Result<GatePermit<'_>, AcquireError> {
        let permit = self.permits.acquire().await?;

        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());

        Ok(GatePermit { _permit: permit })
    }

    /// Refuse all further calls; pending and future `acquire`s fail.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
