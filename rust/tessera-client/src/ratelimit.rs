//! Send-rate pacing.
//!
//! When a transactions-per-second limit is configured, each send worker
//! waits out its pace slot before serializing. Slots are handed out from a
//! shared clock so the limit holds across connections.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

pub(crate) struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    pub(crate) fn new(txn_per_sec: u32) -> Self {
        Self {
            interval: Duration::from_secs(1) / txn_per_sec.max(1),
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Claim the next send slot and wait until it arrives.
    pub(crate) async fn pace(&self) {
        let slot = {
            let mut next = self.next_slot.lock().unwrap();
            let now = Instant::now();
            let slot = if *next < now { now } else { *next };
            *next = slot + self.interval;
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pacing_spaces_sends() {
        let limiter = RateLimiter::new(1000); // 1ms apart
        let start = Instant::now();
        for _ in 0..5 {
            limiter.pace().await;
        }
        // First slot is immediate, four more at 1ms spacing.
        assert!(start.elapsed() >= Duration::from_millis(4));
    }
}
