//! Send pacing against a bandwidth ceiling.
//!
//! A token bucket refilled at the configured rate. The bucket holds a short
//! burst worth of bytes (never less than one packet), so a connection that
//! was idle may send a few packets back to back and is then held to the
//! rate.

use std::time::{Duration, Instant};

/// Pacing constants.
pub mod constants {
    use std::time::Duration;

    /// Burst allowance, as time at the configured rate.
    pub const BURST_WINDOW: Duration = Duration::from_millis(20);
}

/// Token bucket limiting the payload bytes sent per second.
#[derive(Debug, Clone)]
pub(crate) struct Pacer {
    /// Bytes per second.
    rate: u64,
    tokens: f64,
    capacity: f64,
    last_refill: Instant,
}

impl Pacer {
    /// Pacer for `rate` bytes per second; `packet_size` bounds the burst
    /// from below.
    pub(crate) fn new(rate: u64, packet_size: usize, now: Instant) -> Self {
        let burst = rate as f64 * constants::BURST_WINDOW.as_secs_f64();
        let capacity = burst.max(packet_size as f64);
        Self {
            rate,
            tokens: capacity,
            capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.capacity);
        self.last_refill = now;
    }

    /// Take `bytes` from the bucket if they are available.
    pub(crate) fn try_consume(&mut self, bytes: usize, now: Instant) -> bool {
        self.refill(now);
        let bytes = bytes as f64;
        if self.tokens < bytes {
            return false;
        }
        self.tokens -= bytes;
        true
    }

    /// Spacing between packets of `bytes` at the configured rate.
    pub(crate) fn packet_period(&self, bytes: usize) -> Duration {
        Duration::from_secs_f64(bytes as f64 / self.rate as f64)
    }
}
