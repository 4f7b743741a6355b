// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Token bucket capping the retransmission bitrate.
//!
//! The sender refuses to let repairs exceed `recovery_maxbitrate_return`:
//! each retransmitted packet consumes its wire size in tokens, refilled at
//! the configured rate. NACKs arriving with an empty bucket are dropped
//! silently; the requester will ask again.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct TokenBucket {
    /// Current tokens, in bytes.
    tokens: u64,
    /// Burst capacity, in bytes.
    capacity: u64,
    /// Refill rate, bytes per second.
    rate: u64,
    last_refill: Instant,
}

impl TokenBucket {
    /// `rate_bps` is in bits per second (the config unit); the burst
    /// capacity defaults to 100 ms worth of tokens.
    pub fn new(rate_bps: u32, now: Instant) -> Self {
        let rate = u64::from(rate_bps) / 8;
        Self {
            tokens: rate / 10,
            capacity: (rate / 10).max(2048),
            rate,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let add = (u128::from(self.rate) * elapsed.as_micros() / 1_000_000) as u64;
        if add > 0 {
            self.tokens = (self.tokens + add).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Consume `bytes` if available; `false` means the caller must drop.
    pub fn try_consume(&mut self, bytes: u64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= bytes {
            self.tokens -= bytes;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    /// Time until `bytes` tokens accumulate, zero if already available.
    pub fn time_until(&mut self, bytes: u64, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= bytes {
            return Duration::ZERO;
        }
        if self.rate == 0 {
            return Duration::MAX;
        }
        let missing = bytes - self.tokens;
        Duration::from_micros(missing * 1_000_000 / self.rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_burst_available() {
        let now = Instant::now();
        // 8 Mbps -> 1 MB/s -> 100 KB burst.
        let mut tb = TokenBucket::new(8_000_000, now);
        assert!(tb.try_consume(50_000, now));
        assert!(tb.try_consume(50_000, now));
        assert!(!tb.try_consume(1, now));
    }

    #[test]
    fn test_refills_over_time() {
        let now = Instant::now();
        let mut tb = TokenBucket::new(8_000_000, now); // 1 MB/s
        assert!(tb.try_consume(100_000, now));
        assert!(!tb.try_consume(10_000, now));

        // 20 ms later: 20 KB refilled.
        let later = now + Duration::from_millis(20);
        assert!(tb.try_consume(10_000, later));
    }

    #[test]
    fn test_capacity_caps_refill() {
        let now = Instant::now();
        let mut tb = TokenBucket::new(8_000_000, now);
        let much_later = now + Duration::from_secs(60);
        assert!(tb.try_consume(100_000, much_later));
        assert!(!tb.try_consume(100_000, much_later), "burst is capped");
    }

    #[test]
    fn test_time_until_tokens() {
        let now = Instant::now();
        let mut tb = TokenBucket::new(8_000_000, now);
        assert_eq!(tb.time_until(1_000, now), Duration::ZERO);
        assert!(tb.try_consume(100_000, now));
        let wait = tb.time_until(10_000, now);
        assert_eq!(wait, Duration::from_millis(10));
    }

    #[test]
    fn test_zero_rate_never_allows() {
        let now = Instant::now();
        let mut tb = TokenBucket::new(0, now);
        assert!(!tb.try_consume(2_049, now));
        assert_eq!(tb.time_until(1_000_000, now), Duration::MAX);
    }
}
