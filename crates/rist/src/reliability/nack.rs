// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! NACK scheduling with RTT-aware backoff.
//!
//! Tracks every gap the reassembly window reports and decides, each engine
//! turn, which sequences are worth requesting again. A gap becomes
//! eligible once the reorder grace period passes; retries back off
//! exponentially (`rtt x 1.5^n`) up to a quarter of the recovery horizon,
//! and a gap is abandoned after `max_retries` requests or as soon as the
//! window fills or expires it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::seq;

/// Bound on tracked gaps; beyond this the oldest are abandoned.
const MAX_TRACKED_GAPS: usize = 8192;

#[derive(Debug, Clone, Copy)]
struct GapRecord {
    first_missed: Instant,
    nacks_sent: u32,
    /// Valid once `nacks_sent > 0`.
    next_retry: Instant,
}

pub struct NackScheduler {
    gaps: HashMap<u32, GapRecord>,
    /// Grace period before the first NACK for a gap.
    reorder: Duration,
    /// Retry backoff cap: `recovery_length_max / 4`.
    backoff_cap: Duration,
    max_retries: u32,
    /// Requests sent (for stats).
    nacks_sent_total: u64,
}

impl NackScheduler {
    pub fn new(reorder: Duration, recovery_length_max: Duration, max_retries: u32) -> Self {
        Self {
            gaps: HashMap::new(),
            reorder,
            backoff_cap: recovery_length_max / 4,
            max_retries,
            nacks_sent_total: 0,
        }
    }

    /// Register a sequence the window just reported missing.
    pub fn on_gap(&mut self, seq_no: u32, now: Instant) {
        if self.gaps.len() >= MAX_TRACKED_GAPS {
            // Abandon the oldest gap to stay bounded.
            if let Some((&oldest, _)) = self
                .gaps
                .iter()
                .min_by_key(|(_, rec)| rec.first_missed)
            {
                self.gaps.remove(&oldest);
                log::debug!("[nack] gap table full, abandoned seq {}", oldest);
            }
        }
        self.gaps.entry(seq_no).or_insert(GapRecord {
            first_missed: now,
            nacks_sent: 0,
            next_retry: now,
        });
    }

    /// The gap was filled (repair or reorder arrived): stop requesting it.
    pub fn on_fill(&mut self, seq_no: u32) {
        self.gaps.remove(&seq_no);
    }

    /// The window gave up on the gap: stop requesting it.
    pub fn on_expire(&mut self, seq_no: u32) {
        self.gaps.remove(&seq_no);
    }

    pub fn pending(&self) -> usize {
        self.gaps.len()
    }

    pub fn nacks_sent_total(&self) -> u64 {
        self.nacks_sent_total
    }

    /// Collect the sequences to request this turn, in wraparound order
    /// starting from `expected`. Updates per-gap retry state; gaps that hit
    /// `max_retries` with this emission are dropped.
    pub fn poll(&mut self, now: Instant, rtt_ms: u32, expected: u32) -> Vec<u32> {
        let first_wait = self.first_wait(rtt_ms);
        let mut due: Vec<u32> = self
            .gaps
            .iter()
            .filter(|(_, rec)| {
                if rec.nacks_sent == 0 {
                    now.duration_since(rec.first_missed) >= first_wait
                } else {
                    now >= rec.next_retry
                }
            })
            .map(|(&s, _)| s)
            .collect();
        if due.is_empty() {
            return due;
        }
        due.sort_by_key(|&s| seq::delta(s, expected));

        let max_retries = self.max_retries;
        for &s in &due {
            let sent_after = {
                let Some(rec) = self.gaps.get_mut(&s) else {
                    continue;
                };
                rec.nacks_sent += 1;
                rec.nacks_sent
            };
            self.nacks_sent_total += 1;
            if sent_after >= max_retries {
                self.gaps.remove(&s);
            } else {
                let backoff = self.backoff(rtt_ms, sent_after);
                if let Some(rec) = self.gaps.get_mut(&s) {
                    rec.next_retry = now + backoff;
                }
            }
        }
        due
    }

    /// `max(rtt x 1.1, reorder_buffer)` before the first request.
    fn first_wait(&self, rtt_ms: u32) -> Duration {
        let rtt = Duration::from_millis(u64::from(rtt_ms) * 11 / 10);
        rtt.max(self.reorder)
    }

    /// `rtt x 1.5^sent`, capped.
    fn backoff(&self, rtt_ms: u32, sent: u32) -> Duration {
        let mut ms = u64::from(rtt_ms).max(1);
        for _ in 0..sent {
            ms = ms.saturating_mul(3) / 2;
            if ms >= self.backoff_cap.as_millis() as u64 {
                return self.backoff_cap;
            }
        }
        Duration::from_millis(ms).min(self.backoff_cap)
    }
}
