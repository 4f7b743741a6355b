// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-flow reassembly window.
//!
//! A sparse ring of slots indexed by `seq & (window_size - 1)`. Packets are
//! held until they can be released in sequence order; gaps wait for repair
//! up to the recovery horizon, then are declared lost. The window also
//! implements the fast-forward recovery for overruns and the flush
//! primitives used by the buffer-bloat policy.
//!
//! Invariants:
//! - `head_seq <= expected_seq <= tail_seq + 1` (wraparound order)
//! - `tail_seq - expected_seq < window_size`
//! - a sequence is released at most once; anything else is counted lost

use std::time::{Duration, Instant};

use crate::config::{AVG_PACKET_SIZE, WINDOW_SIZE_MIN};
use crate::protocol::seq;

/// Slot lifecycle. `Released`/`Expired` keep only the sequence so that
/// re-arrivals can be classified until the ring position is reused.
#[derive(Debug)]
enum Slot {
    Empty,
    /// Known gap awaiting repair.
    Missing { seq: u32, deadline: Instant },
    Held(Box<HeldPacket>),
    Released { seq: u32 },
    Expired { seq: u32 },
}

/// A packet parked in the window.
#[derive(Debug, Clone)]
pub struct HeldPacket {
    pub seq: u32,
    pub arrival: Instant,
    /// `arrival + recovery_length_min`; once it passes, any gap still
    /// blocking this packet is abandoned.
    pub deadline: Instant,
    pub ts_ntp: u64,
    pub virt_src_port: u16,
    pub virt_dst_port: u16,
    pub payload: Vec<u8>,
    pub retransmission: bool,
}

/// How an insert was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored at or past the expected sequence.
    Stored,
    /// Filled a tracked gap.
    GapFilled,
    /// Sequence already held, released, or expired.
    Duplicate,
    /// Before the window head and not recoverable.
    Late,
}

/// Insert classification plus the gap bookkeeping the NACK scheduler needs.
#[derive(Debug)]
pub struct InsertResult {
    pub outcome: InsertOutcome,
    /// Sequences that became missing because this packet jumped ahead.
    pub new_gaps: Vec<u32>,
    /// Sequences force-expired by a window overrun (cancel their NACKs).
    pub expired: Vec<u32>,
}

/// Loss/recovery counters kept per window.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowCounters {
    pub received: u64,
    pub recovered: u64,
    pub lost: u64,
    pub duplicates: u64,
    pub late: u64,
}

enum ReleaseStep {
    Release,
    ExpireGap,
    SkipExpired,
    Wait,
}

pub struct ReassemblyWindow {
    slots: Vec<Slot>,
    mask: usize,
    head_seq: u32,
    expected_seq: u32,
    tail_seq: u32,
    primed: bool,
    /// Current recovery horizon for gaps (shrinks under buffer bloat).
    hold: Duration,
    hold_floor: Duration,
    /// Deadline basis for arrived packets.
    min_hold: Duration,
    counters: WindowCounters,
}

impl ReassemblyWindow {
    pub fn new(window_size: usize, hold: Duration, min_hold: Duration) -> Self {
        let size = window_size.next_power_of_two().max(WINDOW_SIZE_MIN);
        Self {
            slots: (0..size).map(|_| Slot::Empty).collect(),
            mask: size - 1,
            head_seq: 0,
            expected_seq: 0,
            tail_seq: 0,
            primed: false,
            hold,
            hold_floor: min_hold,
            min_hold,
            counters: WindowCounters::default(),
        }
    }

    /// Slot count for a nominal bitrate over the maximum recovery length.
    pub fn size_for(bitrate_bps: u32, length_max_ms: u32) -> usize {
        let bytes = u64::from(bitrate_bps) / 8 * u64::from(length_max_ms) / 1000;
        ((bytes / AVG_PACKET_SIZE as u64) as usize)
            .next_power_of_two()
            .max(WINDOW_SIZE_MIN)
    }

    pub fn window_size(&self) -> usize {
        self.mask + 1
    }

    pub fn expected_seq(&self) -> u32 {
        self.expected_seq
    }

    pub fn head_seq(&self) -> u32 {
        self.head_seq
    }

    pub fn tail_seq(&self) -> u32 {
        self.tail_seq
    }

    pub fn counters(&self) -> WindowCounters {
        self.counters
    }

    /// `tail_seq - expected_seq`: slots between the release point and the
    /// newest arrival. The buffer-bloat policy watches this.
    pub fn occupancy(&self) -> u32 {
        if !self.primed {
            return 0;
        }
        seq::delta(self.tail_seq, self.expected_seq).max(0) as u32
    }

    pub fn hold(&self) -> Duration {
        self.hold
    }

    /// Shrink the recovery horizon by 10%, bounded below by
    /// `recovery_length_min`. Used by the NORMAL buffer-bloat reaction.
    pub fn shrink_hold(&mut self) {
        self.hold = self.hold.mul_f64(0.9).max(self.hold_floor);
    }

    #[inline]
    fn idx(&self, s: u32) -> usize {
        s as usize & self.mask
    }

    /// Insert an arrived packet.
    pub fn insert(
        &mut self,
        seq_no: u32,
        ts_ntp: u64,
        virt_src_port: u16,
        virt_dst_port: u16,
        payload: Vec<u8>,
        retransmission: bool,
        now: Instant,
    ) -> InsertResult {
        if !self.primed {
            self.primed = true;
            self.head_seq = seq_no;
            self.expected_seq = seq_no;
            self.tail_seq = seq_no;
        }

        let d = seq::delta(seq_no, self.expected_seq);
        if d < 0 {
            let outcome = self.classify_late(seq_no);
            return InsertResult {
                outcome,
                new_gaps: Vec::new(),
                expired: Vec::new(),
            };
        }

        let mut expired = Vec::new();
        if d as usize >= self.window_size() {
            let advance = (d as u32) - (self.window_size() as u32) + 1;
            expired = self.fast_forward(advance);
        }

        let mut new_gaps = Vec::new();
        if seq::gt(seq_no, self.tail_seq) {
            // Everything between the old tail and this arrival is missing.
            let deadline = now + self.hold;
            let mut gap = seq::add(self.tail_seq, 1);
            while seq::lt(gap, seq_no) {
                let idx = self.idx(gap);
                self.slots[idx] = Slot::Missing { seq: gap, deadline };
                new_gaps.push(gap);
                gap = seq::add(gap, 1);
            }
            self.tail_seq = seq_no;
        }

        let idx = self.idx(seq_no);
        let (duplicate, filled_gap) = match &self.slots[idx] {
            Slot::Held(existing) if existing.seq == seq_no => (true, false),
            Slot::Released { seq: s } | Slot::Expired { seq: s } if *s == seq_no => (true, false),
            Slot::Missing { seq: s, .. } if *s == seq_no => (false, true),
            _ => (false, false),
        };
        if duplicate {
            self.counters.duplicates += 1;
            return InsertResult {
                outcome: InsertOutcome::Duplicate,
                new_gaps,
                expired,
            };
        }

        self.slots[idx] = Slot::Held(Box::new(HeldPacket {
            seq: seq_no,
            arrival: now,
            deadline: now + self.min_hold,
            ts_ntp,
            virt_src_port,
            virt_dst_port,
            payload,
            retransmission,
        }));
        self.counters.received += 1;
        if filled_gap && retransmission {
            self.counters.recovered += 1;
        }
        InsertResult {
            outcome: if filled_gap {
                InsertOutcome::GapFilled
            } else {
                InsertOutcome::Stored
            },
            new_gaps,
            expired,
        }
    }

    /// Classify an arrival behind `expected_seq`: a re-arrival of a tracked
    /// sequence is a duplicate, anything older is late.
    fn classify_late(&mut self, seq_no: u32) -> InsertOutcome {
        let idx = self.idx(seq_no);
        let duplicate = match &self.slots[idx] {
            Slot::Held(existing) => existing.seq == seq_no,
            Slot::Released { seq: s } | Slot::Expired { seq: s } => *s == seq_no,
            Slot::Missing { .. } | Slot::Empty => false,
        };
        if duplicate {
            self.counters.duplicates += 1;
            InsertOutcome::Duplicate
        } else {
            self.counters.late += 1;
            InsertOutcome::Late
        }
    }

    /// Window overrun: advance head/expected by `advance`, expiring what
    /// gets skipped. Returns the expired gap sequences.
    fn fast_forward(&mut self, advance: u32) -> Vec<u32> {
        let mut expired = Vec::new();
        for _ in 0..advance {
            let s = self.expected_seq;
            let idx = self.idx(s);
            let was_gap = matches!(&self.slots[idx], Slot::Missing { seq, .. } if *seq == s);
            self.slots[idx] = Slot::Expired { seq: s };
            self.counters.lost += 1;
            if was_gap {
                expired.push(s);
            }
            self.expected_seq = seq::add(self.expected_seq, 1);
        }
        self.head_seq = self.expected_seq;
        if seq::gt(self.expected_seq, self.tail_seq) {
            // Tail is the highest accounted sequence; keeping it just
            // behind expected lets the insert re-track everything from
            // expected onward as missing.
            self.tail_seq = self.expected_seq.wrapping_sub(1);
        }
        log::debug!(
            "[window] overrun fast-forward by {} to seq {}",
            advance,
            self.expected_seq
        );
        expired
    }

    fn step_at_expected(&mut self, now: Instant) -> ReleaseStep {
        let s = self.expected_seq;
        let idx = self.idx(s);
        match &self.slots[idx] {
            Slot::Held(held) if held.seq == s => ReleaseStep::Release,
            Slot::Missing { seq: m, deadline } if *m == s => {
                if now < *deadline {
                    ReleaseStep::Wait
                } else {
                    ReleaseStep::ExpireGap
                }
            }
            Slot::Expired { seq: e } if *e == s => ReleaseStep::SkipExpired,
            _ => ReleaseStep::Wait,
        }
    }

    fn take_held(&mut self, s: u32) -> HeldPacket {
        let idx = self.idx(s);
        let slot = std::mem::replace(&mut self.slots[idx], Slot::Released { seq: s });
        match slot {
            Slot::Held(pkt) => *pkt,
            other => {
                // step_at_expected guaranteed a held packet here.
                self.slots[idx] = other;
                unreachable!("take_held on a non-held slot")
            }
        }
    }

    /// Release everything due: in-order held packets unconditionally,
    /// gaps once their deadline passes or once the packet they block has
    /// used up its own hold time. Returns the released packets and the
    /// gap sequences that expired (for NACK cancellation).
    pub fn release_due(&mut self, now: Instant) -> (Vec<HeldPacket>, Vec<u32>) {
        let mut out = Vec::new();
        let mut expired = Vec::new();
        if !self.primed {
            return (out, expired);
        }
        while seq::le(self.expected_seq, self.tail_seq) {
            let s = self.expected_seq;
            match self.step_at_expected(now) {
                ReleaseStep::Release => out.push(self.take_held(s)),
                ReleaseStep::ExpireGap => {
                    let idx = self.idx(s);
                    self.slots[idx] = Slot::Expired { seq: s };
                    self.counters.lost += 1;
                    expired.push(s);
                }
                ReleaseStep::SkipExpired => {}
                ReleaseStep::Wait => {
                    if self.expire_run_blocking_overdue_head(now, &mut expired) {
                        // The run is expired; re-step over it.
                        continue;
                    }
                    break;
                }
            }
            self.expected_seq = seq::add(self.expected_seq, 1);
            self.head_seq = self.expected_seq;
        }
        (out, expired)
    }

    /// When the first held packet behind the missing run at `expected_seq`
    /// is past its deadline (`arrival + recovery_length_min`), the gaps in
    /// front of it have had their chance: expire the whole run. Returns
    /// true when anything was expired.
    fn expire_run_blocking_overdue_head(&mut self, now: Instant, expired: &mut Vec<u32>) -> bool {
        let mut s = self.expected_seq;
        loop {
            if !seq::le(s, self.tail_seq) {
                return false;
            }
            let idx = self.idx(s);
            match &self.slots[idx] {
                Slot::Missing { seq: m, .. } if *m == s => {}
                Slot::Expired { seq: e } if *e == s => {}
                Slot::Held(held) if held.seq == s => {
                    if now < held.deadline {
                        return false;
                    }
                    break;
                }
                _ => return false,
            }
            s = seq::add(s, 1);
        }
        let mut g = self.expected_seq;
        while seq::lt(g, s) {
            let idx = self.idx(g);
            if matches!(&self.slots[idx], Slot::Missing { seq: m, .. } if *m == g) {
                self.slots[idx] = Slot::Expired { seq: g };
                self.counters.lost += 1;
                expired.push(g);
            }
            g = seq::add(g, 1);
        }
        true
    }

    /// AGGRESSIVE buffer-bloat reaction: discard gaps up to the oldest held
    /// packet. Returns the expired gap sequences.
    pub fn advance_to_oldest_held(&mut self) -> Vec<u32> {
        let mut expired = Vec::new();
        if !self.primed {
            return expired;
        }
        while seq::le(self.expected_seq, self.tail_seq) {
            let s = self.expected_seq;
            let idx = self.idx(s);
            match &self.slots[idx] {
                Slot::Held(held) if held.seq == s => break,
                Slot::Expired { seq: e } if *e == s => {}
                slot => {
                    let was_gap = matches!(slot, Slot::Missing { seq, .. } if *seq == s);
                    self.slots[idx] = Slot::Expired { seq: s };
                    self.counters.lost += 1;
                    if was_gap {
                        expired.push(s);
                    }
                }
            }
            self.expected_seq = seq::add(self.expected_seq, 1);
            self.head_seq = self.expected_seq;
        }
        expired
    }

    /// Hard flush: advance to the tail, releasing whatever is held and
    /// counting every gap as lost. Returns (released, expired gaps).
    pub fn flush_to_tail(&mut self) -> (Vec<HeldPacket>, Vec<u32>) {
        let mut out = Vec::new();
        let mut expired = Vec::new();
        if !self.primed {
            return (out, expired);
        }
        while seq::le(self.expected_seq, self.tail_seq) {
            let s = self.expected_seq;
            let idx = self.idx(s);
            let is_held = matches!(&self.slots[idx], Slot::Held(h) if h.seq == s);
            if is_held {
                out.push(self.take_held(s));
            } else {
                let was_expired = matches!(&self.slots[idx], Slot::Expired { seq } if *seq == s);
                if !was_expired {
                    let was_gap = matches!(&self.slots[idx], Slot::Missing { seq, .. } if *seq == s);
                    self.slots[idx] = Slot::Expired { seq: s };
                    self.counters.lost += 1;
                    if was_gap {
                        expired.push(s);
                    }
                }
            }
            self.expected_seq = seq::add(self.expected_seq, 1);
            self.head_seq = self.expected_seq;
        }
        log::debug!("[window] hard flush to seq {}", self.expected_seq);
        (out, expired)
    }
}
