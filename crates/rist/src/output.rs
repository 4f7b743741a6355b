// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Jitter-smoothed delivery of reassembled packets.
//!
//! Released packets are spooled until `arrival + jitter_max`, then handed
//! to the consumer in strict release order (a packet is never delivered
//! before its predecessor, so a late repair delays its successors rather
//! than reordering them). Three delivery modes: a synchronous callback on
//! the reactor thread, a bounded queue drained by `data_read`, or a wake
//! byte written to an application descriptor.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;

use crate::engine::wake::WakeNotifier;
use crate::reliability::HeldPacket;
use crate::DataBlock;

/// Data callback; runs on the reactor thread and must not block.
pub type DataCallback = Box<dyn FnMut(&DataBlock) + Send>;

pub struct OutputScheduler {
    jitter_max: Duration,
    pending: VecDeque<(Instant, DataBlock)>,
    queue: Arc<ArrayQueue<DataBlock>>,
    notifier: Arc<WakeNotifier>,
    callback: Option<DataCallback>,
    notify_fd: Option<i32>,
    overflow: u64,
}

impl OutputScheduler {
    pub fn new(
        jitter_max: Duration,
        queue: Arc<ArrayQueue<DataBlock>>,
        notifier: Arc<WakeNotifier>,
    ) -> Self {
        Self {
            jitter_max,
            pending: VecDeque::new(),
            queue,
            notifier,
            callback: None,
            notify_fd: None,
            overflow: 0,
        }
    }

    pub fn set_jitter_max(&mut self, jitter_max: Duration) {
        self.jitter_max = jitter_max;
    }

    pub fn set_callback(&mut self, callback: Option<DataCallback>) {
        self.callback = callback;
    }

    pub fn set_notify_fd(&mut self, fd: Option<i32>) {
        self.notify_fd = fd;
    }

    pub fn overflow(&self) -> u64 {
        self.overflow
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Spool one released packet for delivery at `arrival + jitter_max`.
    pub fn push(&mut self, flow_id: u32, pkt: HeldPacket, fallback_ntp: u64) {
        let due = pkt.arrival + self.jitter_max;
        let block = DataBlock {
            payload: pkt.payload,
            ts_ntp: if pkt.ts_ntp != 0 { pkt.ts_ntp } else { fallback_ntp },
            virt_src_port: pkt.virt_src_port,
            virt_dst_port: pkt.virt_dst_port,
            flow_id,
            seq: pkt.seq,
            peer: None,
            retransmitted: pkt.retransmission,
        };
        self.pending.push_back((due, block));
    }

    /// Deliver everything due, preserving release order.
    pub fn drain_due(&mut self, now: Instant) {
        while let Some((due, _)) = self.pending.front() {
            if *due > now {
                break;
            }
            let Some((_, block)) = self.pending.pop_front() else {
                break;
            };
            self.deliver(block);
        }
    }

    fn deliver(&mut self, block: DataBlock) {
        if let Some(cb) = self.callback.as_mut() {
            cb(&block);
            return;
        }
        if self.queue.force_push(block).is_some() {
            // Bounded queue: the oldest packet was displaced.
            self.overflow += 1;
        }
        self.notifier.notify();
        if let Some(fd) = self.notify_fd {
            // One wake byte; the consumer drains via data_read.
            let byte = [1u8];
            let n = unsafe { libc::write(fd, byte.as_ptr().cast(), 1) };
            if n < 0 {
                log::debug!("[output] notify fd {} write failed", fd);
            }
        }
    }

    /// Earliest spooled deadline (for reactor poll timeout shaping).
    pub fn next_due(&self) -> Option<Instant> {
        self.pending.front().map(|(due, _)| *due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held(seq: u32, arrival: Instant) -> HeldPacket {
        HeldPacket {
            seq,
            arrival,
            deadline: arrival,
            ts_ntp: 0,
            virt_src_port: 0,
            virt_dst_port: 0,
            payload: vec![seq as u8],
            retransmission: false,
        }
    }

    fn scheduler(jitter_ms: u64, depth: usize) -> OutputScheduler {
        OutputScheduler::new(
            Duration::from_millis(jitter_ms),
            Arc::new(ArrayQueue::new(depth)),
            Arc::new(WakeNotifier::new()),
        )
    }

    #[test]
    fn test_holds_until_jitter_horizon() {
        let now = Instant::now();
        let mut out = scheduler(5, 16);
        let queue = out.queue.clone();
        out.push(1, held(0, now), 0);

        out.drain_due(now);
        assert!(queue.pop().is_none(), "not due yet");

        out.drain_due(now + Duration::from_millis(5));
        assert_eq!(queue.pop().expect("due now").seq, 0);
    }

    #[test]
    fn test_preserves_release_order() {
        let now = Instant::now();
        let mut out = scheduler(5, 16);
        let queue = out.queue.clone();
        // Repair for seq 0 arrived late: its due time is after seq 1's.
        out.push(1, held(0, now + Duration::from_millis(10)), 0);
        out.push(1, held(1, now), 0);

        out.drain_due(now + Duration::from_millis(6));
        assert!(queue.pop().is_none(), "successor must wait for the repair");

        out.drain_due(now + Duration::from_millis(15));
        assert_eq!(queue.pop().expect("first").seq, 0);
        assert_eq!(queue.pop().expect("second").seq, 1);
    }

    #[test]
    fn test_queue_overflow_drops_oldest() {
        let now = Instant::now();
        let mut out = scheduler(0, 2);
        let queue = out.queue.clone();
        for s in 0..4 {
            out.push(1, held(s, now), 0);
        }
        out.drain_due(now);
        assert_eq!(out.overflow(), 2);
        assert_eq!(queue.pop().expect("kept").seq, 2);
        assert_eq!(queue.pop().expect("kept").seq, 3);
    }

    #[test]
    fn test_callback_mode_bypasses_queue() {
        let now = Instant::now();
        let mut out = scheduler(0, 16);
        let queue = out.queue.clone();
        let seen = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let seen2 = seen.clone();
        out.set_callback(Some(Box::new(move |block| {
            seen2.fetch_add(block.seq + 1, std::sync::atomic::Ordering::Relaxed);
        })));

        out.push(1, held(4, now), 0);
        out.drain_due(now);
        assert_eq!(seen.load(std::sync::atomic::Ordering::Relaxed), 5);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_fallback_ntp_fills_zero_timestamp() {
        let now = Instant::now();
        let mut out = scheduler(0, 16);
        let queue = out.queue.clone();
        out.push(1, held(0, now), 0xABCD);
        out.drain_due(now);
        assert_eq!(queue.pop().expect("delivered").ts_ntp, 0xABCD);
    }
}
