// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport statistics.
//!
//! The reactor owns the live counters and periodically publishes an
//! immutable snapshot through an atomic pointer swap; application threads
//! read the last published snapshot without ever touching reactor state.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::peer::PeerState;
use crate::reliability::WindowCounters;

/// Per-peer wire counters, owned by the reactor.
#[derive(Debug, Default, Clone, Copy)]
pub struct PeerStats {
    /// Data packets sent to this peer.
    pub sent: u64,
    /// Datagrams received from this peer.
    pub received: u64,
    /// Repairs re-sent to this peer.
    pub retransmitted: u64,
    /// Repairs suppressed (retry cap or return-bandwidth cap).
    pub suppressed_retransmits: u64,
    /// NACK requests received from this peer.
    pub nacks_rx: u64,
    /// NACK requests sent to this peer.
    pub nacks_tx: u64,
    pub keepalives_rx: u64,
    /// Malformed datagrams dropped.
    pub decode_errors: u64,
    /// Encrypted datagrams dropped for lack of a key.
    pub decrypt_fail: u64,
}

/// Peer line in a published snapshot.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub peer_index: u32,
    pub remote: Option<std::net::SocketAddr>,
    pub state: PeerState,
    pub rtt_ms: u32,
    pub stats: PeerStats,
}

/// Flow line in a published snapshot.
#[derive(Debug, Clone, Copy)]
pub struct FlowSnapshot {
    pub flow_id: u32,
    pub received: u64,
    pub recovered: u64,
    pub lost: u64,
    pub duplicates: u64,
    pub late: u64,
    pub nacks_sent: u64,
    pub expected_seq: u32,
    pub occupancy: u32,
}

impl FlowSnapshot {
    pub fn from_counters(
        flow_id: u32,
        c: WindowCounters,
        nacks_sent: u64,
        expected_seq: u32,
        occupancy: u32,
    ) -> Self {
        Self {
            flow_id,
            received: c.received,
            recovered: c.recovered,
            lost: c.lost,
            duplicates: c.duplicates,
            late: c.late,
            nacks_sent,
            expected_seq,
            occupancy,
        }
    }

    /// Delivered fraction of everything the flow should have carried.
    pub fn quality(&self) -> f64 {
        let delivered = self.received.saturating_sub(self.duplicates);
        let expected = delivered + self.lost;
        if expected == 0 {
            return 1.0;
        }
        delivered as f64 / expected as f64
    }
}

/// One published statistics snapshot.
#[derive(Debug, Default, Clone)]
pub struct StatsSnapshot {
    pub peers: Vec<PeerSnapshot>,
    pub flows: Vec<FlowSnapshot>,
    /// Flows already reaped, folded into totals.
    pub retired_lost: u64,
    pub retired_received: u64,
    /// Packets dropped because the output queue overflowed.
    pub queue_overflow: u64,
    pub generated_at_ntp: u64,
}

impl Default for PeerSnapshot {
    fn default() -> Self {
        Self {
            peer_index: 0,
            remote: None,
            state: PeerState::Idle,
            rtt_ms: 0,
            stats: PeerStats::default(),
        }
    }
}

/// Reactor side: publishes snapshots.
pub struct StatsPublisher {
    shared: Arc<ArcSwap<StatsSnapshot>>,
}

/// Application side: reads the last published snapshot.
#[derive(Clone)]
pub struct StatsHandle {
    shared: Arc<ArcSwap<StatsSnapshot>>,
}

/// Create a connected publisher/reader pair.
pub fn stats_channel() -> (StatsPublisher, StatsHandle) {
    let shared = Arc::new(ArcSwap::from_pointee(StatsSnapshot::default()));
    (
        StatsPublisher {
            shared: shared.clone(),
        },
        StatsHandle { shared },
    )
}

impl StatsPublisher {
    pub fn publish(&self, snapshot: StatsSnapshot) {
        self.shared.store(Arc::new(snapshot));
    }
}

impl StatsHandle {
    pub fn snapshot(&self) -> Arc<StatsSnapshot> {
        self.shared.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_full_delivery() {
        let snap = FlowSnapshot::from_counters(
            1,
            WindowCounters {
                received: 100,
                recovered: 5,
                lost: 0,
                duplicates: 0,
                late: 0,
            },
            5,
            100,
            0,
        );
        assert!((snap.quality() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_quality_with_loss() {
        let snap = FlowSnapshot::from_counters(
            1,
            WindowCounters {
                received: 99,
                recovered: 0,
                lost: 1,
                duplicates: 0,
                late: 0,
            },
            7,
            100,
            0,
        );
        assert!((snap.quality() - 0.99).abs() < 1e-9);
    }

    #[test]
    fn test_quality_empty_flow() {
        let snap = FlowSnapshot::from_counters(1, WindowCounters::default(), 0, 0, 0);
        assert!((snap.quality() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_swap_visible_to_reader() {
        let (publisher, handle) = stats_channel();
        assert!(handle.snapshot().flows.is_empty());

        publisher.publish(StatsSnapshot {
            queue_overflow: 3,
            ..StatsSnapshot::default()
        });
        assert_eq!(handle.snapshot().queue_overflow, 3);

        // Old snapshots remain valid for readers that still hold them.
        let old = handle.snapshot();
        publisher.publish(StatsSnapshot::default());
        assert_eq!(old.queue_overflow, 3);
        assert_eq!(handle.snapshot().queue_overflow, 0);
    }
}
