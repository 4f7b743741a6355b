// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end loss-repair scenarios on a simulated lossy link.
//!
//! The sender side is a real history cache, the receiver side a real flow
//! (window + NACK scheduler); the "network" is a seeded loss process with
//! a fixed one-way delay, driven on a millisecond timeline with explicit
//! timestamps so every run is deterministic.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rist::config::PeerConfig;
use rist::peer::PeerId;
use rist::protocol::seq;
use rist::reliability::{FlowTable, HistoryCache};

const FLOW: u32 = 0x5000;

fn peer(n: u32) -> PeerId {
    PeerId::from_parts(n, 1)
}

struct LossyLink {
    rng: fastrand::Rng,
    loss_permille: u32,
}

impl LossyLink {
    fn new(seed: u64, loss_permille: u32) -> Self {
        Self {
            rng: fastrand::Rng::with_seed(seed),
            loss_permille,
        }
    }

    fn delivers(&mut self) -> bool {
        self.rng.u32(0..1000) >= self.loss_permille
    }
}

/// 10,000 packets, 5% uniform loss, RTT 30 ms, 200 ms
/// recovery window. At least 99.9% must reach the output, in order.
#[test]
fn recovers_five_percent_uniform_loss() {
    let t0 = Instant::now();
    let at = |ms: u64| t0 + Duration::from_millis(ms);
    let total: u32 = 10_000;
    let rtt_ms: u32 = 30;

    let cfg = PeerConfig {
        address: "127.0.0.1:5004".to_string(),
        recovery_length_min: 200,
        recovery_length_max: 200,
        recovery_reorder_buffer: 25,
        recovery_maxbitrate: 10_000_000,
        ..PeerConfig::default()
    };

    let mut link = LossyLink::new(7, 50); // 5%
    let mut history = HistoryCache::new(
        HistoryCache::capacity_for(10_000_000, 200),
        Duration::from_millis(200),
        7,
    );
    let mut flows = FlowTable::new(Duration::from_secs(60), 7);
    flows.flow_for(FLOW, &cfg, at(0));

    // Repairs in flight: arrival ms -> sequences.
    let mut repairs: BTreeMap<u64, Vec<u32>> = BTreeMap::new();
    let mut released: Vec<u32> = Vec::new();

    let horizon = u64::from(total) + 500;
    for ms in 0..horizon {
        let now = at(ms);
        let flow = flows.get_mut(FLOW).expect("flow exists");

        // One original packet per millisecond.
        if ms < u64::from(total) {
            let s = ms as u32;
            history.put(s, now, 0, 0, 0, vec![0u8; 16]);
            if link.delivers() {
                flow.on_data(peer(1), s, 0, 0, 0, vec![0u8; 16], false, now);
            }
        }

        // Repairs that survived the return path land now.
        if let Some(seqs) = repairs.remove(&ms) {
            for s in seqs {
                flow.on_data(peer(1), s, 0, 0, 0, vec![0u8; 16], true, now);
            }
        }

        // Release quantum: every 5 ms.
        if ms % 5 == 0 {
            let tick = flow.tick(now, rtt_ms);
            released.extend(tick.ready.iter().map(|p| p.seq));
            for s in tick.nacks {
                if history.get(s, now).is_none() {
                    continue;
                }
                if !history.note_retransmit(s, peer(1)) {
                    continue;
                }
                if link.delivers() {
                    repairs
                        .entry(ms + u64::from(rtt_ms))
                        .or_default()
                        .push(s);
                }
            }
        }
    }

    let flow = flows.get(FLOW).expect("flow exists");
    let counters = flow.counters();
    let delivered = released.len() as u64;
    assert!(
        delivered * 1000 >= u64::from(total) * 999,
        "only {delivered}/{total} delivered (lost {})",
        counters.lost
    );
    // Released exactly once or counted lost, never both. The last few
    // sequences may be neither if the stream ends in a loss run (nothing
    // after them ever reveals the gap).
    assert!(delivered + counters.lost <= u64::from(total));
    assert!(delivered + counters.lost >= u64::from(total) - 20);
    for pair in released.windows(2) {
        assert!(
            seq::lt(pair[0], pair[1]),
            "output order violated: {} before {}",
            pair[0],
            pair[1]
        );
    }
    assert!(counters.recovered > 0, "repairs must have contributed");
}

/// Seq 50 lost permanently. Exactly `max_retries` NACKs go
/// out, then the gap is abandoned and counted lost after the recovery
/// window; output carries 0..49, 51..99 in order.
#[test]
fn permanent_loss_caps_nacks_and_counts_lost() {
    let t0 = Instant::now();
    let at = |ms: u64| t0 + Duration::from_millis(ms);
    let rtt_ms = 3;

    let cfg = PeerConfig {
        address: "127.0.0.1:5004".to_string(),
        recovery_length_min: 100,
        recovery_length_max: 100,
        recovery_reorder_buffer: 3,
        ..PeerConfig::default()
    };
    let mut flows = FlowTable::new(Duration::from_secs(60), 7);
    flows.flow_for(FLOW, &cfg, at(0));

    let mut nacks_for_50 = 0u32;
    let mut released: Vec<u32> = Vec::new();

    for ms in 0..400u64 {
        let now = at(ms);
        let flow = flows.get_mut(FLOW).expect("flow exists");
        if ms < 100 && ms != 50 {
            flow.on_data(peer(1), ms as u32, 0, 0, 0, vec![1], false, now);
        }
        let tick = flow.tick(now, rtt_ms);
        released.extend(tick.ready.iter().map(|p| p.seq));
        nacks_for_50 += tick.nacks.iter().filter(|&&s| s == 50).count() as u32;
    }

    assert_eq!(nacks_for_50, 7, "retry cap must bound NACK emission");
    let counters = flows.get(FLOW).expect("flow exists").counters();
    assert_eq!(counters.lost, 1);
    assert_eq!(released.len(), 99);
    let expected: Vec<u32> = (0..100).filter(|&s| s != 50).collect();
    assert_eq!(released, expected);
}

/// Two peers carry the same flow; NACKs go to the one with
/// the lowest smoothed RTT, and weight-0 peers are never asked.
#[test]
fn nacks_route_to_lowest_rtt_contributor() {
    use rist::peer::{Peer, PeerTable};
    use rist::reliability::flow::repair_peer;

    let t0 = Instant::now();
    let mk_cfg = |weight: u32| PeerConfig {
        address: "127.0.0.1:5004".to_string(),
        recovery_rtt_min: 1,
        recovery_rtt_max: 500,
        weight,
        ..PeerConfig::default()
    };
    let local = "127.0.0.1:4000".parse().expect("addr");
    let remote = "127.0.0.1:5004".parse().expect("addr");

    let mut peers = PeerTable::new();
    let fast = peers.insert(|id| {
        Peer::new(
            id,
            mk_cfg(5),
            local,
            Some(remote),
            Duration::from_secs(6),
            Duration::from_secs(1),
            false,
            t0,
        )
    });
    let slow = peers.insert(|id| {
        Peer::new(
            id,
            mk_cfg(5),
            local,
            Some(remote),
            Duration::from_secs(6),
            Duration::from_secs(1),
            false,
            t0,
        )
    });
    for id in [fast, slow] {
        let p = peers.get_mut(id).expect("peer exists");
        p.start(t0);
        p.on_packet_rx(remote, t0);
    }
    peers.get_mut(fast).expect("peer").rtt_sample(10);
    peers.get_mut(slow).expect("peer").rtt_sample(200);

    let cfg = mk_cfg(5);
    let mut flows = FlowTable::new(Duration::from_secs(60), 7);
    let flow = flows.flow_for(FLOW, &cfg, t0);
    flow.on_data(fast, 0, 0, 0, 0, vec![1], false, t0);
    flow.on_data(slow, 1, 0, 0, 0, vec![1], false, t0);

    let flow = flows.get(FLOW).expect("flow exists");
    assert_eq!(repair_peer(flow, &peers), Some(fast));

    // A dead fast path falls back to the slow one.
    peers.get_mut(fast).expect("peer").kill();
    assert_eq!(repair_peer(flow, &peers), Some(slow));
}

/// Weight-0 peers receive duplicates but must never be NACK targets.
#[test]
fn weight_zero_peer_excluded_from_repair() {
    use rist::peer::{Peer, PeerTable};
    use rist::reliability::flow::repair_peer;

    let t0 = Instant::now();
    let local = "127.0.0.1:4000".parse().expect("addr");
    let remote = "127.0.0.1:5004".parse().expect("addr");
    let cfg0 = PeerConfig {
        address: "127.0.0.1:5004".to_string(),
        weight: 0,
        ..PeerConfig::default()
    };

    let mut peers = PeerTable::new();
    let only = peers.insert(|id| {
        Peer::new(
            id,
            cfg0.clone(),
            local,
            Some(remote),
            Duration::from_secs(6),
            Duration::from_secs(1),
            false,
            t0,
        )
    });

    let mut flows = FlowTable::new(Duration::from_secs(60), 7);
    let flow = flows.flow_for(FLOW, &cfg0, t0);
    flow.on_data(only, 0, 0, 0, 0, vec![1], false, t0);

    assert_eq!(repair_peer(flows.get(FLOW).expect("flow"), &peers), None);
}

/// Reassembly across the 2^32 wrap with one delayed
/// packet; everything comes out in numerical wraparound order.
#[test]
fn reassembles_across_sequence_wrap() {
    let t0 = Instant::now();
    let at = |ms: u64| t0 + Duration::from_millis(ms);

    let cfg = PeerConfig {
        address: "127.0.0.1:5004".to_string(),
        recovery_length_min: 100,
        recovery_length_max: 100,
        ..PeerConfig::default()
    };
    let mut flows = FlowTable::new(Duration::from_secs(60), 7);
    flows.flow_for(FLOW, &cfg, at(0));

    let start = 0xFFFF_FFF0u32;
    let delayed = 0xFFFF_FFF8u32;
    let count = 22u32; // 0xFFFFFFF0 ..= 0x00000005
    let mut sent = Vec::new();

    {
        let flow = flows.get_mut(FLOW).expect("flow exists");
        let mut s = start;
        for _ in 0..count {
            if s != delayed {
                flow.on_data(peer(1), s, 0, 0, 0, vec![2], false, at(0));
            }
            sent.push(s);
            s = seq::add(s, 1);
        }
    }

    let mut released = Vec::new();
    for ms in 0..30u64 {
        let flow = flows.get_mut(FLOW).expect("flow exists");
        if ms == 20 {
            flow.on_data(peer(1), delayed, 0, 0, 0, vec![2], true, at(ms));
        }
        let tick = flow.tick(at(ms), 5);
        released.extend(tick.ready.iter().map(|p| p.seq));
    }

    assert_eq!(released, sent);
    let counters = flows.get(FLOW).expect("flow exists").counters();
    assert_eq!(counters.lost, 0);
    assert_eq!(counters.recovered, 1);
}

/// Flows are isolated: loss in one never stalls or corrupts another.
#[test]
fn flows_are_isolated() {
    let t0 = Instant::now();
    let cfg = PeerConfig {
        address: "127.0.0.1:5004".to_string(),
        recovery_length_min: 100,
        recovery_length_max: 100,
        ..PeerConfig::default()
    };
    let mut flows = FlowTable::new(Duration::from_secs(60), 7);
    let lossy = FLOW;
    let clean = FLOW + 2;
    flows.flow_for(lossy, &cfg, t0);
    flows.flow_for(clean, &cfg, t0);

    {
        let f = flows.get_mut(lossy).expect("flow exists");
        f.on_data(peer(1), 0, 0, 0, 0, vec![1], false, t0);
        f.on_data(peer(1), 10, 0, 0, 0, vec![1], false, t0); // gap 1..9
    }
    let clean_released = {
        let f = flows.get_mut(clean).expect("flow exists");
        for s in 0..50u32 {
            f.on_data(peer(1), s, 0, 0, 0, vec![1], false, t0);
        }
        f.tick(t0, 5).ready.len()
    };
    assert_eq!(clean_released, 50);
    assert_eq!(flows.get(clean).expect("flow").counters().lost, 0);
    assert!(flows.get(lossy).expect("flow").pending_nacks() > 0);
}
