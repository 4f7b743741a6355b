// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Receiver-side flow management.
//!
//! A flow is a logical stream identified by a 32-bit id sharing one
//! sequence space. Flows are created lazily on the first data packet that
//! carries a new id, own one reassembly window plus one NACK scheduler,
//! and are reaped after `flow_ttl` without traffic. A flow may receive
//! from several peers (multi-path repair); the engine routes NACKs to the
//! contributing peer with the lowest smoothed RTT.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::nack::NackScheduler;
use super::window::{HeldPacket, InsertOutcome, ReassemblyWindow, WindowCounters};
use crate::config::{BufferBloatMode, PeerConfig, RecoveryMode};
use crate::peer::PeerId;

/// Consecutive over-limit ticks before the bloat policy reacts.
const BLOAT_DEBOUNCE_TICKS: u32 = 3;

/// What one flow produced during a release tick.
#[derive(Debug, Default)]
pub struct FlowTick {
    pub ready: Vec<HeldPacket>,
    /// Sequences to NACK this turn, in wraparound order.
    pub nacks: Vec<u32>,
    pub hard_flushed: bool,
}

pub struct Flow {
    pub id: u32,
    window: ReassemblyWindow,
    nack: NackScheduler,
    repair_enabled: bool,
    bloat_mode: BufferBloatMode,
    bloat_limit: u32,
    bloat_hard_limit: u32,
    bloat_over_ticks: u32,
    contributors: Vec<PeerId>,
    last_rx: Instant,
}

impl Flow {
    fn new(id: u32, cfg: &PeerConfig, max_retries: u32, now: Instant) -> Self {
        let window_size =
            ReassemblyWindow::size_for(cfg.recovery_maxbitrate, cfg.recovery_length_max_ms());
        let window = ReassemblyWindow::new(
            window_size,
            cfg.recovery_length_max_duration(),
            cfg.recovery_length_min_duration(),
        );
        log::info!(
            "[flow] created flow {:#010x} window_size={} hold={}ms",
            id,
            window.window_size(),
            cfg.recovery_length_max_ms()
        );
        Self {
            id,
            window,
            nack: NackScheduler::new(
                Duration::from_millis(u64::from(cfg.recovery_reorder_buffer)),
                cfg.recovery_length_max_duration(),
                max_retries,
            ),
            repair_enabled: cfg.recovery_mode != RecoveryMode::Disabled,
            bloat_mode: cfg.buffer_bloat_mode,
            bloat_limit: cfg.buffer_bloat_limit,
            bloat_hard_limit: cfg.buffer_bloat_hard_limit,
            bloat_over_ticks: 0,
            contributors: Vec::new(),
            last_rx: now,
        }
    }

    /// Feed one data packet into the window; keeps NACK state in sync.
    #[allow(clippy::too_many_arguments)]
    pub fn on_data(
        &mut self,
        from: PeerId,
        seq_no: u32,
        ts_ntp: u64,
        virt_src_port: u16,
        virt_dst_port: u16,
        payload: Vec<u8>,
        retransmission: bool,
        now: Instant,
    ) -> InsertOutcome {
        self.last_rx = now;
        if !self.contributors.contains(&from) {
            self.contributors.push(from);
        }

        let res = self.window.insert(
            seq_no,
            ts_ntp,
            virt_src_port,
            virt_dst_port,
            payload,
            retransmission,
            now,
        );
        if self.repair_enabled {
            for gap in &res.new_gaps {
                self.nack.on_gap(*gap, now);
            }
        }
        for expired in &res.expired {
            self.nack.on_expire(*expired);
        }
        if matches!(res.outcome, InsertOutcome::GapFilled | InsertOutcome::Stored) {
            self.nack.on_fill(seq_no);
        }
        res.outcome
    }

    /// One release-quantum tick: release due packets, run the bloat
    /// policy, and collect the NACKs to emit. `rtt_ms` is the smoothed RTT
    /// of the peer the repairs will be requested from.
    pub fn tick(&mut self, now: Instant, rtt_ms: u32) -> FlowTick {
        let (mut ready, expired) = self.window.release_due(now);
        for e in expired {
            self.nack.on_expire(e);
        }

        let mut hard_flushed = false;
        let occupancy = self.window.occupancy();
        if occupancy > self.bloat_hard_limit {
            let (flushed, expired) = self.window.flush_to_tail();
            log::warn!(
                "[flow] {:#010x} occupancy {} over hard limit {}, flushed",
                self.id,
                occupancy,
                self.bloat_hard_limit
            );
            for e in expired {
                self.nack.on_expire(e);
            }
            ready.extend(flushed);
            hard_flushed = true;
            self.bloat_over_ticks = 0;
        } else if self.bloat_mode != BufferBloatMode::Off && occupancy > self.bloat_limit {
            self.bloat_over_ticks += 1;
            if self.bloat_over_ticks >= BLOAT_DEBOUNCE_TICKS {
                self.window.shrink_hold();
                if self.bloat_mode == BufferBloatMode::Aggressive {
                    for e in self.window.advance_to_oldest_held() {
                        self.nack.on_expire(e);
                    }
                }
                log::debug!(
                    "[flow] {:#010x} bloat reaction, hold now {}ms",
                    self.id,
                    self.window.hold().as_millis()
                );
                self.bloat_over_ticks = 0;
            }
        } else {
            self.bloat_over_ticks = 0;
        }

        let nacks = if self.repair_enabled {
            self.nack.poll(now, rtt_ms, self.window.expected_seq())
        } else {
            Vec::new()
        };
        FlowTick {
            ready,
            nacks,
            hard_flushed,
        }
    }

    pub fn counters(&self) -> WindowCounters {
        self.window.counters()
    }

    pub fn expected_seq(&self) -> u32 {
        self.window.expected_seq()
    }

    pub fn tail_seq(&self) -> u32 {
        self.window.tail_seq()
    }

    pub fn occupancy(&self) -> u32 {
        self.window.occupancy()
    }

    /// Current recovery horizon (shrinks under buffer bloat).
    pub fn hold(&self) -> Duration {
        self.window.hold()
    }

    pub fn pending_nacks(&self) -> usize {
        self.nack.pending()
    }

    pub fn nacks_sent_total(&self) -> u64 {
        self.nack.nacks_sent_total()
    }

    pub fn contributors(&self) -> &[PeerId] {
        &self.contributors
    }

    pub fn last_rx(&self) -> Instant {
        self.last_rx
    }
}

/// Pick the peer NACKs for this flow should go to: the lowest-RTT live
/// contributor, excluding weight-0 peers.
pub fn repair_peer(flow: &Flow, peers: &crate::peer::PeerTable) -> Option<PeerId> {
    flow.contributors()
        .iter()
        .filter_map(|&id| peers.get(id))
        .filter(|p| p.is_alive() && p.config.weight != 0)
        .min_by_key(|p| p.rtt_ms())
        .map(|p| p.id)
}

/// All live flows at the receiver.
pub struct FlowTable {
    flows: HashMap<u32, Flow>,
    ttl: Duration,
    max_retries: u32,
}

impl FlowTable {
    pub fn new(ttl: Duration, max_retries: u32) -> Self {
        Self {
            flows: HashMap::new(),
            ttl,
            max_retries,
        }
    }

    /// Get or lazily create the flow for `flow_id`, configured from the
    /// delivering peer.
    pub fn flow_for(&mut self, flow_id: u32, cfg: &PeerConfig, now: Instant) -> &mut Flow {
        let max_retries = self.max_retries;
        self.flows
            .entry(flow_id)
            .or_insert_with(|| Flow::new(flow_id, cfg, max_retries, now))
    }

    pub fn get(&self, flow_id: u32) -> Option<&Flow> {
        self.flows.get(&flow_id)
    }

    pub fn get_mut(&mut self, flow_id: u32) -> Option<&mut Flow> {
        self.flows.get_mut(&flow_id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Flow> {
        self.flows.values_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flow> {
        self.flows.values()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Drop flows idle past the TTL; returns their final counters so
    /// stats survive the flow.
    pub fn reap(&mut self, now: Instant) -> Vec<(u32, WindowCounters)> {
        let ttl = self.ttl;
        let dead: Vec<u32> = self
            .flows
            .iter()
            .filter(|(_, f)| now.duration_since(f.last_rx()) > ttl)
            .map(|(&id, _)| id)
            .collect();
        dead.iter()
            .filter_map(|id| {
                self.flows.remove(id).map(|f| {
                    log::info!("[flow] reaped idle flow {:#010x}", id);
                    (*id, f.counters())
                })
            })
            .collect()
    }
}
