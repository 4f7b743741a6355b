// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer lifecycle: handshake, keep-alive, authentication, RTT probing.
//!
//! A peer walks IDLE -> HANDSHAKING -> (AUTHENTICATED) -> ACTIVE, droops to
//! DYING after `session_timeout` without traffic, recovers on any receive,
//! and dies for good at twice the timeout. The keep-alive doubles as the
//! RTT probe: our SR timestamp comes back in the peer's RR (LSR/DLSR) and
//! yields one smoothed sample per exchange.
//!
//! Peers live in a generational-index arena. Callbacks and the public API
//! only ever see a [`PeerId`]; a stale id (destroyed peer, reused slot)
//! simply fails to resolve instead of dangling.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::config::PeerConfig;
use crate::congestion::{RttEstimator, TokenBucket};
use crate::protocol::ntp;
use crate::stats::PeerStats;

/// Opaque generational peer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId {
    index: u32,
    generation: u32,
}

impl PeerId {
    pub fn from_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Handshaking,
    /// Handshake seen, auth decision pending or just granted.
    Authenticated,
    Active,
    Dying,
    Dead,
}

/// What the engine must do after a peer state step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// Emit a keep-alive (SR + SDES) to the peer.
    SendKeepalive,
    /// First handshake traffic arrived; run the auth decision.
    AuthPending,
    /// Peer became ACTIVE; fire the connect callback.
    Connected,
    /// Peer recovered from DYING.
    Restored,
    /// Session timed out; repairs continue, new data stops.
    WentDying,
    /// Peer is gone; fire the disconnect callback (at most once).
    WentDead,
}

pub struct Peer {
    pub id: PeerId,
    pub config: PeerConfig,
    /// Known after config resolution (sender) or first receive (receiver).
    pub remote: Option<SocketAddr>,
    pub local: SocketAddr,
    pub stats: PeerStats,
    state: PeerState,
    rtt: RttEstimator,
    last_rx: Instant,
    last_keepalive_tx: Instant,
    session_timeout: Duration,
    keepalive_interval: Duration,
    requires_auth: bool,
    was_connected: bool,
    disconnect_notified: bool,
    return_bucket: TokenBucket,
    /// Compact NTP of the last SR received and when it arrived (RR echo).
    last_sr: Option<(u32, Instant)>,
    pub cname_remote: Option<String>,
}

impl Peer {
    pub fn new(
        id: PeerId,
        config: PeerConfig,
        local: SocketAddr,
        remote: Option<SocketAddr>,
        session_timeout: Duration,
        keepalive_interval: Duration,
        requires_auth: bool,
        now: Instant,
    ) -> Self {
        let rtt = RttEstimator::new(config.recovery_rtt_min, config.recovery_rtt_max);
        let return_bucket = TokenBucket::new(config.recovery_maxbitrate_return, now);
        Self {
            id,
            config,
            remote,
            local,
            stats: PeerStats::default(),
            state: PeerState::Idle,
            rtt,
            last_rx: now,
            last_keepalive_tx: now,
            session_timeout,
            keepalive_interval,
            requires_auth,
            was_connected: false,
            disconnect_notified: false,
            return_bucket,
            last_sr: None,
            cname_remote: None,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.state, PeerState::Dead)
    }

    /// Data flows only to/through peers that are fully up (or draining).
    pub fn accepts_data(&self) -> bool {
        matches!(self.state, PeerState::Active)
    }

    pub fn rtt_ms(&self) -> u32 {
        self.rtt.rtt_ms()
    }

    /// Feed one RTT sample (ms) into the smoothed estimate.
    pub fn rtt_sample(&mut self, ms: u32) {
        self.rtt.update(ms);
    }

    /// Retime the liveness machinery (context-level setters apply to
    /// peers that already exist).
    pub fn set_timeouts(&mut self, session_timeout: Duration, keepalive_interval: Duration) {
        self.session_timeout = session_timeout;
        self.keepalive_interval = keepalive_interval;
    }

    pub fn return_bucket(&mut self) -> &mut TokenBucket {
        &mut self.return_bucket
    }

    /// IDLE -> HANDSHAKING: emit the first keep-alive immediately.
    pub fn start(&mut self, now: Instant) -> Vec<PeerEvent> {
        if self.state != PeerState::Idle {
            return Vec::new();
        }
        self.state = PeerState::Handshaking;
        self.last_keepalive_tx = now;
        log::debug!("[peer] {} handshaking with {:?}", self.id, self.remote);
        vec![PeerEvent::SendKeepalive]
    }

    /// Any packet from the peer resets liveness and may advance the
    /// handshake or restore a DYING peer.
    pub fn on_packet_rx(&mut self, from: SocketAddr, now: Instant) -> Vec<PeerEvent> {
        self.last_rx = now;
        if self.remote.is_none() {
            self.remote = Some(from);
            log::info!("[peer] {} learned remote address {}", self.id, from);
        }
        match self.state {
            PeerState::Handshaking => {
                if self.requires_auth {
                    vec![PeerEvent::AuthPending]
                } else {
                    self.state = PeerState::Authenticated;
                    self.grant()
                }
            }
            PeerState::Dying => {
                self.state = PeerState::Active;
                log::info!("[peer] {} restored from DYING", self.id);
                vec![PeerEvent::Restored]
            }
            _ => Vec::new(),
        }
    }

    /// Apply the auth decision (callback result and/or PSK challenge).
    pub fn authorize(&mut self, granted: bool) -> Vec<PeerEvent> {
        if !matches!(
            self.state,
            PeerState::Handshaking | PeerState::Authenticated
        ) {
            return Vec::new();
        }
        if granted {
            self.state = PeerState::Authenticated;
            self.grant()
        } else {
            log::warn!("[peer] {} authentication denied", self.id);
            self.state = PeerState::Dead;
            vec![]
        }
    }

    fn grant(&mut self) -> Vec<PeerEvent> {
        self.state = PeerState::Active;
        self.was_connected = true;
        log::info!("[peer] {} active", self.id);
        vec![PeerEvent::Connected]
    }

    /// Periodic liveness step.
    pub fn tick(&mut self, now: Instant) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        let silent = now.saturating_duration_since(self.last_rx);
        match self.state {
            PeerState::Active => {
                if silent >= self.session_timeout {
                    self.state = PeerState::Dying;
                    log::warn!(
                        "[peer] {} silent for {}ms, dying",
                        self.id,
                        silent.as_millis()
                    );
                    events.push(PeerEvent::WentDying);
                }
            }
            PeerState::Dying => {
                if silent >= self.session_timeout * 2 {
                    self.state = PeerState::Dead;
                    if self.was_connected && !self.disconnect_notified {
                        self.disconnect_notified = true;
                        events.push(PeerEvent::WentDead);
                    }
                }
            }
            _ => {}
        }
        if matches!(
            self.state,
            PeerState::Handshaking | PeerState::Active | PeerState::Dying
        ) && now.saturating_duration_since(self.last_keepalive_tx) >= self.keepalive_interval
        {
            self.last_keepalive_tx = now;
            events.push(PeerEvent::SendKeepalive);
        }
        events
    }

    /// Force-kill (peer_destroy). Returns true if the disconnect callback
    /// still needs to fire.
    pub fn kill(&mut self) -> bool {
        let notify = self.was_connected && !self.disconnect_notified;
        self.disconnect_notified = true;
        self.state = PeerState::Dead;
        notify
    }

    /// Record an incoming SR for later echoing in our RR.
    pub fn record_sr(&mut self, ntp_ts: u64, now: Instant) {
        self.last_sr = Some((ntp::compact(ntp_ts), now));
        self.stats.keepalives_rx += 1;
    }

    /// LSR/DLSR pair for the next RR, if an SR was seen.
    pub fn rr_echo(&self, now: Instant) -> Option<(u32, u32)> {
        self.last_sr.map(|(lsr, at)| {
            let delay = now.saturating_duration_since(at);
            let dlsr = (delay.as_micros() * 65_536 / 1_000_000) as u32;
            (lsr, dlsr)
        })
    }

    /// Fold an RR echo into the RTT estimate. `now_ntp` is the local NTP
    /// clock at RR reception.
    pub fn on_rr_echo(&mut self, last_sr: u32, dlsr: u32, now_ntp: u64) {
        if last_sr == 0 {
            return;
        }
        let now_compact = ntp::compact(now_ntp);
        let units = now_compact
            .wrapping_sub(last_sr)
            .wrapping_sub(dlsr);
        // Reject wrapped/negative garbage: anything over 10 min is noise.
        let ms = u64::from(units) * 1000 / 65_536;
        if ms > 600_000 {
            return;
        }
        self.rtt.update(ms as u32);
        log::debug!("[peer] {} rtt sample {}ms -> {}ms", self.id, ms, self.rtt_ms());
    }
}

struct PeerSlot {
    generation: u32,
    peer: Option<Peer>,
}

/// Generational-index arena owning all peers of one context.
#[derive(Default)]
pub struct PeerTable {
    slots: Vec<PeerSlot>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Allocate a slot and build the peer with its final id.
    pub fn insert(&mut self, build: impl FnOnce(PeerId) -> Peer) -> PeerId {
        if let Some(index) = self.slots.iter().position(|s| s.peer.is_none()) {
            let slot = &mut self.slots[index];
            let id = PeerId::from_parts(index as u32, slot.generation);
            slot.peer = Some(build(id));
            return id;
        }
        let index = self.slots.len() as u32;
        let id = PeerId::from_parts(index, 1);
        self.slots.push(PeerSlot {
            generation: 1,
            peer: Some(build(id)),
        });
        id
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.peer.as_ref()
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.peer.as_mut()
    }

    /// Remove the peer and bump the slot generation so stale ids die.
    pub fn remove(&mut self, id: PeerId) -> Option<Peer> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation || slot.peer.is_none() {
            return None;
        }
        slot.generation += 1;
        slot.peer.take()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.slots.iter().filter_map(|s| s.peer.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.slots.iter_mut().filter_map(|s| s.peer.as_mut())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.peer.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve the peer a datagram came from.
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<PeerId> {
        self.iter()
            .find(|p| p.remote == Some(addr))
            .map(|p| p.id)
    }
}
