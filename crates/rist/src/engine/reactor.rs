// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The reactor: one cooperative loop per context.
//!
//! Poll wakes on socket readiness, the cross-thread waker, or the next
//! timer. Each pass drains at most 64 datagrams per socket (starvation
//! guard), fires due timers, flushes NACK-triggered retransmits, then
//! drains the application command ring. Retransmit requests picked up
//! during the socket drain are only queued there and sent after the
//! timers, so keep-alives and RTT probes always precede repairs on the
//! wire. NACKs collected during a pass are coalesced into one control
//! datagram per peer. All peer/flow/cache/window state lives here and is
//! never touched from another thread.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use mio::{Events, Interest, Poll, Token, Waker};

use super::ring::SpscRing;
use super::timer::TimerWheel;
use super::wake::WakeNotifier;
use crate::config::{
    ContextConfig, PeerConfig, NackType, OUTPUT_QUEUE_DEPTH, JITTER_QUANTUM_MS,
    MAX_DATAGRAMS_PER_PASS,
};
use crate::output::OutputScheduler;
use crate::peer::{Peer, PeerEvent, PeerId, PeerTable};
use crate::protocol::crypto::Psk;
use crate::protocol::packet::{Codec, Decoded, Packet};
use crate::protocol::{ntp, rtcp, DecodeError};
use crate::reliability::{FlowTable, HistoryCache};
use crate::stats::{stats_channel, FlowSnapshot, PeerSnapshot, StatsHandle, StatsPublisher, StatsSnapshot};
use crate::transport::udp;
use crate::{DataBlock, Error, OobBlock};

const WAKER_TOKEN: Token = Token(0);
const SOCKET_TOKEN_BASE: usize = 1;

/// Liveness/keep-alive evaluation cadence.
const PEER_TICK: Duration = Duration::from_millis(100);
/// Flow reaping cadence.
const REAP_TICK: Duration = Duration::from_secs(1);
/// Stats publication cadence.
const STATS_TICK: Duration = Duration::from_secs(1);
/// Wire overhead estimate charged to the retransmit token bucket.
const RETRANSMIT_OVERHEAD: usize = 44;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

/// Application-to-reactor commands.
pub enum Command {
    DataWrite(DataBlock),
    OobWrite(OobBlock),
    PeerDestroy(PeerId),
    Shutdown,
}

/// Auth decision callback: `(remote_ip, remote_port, local_ip, local_port,
/// peer)`; returning `false` denies the peer.
pub type ConnectCallback = Box<dyn FnMut(&str, u16, &str, u16, PeerId) -> bool + Send>;
pub type DisconnectCallback = Box<dyn FnMut(PeerId) + Send>;
pub type OobCallback = Box<dyn FnMut(&OobBlock) + Send>;

#[derive(Default)]
pub struct Callbacks {
    pub connect: Option<ConnectCallback>,
    pub disconnect: Option<DisconnectCallback>,
    pub oob: Option<OobCallback>,
}

/// Handles the application side keeps after `start()`.
#[derive(Clone)]
pub struct Shared {
    pub commands: Arc<SpscRing<Command>>,
    pub waker: Arc<Waker>,
    pub out_queue: Arc<ArrayQueue<DataBlock>>,
    pub out_notifier: Arc<WakeNotifier>,
    pub oob_queue: Arc<ArrayQueue<OobBlock>>,
    pub oob_notifier: Arc<WakeNotifier>,
    pub stats: StatsHandle,
}

struct Endpoint {
    peer: PeerId,
    socket: mio::net::UdpSocket,
    codec: Codec,
    connected: bool,
}

enum Tick {
    Release,
    Peer,
    Reap,
    Stats,
}

pub struct Core {
    role: Role,
    cfg: ContextConfig,
    flow_id: u32,
    next_seq: u32,
    poll: Poll,
    endpoints: Vec<Option<Endpoint>>,
    peers: PeerTable,
    flows: FlowTable,
    history: Option<HistoryCache>,
    output: OutputScheduler,
    callbacks: Callbacks,
    psk: Option<Psk>,
    wrr_credit: HashMap<u32, i64>,
    /// Retransmit requests collected while draining sockets; flushed
    /// after the timers so keep-alives go out first.
    pending_retransmits: Vec<(PeerId, u32)>,
    stats_pub: StatsPublisher,
    retired_lost: u64,
    retired_received: u64,
    shared: Shared,
    shutdown: bool,
}

impl Core {
    pub fn new(role: Role, cfg: ContextConfig, flow_id: u32) -> Result<Self, Error> {
        let poll = Poll::new().map_err(Error::Io)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(Error::Io)?);
        let (stats_pub, stats) = stats_channel();
        let out_queue = Arc::new(ArrayQueue::new(OUTPUT_QUEUE_DEPTH));
        let out_notifier = Arc::new(WakeNotifier::new());
        let shared = Shared {
            commands: Arc::new(SpscRing::with_capacity(OUTPUT_QUEUE_DEPTH)),
            waker,
            out_queue: out_queue.clone(),
            out_notifier: out_notifier.clone(),
            oob_queue: Arc::new(ArrayQueue::new(256)),
            oob_notifier: Arc::new(WakeNotifier::new()),
            stats,
        };
        let output = OutputScheduler::new(cfg.jitter_max, out_queue, out_notifier);
        let flows = FlowTable::new(cfg.flow_ttl, cfg.max_retries);
        Ok(Self {
            role,
            cfg,
            flow_id,
            next_seq: 0,
            poll,
            endpoints: Vec::new(),
            peers: PeerTable::new(),
            flows,
            history: None,
            output,
            callbacks: Callbacks::default(),
            psk: None,
            wrr_credit: HashMap::new(),
            pending_retransmits: Vec::new(),
            stats_pub,
            retired_lost: 0,
            retired_received: 0,
            shared,
            shutdown: false,
        })
    }

    pub fn shared(&self) -> Shared {
        self.shared.clone()
    }

    pub fn callbacks_mut(&mut self) -> &mut Callbacks {
        &mut self.callbacks
    }

    pub fn config_mut(&mut self) -> &mut ContextConfig {
        &mut self.cfg
    }

    pub fn flow_id(&self) -> u32 {
        self.flow_id
    }

    /// Install the pre-shared key on the context and every endpoint codec.
    pub fn set_psk(&mut self, psk: Option<Psk>) {
        self.psk = psk;
        for ep in self.endpoints.iter_mut().flatten() {
            ep.codec.set_psk(self.psk.clone());
        }
    }

    pub fn set_compression_level(&mut self, level: u8) {
        self.cfg.compression_level = level;
        for ep in self.endpoints.iter_mut().flatten() {
            ep.codec.set_compression_level(level);
        }
    }

    pub fn set_jitter_max(&mut self, jitter: Duration) {
        self.cfg.jitter_max = jitter;
        self.output.set_jitter_max(jitter);
    }

    pub fn set_session_timeout(&mut self, timeout: Duration) {
        self.cfg.session_timeout = timeout;
        let keepalive = self.cfg.keepalive_interval;
        for p in self.peers.iter_mut() {
            p.set_timeouts(timeout, keepalive);
        }
    }

    pub fn set_keepalive_interval(&mut self, interval: Duration) {
        self.cfg.keepalive_interval = interval;
        let session = self.cfg.session_timeout;
        for p in self.peers.iter_mut() {
            p.set_timeouts(session, interval);
        }
    }

    pub fn set_data_callback(&mut self, cb: Option<crate::output::DataCallback>) {
        self.output.set_callback(cb);
    }

    pub fn set_notify_fd(&mut self, fd: Option<i32>) {
        self.output.set_notify_fd(fd);
    }

    /// Create a peer and its endpoint socket (setup phase).
    pub fn peer_create(&mut self, config: &PeerConfig, now: Instant) -> Result<PeerId, Error> {
        config.validate()?;
        let mut addr = udp::resolve(&config.address).map_err(Error::Io)?;

        let (socket, connected, local, remote) = match self.role {
            Role::Sender => {
                if self.cfg.profile.uses_gre() && config.gre_dst_port != 0 {
                    addr.set_port(config.gre_dst_port);
                }
                let socket = udp::connect(addr).map_err(Error::Io)?;
                let local = socket.local_addr().map_err(Error::Io)?;
                (socket, true, local, Some(addr))
            }
            Role::Receiver => {
                let socket = udp::bind(addr).map_err(Error::Io)?;
                let local = socket.local_addr().map_err(Error::Io)?;
                (socket, false, local, None)
            }
        };

        if self.role == Role::Sender && self.history.is_none() {
            let capacity = HistoryCache::capacity_for(
                config.recovery_maxbitrate,
                config.recovery_length_max_ms(),
            );
            self.history = Some(HistoryCache::new(
                capacity,
                config.recovery_length_max_duration(),
                self.cfg.max_retries,
            ));
        }

        let requires_auth = self.callbacks.connect.is_some();
        let session_timeout = self.cfg.session_timeout;
        let keepalive = self.cfg.keepalive_interval;
        let cfg_clone = config.clone();
        let peer = self.peers.insert(|id| {
            Peer::new(
                id,
                cfg_clone,
                local,
                remote,
                session_timeout,
                keepalive,
                requires_auth,
                now,
            )
        });

        let mut codec = Codec::new(self.cfg.profile, self.cfg.payload_type);
        codec.set_psk(self.psk.clone());
        codec.set_compression_level(self.cfg.compression_level);

        let slot = self.endpoints.len();
        let mut socket = socket;
        self.poll
            .registry()
            .register(
                &mut socket,
                Token(SOCKET_TOKEN_BASE + slot),
                Interest::READABLE,
            )
            .map_err(Error::Io)?;
        self.endpoints.push(Some(Endpoint {
            peer,
            socket,
            codec,
            connected,
        }));
        log::info!("[engine] created {} for {}", peer, config.address);
        Ok(peer)
    }

    /// Destroy a peer: mark DEAD, fire the disconnect callback if owed,
    /// drop its endpoint.
    pub fn peer_destroy(&mut self, id: PeerId) -> Result<(), Error> {
        let Some(peer) = self.peers.get_mut(id) else {
            return Err(Error::InvalidPeer);
        };
        let notify = peer.kill();
        if notify {
            if let Some(cb) = self.callbacks.disconnect.as_mut() {
                cb(id);
            }
        }
        for slot in self.endpoints.iter_mut() {
            if slot.as_ref().is_some_and(|ep| ep.peer == id) {
                if let Some(mut ep) = slot.take() {
                    let _ = self.poll.registry().deregister(&mut ep.socket);
                }
            }
        }
        self.peers.remove(id);
        log::info!("[engine] destroyed {}", id);
        Ok(())
    }

    /// Kick every configured peer into its handshake.
    pub fn start_peers(&mut self, now: Instant) {
        let ids: Vec<PeerId> = self.peers.iter().map(|p| p.id).collect();
        for id in ids {
            let events = match self.peers.get_mut(id) {
                Some(p) => p.start(now),
                None => continue,
            };
            self.process_peer_events(id, events, now);
        }
    }

    /// Reactor entry point; returns when a shutdown command arrives.
    pub fn run(mut self) {
        let mut events = Events::with_capacity(256);
        let mut buf = vec![0u8; 65536];
        let mut wheel: TimerWheel<Tick> = TimerWheel::new(Instant::now());
        let now = Instant::now();
        wheel.schedule_after(now, Duration::from_millis(JITTER_QUANTUM_MS), Tick::Release);
        wheel.schedule_after(now, PEER_TICK, Tick::Peer);
        wheel.schedule_after(now, REAP_TICK, Tick::Reap);
        wheel.schedule_after(now, STATS_TICK, Tick::Stats);

        log::info!("[engine] reactor running ({:?})", self.role);
        while !self.shutdown {
            let now = Instant::now();
            let timeout = wheel
                .next_deadline()
                .map(|d| d.saturating_duration_since(now))
                .unwrap_or(Duration::from_millis(JITTER_QUANTUM_MS));
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("[engine] poll failed: {}", e);
                break;
            }

            let now = Instant::now();
            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {} // command ring drained below
                    Token(t) if t >= SOCKET_TOKEN_BASE => {
                        self.drain_socket(t - SOCKET_TOKEN_BASE, &mut buf, now);
                    }
                    _ => {}
                }
            }

            for tick in wheel.expire(now) {
                match tick {
                    Tick::Release => {
                        self.release_tick(now);
                        wheel.schedule_after(
                            now,
                            Duration::from_millis(JITTER_QUANTUM_MS),
                            Tick::Release,
                        );
                    }
                    Tick::Peer => {
                        self.peer_tick(now);
                        wheel.schedule_after(now, PEER_TICK, Tick::Peer);
                    }
                    Tick::Reap => {
                        self.reap_tick(now);
                        wheel.schedule_after(now, REAP_TICK, Tick::Reap);
                    }
                    Tick::Stats => {
                        self.publish_stats();
                        wheel.schedule_after(now, STATS_TICK, Tick::Stats);
                    }
                }
            }

            self.flush_retransmits(now);
            self.drain_commands(now);
        }
        log::info!("[engine] reactor stopped");
    }

    // ---- receive path -----------------------------------------------------

    fn drain_socket(&mut self, idx: usize, buf: &mut [u8], now: Instant) {
        for _ in 0..MAX_DATAGRAMS_PER_PASS {
            let recv = match self.endpoints.get_mut(idx).and_then(Option::as_mut) {
                Some(ep) => ep.socket.recv_from(buf),
                None => return,
            };
            match recv {
                Ok((len, from)) => self.handle_datagram(idx, len, from, buf, now),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    // Transient (ICMP port unreachable surfaces here); the
                    // peer liveness machinery decides what it means.
                    log::debug!("[engine] recv error on endpoint {}: {}", idx, e);
                    return;
                }
            }
        }
    }

    fn handle_datagram(
        &mut self,
        idx: usize,
        len: usize,
        from: std::net::SocketAddr,
        buf: &[u8],
        now: Instant,
    ) {
        let (pid, decoded) = {
            let Some(ep) = self.endpoints.get_mut(idx).and_then(Option::as_mut) else {
                return;
            };
            (ep.peer, ep.codec.decode(&buf[..len]))
        };

        let decoded = match decoded {
            Ok(d) => d,
            Err(err) => {
                // Malformed traffic neither resets liveness nor teaches a
                // listening endpoint its remote address.
                if let Some(peer) = self.peers.get_mut(pid) {
                    match err {
                        DecodeError::EncryptedNoKey => peer.stats.decrypt_fail += 1,
                        _ => peer.stats.decode_errors += 1,
                    }
                }
                log::debug!("[engine] dropped datagram from {}: {}", from, err);
                return;
            }
        };

        // Any decodable datagram from the peer resets the keep-alive timer
        // and may advance the handshake.
        let events = match self.peers.get_mut(pid) {
            Some(peer) => {
                peer.stats.received += 1;
                peer.on_packet_rx(from, now)
            }
            None => return,
        };
        self.process_peer_events(pid, events, now);

        match decoded {
            Decoded::Data(pkt) => self.handle_data(pid, pkt, now),
            Decoded::Control(packets) => {
                for packet in packets {
                    self.handle_control(pid, packet, now);
                }
            }
        }
    }

    fn handle_data(&mut self, pid: PeerId, pkt: Packet, now: Instant) {
        if self.role != Role::Receiver {
            // Data at a sender is a protocol violation; count and drop.
            if let Some(peer) = self.peers.get_mut(pid) {
                peer.stats.decode_errors += 1;
            }
            return;
        }
        let Some(peer) = self.peers.get(pid) else {
            return;
        };
        if !peer.accepts_data() {
            return;
        }
        if self.flows.get(pkt.flow_id).is_none() {
            let cfg = peer.config.clone();
            self.flows.flow_for(pkt.flow_id, &cfg, now);
        }
        let Some(flow) = self.flows.get_mut(pkt.flow_id) else {
            return;
        };
        flow.on_data(
            pid,
            pkt.seq,
            pkt.ts_ntp,
            pkt.virt_src_port,
            pkt.virt_dst_port,
            pkt.payload,
            pkt.retransmission,
            now,
        );
    }

    fn handle_control(&mut self, pid: PeerId, packet: rtcp::ControlPacket, now: Instant) {
        match packet {
            rtcp::ControlPacket::SenderReport(sr) => {
                if let Some(peer) = self.peers.get_mut(pid) {
                    peer.record_sr(sr.ntp, now);
                }
            }
            rtcp::ControlPacket::ReceiverReport(rr) => {
                if let Some(peer) = self.peers.get_mut(pid) {
                    peer.on_rr_echo(rr.last_sr, rr.delay_since_last_sr, ntp::now());
                }
            }
            rtcp::ControlPacket::Sdes(sdes) => {
                if let Some(peer) = self.peers.get_mut(pid) {
                    peer.cname_remote = Some(sdes.cname);
                }
            }
            rtcp::ControlPacket::Nack { payload, .. } => {
                let seqs = payload.sequences();
                self.serve_nacks(pid, &seqs);
            }
            rtcp::ControlPacket::Oob { data } => {
                let block = OobBlock {
                    peer: Some(pid),
                    payload: data,
                    ts_ntp: ntp::now(),
                };
                if let Some(cb) = self.callbacks.oob.as_mut() {
                    cb(&block);
                } else {
                    let _ = self.shared.oob_queue.force_push(block);
                    self.shared.oob_notifier.notify();
                }
            }
            rtcp::ControlPacket::Auth { .. } => {
                // Key possession is proven by the payload cipher; the AUTH
                // carriage is tolerated for interop and otherwise ignored.
                log::debug!("[engine] ignored AUTH packet from {}", pid);
            }
        }
    }

    /// Sender side: queue NACKed sequences for repair. The actual sends
    /// happen in `flush_retransmits`, after the timer pass, so keep-alives
    /// and RTT probes take precedence on the wire.
    fn serve_nacks(&mut self, pid: PeerId, seqs: &[u32]) {
        if self.role != Role::Sender {
            return;
        }
        for &s in seqs {
            if let Some(peer) = self.peers.get_mut(pid) {
                peer.stats.nacks_rx += 1;
            }
            self.pending_retransmits.push((pid, s));
        }
    }

    /// Answer queued NACKs from the history cache.
    fn flush_retransmits(&mut self, now: Instant) {
        if self.pending_retransmits.is_empty() {
            return;
        }
        let requests = std::mem::take(&mut self.pending_retransmits);
        for (pid, s) in requests {
            let entry = match self.history.as_ref().and_then(|h| h.get(s, now)) {
                Some(e) => (e.seq, e.ts_ntp, e.virt_src_port, e.virt_dst_port, e.payload.clone()),
                None => continue, // aged out or never sent
            };

            // Retry cap, then return-bandwidth cap; both drop silently.
            let allowed = self
                .history
                .as_mut()
                .map(|h| h.note_retransmit(s, pid))
                .unwrap_or(false);
            if !allowed {
                if let Some(peer) = self.peers.get_mut(pid) {
                    peer.stats.suppressed_retransmits += 1;
                }
                continue;
            }
            let cost = (entry.4.len() + RETRANSMIT_OVERHEAD) as u64;
            let budget_ok = self
                .peers
                .get_mut(pid)
                .map(|p| p.return_bucket().try_consume(cost, now))
                .unwrap_or(false);
            if !budget_ok {
                if let Some(peer) = self.peers.get_mut(pid) {
                    peer.stats.suppressed_retransmits += 1;
                }
                continue;
            }

            let mut pkt = Packet::data(entry.0, self.flow_id, entry.1, entry.4);
            pkt.virt_src_port = entry.2;
            pkt.virt_dst_port = entry.3;
            pkt.retransmission = true;
            self.send_data_to(pid, &pkt);
            if let Some(peer) = self.peers.get_mut(pid) {
                peer.stats.retransmitted += 1;
            }
        }
    }

    // ---- timers -----------------------------------------------------------

    fn release_tick(&mut self, now: Instant) {
        // Per-turn NACK coalescing: flow -> (repair peer, seqs), merged
        // into one control datagram per peer.
        let mut per_peer: HashMap<PeerId, Vec<(u32, Vec<u32>)>> = HashMap::new();
        let mut released: Vec<(u32, Vec<crate::reliability::HeldPacket>)> = Vec::new();

        let flow_ids: Vec<u32> = self.flows.iter().map(|f| f.id).collect();
        for flow_id in flow_ids {
            let repair = self.repair_peer_for(flow_id);
            let rtt = repair
                .and_then(|id| self.peers.get(id))
                .map(|p| p.rtt_ms())
                .unwrap_or(0);
            let Some(flow) = self.flows.get_mut(flow_id) else {
                continue;
            };
            let tick = flow.tick(now, rtt);
            if !tick.ready.is_empty() {
                released.push((flow_id, tick.ready));
            }
            if !tick.nacks.is_empty() {
                if let Some(peer) = repair {
                    per_peer.entry(peer).or_default().push((flow_id, tick.nacks));
                } else {
                    log::debug!(
                        "[engine] no repair peer for flow {:#010x}, {} gaps wait",
                        flow_id,
                        tick.nacks.len()
                    );
                }
            }
        }

        let fallback = ntp::now();
        for (flow_id, ready) in released {
            for pkt in ready {
                self.output.push(flow_id, pkt, fallback);
            }
        }
        self.output.drain_due(now);

        for (peer, flows) in per_peer {
            self.send_nacks(peer, &flows);
        }
    }

    /// Lowest-RTT live contributor with non-zero weight.
    fn repair_peer_for(&self, flow_id: u32) -> Option<PeerId> {
        let flow = self.flows.get(flow_id)?;
        crate::reliability::flow::repair_peer(flow, &self.peers)
    }

    fn send_nacks(&mut self, pid: PeerId, flows: &[(u32, Vec<u32>)]) {
        let mut control = Vec::new();
        let mut total = 0u64;
        for (flow_id, seqs) in flows {
            let payload = match self.cfg.nack_type {
                NackType::Range => rtcp::NackPayload::Range(rtcp::build_ranges(seqs)),
                NackType::Bitmask => rtcp::NackPayload::Bitmask(rtcp::build_bitmasks(seqs)),
            };
            rtcp::encode_nack(*flow_id, &payload, &mut control);
            total += seqs.len() as u64;
        }
        self.send_control_to(pid, &control);
        if let Some(peer) = self.peers.get_mut(pid) {
            peer.stats.nacks_tx += total;
        }
    }

    fn peer_tick(&mut self, now: Instant) {
        let ids: Vec<PeerId> = self.peers.iter().map(|p| p.id).collect();
        for id in ids {
            let events = match self.peers.get_mut(id) {
                Some(p) => p.tick(now),
                None => continue,
            };
            self.process_peer_events(id, events, now);
        }
    }

    fn reap_tick(&mut self, now: Instant) {
        for (_, counters) in self.flows.reap(now) {
            self.retired_lost += counters.lost;
            self.retired_received += counters.received;
        }
    }

    fn publish_stats(&self) {
        let peers = self
            .peers
            .iter()
            .map(|p| PeerSnapshot {
                peer_index: p.id.index(),
                remote: p.remote,
                state: p.state(),
                rtt_ms: p.rtt_ms(),
                stats: p.stats,
            })
            .collect();
        let flows = self
            .flows
            .iter()
            .map(|f| {
                FlowSnapshot::from_counters(
                    f.id,
                    f.counters(),
                    f.nacks_sent_total(),
                    f.expected_seq(),
                    f.occupancy(),
                )
            })
            .collect();
        self.stats_pub.publish(StatsSnapshot {
            peers,
            flows,
            retired_lost: self.retired_lost,
            retired_received: self.retired_received,
            queue_overflow: self.output.overflow(),
            generated_at_ntp: ntp::now(),
        });
    }

    // ---- peer events & keep-alives ----------------------------------------

    fn process_peer_events(&mut self, pid: PeerId, events: Vec<PeerEvent>, now: Instant) {
        for event in events {
            match event {
                PeerEvent::SendKeepalive => self.send_keepalive(pid, now),
                PeerEvent::AuthPending => {
                    let decision = self.run_auth_callback(pid);
                    let follow_up = match self.peers.get_mut(pid) {
                        Some(p) => p.authorize(decision),
                        None => continue,
                    };
                    if !decision {
                        log::warn!("[engine] {} denied by auth handler", pid);
                    }
                    self.process_peer_events(pid, follow_up, now);
                }
                PeerEvent::Connected => {
                    log::info!("[engine] {} connected", pid);
                }
                PeerEvent::Restored => {}
                PeerEvent::WentDying => {}
                PeerEvent::WentDead => {
                    if let Some(cb) = self.callbacks.disconnect.as_mut() {
                        cb(pid);
                    }
                }
            }
        }
    }

    fn run_auth_callback(&mut self, pid: PeerId) -> bool {
        let Some(peer) = self.peers.get(pid) else {
            return false;
        };
        let (remote_ip, remote_port) = match peer.remote {
            Some(addr) => (addr.ip().to_string(), addr.port()),
            None => (String::new(), 0),
        };
        let (local_ip, local_port) = (peer.local.ip().to_string(), peer.local.port());
        match self.callbacks.connect.as_mut() {
            Some(cb) => cb(&remote_ip, remote_port, &local_ip, local_port, pid),
            None => true,
        }
    }

    fn send_keepalive(&mut self, pid: PeerId, now: Instant) {
        let Some(peer) = self.peers.get(pid) else {
            return;
        };
        if peer.remote.is_none() {
            // Receiver endpoint that has not seen the sender yet.
            return;
        }
        let ssrc = self.flow_id;
        let ntp_now = ntp::now();
        let sr = rtcp::SenderReport {
            ssrc,
            ntp: ntp_now,
            rtp_ts: ntp::to_rtp(ntp_now),
            packet_count: peer.stats.sent as u32,
            octet_count: 0,
        };
        let echo = peer.rr_echo(now);
        let cname = self.cfg.cname.clone();

        let mut control = Vec::new();
        rtcp::encode_sender_report(&sr, &mut control);
        if let Some((last_sr, dlsr)) = echo {
            rtcp::encode_receiver_report(
                &rtcp::ReceiverReport {
                    ssrc,
                    source_ssrc: 0,
                    fraction_lost: 0,
                    cumulative_lost: 0,
                    highest_seq: 0,
                    jitter: 0,
                    last_sr,
                    delay_since_last_sr: dlsr,
                },
                &mut control,
            );
        }
        rtcp::encode_sdes(&rtcp::SdesCname { ssrc, cname }, &mut control);
        self.send_control_to(pid, &control);
    }

    // ---- send path --------------------------------------------------------

    fn drain_commands(&mut self, now: Instant) {
        while let Some(cmd) = self.shared.commands.pop() {
            match cmd {
                Command::DataWrite(block) => self.handle_data_write(block, now),
                Command::OobWrite(block) => self.handle_oob_write(block),
                Command::PeerDestroy(id) => {
                    let _ = self.peer_destroy(id);
                }
                Command::Shutdown => {
                    self.shutdown = true;
                }
            }
        }
    }

    fn handle_data_write(&mut self, block: DataBlock, now: Instant) {
        if self.role != Role::Sender {
            return;
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let ts_ntp = if block.ts_ntp != 0 {
            block.ts_ntp
        } else {
            ntp::now()
        };

        if let Some(history) = self.history.as_mut() {
            history.put(
                seq,
                now,
                ts_ntp,
                block.virt_src_port,
                block.virt_dst_port,
                block.payload.clone(),
            );
        }

        let mut pkt = Packet::data(seq, self.flow_id, ts_ntp, block.payload);
        pkt.virt_src_port = block.virt_src_port;
        pkt.virt_dst_port = block.virt_dst_port;

        let targets = match block.peer {
            Some(peer) => vec![peer],
            None => self.data_targets(),
        };
        for pid in targets {
            self.send_data_to(pid, &pkt);
            if let Some(peer) = self.peers.get_mut(pid) {
                peer.stats.sent += 1;
            }
        }
    }

    /// Zero-weight peers get every packet; weighted peers share the load
    /// by smooth weighted round-robin.
    fn data_targets(&mut self) -> Vec<PeerId> {
        let mut targets: Vec<PeerId> = Vec::new();
        let mut weighted: Vec<(PeerId, u32)> = Vec::new();
        for p in self.peers.iter() {
            if !p.accepts_data() {
                continue;
            }
            if p.config.weight == 0 {
                targets.push(p.id);
            } else {
                weighted.push((p.id, p.config.weight));
            }
        }
        if !weighted.is_empty() {
            let total: i64 = weighted.iter().map(|(_, w)| i64::from(*w)).sum();
            let mut best: Option<(PeerId, i64)> = None;
            for (id, w) in &weighted {
                let credit = self.wrr_credit.entry(id.index()).or_insert(0);
                *credit += i64::from(*w);
                if best.is_none() || *credit > best.map(|(_, c)| c).unwrap_or(i64::MIN) {
                    best = Some((*id, *credit));
                }
            }
            if let Some((chosen, _)) = best {
                if let Some(c) = self.wrr_credit.get_mut(&chosen.index()) {
                    *c -= total;
                }
                targets.push(chosen);
            }
        }
        targets
    }

    fn handle_oob_write(&mut self, block: OobBlock) {
        let mut control = Vec::new();
        rtcp::encode_oob(self.flow_id, &block.payload, &mut control);
        let targets = match block.peer {
            Some(peer) => vec![peer],
            None => self
                .peers
                .iter()
                .filter(|p| p.accepts_data())
                .map(|p| p.id)
                .take(1)
                .collect(),
        };
        for pid in targets {
            self.send_control_to(pid, &control);
        }
    }

    fn endpoint_index_of(&self, pid: PeerId) -> Option<usize> {
        self.endpoints
            .iter()
            .position(|ep| ep.as_ref().is_some_and(|ep| ep.peer == pid))
    }

    fn send_data_to(&mut self, pid: PeerId, pkt: &Packet) {
        let Some(idx) = self.endpoint_index_of(pid) else {
            return;
        };
        let remote = self.peers.get(pid).and_then(|p| p.remote);
        let Some(ep) = self.endpoints.get_mut(idx).and_then(Option::as_mut) else {
            return;
        };
        let mut wire = Vec::with_capacity(pkt.payload.len() + 64);
        ep.codec.encode_data(pkt, &mut wire);
        Self::send_wire(ep, remote, &wire);
    }

    fn send_control_to(&mut self, pid: PeerId, control: &[u8]) {
        if control.is_empty() {
            return;
        }
        let Some(idx) = self.endpoint_index_of(pid) else {
            return;
        };
        let remote = self.peers.get(pid).and_then(|p| p.remote);
        let Some(ep) = self.endpoints.get_mut(idx).and_then(Option::as_mut) else {
            return;
        };
        let mut wire = Vec::with_capacity(control.len() + 24);
        ep.codec.encode_control(0, 0, control, &mut wire);
        Self::send_wire(ep, remote, &wire);
    }

    fn send_wire(ep: &mut Endpoint, remote: Option<std::net::SocketAddr>, wire: &[u8]) {
        let result = if ep.connected {
            ep.socket.send(wire)
        } else {
            match remote {
                Some(addr) => ep.socket.send_to(wire, addr),
                None => return,
            }
        };
        match result {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // UDP send buffers full: the packet is gone, repairs cover it.
                log::debug!("[engine] send would block, datagram dropped");
            }
            Err(e) => log::debug!("[engine] send failed: {}", e),
        }
    }
}
