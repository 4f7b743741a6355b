// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # RIST - Reliable Internet Stream Transport
//!
//! A pure Rust implementation of a RIST endpoint library: bidirectional,
//! loss-tolerant transport of MPEG-TS or arbitrary datagrams over UDP with
//! selective retransmission, optional GRE tunneling, AES-128/256 link
//! encryption, and NACK-driven repair inside a bounded reordering buffer.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use rist::{Receiver, Sender, Profile, LogLevel, PeerConfig, DataBlock};
//!
//! // Receiver listens; the sender's address is learned on first contact.
//! let mut rx = Receiver::new(Profile::Main, LogLevel::Info)?;
//! rx.peer_create(&PeerConfig {
//!     address: "0.0.0.0:1968".to_string(),
//!     recovery_length_max: 200,
//!     ..PeerConfig::default()
//! })?;
//! rx.start()?;
//!
//! let mut tx = Sender::new(Profile::Main, 0, LogLevel::Info)?;
//! tx.peer_create(&PeerConfig {
//!     address: "127.0.0.1:1968".to_string(),
//!     ..PeerConfig::default()
//! })?;
//! tx.start()?;
//!
//! tx.data_write(DataBlock::new(vec![0u8; 1316]))?;
//! if let Some(block) = rx.data_read(Duration::from_millis(100))? {
//!     assert_eq!(block.payload.len(), 1316);
//! }
//! # Ok::<(), rist::Error>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Application Layer                           |
//! |      Sender / Receiver contexts, data & OOB queues, callbacks      |
//! +--------------------------------------------------------------------+
//! |                           Engine                                   |
//! |   One reactor thread per context: sockets, timer wheel, rings      |
//! +--------------------------------------------------------------------+
//! |                         Reliability                                |
//! |   History cache | Reassembly windows | NACK scheduler | Flows      |
//! +--------------------------------------------------------------------+
//! |                          Protocol                                  |
//! |   RTP / GRE framing | RTCP control | AES-CTR | LZ4 | seq math      |
//! +--------------------------------------------------------------------+
//! ```
//!
//! All transport state is owned by the reactor thread; application
//! threads communicate exclusively through lock-free rings and bounded
//! queues. Setup-time errors surface as [`Error`]; data-path problems are
//! counted in [`stats::StatsSnapshot`] and never interrupt the stream.

pub mod config;
pub mod congestion;
pub mod engine;
pub mod logging;
pub mod output;
pub mod peer;
pub mod protocol;
pub mod reliability;
pub mod stats;
pub mod transport;

mod context;
mod receiver;
mod sender;

pub use config::{
    BufferBloatMode, LogLevel, NackType, PeerConfig, Profile, RecoveryMode, PEER_CONFIG_VERSION,
};
pub use peer::{PeerId, PeerState};
pub use protocol::crypto::KeySize;
pub use receiver::Receiver;
pub use sender::Sender;
pub use stats::StatsSnapshot;

/// One block of application data crossing the API.
///
/// On `data_write`, `ts_ntp` 0 is stamped by the library and `peer`
/// restricts the write to one peer (otherwise weighted distribution
/// applies). On `data_read`, `seq`/`flow_id`/`retransmitted` describe how
/// the block travelled.
#[derive(Debug, Clone, Default)]
pub struct DataBlock {
    pub payload: Vec<u8>,
    /// NTP 64-bit timestamp; 0 means "let the library stamp it".
    pub ts_ntp: u64,
    /// Virtual ports (GRE profiles only).
    pub virt_src_port: u16,
    pub virt_dst_port: u16,
    pub flow_id: u32,
    pub seq: u32,
    pub peer: Option<PeerId>,
    pub retransmitted: bool,
}

impl DataBlock {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }
}

/// One out-of-band block (application side channel between peers).
#[derive(Debug, Clone, Default)]
pub struct OobBlock {
    /// Target peer on write (None = first active); source peer on read.
    pub peer: Option<PeerId>,
    pub payload: Vec<u8>,
    pub ts_ntp: u64,
}

impl OobBlock {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }
}

/// Setup-time and API-boundary errors.
///
/// Transport-level problems (malformed packets, loss, late repairs) never
/// surface here: they are dropped, counted, and visible in the stats.
#[derive(Debug)]
pub enum Error {
    /// Rejected configuration (bad option combination, bad value).
    ConfigInvalid(String),
    /// Peer address did not resolve or the endpoint socket failed.
    PeerUnreachable(String),
    /// Stale or foreign peer handle.
    InvalidPeer,
    /// Operation requires `start()` first.
    NotStarted,
    /// Operation is only valid before `start()`.
    AlreadyStarted,
    /// Command or write queue is full; retry after draining.
    QueueFull,
    /// Peer was denied by the authentication handler.
    AuthDenied,
    /// Underlying socket or thread error.
    Io(std::io::Error),
    /// Unrecoverable internal state; destroy the context.
    Fatal(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigInvalid(msg) => write!(f, "invalid configuration: {msg}"),
            Self::PeerUnreachable(msg) => write!(f, "peer unreachable: {msg}"),
            Self::InvalidPeer => write!(f, "invalid or stale peer handle"),
            Self::NotStarted => write!(f, "context not started"),
            Self::AlreadyStarted => write!(f, "context already started"),
            Self::QueueFull => write!(f, "queue full"),
            Self::AuthDenied => write!(f, "authentication denied"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
