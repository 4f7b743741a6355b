// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Context and peer configuration.
//!
//! Peer options mirror the public peer-config surface: recovery sizing,
//! RTT clamps, NACK reorder delay, multi-peer weight, and the buffer-bloat
//! policy. Validation happens once at `peer_create`; the data path never
//! re-checks configuration.

use std::time::Duration;

use crate::Error;

/// Peer-config structure revision accepted by `peer_create`.
pub const PEER_CONFIG_VERSION: u32 = 0;

/// Default session timeout before a peer starts DYING (ms).
pub const SESSION_TIMEOUT_DEFAULT_MS: u64 = 6_000;
/// Default keep-alive cadence (ms).
pub const KEEPALIVE_INTERVAL_DEFAULT_MS: u64 = 1_000;
/// Output scheduler tick and default jitter horizon (ms).
pub const JITTER_QUANTUM_MS: u64 = 5;
/// Retransmit attempts per sequence before giving up.
pub const MAX_RETRIES_DEFAULT: u32 = 7;
/// Depth of the application-facing output queue.
pub const OUTPUT_QUEUE_DEPTH: usize = 1024;
/// Datagrams drained per socket per reactor pass (starvation guard).
pub const MAX_DATAGRAMS_PER_PASS: usize = 64;
/// Idle time after which an inactive flow is reaped (ms).
pub const FLOW_TTL_DEFAULT_MS: u64 = 30_000;
/// Floor for the reassembly window slot count.
pub const WINDOW_SIZE_MIN: usize = 1024;
/// Assumed payload size when sizing windows from a bitrate.
pub const AVG_PACKET_SIZE: usize = 1316;

/// RIST interoperability profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Simple,
    Main,
    Advanced,
}

impl Profile {
    /// GRE-framed profiles carry virtual ports, encryption, compression.
    pub fn uses_gre(self) -> bool {
        !matches!(self, Self::Simple)
    }
}

/// How the retransmission history is sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryMode {
    /// Inherit the context defaults.
    #[default]
    Unconfigured,
    /// No history, no NACKs.
    Disabled,
    /// History sized by `recovery_maxbitrate` alone.
    Bytes,
    /// History sized by `recovery_length_max` x `recovery_maxbitrate`.
    Time,
}

/// Reaction when the reassembly buffer keeps growing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferBloatMode {
    #[default]
    Off,
    /// Shrink the recovery window by 10% per trigger.
    Normal,
    /// Also jump `expected_seq` to the oldest held packet.
    Aggressive,
}

/// NACK encoding selected per receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NackType {
    #[default]
    Range,
    Bitmask,
}

/// Log verbosity, matching the original numeric levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Quiet,
    Info,
    Error,
    Warn,
    Debug,
    Simulate,
}

impl LogLevel {
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            Self::Quiet => log::LevelFilter::Off,
            Self::Error => log::LevelFilter::Error,
            Self::Warn => log::LevelFilter::Warn,
            Self::Info => log::LevelFilter::Info,
            Self::Debug | Self::Simulate => log::LevelFilter::Debug,
        }
    }
}

/// Per-peer endpoint configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub version: u32,
    /// Remote (sender role) or local listen (receiver role) `host:port`.
    pub address: String,
    /// UDP port for main-profile GRE traffic; 0 uses the address port.
    pub gre_dst_port: u16,
    pub recovery_mode: RecoveryMode,
    /// Nominal stream bitrate in bits per second, sizes the history.
    pub recovery_maxbitrate: u32,
    /// Retransmission bandwidth cap in bits per second.
    pub recovery_maxbitrate_return: u32,
    /// Reassembly hold floor in ms.
    pub recovery_length_min: u32,
    /// Reassembly hold ceiling in ms.
    pub recovery_length_max: u32,
    /// Delay before first NACK for a gap, in ms.
    pub recovery_reorder_buffer: u32,
    /// RTT clamp floor in ms.
    pub recovery_rtt_min: u32,
    /// RTT clamp ceiling in ms.
    pub recovery_rtt_max: u32,
    /// Multi-peer distribution weight; 0 excludes the peer from NACK
    /// routing and duplicates data to it.
    pub weight: u32,
    pub buffer_bloat_mode: BufferBloatMode,
    /// Soft occupancy threshold in window slots.
    pub buffer_bloat_limit: u32,
    /// Flush-now occupancy threshold in window slots.
    pub buffer_bloat_hard_limit: u32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            version: PEER_CONFIG_VERSION,
            address: String::new(),
            gre_dst_port: 0,
            recovery_mode: RecoveryMode::Time,
            recovery_maxbitrate: 100_000_000,
            recovery_maxbitrate_return: 10_000_000,
            recovery_length_min: 1_000,
            recovery_length_max: 1_000,
            recovery_reorder_buffer: 25,
            recovery_rtt_min: 50,
            recovery_rtt_max: 500,
            weight: 5,
            buffer_bloat_mode: BufferBloatMode::Off,
            buffer_bloat_limit: 6_000,
            buffer_bloat_hard_limit: 20_000,
        }
    }
}

impl PeerConfig {
    /// Reject inconsistent options before any peer state is created.
    pub fn validate(&self) -> Result<(), Error> {
        if self.version != PEER_CONFIG_VERSION {
            return Err(Error::ConfigInvalid(format!(
                "unsupported peer config version {}",
                self.version
            )));
        }
        if self.address.is_empty() {
            return Err(Error::ConfigInvalid("peer address is empty".to_string()));
        }
        if self.recovery_length_min > self.recovery_length_max {
            return Err(Error::ConfigInvalid(format!(
                "recovery_length_min {} > recovery_length_max {}",
                self.recovery_length_min, self.recovery_length_max
            )));
        }
        if self.recovery_rtt_min > self.recovery_rtt_max {
            return Err(Error::ConfigInvalid(format!(
                "recovery_rtt_min {} > recovery_rtt_max {}",
                self.recovery_rtt_min, self.recovery_rtt_max
            )));
        }
        if self.recovery_mode != RecoveryMode::Disabled && self.recovery_maxbitrate == 0 {
            return Err(Error::ConfigInvalid(
                "recovery_maxbitrate must be non-zero".to_string(),
            ));
        }
        if self.buffer_bloat_mode != BufferBloatMode::Off
            && self.buffer_bloat_limit >= self.buffer_bloat_hard_limit
        {
            return Err(Error::ConfigInvalid(format!(
                "buffer_bloat_limit {} must be below hard limit {}",
                self.buffer_bloat_limit, self.buffer_bloat_hard_limit
            )));
        }
        Ok(())
    }

    /// Recovery floor in ms. TIME mode reads `recovery_length_min` as
    /// milliseconds; BYTES mode reads it as a byte budget drained at
    /// `recovery_maxbitrate`.
    pub fn recovery_length_min_ms(&self) -> u32 {
        self.length_to_ms(self.recovery_length_min)
    }

    /// Recovery ceiling in ms (same unit rule as the floor).
    pub fn recovery_length_max_ms(&self) -> u32 {
        self.length_to_ms(self.recovery_length_max)
    }

    fn length_to_ms(&self, length: u32) -> u32 {
        match self.recovery_mode {
            RecoveryMode::Bytes => {
                let bitrate = self.recovery_maxbitrate.max(1);
                ((u64::from(length) * 8 * 1000) / u64::from(bitrate)).max(1) as u32
            }
            _ => length,
        }
    }

    pub fn recovery_length_min_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.recovery_length_min_ms()))
    }

    pub fn recovery_length_max_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.recovery_length_max_ms()))
    }
}

/// Context-wide options shared by sender and receiver roles.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub profile: Profile,
    /// Flow id for the sender role; 0 lets the library generate one.
    pub flow_id: u32,
    pub log_level: LogLevel,
    pub cname: String,
    pub session_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Sender: pacing quantum. Receiver: output smoothing horizon.
    pub jitter_max: Duration,
    pub nack_type: NackType,
    /// 0 disables LZ4; 1-10 select the effort level.
    pub compression_level: u8,
    pub payload_type: u8,
    pub max_retries: u32,
    pub flow_ttl: Duration,
}

impl ContextConfig {
    pub fn new(profile: Profile, flow_id: u32, log_level: LogLevel) -> Self {
        Self {
            profile,
            flow_id,
            log_level,
            cname: String::new(),
            session_timeout: Duration::from_millis(SESSION_TIMEOUT_DEFAULT_MS),
            keepalive_interval: Duration::from_millis(KEEPALIVE_INTERVAL_DEFAULT_MS),
            jitter_max: Duration::from_millis(JITTER_QUANTUM_MS),
            nack_type: NackType::Range,
            compression_level: 0,
            payload_type: crate::protocol::rtp::PT_DATA_DEFAULT,
            max_retries: MAX_RETRIES_DEFAULT,
            flow_ttl: Duration::from_millis(FLOW_TTL_DEFAULT_MS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> PeerConfig {
        PeerConfig {
            address: "127.0.0.1:9000".to_string(),
            ..PeerConfig::default()
        }
    }

    #[test]
    fn test_default_config_validates() {
        valid().validate().expect("default config should be valid");
    }

    #[test]
    fn test_rejects_empty_address() {
        let cfg = PeerConfig::default();
        assert!(matches!(cfg.validate(), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_rejects_bad_version() {
        let cfg = PeerConfig {
            version: 99,
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_recovery_lengths() {
        let cfg = PeerConfig {
            recovery_length_min: 500,
            recovery_length_max: 100,
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_rtt_clamp() {
        let cfg = PeerConfig {
            recovery_rtt_min: 600,
            recovery_rtt_max: 100,
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_bloat_limits_out_of_order() {
        let cfg = PeerConfig {
            buffer_bloat_mode: BufferBloatMode::Normal,
            buffer_bloat_limit: 100,
            buffer_bloat_hard_limit: 50,
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_equal_recovery_lengths_allowed() {
        let cfg = PeerConfig {
            recovery_length_min: 200,
            recovery_length_max: 200,
            ..valid()
        };
        cfg.validate().expect("equal min/max is the fixed-latency case");
    }

    #[test]
    fn test_bytes_mode_converts_to_ms() {
        // 1.25 MB buffer at 100 Mbps drains in 100 ms.
        let cfg = PeerConfig {
            recovery_mode: RecoveryMode::Bytes,
            recovery_maxbitrate: 100_000_000,
            recovery_length_min: 1_250_000,
            recovery_length_max: 1_250_000,
            ..valid()
        };
        assert_eq!(cfg.recovery_length_max_ms(), 100);
        assert_eq!(cfg.recovery_length_min_ms(), 100);
    }

    #[test]
    fn test_time_mode_lengths_are_ms() {
        let cfg = PeerConfig {
            recovery_length_min: 50,
            recovery_length_max: 200,
            ..valid()
        };
        assert_eq!(cfg.recovery_length_min_ms(), 50);
        assert_eq!(cfg.recovery_length_max_ms(), 200);
    }

    #[test]
    fn test_log_level_filters() {
        assert_eq!(LogLevel::Quiet.to_filter(), log::LevelFilter::Off);
        assert_eq!(LogLevel::Debug.to_filter(), log::LevelFilter::Debug);
        assert_eq!(LogLevel::Warn.to_filter(), log::LevelFilter::Warn);
    }
}
