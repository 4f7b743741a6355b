// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire protocol: framing, control packets, sequence math, encryption.
//!
//! Submodules are organized by layer: [`rtp`] and [`gre`] are the raw
//! header codecs, [`rtcp`] covers control traffic, [`crypto`] the
//! pre-shared-key cipher, and [`packet`] ties them into the
//! profile-aware packet codec used by the engine.

pub mod crypto;
pub mod gre;
pub mod ntp;
pub mod packet;
pub mod rtcp;
pub mod rtp;
pub mod seq;

/// Why an incoming datagram was rejected.
///
/// Decode failures never propagate past the engine: the datagram is
/// dropped and a per-peer counter incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer shorter than the advertised structure.
    Truncated,
    /// RTP/GRE/RTCP version field mismatch.
    BadVersion,
    /// GRE protocol type is not RIST.
    BadProtocolType,
    /// Structurally invalid header (missing extensions, unknown APP name).
    BadHeader,
    /// Payload type outside the data and control ranges.
    UnknownPayloadType,
    /// Encrypted bit set but no pre-shared key configured.
    EncryptedNoKey,
    /// LZ4 payload failed to decompress.
    Compression,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated packet"),
            Self::BadVersion => write!(f, "bad protocol version"),
            Self::BadProtocolType => write!(f, "GRE protocol type is not RIST"),
            Self::BadHeader => write!(f, "malformed header"),
            Self::UnknownPayloadType => write!(f, "unknown payload type"),
            Self::EncryptedNoKey => write!(f, "encrypted packet but no key configured"),
            Self::Compression => write!(f, "LZ4 decompression failed"),
        }
    }
}

impl std::error::Error for DecodeError {}
