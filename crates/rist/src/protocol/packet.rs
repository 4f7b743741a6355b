// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Profile-aware packet codec.
//!
//! Ties the header codecs, the cipher, and LZ4 together into the single
//! encode/decode surface the engine uses. The codec owns the per-link
//! decode state (16-bit sequence extension for the simple profile, control
//! sequence counter for GRE) and the sender-side compression decision:
//! a payload ships compressed only when LZ4 saves at least 10%.
//!
//! The advanced profile emits main-profile framing but additionally
//! accepts reduced-header frames on decode (GRE only, no inner RTP);
//! extension blocks ride the inner RTP extension mechanism and are
//! skipped by the RTP parser.

use super::crypto::Psk;
use super::gre::GreHeader;
use super::rtcp::ControlPacket;
use super::rtp::{self, RtpHeader};
use super::seq::SeqExtender;
use super::{ntp, rtcp, DecodeError};
use crate::config::Profile;

/// Transport-level payload classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Data,
    RtcpSr,
    RtcpRr,
    NackRange,
    NackBitmask,
    Keepalive,
    Oob,
    Auth,
    Compressed,
}

/// A decoded or to-be-encoded data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Free-running 32-bit transport sequence.
    pub seq: u32,
    /// Flow identifier (always even; the wire SSRC low bit marks repairs).
    pub flow_id: u32,
    /// Sender timestamp; 0 on decode (filled with arrival time upstream).
    pub ts_ntp: u64,
    pub virt_src_port: u16,
    pub virt_dst_port: u16,
    pub kind: PayloadKind,
    pub encrypted: bool,
    pub retransmission: bool,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn data(seq: u32, flow_id: u32, ts_ntp: u64, payload: Vec<u8>) -> Self {
        Self {
            seq,
            flow_id,
            ts_ntp,
            virt_src_port: 0,
            virt_dst_port: 0,
            kind: PayloadKind::Data,
            encrypted: false,
            retransmission: false,
            payload,
        }
    }
}

/// Result of decoding one datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Data(Packet),
    Control(Vec<ControlPacket>),
}

/// Per-link packet codec. One instance per peer link on the decode side.
pub struct Codec {
    profile: Profile,
    payload_type: u8,
    psk: Option<Psk>,
    compression_level: u8,
    extender: SeqExtender,
    ctrl_seq: u32,
}

impl Codec {
    pub fn new(profile: Profile, payload_type: u8) -> Self {
        Self {
            profile,
            payload_type,
            psk: None,
            compression_level: 0,
            extender: SeqExtender::new(),
            ctrl_seq: 0,
        }
    }

    pub fn set_psk(&mut self, psk: Option<Psk>) {
        self.psk = psk;
    }

    pub fn set_compression_level(&mut self, level: u8) {
        self.compression_level = level;
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// Encode a data packet into `out`, returning the wire length.
    pub fn encode_data(&self, pkt: &Packet, out: &mut Vec<u8>) -> usize {
        let start = out.len();
        let mut payload = pkt.payload.clone();
        let mut compressed = false;

        if self.compression_level > 0 && self.profile.uses_gre() {
            let candidate = lz4_flex::compress_prepend_size(&payload);
            // Ship compressed only when it saves at least 10%.
            if candidate.len() * 10 < payload.len() * 9 {
                payload = candidate;
                compressed = true;
            }
        }

        let encrypted = self.psk.is_some() && self.profile.uses_gre();
        if let (true, Some(psk)) = (encrypted, self.psk.as_ref()) {
            psk.apply(pkt.flow_id, pkt.seq, &mut payload);
        }

        if self.profile.uses_gre() {
            let mut gre = GreHeader::new(pkt.virt_src_port, pkt.virt_dst_port, pkt.seq);
            gre.compressed = compressed;
            if encrypted {
                gre.nonce = Some(pkt.seq);
            }
            gre.encode(out);
        }

        let ssrc = (pkt.flow_id & !1) | u32::from(pkt.retransmission);
        RtpHeader {
            payload_type: self.payload_type,
            marker: false,
            seq: (pkt.seq & 0xFFFF) as u16,
            timestamp: ntp::to_rtp(pkt.ts_ntp),
            ssrc,
        }
        .encode(out);
        out.extend_from_slice(&payload);
        out.len() - start
    }

    /// Encode pre-built RTCP bytes with profile framing applied.
    pub fn encode_control(&mut self, virt_src: u16, virt_dst: u16, rtcp: &[u8], out: &mut Vec<u8>) {
        if self.profile.uses_gre() {
            // Control packets ride the tunnel in clear: keep-alives must
            // decode before any key exchange completes.
            self.ctrl_seq = self.ctrl_seq.wrapping_add(1);
            GreHeader::new(virt_src, virt_dst, self.ctrl_seq).encode(out);
        }
        out.extend_from_slice(rtcp);
    }

    /// Decode one datagram.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Decoded, DecodeError> {
        if self.profile.uses_gre() {
            let (gre, offset) = GreHeader::decode(buf)?;
            let inner = &buf[offset..];
            if gre.reduced {
                // Reduced header mode: advanced profile only.
                if self.profile != Profile::Advanced {
                    return Err(DecodeError::BadHeader);
                }
                return self.decode_data_reduced(&gre, inner);
            }
            if rtp::looks_like_rtcp(inner) {
                return Ok(Decoded::Control(rtcp::decode_compound(inner)?));
            }
            self.decode_data_gre(&gre, inner)
        } else {
            if rtp::looks_like_rtcp(buf) {
                return Ok(Decoded::Control(rtcp::decode_compound(buf)?));
            }
            self.decode_data_simple(buf)
        }
    }

    fn decode_data_gre(&mut self, gre: &GreHeader, inner: &[u8]) -> Result<Decoded, DecodeError> {
        let (hdr, offset) = RtpHeader::decode(inner)?;
        self.check_payload_type(hdr.payload_type)?;
        let mut payload = inner[offset..].to_vec();

        let encrypted = gre.nonce.is_some();
        if let Some(nonce) = gre.nonce {
            let Some(psk) = self.psk.as_ref() else {
                return Err(DecodeError::EncryptedNoKey);
            };
            psk.apply(hdr.ssrc & !1, nonce, &mut payload);
        }
        if gre.compressed {
            payload = lz4_flex::decompress_size_prepended(&payload)
                .map_err(|_| DecodeError::Compression)?;
        }

        Ok(Decoded::Data(Packet {
            seq: gre.seq,
            flow_id: hdr.ssrc & !1,
            ts_ntp: 0,
            virt_src_port: gre.virt_src_port(),
            virt_dst_port: gre.virt_dst_port(),
            kind: PayloadKind::Data,
            encrypted,
            retransmission: hdr.ssrc & 1 != 0,
            payload,
        }))
    }

    /// Reduced header mode: the GRE key carries `flow_id | retransmission`
    /// and the payload follows the GRE header directly.
    fn decode_data_reduced(&self, gre: &GreHeader, inner: &[u8]) -> Result<Decoded, DecodeError> {
        let flow_id = gre.key & !1;
        let mut payload = inner.to_vec();
        let encrypted = gre.nonce.is_some();
        if let Some(nonce) = gre.nonce {
            let Some(psk) = self.psk.as_ref() else {
                return Err(DecodeError::EncryptedNoKey);
            };
            psk.apply(flow_id, nonce, &mut payload);
        }
        if gre.compressed {
            payload = lz4_flex::decompress_size_prepended(&payload)
                .map_err(|_| DecodeError::Compression)?;
        }
        Ok(Decoded::Data(Packet {
            seq: gre.seq,
            flow_id,
            ts_ntp: 0,
            virt_src_port: 0,
            virt_dst_port: 0,
            kind: PayloadKind::Data,
            encrypted,
            retransmission: gre.key & 1 != 0,
            payload,
        }))
    }

    fn decode_data_simple(&mut self, buf: &[u8]) -> Result<Decoded, DecodeError> {
        let (hdr, offset) = RtpHeader::decode(buf)?;
        self.check_payload_type(hdr.payload_type)?;
        Ok(Decoded::Data(Packet {
            seq: self.extender.extend(hdr.seq),
            flow_id: hdr.ssrc & !1,
            ts_ntp: 0,
            virt_src_port: 0,
            virt_dst_port: 0,
            kind: PayloadKind::Data,
            encrypted: false,
            retransmission: hdr.ssrc & 1 != 0,
            payload: buf[offset..].to_vec(),
        }))
    }

    fn check_payload_type(&self, pt: u8) -> Result<(), DecodeError> {
        if (rtp::PT_DATA_MIN..=rtp::PT_DATA_MAX).contains(&pt) {
            Ok(())
        } else {
            Err(DecodeError::UnknownPayloadType)
        }
    }
}
