// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RTCP control packets.
//!
//! Control traffic is carried as RTCP: keep-alives are SR+SDES compounds,
//! RTT probe echoes ride the RR report block (LSR/DLSR), and NACKs, the OOB
//! channel, and the auth exchange use APP packets distinguished by their
//! four-byte ASCII name.
//!
//! NACK payload formats:
//! - RANGE: `(start_seq: u32, count: u32)` pairs, 8 bytes each.
//! - BITMASK: `(base_seq: u32, mask: u16, pad: u16)` entries, 8 bytes each,
//!   where mask bit 15 stands for `base_seq + 1` down to bit 0 for
//!   `base_seq + 16`.

use super::{seq, DecodeError};

pub const PT_SR: u8 = 200;
pub const PT_RR: u8 = 201;
pub const PT_SDES: u8 = 202;
pub const PT_APP: u8 = 204;

/// APP name for loss repair requests.
pub const APP_NAME_NACK: &[u8; 4] = b"RIST";
/// APP name for the out-of-band data channel.
pub const APP_NAME_OOB: &[u8; 4] = b"ROOB";
/// APP name for the pre-shared-key auth exchange.
pub const APP_NAME_AUTH: &[u8; 4] = b"AUTH";

pub const APP_SUBTYPE_NACK_RANGE: u8 = 0;
pub const APP_SUBTYPE_NACK_BITMASK: u8 = 1;

const RTCP_VERSION_BYTE: u8 = 0x80;

/// SR payload of a keep-alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp: u64,
    pub rtp_ts: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

/// RR with a single report block; echoes the last SR for RTT sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub source_ssrc: u32,
    pub fraction_lost: u8,
    /// 24 bits on the wire.
    pub cumulative_lost: u32,
    pub highest_seq: u32,
    pub jitter: u32,
    /// Compact NTP of the last SR received from `source_ssrc`.
    pub last_sr: u32,
    /// Delay since that SR, 1/65536 s units.
    pub delay_since_last_sr: u32,
}

/// SDES chunk carrying the CNAME item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesCname {
    pub ssrc: u32,
    pub cname: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackRange {
    pub start: u32,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackBitmask {
    pub base: u32,
    pub mask: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackPayload {
    Range(Vec<NackRange>),
    Bitmask(Vec<NackBitmask>),
}

impl NackPayload {
    /// Expand to the individual missing sequences, in payload order.
    pub fn sequences(&self) -> Vec<u32> {
        let mut out = Vec::new();
        match self {
            Self::Range(ranges) => {
                for r in ranges {
                    for i in 0..r.count.min(65_536) {
                        out.push(seq::add(r.start, i));
                    }
                }
            }
            Self::Bitmask(entries) => {
                for e in entries {
                    out.push(e.base);
                    for bit in 0..16 {
                        if e.mask & (0x8000 >> bit) != 0 {
                            out.push(seq::add(e.base, bit + 1));
                        }
                    }
                }
            }
        }
        out
    }
}

/// One decoded RTCP packet out of a compound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    Sdes(SdesCname),
    Nack { flow_id: u32, payload: NackPayload },
    Oob { data: Vec<u8> },
    Auth { data: Vec<u8> },
}

fn push_header(out: &mut Vec<u8>, count: u8, pt: u8, payload_len: usize) {
    debug_assert!(payload_len % 4 == 0);
    out.push(RTCP_VERSION_BYTE | (count & 0x1F));
    out.push(pt);
    let words = (payload_len / 4) as u16;
    out.extend_from_slice(&words.to_be_bytes());
}

pub fn encode_sender_report(sr: &SenderReport, out: &mut Vec<u8>) {
    push_header(out, 0, PT_SR, 24);
    out.extend_from_slice(&sr.ssrc.to_be_bytes());
    out.extend_from_slice(&sr.ntp.to_be_bytes());
    out.extend_from_slice(&sr.rtp_ts.to_be_bytes());
    out.extend_from_slice(&sr.packet_count.to_be_bytes());
    out.extend_from_slice(&sr.octet_count.to_be_bytes());
}

pub fn encode_receiver_report(rr: &ReceiverReport, out: &mut Vec<u8>) {
    push_header(out, 1, PT_RR, 28);
    out.extend_from_slice(&rr.ssrc.to_be_bytes());
    out.extend_from_slice(&rr.source_ssrc.to_be_bytes());
    let lost = (u32::from(rr.fraction_lost) << 24) | (rr.cumulative_lost & 0x00FF_FFFF);
    out.extend_from_slice(&lost.to_be_bytes());
    out.extend_from_slice(&rr.highest_seq.to_be_bytes());
    out.extend_from_slice(&rr.jitter.to_be_bytes());
    out.extend_from_slice(&rr.last_sr.to_be_bytes());
    out.extend_from_slice(&rr.delay_since_last_sr.to_be_bytes());
}

pub fn encode_sdes(sdes: &SdesCname, out: &mut Vec<u8>) {
    let cname = sdes.cname.as_bytes();
    debug_assert!(cname.len() <= 255);
    // chunk: ssrc + item(type, len, text) + terminator, padded to 4.
    let item_len = 4 + 2 + cname.len() + 1;
    let padded = (item_len + 3) & !3;
    push_header(out, 1, PT_SDES, padded);
    out.extend_from_slice(&sdes.ssrc.to_be_bytes());
    out.push(1); // CNAME
    out.push(cname.len() as u8);
    out.extend_from_slice(cname);
    out.push(0);
    for _ in item_len..padded {
        out.push(0);
    }
}

fn encode_app(subtype: u8, ssrc: u32, name: &[u8; 4], data: &[u8], out: &mut Vec<u8>) {
    let padded = (data.len() + 3) & !3;
    push_header(out, subtype, PT_APP, 8 + padded);
    out.extend_from_slice(&ssrc.to_be_bytes());
    out.extend_from_slice(name);
    out.extend_from_slice(data);
    for _ in data.len()..padded {
        out.push(0);
    }
}

pub fn encode_nack(flow_id: u32, payload: &NackPayload, out: &mut Vec<u8>) {
    let mut data = Vec::new();
    let subtype = match payload {
        NackPayload::Range(ranges) => {
            for r in ranges {
                data.extend_from_slice(&r.start.to_be_bytes());
                data.extend_from_slice(&r.count.to_be_bytes());
            }
            APP_SUBTYPE_NACK_RANGE
        }
        NackPayload::Bitmask(entries) => {
            for e in entries {
                data.extend_from_slice(&e.base.to_be_bytes());
                data.extend_from_slice(&e.mask.to_be_bytes());
                data.extend_from_slice(&[0, 0]);
            }
            APP_SUBTYPE_NACK_BITMASK
        }
    };
    encode_app(subtype, flow_id, APP_NAME_NACK, &data, out);
}

/// OOB and AUTH bodies carry a 16-bit length prefix so padding can be
/// stripped on decode.
fn encode_prefixed_app(name: &[u8; 4], ssrc: u32, data: &[u8], out: &mut Vec<u8>) {
    debug_assert!(data.len() <= usize::from(u16::MAX));
    let mut body = Vec::with_capacity(2 + data.len());
    body.extend_from_slice(&(data.len() as u16).to_be_bytes());
    body.extend_from_slice(data);
    encode_app(0, ssrc, name, &body, out);
}

pub fn encode_oob(ssrc: u32, data: &[u8], out: &mut Vec<u8>) {
    encode_prefixed_app(APP_NAME_OOB, ssrc, data, out);
}

pub fn encode_auth(ssrc: u32, data: &[u8], out: &mut Vec<u8>) {
    encode_prefixed_app(APP_NAME_AUTH, ssrc, data, out);
}

/// Decode a compound RTCP datagram into its constituent packets.
///
/// Unknown packet types are skipped; a malformed length aborts the whole
/// datagram with an error.
pub fn decode_compound(buf: &[u8]) -> Result<Vec<ControlPacket>, DecodeError> {
    let mut packets = Vec::new();
    let mut offset = 0;
    while offset + 4 <= buf.len() {
        let b0 = buf[offset];
        if b0 >> 6 != 2 {
            return Err(DecodeError::BadVersion);
        }
        let count = b0 & 0x1F;
        let pt = buf[offset + 1];
        let words = usize::from(u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]));
        let end = offset + 4 + words * 4;
        if end > buf.len() {
            return Err(DecodeError::Truncated);
        }
        let body = &buf[offset + 4..end];
        match pt {
            PT_SR => packets.push(decode_sr(body)?),
            PT_RR => {
                if let Some(p) = decode_rr(body, count)? {
                    packets.push(p);
                }
            }
            PT_SDES => {
                if let Some(p) = decode_sdes(body)? {
                    packets.push(p);
                }
            }
            PT_APP => packets.push(decode_app(body, count)?),
            _ => {} // RFC-mandated tolerance for unknown packet types
        }
        offset = end;
    }
    if offset != buf.len() {
        return Err(DecodeError::Truncated);
    }
    Ok(packets)
}

fn decode_sr(body: &[u8]) -> Result<ControlPacket, DecodeError> {
    if body.len() < 24 {
        return Err(DecodeError::Truncated);
    }
    Ok(ControlPacket::SenderReport(SenderReport {
        ssrc: be32(body, 0),
        ntp: u64::from(be32(body, 4)) << 32 | u64::from(be32(body, 8)),
        rtp_ts: be32(body, 12),
        packet_count: be32(body, 16),
        octet_count: be32(body, 20),
    }))
}

fn decode_rr(body: &[u8], count: u8) -> Result<Option<ControlPacket>, DecodeError> {
    if body.len() < 4 {
        return Err(DecodeError::Truncated);
    }
    if count == 0 {
        // Empty RR (no report blocks) is a bare liveness signal.
        return Ok(None);
    }
    if body.len() < 28 {
        return Err(DecodeError::Truncated);
    }
    let lost = be32(body, 8);
    Ok(Some(ControlPacket::ReceiverReport(ReceiverReport {
        ssrc: be32(body, 0),
        source_ssrc: be32(body, 4),
        fraction_lost: (lost >> 24) as u8,
        cumulative_lost: lost & 0x00FF_FFFF,
        highest_seq: be32(body, 12),
        jitter: be32(body, 16),
        last_sr: be32(body, 20),
        delay_since_last_sr: be32(body, 24),
    })))
}

fn decode_sdes(body: &[u8]) -> Result<Option<ControlPacket>, DecodeError> {
    if body.len() < 6 {
        return Err(DecodeError::Truncated);
    }
    let ssrc = be32(body, 0);
    if body[4] != 1 {
        // Only CNAME is meaningful to the transport.
        return Ok(None);
    }
    let len = usize::from(body[5]);
    if body.len() < 6 + len {
        return Err(DecodeError::Truncated);
    }
    let cname = String::from_utf8_lossy(&body[6..6 + len]).into_owned();
    Ok(Some(ControlPacket::Sdes(SdesCname { ssrc, cname })))
}

fn decode_app(body: &[u8], subtype: u8) -> Result<ControlPacket, DecodeError> {
    if body.len() < 8 {
        return Err(DecodeError::Truncated);
    }
    let ssrc = be32(body, 0);
    let name: [u8; 4] = [body[4], body[5], body[6], body[7]];
    let data = &body[8..];
    match &name {
        n if n == APP_NAME_NACK => {
            let payload = match subtype {
                APP_SUBTYPE_NACK_RANGE => {
                    let mut ranges = Vec::with_capacity(data.len() / 8);
                    for chunk in data.chunks_exact(8) {
                        ranges.push(NackRange {
                            start: be32(chunk, 0),
                            count: be32(chunk, 4),
                        });
                    }
                    NackPayload::Range(ranges)
                }
                APP_SUBTYPE_NACK_BITMASK => {
                    let mut entries = Vec::with_capacity(data.len() / 8);
                    for chunk in data.chunks_exact(8) {
                        entries.push(NackBitmask {
                            base: be32(chunk, 0),
                            mask: u16::from_be_bytes([chunk[4], chunk[5]]),
                        });
                    }
                    NackPayload::Bitmask(entries)
                }
                _ => return Err(DecodeError::BadHeader),
            };
            Ok(ControlPacket::Nack {
                flow_id: ssrc,
                payload,
            })
        }
        n if n == APP_NAME_OOB => Ok(ControlPacket::Oob {
            data: strip_prefixed(data)?,
        }),
        n if n == APP_NAME_AUTH => Ok(ControlPacket::Auth {
            data: strip_prefixed(data)?,
        }),
        _ => Err(DecodeError::BadHeader),
    }
}

fn strip_prefixed(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if data.len() < 2 {
        return Err(DecodeError::Truncated);
    }
    let len = usize::from(u16::from_be_bytes([data[0], data[1]]));
    if data.len() < 2 + len {
        return Err(DecodeError::Truncated);
    }
    Ok(data[2..2 + len].to_vec())
}

fn be32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Pack sorted missing sequences into RANGE entries.
///
/// `seqs` must be in ascending wraparound order (as produced by the NACK
/// scheduler); adjacent sequences merge into one range.
pub fn build_ranges(seqs: &[u32]) -> Vec<NackRange> {
    let mut out: Vec<NackRange> = Vec::new();
    for &s in seqs {
        match out.last_mut() {
            Some(last) if seq::add(last.start, last.count) == s => last.count += 1,
            _ => out.push(NackRange { start: s, count: 1 }),
        }
    }
    out
}

/// Pack sorted missing sequences into BITMASK entries (denser for
/// clustered loss: one entry covers a base plus the following 16 sequences).
pub fn build_bitmasks(seqs: &[u32]) -> Vec<NackBitmask> {
    let mut out: Vec<NackBitmask> = Vec::new();
    for &s in seqs {
        if let Some(last) = out.last_mut() {
            let d = seq::delta(s, last.base);
            if d > 0 && d <= 16 {
                last.mask |= 0x8000 >> (d - 1);
                continue;
            }
        }
        out.push(NackBitmask { base: s, mask: 0 });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_compound_roundtrip() {
        let sr = SenderReport {
            ssrc: 0xAA00,
            ntp: 0x0102_0304_0506_0708,
            rtp_ts: 90_000,
            packet_count: 17,
            octet_count: 22_372,
        };
        let sdes = SdesCname {
            ssrc: 0xAA00,
            cname: "rist@host".to_string(),
        };
        let mut buf = Vec::new();
        encode_sender_report(&sr, &mut buf);
        encode_sdes(&sdes, &mut buf);

        let packets = decode_compound(&buf).expect("compound should decode");
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0], ControlPacket::SenderReport(sr));
        assert_eq!(packets[1], ControlPacket::Sdes(sdes));
    }

    #[test]
    fn test_receiver_report_roundtrip() {
        let rr = ReceiverReport {
            ssrc: 0xBB00,
            source_ssrc: 0xAA00,
            fraction_lost: 12,
            cumulative_lost: 345,
            highest_seq: 0xFFFF_FFF0,
            jitter: 3,
            last_sr: 0x1234_5678,
            delay_since_last_sr: 655,
        };
        let mut buf = Vec::new();
        encode_receiver_report(&rr, &mut buf);
        let packets = decode_compound(&buf).expect("RR should decode");
        assert_eq!(packets, vec![ControlPacket::ReceiverReport(rr)]);
    }

    #[test]
    fn test_nack_range_roundtrip() {
        let payload = NackPayload::Range(vec![
            NackRange { start: 50, count: 1 },
            NackRange {
                start: 0xFFFF_FFFE,
                count: 4,
            },
        ]);
        let mut buf = Vec::new();
        encode_nack(0x42, &payload, &mut buf);
        let packets = decode_compound(&buf).expect("NACK should decode");
        assert_eq!(
            packets,
            vec![ControlPacket::Nack {
                flow_id: 0x42,
                payload
            }]
        );
    }

    #[test]
    fn test_nack_bitmask_roundtrip_and_expansion() {
        let payload = NackPayload::Bitmask(vec![NackBitmask {
            base: 100,
            mask: 0xA000, // 101 and 103
        }]);
        let mut buf = Vec::new();
        encode_nack(7, &payload, &mut buf);
        let packets = decode_compound(&buf).expect("NACK should decode");
        let ControlPacket::Nack { payload: got, .. } = &packets[0] else {
            panic!("expected NACK");
        };
        assert_eq!(got.sequences(), vec![100, 101, 103]);
    }

    #[test]
    fn test_oob_roundtrip_with_padding() {
        let mut buf = Vec::new();
        encode_oob(0, b"hello", &mut buf); // 5 bytes forces padding
        let packets = decode_compound(&buf).expect("OOB should decode");
        assert_eq!(
            packets,
            vec![ControlPacket::Oob {
                data: b"hello".to_vec()
            }]
        );
    }

    #[test]
    fn test_build_ranges_merges_adjacent() {
        let ranges = build_ranges(&[5, 6, 7, 10, 0xFFFF_FFFF]);
        assert_eq!(
            ranges,
            vec![
                NackRange { start: 5, count: 3 },
                NackRange {
                    start: 10,
                    count: 1
                },
                NackRange {
                    start: 0xFFFF_FFFF,
                    count: 1
                },
            ]
        );
    }

    #[test]
    fn test_build_ranges_across_wrap() {
        let ranges = build_ranges(&[0xFFFF_FFFE, 0xFFFF_FFFF, 0, 1]);
        assert_eq!(
            ranges,
            vec![NackRange {
                start: 0xFFFF_FFFE,
                count: 4
            }]
        );
    }

    #[test]
    fn test_build_bitmasks_clusters() {
        let entries = build_bitmasks(&[100, 101, 103, 120]);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].base, 100);
        assert_eq!(entries[0].mask, 0xA000);
        assert_eq!(entries[1].base, 120);
        assert_eq!(entries[1].mask, 0);
    }

    #[test]
    fn test_compound_rejects_truncated() {
        let sr = SenderReport {
            ssrc: 1,
            ntp: 2,
            rtp_ts: 3,
            packet_count: 4,
            octet_count: 5,
        };
        let mut buf = Vec::new();
        encode_sender_report(&sr, &mut buf);
        buf.truncate(buf.len() - 3);
        assert!(decode_compound(&buf).is_err());
    }

    #[test]
    fn test_compound_skips_unknown_packet_type() {
        let mut buf = Vec::new();
        // Unknown PT 203 (BYE), well-formed length.
        buf.push(0x80);
        buf.push(203);
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&7u32.to_be_bytes());
        let packets = decode_compound(&buf).expect("unknown type is skipped");
        assert!(packets.is_empty());
    }
}
