// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire-level behavior across the public packet codec, plus a loopback
//! smoke test of the full sender/receiver engines.

use std::time::Duration;

use rist::config::Profile;
use rist::protocol::crypto::{KeySize, Psk};
use rist::protocol::packet::{Codec, Decoded, Packet};
use rist::protocol::rtp::PT_DATA_DEFAULT;
use rist::protocol::DecodeError;
use rist::{DataBlock, LogLevel, PeerConfig, Receiver, Sender};

fn roundtrip(profile: Profile, pkt: &Packet) -> Packet {
    let mut enc = Codec::new(profile, PT_DATA_DEFAULT);
    let mut dec = Codec::new(profile, PT_DATA_DEFAULT);
    let mut wire = Vec::new();
    enc.encode_data(pkt, &mut wire);
    match dec.decode(&wire).expect("well-formed packet decodes") {
        Decoded::Data(p) => p,
        Decoded::Control(_) => panic!("expected data"),
    }
}

#[test]
fn encode_decode_identity_per_profile() {
    for profile in [Profile::Simple, Profile::Main, Profile::Advanced] {
        let mut pkt = Packet::data(12_345, 0x2468, 0, vec![7u8; 188]);
        if profile.uses_gre() {
            pkt.virt_src_port = 1968;
            pkt.virt_dst_port = 1970;
        }
        let got = roundtrip(profile, &pkt);
        assert_eq!(got.seq, pkt.seq, "{profile:?}");
        assert_eq!(got.flow_id, pkt.flow_id, "{profile:?}");
        assert_eq!(got.payload, pkt.payload, "{profile:?}");
        assert_eq!(got.virt_src_port, pkt.virt_src_port, "{profile:?}");
        assert_eq!(got.virt_dst_port, pkt.virt_dst_port, "{profile:?}");
    }
}

#[test]
fn aes_roundtrip_and_wrong_key_fails() {
    let good = Psk::new("correct horse", KeySize::Aes256, Profile::Main);
    let bad = Psk::new("battery staple", KeySize::Aes256, Profile::Main);

    let mut enc = Codec::new(Profile::Main, PT_DATA_DEFAULT);
    enc.set_psk(Some(good.clone()));
    let pkt = Packet::data(99, 0x42, 0, b"scrambled eggs".to_vec());
    let mut wire = Vec::new();
    enc.encode_data(&pkt, &mut wire);

    // Correct key: identity.
    let mut dec = Codec::new(Profile::Main, PT_DATA_DEFAULT);
    dec.set_psk(Some(good));
    let Decoded::Data(got) = dec.decode(&wire).expect("decodes") else {
        panic!("expected data");
    };
    assert_eq!(got.payload, pkt.payload);

    // Wrong key: never reports the original payload.
    let mut dec = Codec::new(Profile::Main, PT_DATA_DEFAULT);
    dec.set_psk(Some(bad));
    match dec.decode(&wire) {
        Ok(Decoded::Data(garbled)) => assert_ne!(garbled.payload, pkt.payload),
        Ok(Decoded::Control(_)) => panic!("expected data"),
        Err(_) => {} // also acceptable: garbage may fail structurally
    }

    // No key at all: explicit drop reason, no crash.
    let mut dec = Codec::new(Profile::Main, PT_DATA_DEFAULT);
    assert_eq!(dec.decode(&wire), Err(DecodeError::EncryptedNoKey));
}

#[test]
fn truncated_and_garbage_datagrams_are_rejected() {
    let mut dec = Codec::new(Profile::Main, PT_DATA_DEFAULT);
    assert!(dec.decode(&[]).is_err());
    assert!(dec.decode(&[0x30]).is_err());
    assert!(dec.decode(&[0xFF; 7]).is_err());

    let mut enc = Codec::new(Profile::Main, PT_DATA_DEFAULT);
    let mut wire = Vec::new();
    enc.encode_data(&Packet::data(1, 2, 0, vec![0; 64]), &mut wire);
    for cut in [1, 5, 11, 13] {
        let mut dec = Codec::new(Profile::Main, PT_DATA_DEFAULT);
        assert!(dec.decode(&wire[..cut]).is_err(), "cut at {cut}");
    }
}

#[test]
fn compressed_payload_roundtrips_through_wire() {
    let mut enc = Codec::new(Profile::Main, PT_DATA_DEFAULT);
    enc.set_compression_level(6);
    let mut dec = Codec::new(Profile::Main, PT_DATA_DEFAULT);

    let payload = vec![0x47u8; 1316]; // TS sync bytes compress hard
    let pkt = Packet::data(5, 0x42, 0, payload.clone());
    let mut wire = Vec::new();
    let wire_len = enc.encode_data(&pkt, &mut wire);
    assert!(wire_len < payload.len() / 2);

    let Decoded::Data(got) = dec.decode(&wire).expect("decodes") else {
        panic!("expected data");
    };
    assert_eq!(got.payload, payload);
}

/// Full-engine smoke test: sender and receiver over localhost UDP, no
/// injected loss. Exercises handshake, keep-alives, packetization,
/// reassembly, and the data queue.
#[test]
fn loopback_delivery_end_to_end() {
    // Reserve a port, then hand it to the receiver.
    let probe = std::net::UdpSocket::bind("127.0.0.1:0").expect("probe binds");
    let port = probe.local_addr().expect("has addr").port();
    drop(probe);

    let mut rx = Receiver::new(Profile::Main, LogLevel::Quiet).expect("receiver builds");
    rx.peer_create(&PeerConfig {
        address: format!("127.0.0.1:{port}"),
        recovery_length_min: 20,
        recovery_length_max: 50,
        ..PeerConfig::default()
    })
    .expect("receiver peer binds");
    rx.keepalive_timeout_set(50).expect("pre-start");
    rx.max_jitter_set(5).expect("pre-start");
    rx.start().expect("receiver starts");

    let mut tx = Sender::new(Profile::Main, 0xBEE0, LogLevel::Quiet).expect("sender builds");
    tx.peer_create(&PeerConfig {
        address: format!("127.0.0.1:{port}"),
        ..PeerConfig::default()
    })
    .expect("sender peer connects");
    tx.keepalive_timeout_set(50).expect("pre-start");
    tx.start().expect("sender starts");

    // Let the keep-alive handshake converge.
    std::thread::sleep(Duration::from_millis(400));

    let count = 20u32;
    for i in 0..count {
        tx.data_write(DataBlock::new(vec![i as u8; 188]))
            .expect("write accepted");
    }

    let mut got = Vec::new();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while got.len() < count as usize && std::time::Instant::now() < deadline {
        if let Some(block) = rx
            .data_read(Duration::from_millis(200))
            .expect("read after start")
        {
            got.push(block);
        }
    }

    assert_eq!(got.len(), count as usize, "all packets must arrive");
    for (i, block) in got.iter().enumerate() {
        assert_eq!(block.payload, vec![i as u8; 188]);
        assert_eq!(block.flow_id, 0xBEE0);
    }
    for pair in got.windows(2) {
        assert!(pair[0].seq < pair[1].seq);
    }

    let stats = rx.stats();
    let _ = stats; // published asynchronously; presence is enough here

    tx.destroy();
    rx.destroy();
}
