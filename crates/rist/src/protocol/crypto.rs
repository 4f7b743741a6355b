// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pre-shared-key link encryption.
//!
//! The session key is derived from the configured passphrase with
//! PBKDF2-HMAC-SHA1 (100 iterations, fixed per-profile salt) and applied as
//! AES-128/256 in counter mode over the payload only. The CTR IV is built
//! from `(flow_id, nonce)` so each packet gets a distinct keystream; the
//! nonce travels in clear in the GRE header.

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::config::Profile;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// PBKDF2 iteration count; both ends must agree on it.
const PBKDF2_ROUNDS: u32 = 100;

const SALT_SIMPLE: &[u8] = b"rist-simple-profile";
const SALT_MAIN: &[u8] = b"rist-main-profile";
const SALT_ADVANCED: &[u8] = b"rist-advanced-profile";

/// AES key length selector (`encrypt_aes_set` key_size argument).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySize {
    Aes128,
    Aes256,
}

impl KeySize {
    /// Map the public 128/256 knob; anything else is a config error.
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            128 => Some(Self::Aes128),
            256 => Some(Self::Aes256),
            _ => None,
        }
    }

    fn byte_len(self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes256 => 32,
        }
    }
}

/// Derived pre-shared key, ready to cipher packet payloads.
#[derive(Clone)]
pub struct Psk {
    key: Vec<u8>,
    size: KeySize,
}

impl std::fmt::Debug for Psk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("Psk").field("size", &self.size).finish()
    }
}

impl Psk {
    pub fn new(secret: &str, size: KeySize, profile: Profile) -> Self {
        let salt = match profile {
            Profile::Simple => SALT_SIMPLE,
            Profile::Main => SALT_MAIN,
            Profile::Advanced => SALT_ADVANCED,
        };
        Self {
            key: pbkdf2_sha1(secret.as_bytes(), salt, PBKDF2_ROUNDS, size.byte_len()),
            size,
        }
    }

    /// Apply the CTR keystream in place. Encryption and decryption are the
    /// same operation.
    pub fn apply(&self, flow_id: u32, nonce: u32, buf: &mut [u8]) {
        let mut iv = [0u8; 16];
        iv[0..4].copy_from_slice(&flow_id.to_be_bytes());
        iv[8..12].copy_from_slice(&nonce.to_be_bytes());
        // Low 4 bytes stay zero: the in-packet block counter.
        match self.size {
            KeySize::Aes128 => {
                let mut key = [0u8; 16];
                key.copy_from_slice(&self.key);
                let mut cipher = Aes128Ctr::new(&key.into(), &iv.into());
                cipher.apply_keystream(buf);
            }
            KeySize::Aes256 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(&self.key);
                let mut cipher = Aes256Ctr::new(&key.into(), &iv.into());
                cipher.apply_keystream(buf);
            }
        }
    }
}

/// PBKDF2 with HMAC-SHA1 as the PRF (RFC 2898 Sec.5.2).
fn pbkdf2_sha1(password: &[u8], salt: &[u8], rounds: u32, out_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(out_len);
    let mut block_index: u32 = 1;
    while out.len() < out_len {
        let mut mac = hmac_sha1(password);
        mac.update(salt);
        mac.update(&block_index.to_be_bytes());
        let mut u: [u8; 20] = mac.finalize().into_bytes().into();
        let mut t = u;
        for _ in 1..rounds {
            let mut mac = hmac_sha1(password);
            mac.update(&u);
            u = mac.finalize().into_bytes().into();
            for (ti, ui) in t.iter_mut().zip(u.iter()) {
                *ti ^= ui;
            }
        }
        let take = (out_len - out.len()).min(t.len());
        out.extend_from_slice(&t[..take]);
        block_index += 1;
    }
    out
}

fn hmac_sha1(key: &[u8]) -> Hmac<Sha1> {
    #[allow(clippy::expect_used)] // HMAC accepts keys of any length
    Hmac::<Sha1>::new_from_slice(key).expect("HMAC key length is unbounded")
}
