// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sender context: packetizes application writes, keeps the
//! retransmission history, and serves NACKs from its peers.

use std::time::Duration;

use crate::config::{LogLevel, PeerConfig, Profile};
use crate::context::Context;
use crate::engine::reactor::{ConnectCallback, DisconnectCallback, OobCallback};
use crate::engine::Role;
use crate::peer::PeerId;
use crate::protocol::crypto::{KeySize, Psk};
use crate::stats::StatsSnapshot;
use crate::{DataBlock, Error, OobBlock};

/// A RIST sender.
///
/// Typical lifecycle: create, configure (peers, encryption, timeouts),
/// `start()`, then feed media with [`Sender::data_write`]. Dropping the
/// sender stops the reactor and releases every peer.
///
/// ```no_run
/// use rist::{Sender, Profile, LogLevel, PeerConfig, DataBlock};
///
/// let mut tx = Sender::new(Profile::Main, 0, LogLevel::Info)?;
/// tx.peer_create(&PeerConfig {
///     address: "203.0.113.9:1968".to_string(),
///     ..PeerConfig::default()
/// })?;
/// tx.start()?;
/// tx.data_write(DataBlock::new(vec![0u8; 1316]))?;
/// # Ok::<(), rist::Error>(())
/// ```
pub struct Sender {
    ctx: Context,
}

impl Sender {
    /// Create a sender. `flow_id` 0 lets the library pick one (even, per
    /// the wire rule that odd SSRCs mark retransmissions).
    pub fn new(profile: Profile, flow_id: u32, log_level: LogLevel) -> Result<Self, Error> {
        Ok(Self {
            ctx: Context::new(Role::Sender, profile, flow_id, log_level)?,
        })
    }

    /// Install the authentication/disconnect handlers. The connect
    /// callback authorizes each handshaking peer; both run on the reactor
    /// thread and must not call back into this context.
    pub fn auth_handler_set(
        &mut self,
        connect_cb: Option<ConnectCallback>,
        disconn_cb: Option<DisconnectCallback>,
    ) -> Result<(), Error> {
        let callbacks = self.ctx.core_mut()?.callbacks_mut();
        callbacks.connect = connect_cb;
        callbacks.disconnect = disconn_cb;
        Ok(())
    }

    /// Override the auto-generated SDES CName (127 bytes max).
    pub fn cname_set(&mut self, cname: &str) -> Result<(), Error> {
        if cname.len() >= 128 {
            return Err(Error::ConfigInvalid("cname exceeds 128 bytes".to_string()));
        }
        self.ctx.core_mut()?.config_mut().cname = cname.to_string();
        Ok(())
    }

    /// Add a peer. All peers must be created before `start()`.
    pub fn peer_create(&mut self, config: &PeerConfig) -> Result<PeerId, Error> {
        self.ctx.peer_create(config)
    }

    pub fn peer_destroy(&mut self, peer: PeerId) -> Result<(), Error> {
        self.ctx.peer_destroy(peer)
    }

    /// Enable AES link encryption. `key_size` must be 128 or 256; the
    /// simple profile has no room for the nonce and rejects it.
    pub fn encrypt_aes_set(&mut self, secret: &str, key_size: u32) -> Result<(), Error> {
        let size = KeySize::from_bits(key_size).ok_or_else(|| {
            Error::ConfigInvalid(format!("unsupported AES key size {key_size}"))
        })?;
        let core = self.ctx.core_mut()?;
        let profile = core.config_mut().profile;
        if !profile.uses_gre() {
            return Err(Error::ConfigInvalid(
                "encryption requires the main or advanced profile".to_string(),
            ));
        }
        core.set_psk(Some(Psk::new(secret, size, profile)));
        Ok(())
    }

    /// Session timeout in ms (peer goes DYING after this much silence).
    pub fn session_timeout_set(&mut self, timeout_ms: u32) -> Result<(), Error> {
        if timeout_ms == 0 {
            return Err(Error::ConfigInvalid("session timeout must be > 0".to_string()));
        }
        self.ctx
            .core_mut()?
            .set_session_timeout(Duration::from_millis(u64::from(timeout_ms)));
        Ok(())
    }

    /// Keep-alive cadence in ms.
    pub fn keepalive_timeout_set(&mut self, interval_ms: u32) -> Result<(), Error> {
        if interval_ms == 0 {
            return Err(Error::ConfigInvalid("keepalive interval must be > 0".to_string()));
        }
        self.ctx
            .core_mut()?
            .set_keepalive_interval(Duration::from_millis(u64::from(interval_ms)));
        Ok(())
    }

    /// Sender-side pacing quantum in ms: spooled writes flush at least
    /// this often.
    pub fn jitter_max_set(&mut self, jitter_ms: u32) -> Result<(), Error> {
        self.ctx
            .core_mut()?
            .set_jitter_max(Duration::from_millis(u64::from(jitter_ms)));
        Ok(())
    }

    /// Route incoming OOB blocks to a callback instead of the fifo.
    pub fn oob_set(&mut self, oob_cb: Option<OobCallback>) -> Result<(), Error> {
        self.ctx.core_mut()?.callbacks_mut().oob = oob_cb;
        Ok(())
    }

    /// LZ4 payload compression: 0 disables, 1-10 sets the effort level.
    /// Requires a GRE profile (the compressed bit lives in the GRE flags).
    pub fn compression_lz4_set(&mut self, level: u8) -> Result<(), Error> {
        if level > 10 {
            return Err(Error::ConfigInvalid(format!(
                "compression level {level} out of range 0-10"
            )));
        }
        let core = self.ctx.core_mut()?;
        if level > 0 && !core.config_mut().profile.uses_gre() {
            return Err(Error::ConfigInvalid(
                "compression requires the main or advanced profile".to_string(),
            ));
        }
        core.set_compression_level(level);
        Ok(())
    }

    /// Kick off the reactor after all peers are configured.
    pub fn start(&mut self) -> Result<(), Error> {
        self.ctx.start()
    }

    /// Queue one data block for transmission. Returns the payload length.
    /// `ts_ntp` 0 is stamped with the current clock; `peer` restricts the
    /// write to a single peer.
    pub fn data_write(&self, block: DataBlock) -> Result<usize, Error> {
        self.ctx.data_write(block)
    }

    /// Send an out-of-band block to the remote application channel.
    pub fn oob_write(&self, block: OobBlock) -> Result<usize, Error> {
        self.ctx.oob_write(block)
    }

    /// Read one incoming OOB block from the fifo.
    pub fn oob_read(&self, timeout: Duration) -> Result<Option<OobBlock>, Error> {
        self.ctx.oob_read(timeout)
    }

    /// The flow id data writes are stamped with.
    pub fn flow_id_get(&self) -> u32 {
        self.ctx.flow_id()
    }

    /// Last published statistics snapshot.
    pub fn stats(&self) -> std::sync::Arc<StatsSnapshot> {
        self.ctx.stats()
    }

    /// Stop the reactor and release all resources. Also runs on drop.
    pub fn destroy(mut self) {
        self.ctx.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> Sender {
        Sender::new(Profile::Main, 0x4242, LogLevel::Quiet).expect("sender builds")
    }

    #[test]
    fn test_flow_id_generated_when_zero() {
        let tx = Sender::new(Profile::Main, 0, LogLevel::Quiet).expect("sender builds");
        assert_ne!(tx.flow_id_get(), 0);
        assert_eq!(tx.flow_id_get() & 1, 0);
    }

    #[test]
    fn test_flow_id_kept_when_given() {
        assert_eq!(sender().flow_id_get(), 0x4242);
    }

    #[test]
    fn test_encrypt_rejects_bad_key_size() {
        let mut tx = sender();
        assert!(matches!(
            tx.encrypt_aes_set("secret", 192),
            Err(Error::ConfigInvalid(_))
        ));
        tx.encrypt_aes_set("secret", 128).expect("128 is valid");
        tx.encrypt_aes_set("secret", 256).expect("256 is valid");
    }

    #[test]
    fn test_encrypt_rejects_simple_profile() {
        let mut tx = Sender::new(Profile::Simple, 0, LogLevel::Quiet).expect("sender builds");
        assert!(tx.encrypt_aes_set("secret", 128).is_err());
    }

    #[test]
    fn test_compression_level_range() {
        let mut tx = sender();
        tx.compression_lz4_set(0).expect("disable ok");
        tx.compression_lz4_set(10).expect("max ok");
        assert!(tx.compression_lz4_set(11).is_err());
    }

    #[test]
    fn test_cname_length_limit() {
        let mut tx = sender();
        tx.cname_set("short").expect("fits");
        assert!(tx.cname_set(&"x".repeat(200)).is_err());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut tx = sender();
        assert!(tx.session_timeout_set(0).is_err());
        assert!(tx.keepalive_timeout_set(0).is_err());
        tx.session_timeout_set(6000).expect("valid");
        tx.keepalive_timeout_set(1000).expect("valid");
    }

    #[test]
    fn test_data_write_before_start_fails() {
        let tx = sender();
        assert!(matches!(
            tx.data_write(DataBlock::new(vec![1, 2, 3])),
            Err(Error::NotStarted)
        ));
    }

    #[test]
    fn test_peer_create_validates_config() {
        let mut tx = sender();
        let bad = PeerConfig::default(); // empty address
        assert!(matches!(
            tx.peer_create(&bad),
            Err(Error::ConfigInvalid(_))
        ));
    }
}
