// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Receiver context: reassembles flows, schedules NACKs, and hands the
//! repaired stream to the application.

use std::time::Duration;

use crate::config::{LogLevel, NackType, PeerConfig, Profile};
use crate::context::Context;
use crate::engine::reactor::{ConnectCallback, DisconnectCallback, OobCallback};
use crate::engine::Role;
use crate::output::DataCallback;
use crate::peer::PeerId;
use crate::protocol::crypto::{KeySize, Psk};
use crate::stats::StatsSnapshot;
use crate::{DataBlock, Error, OobBlock};

/// A RIST receiver.
///
/// Peers are listening endpoints; the sender's address is learned from
/// its first datagram. Reassembled packets are consumed either through a
/// callback ([`Receiver::data_callback_set`]) or by polling
/// [`Receiver::data_read`].
///
/// ```no_run
/// use std::time::Duration;
/// use rist::{Receiver, Profile, LogLevel, PeerConfig};
///
/// let mut rx = Receiver::new(Profile::Main, LogLevel::Info)?;
/// rx.peer_create(&PeerConfig {
///     address: "0.0.0.0:1968".to_string(),
///     ..PeerConfig::default()
/// })?;
/// rx.start()?;
/// while let Some(block) = rx.data_read(Duration::from_millis(100))? {
///     // feed block.payload to the demuxer
/// }
/// # Ok::<(), rist::Error>(())
/// ```
pub struct Receiver {
    ctx: Context,
}

impl Receiver {
    pub fn new(profile: Profile, log_level: LogLevel) -> Result<Self, Error> {
        Ok(Self {
            ctx: Context::new(Role::Receiver, profile, 0, log_level)?,
        })
    }

    /// Install the authentication/disconnect handlers (reactor-thread
    /// callbacks; they must not call back into this context).
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

    /// Add a listening peer endpoint.
    pub fn peer_create(&mut self, config: &PeerConfig) -> Result<PeerId, Error> {
        self.ctx.peer_create(config)
    }

    pub fn peer_destroy(&mut self, peer: PeerId) -> Result<(), Error> {
        self.ctx.peer_destroy(peer)
    }

    /// Enable AES link decryption (main/advanced profile only).
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

    pub fn session_timeout_set(&mut self, timeout_ms: u32) -> Result<(), Error> {
        if timeout_ms == 0 {
            return Err(Error::ConfigInvalid("session timeout must be > 0".to_string()));
        }
        self.ctx
            .core_mut()?
            .set_session_timeout(Duration::from_millis(u64::from(timeout_ms)));
        Ok(())
    }

    pub fn keepalive_timeout_set(&mut self, interval_ms: u32) -> Result<(), Error> {
        if interval_ms == 0 {
            return Err(Error::ConfigInvalid("keepalive interval must be > 0".to_string()));
        }
        self.ctx
            .core_mut()?
            .set_keepalive_interval(Duration::from_millis(u64::from(interval_ms)));
        Ok(())
    }

    /// Output smoothing horizon in ms: a packet is delivered at its
    /// arrival time plus this much, preserving order.
    pub fn max_jitter_set(&mut self, jitter_ms: u32) -> Result<(), Error> {
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

    /// Choose the NACK encoding (RANGE by default; BITMASK is denser for
    /// clustered loss).
    pub fn nack_type_set(&mut self, nack_type: NackType) -> Result<(), Error> {
        self.ctx.core_mut()?.config_mut().nack_type = nack_type;
        Ok(())
    }

    /// Deliver reassembled packets through a callback on the reactor
    /// thread instead of the queue. The callback must not block.
    pub fn data_callback_set(&mut self, cb: Option<DataCallback>) -> Result<(), Error> {
        self.ctx.core_mut()?.set_data_callback(cb);
        Ok(())
    }

    /// Write one wake byte to `fd` whenever data is queued; the consumer
    /// drains with `data_read`.
    pub fn notify_fd_set(&mut self, fd: Option<i32>) -> Result<(), Error> {
        self.ctx.core_mut()?.set_notify_fd(fd);
        Ok(())
    }

    /// Start the receive/reassembly engine.
    pub fn start(&mut self) -> Result<(), Error> {
        self.ctx.start()
    }

    /// Pop one reassembled block, waiting up to `timeout` if the queue is
    /// empty. `Duration::ZERO` polls without waiting.
    pub fn data_read(&self, timeout: Duration) -> Result<Option<DataBlock>, Error> {
        self.ctx.data_read(timeout)
    }

    /// Send an out-of-band block back to the sender.
    pub fn oob_write(&self, block: OobBlock) -> Result<usize, Error> {
        self.ctx.oob_write(block)
    }

    /// Read one incoming OOB block from the fifo.
    pub fn oob_read(&self, timeout: Duration) -> Result<Option<OobBlock>, Error> {
        self.ctx.oob_read(timeout)
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
