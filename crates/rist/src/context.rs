// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Plumbing shared by the sender and receiver contexts.
//!
//! Before `start()` the core lives here and setup calls mutate it
//! directly. `start()` moves the core onto the reactor thread; from then
//! on the application talks through the command ring and the bounded
//! queues, and `destroy()`/drop joins the thread.

use std::time::{Duration, Instant};

use crate::config::{ContextConfig, LogLevel, PeerConfig, Profile};
use crate::engine::{Command, Core, Role, Shared};
use crate::peer::PeerId;
use crate::stats::StatsSnapshot;
use crate::{DataBlock, Error, OobBlock};

pub(crate) struct Context {
    core: Option<Core>,
    shared: Shared,
    thread: Option<std::thread::JoinHandle<()>>,
    flow_id: u32,
}

impl Context {
    pub fn new(role: Role, profile: Profile, flow_id: u32, log_level: LogLevel) -> Result<Self, Error> {
        crate::logging::init(log_level);
        let flow_id = match flow_id {
            0 => generate_flow_id(),
            id if id & 1 != 0 => {
                return Err(Error::ConfigInvalid(
                    "flow id must be even (odd SSRCs mark retransmissions)".to_string(),
                ))
            }
            id => id,
        };
        let mut cfg = ContextConfig::new(profile, flow_id, log_level);
        cfg.cname = format!("rist-{:08x}", flow_id);
        let core = Core::new(role, cfg, flow_id)?;
        let shared = core.shared();
        Ok(Self {
            core: Some(core),
            shared,
            thread: None,
            flow_id,
        })
    }

    pub fn flow_id(&self) -> u32 {
        self.flow_id
    }

    pub fn started(&self) -> bool {
        self.thread.is_some()
    }

    /// Setup-phase access to the core.
    pub fn core_mut(&mut self) -> Result<&mut Core, Error> {
        self.core.as_mut().ok_or(Error::AlreadyStarted)
    }

    pub fn start(&mut self) -> Result<(), Error> {
        let mut core = self.core.take().ok_or(Error::AlreadyStarted)?;
        core.start_peers(Instant::now());
        let handle = std::thread::Builder::new()
            .name("rist-reactor".to_string())
            .spawn(move || core.run())
            .map_err(Error::Io)?;
        self.thread = Some(handle);
        Ok(())
    }

    fn post(&self, cmd: Command) -> Result<(), Error> {
        if !self.started() {
            return Err(Error::NotStarted);
        }
        self.shared
            .commands
            .push(cmd)
            .map_err(|_| Error::QueueFull)?;
        let _ = self.shared.waker.wake();
        Ok(())
    }

    pub fn data_write(&self, block: DataBlock) -> Result<usize, Error> {
        let len = block.payload.len();
        self.post(Command::DataWrite(block))?;
        Ok(len)
    }

    pub fn oob_write(&self, block: OobBlock) -> Result<usize, Error> {
        let len = block.payload.len();
        self.post(Command::OobWrite(block))?;
        Ok(len)
    }

    pub fn peer_destroy(&mut self, peer: PeerId) -> Result<(), Error> {
        if self.started() {
            self.post(Command::PeerDestroy(peer))
        } else {
            self.core_mut()?.peer_destroy(peer)
        }
    }

    pub fn peer_create(&mut self, config: &PeerConfig) -> Result<PeerId, Error> {
        self.core_mut()?.peer_create(config, Instant::now())
    }

    pub fn data_read(&self, timeout: Duration) -> Result<Option<DataBlock>, Error> {
        if !self.started() {
            return Err(Error::NotStarted);
        }
        if let Some(block) = self.shared.out_queue.pop() {
            return Ok(Some(block));
        }
        if timeout.is_zero() {
            return Ok(None);
        }
        self.shared.out_notifier.wait_timeout(timeout);
        Ok(self.shared.out_queue.pop())
    }

    pub fn oob_read(&self, timeout: Duration) -> Result<Option<OobBlock>, Error> {
        if !self.started() {
            return Err(Error::NotStarted);
        }
        if let Some(block) = self.shared.oob_queue.pop() {
            return Ok(Some(block));
        }
        if timeout.is_zero() {
            return Ok(None);
        }
        self.shared.oob_notifier.wait_timeout(timeout);
        Ok(self.shared.oob_queue.pop())
    }

    pub fn stats(&self) -> std::sync::Arc<StatsSnapshot> {
        self.shared.stats.snapshot()
    }

    /// Halt the reactor and join its thread. Idempotent.
    pub fn destroy(&mut self) {
        if let Some(handle) = self.thread.take() {
            // A full command ring would swallow the shutdown; keep nudging
            // the reactor until the command lands.
            let mut cmd = Command::Shutdown;
            loop {
                match self.shared.commands.push(cmd) {
                    Ok(()) => break,
                    Err(rejected) => {
                        cmd = rejected;
                        let _ = self.shared.waker.wake();
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
            }
            let _ = self.shared.waker.wake();
            let _ = handle.join();
        }
        self.core = None;
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Even, non-zero flow id derived from the wall clock.
fn generate_flow_id() -> u32 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos().wrapping_add(d.as_secs() as u32))
        .unwrap_or(0x2A);
    let id = nanos & !1;
    if id == 0 {
        0x2A
    } else {
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_flow_ids_are_even_nonzero() {
        for _ in 0..100 {
            let id = generate_flow_id();
            assert_eq!(id & 1, 0);
            assert_ne!(id, 0);
        }
    }

    #[test]
    fn test_odd_flow_id_rejected() {
        let err = Context::new(Role::Sender, Profile::Main, 0x41, LogLevel::Quiet);
        assert!(matches!(err, Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn test_reads_require_start() {
        let ctx = Context::new(Role::Receiver, Profile::Main, 0, LogLevel::Quiet)
            .expect("context builds");
        assert!(matches!(
            ctx.data_read(Duration::ZERO),
            Err(Error::NotStarted)
        ));
        assert!(matches!(
            ctx.oob_read(Duration::ZERO),
            Err(Error::NotStarted)
        ));
    }
}
