// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Loss repair: sender history, receiver reassembly, NACK scheduling.
//!
//! The sender keeps a [`history_cache::HistoryCache`] of recently sent
//! packets and serves retransmissions against incoming NACKs. The receiver
//! reassembles each flow in a [`window::ReassemblyWindow`], while the
//! [`nack::NackScheduler`] decides when gaps are worth requesting again.
//! [`flow`] binds the receiver pieces together per flow id.

pub mod flow;
pub mod history_cache;
pub mod nack;
pub mod window;

pub use flow::{Flow, FlowTable, FlowTick};
pub use history_cache::{HistoryCache, HistoryEntry};
pub use nack::NackScheduler;
pub use window::{HeldPacket, InsertOutcome, ReassemblyWindow, WindowCounters};
