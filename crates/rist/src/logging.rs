// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Non-blocking logging backend.
//!
//! The reactor formats records into a bounded ring; a detached
//! low-priority thread drains the ring to stderr. The hot path never
//! issues a write syscall, and a full ring drops the record (dropped
//! records are themselves counted and reported by the drainer).
//!
//! The backend installs itself behind the `log` facade at first context
//! creation. The process-wide level is set once, from the first context's
//! configured level, and never mutated afterwards.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crossbeam::queue::ArrayQueue;

use crate::config::LogLevel;
use crate::engine::wake::WakeNotifier;

/// Records buffered between drainer wake-ups.
const LOG_RING_DEPTH: usize = 4096;
/// Drainer sleep when idle.
const DRAIN_IDLE: Duration = Duration::from_millis(50);

struct RingLogger {
    ring: Arc<ArrayQueue<String>>,
    notifier: Arc<WakeNotifier>,
    dropped: AtomicU64,
}

impl log::Log for RingLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "[{}] {} {}",
            record.level(),
            record.target(),
            record.args()
        );
        if self.ring.push(line).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notifier.notify();
    }

    fn flush(&self) {
        self.notifier.notify();
    }
}

static LOGGER: OnceLock<&'static RingLogger> = OnceLock::new();

/// Install the ring logger and spawn its drain thread. Only the first
/// call takes effect; later contexts inherit the first level.
pub fn init(level: LogLevel) {
    LOGGER.get_or_init(|| {
        let ring = Arc::new(ArrayQueue::new(LOG_RING_DEPTH));
        let notifier = Arc::new(WakeNotifier::new());
        let logger: &'static RingLogger = Box::leak(Box::new(RingLogger {
            ring: ring.clone(),
            notifier: notifier.clone(),
            dropped: AtomicU64::new(0),
        }));

        std::thread::Builder::new()
            .name("rist-log".to_string())
            .spawn(move || drain_loop(&ring, &notifier, logger))
            .ok();

        if log::set_logger(logger).is_ok() {
            log::set_max_level(level.to_filter());
        }
        logger
    });
}

fn drain_loop(ring: &ArrayQueue<String>, notifier: &WakeNotifier, logger: &RingLogger) {
    let mut reported_drops = 0u64;
    loop {
        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        while let Some(line) = ring.pop() {
            let _ = writeln!(out, "{line}");
        }
        let dropped = logger.dropped.load(Ordering::Relaxed);
        if dropped > reported_drops {
            let _ = writeln!(out, "[WARN] rist::logging {} records dropped", dropped - reported_drops);
            reported_drops = dropped;
        }
        drop(out);
        notifier.wait_timeout(DRAIN_IDLE);
    }
}
