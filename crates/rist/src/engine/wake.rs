// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Consumer wake-up for the blocking read APIs.
//!
//! Two tiers: an atomic flag the reactor sets on every delivery (no lock
//! on the hot path), and a condvar the consumer falls back to when it
//! wants to block in `data_read`/`oob_read` with a timeout.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct WakeNotifier {
    ready: AtomicBool,
    sleeping: Mutex<bool>,
    condvar: Condvar,
}

impl WakeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer side: cheap atomic store; the condvar is only signalled
    /// when a consumer might actually be parked.
    pub fn notify(&self) {
        self.ready.store(true, Ordering::Release);
        if *self.sleeping.lock() {
            self.condvar.notify_one();
        }
    }

    /// Consume the ready flag without blocking.
    pub fn take_ready(&self) -> bool {
        self.ready.swap(false, Ordering::Acquire)
    }

    /// Block up to `timeout` for a notification. Returns immediately if
    /// one is already pending.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.take_ready() {
            return true;
        }
        let mut sleeping = self.sleeping.lock();
        if self.take_ready() {
            return true;
        }
        *sleeping = true;
        let _ = self.condvar.wait_for(&mut sleeping, timeout);
        *sleeping = false;
        // Whether woken or timed out, report what is actually there.
        self.take_ready()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_notify_before_wait_returns_immediately() {
        let n = WakeNotifier::new();
        n.notify();
        let start = Instant::now();
        assert!(n.wait_timeout(Duration::from_millis(200)));
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_timeout_expires_without_notify() {
        let n = WakeNotifier::new();
        let start = Instant::now();
        assert!(!n.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(19));
    }

    #[test]
    fn test_concurrent_notify_wakes_sleeper() {
        let n = Arc::new(WakeNotifier::new());
        let n2 = Arc::clone(&n);
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            n2.notify();
        });
        assert!(n.wait_timeout(Duration::from_millis(500)));
        waker.join().expect("waker finished");
    }

    #[test]
    fn test_take_ready_clears_flag() {
        let n = WakeNotifier::new();
        n.notify();
        assert!(n.take_ready());
        assert!(!n.take_ready());
    }
}
