// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-producer single-consumer ring for application commands.
//!
//! Lock-free with atomic head/tail counters over a power-of-two slot
//! array. The application thread pushes, the reactor pops; a full ring
//! rejects the push so the caller can surface `QueueFull` instead of
//! blocking the reactor.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct SpscRing<T> {
    slots: Box<[UnsafeCell<Option<T>>]>,
    mask: usize,
    /// Producer counter (monotonic, masked on access).
    head: AtomicUsize,
    /// Consumer counter.
    tail: AtomicUsize,
}

// SAFETY: the SPSC protocol guarantees a slot is written by exactly one
// thread at a time: the producer only writes slots the consumer has
// drained (head - tail < capacity), and the acquire/release pairing on
// head/tail publishes the slot contents.
unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T> SpscRing<T> {
    /// Create a ring with capacity rounded up to a power of two.
    pub fn with_capacity(n: usize) -> Self {
        assert!(n > 0, "capacity must be > 0");
        let capacity = n.next_power_of_two();
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Producer side. Returns the value back if the ring is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.capacity() {
            return Err(value);
        }
        // SAFETY: slot is outside the consumer's visible range until the
        // head store below.
        unsafe {
            *self.slots[head & self.mask].get() = Some(value);
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer side.
    pub fn pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        // SAFETY: the producer will not touch this slot again until the
        // tail store below makes it writable.
        let value = unsafe { (*self.slots[tail & self.mask].get()).take() };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        value
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_push_pop_fifo() {
        let ring = SpscRing::with_capacity(8);
        for i in 0..5 {
            ring.push(i).expect("ring has room");
        }
        for i in 0..5 {
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_full_ring_rejects() {
        let ring = SpscRing::with_capacity(4);
        for i in 0..4 {
            ring.push(i).expect("ring has room");
        }
        assert_eq!(ring.push(99), Err(99));
        assert_eq!(ring.pop(), Some(0));
        ring.push(99).expect("slot freed");
    }

    #[test]
    fn test_capacity_rounds_up() {
        let ring = SpscRing::<u8>::with_capacity(5);
        assert_eq!(ring.capacity(), 8);
    }

    #[test]
    fn test_cross_thread_transfer() {
        let ring = Arc::new(SpscRing::with_capacity(1024));
        let producer_ring = Arc::clone(&ring);

        let producer = thread::spawn(move || {
            for i in 0..10_000u64 {
                loop {
                    if producer_ring.push(i).is_ok() {
                        break;
                    }
                    std::hint::spin_loop();
                }
            }
        });

        let mut expected = 0u64;
        while expected < 10_000 {
            if let Some(v) = ring.pop() {
                assert_eq!(v, expected, "FIFO order must hold across threads");
                expected += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        producer.join().expect("producer finished");
    }
}
