//! Interrupt → main loop hand-off of pulses.
//!
//! A fixed-capacity single-producer/single-consumer queue per sensor. The
//! producer half lives with the capture interrupt and never blocks: when the
//! queue is full the pulse being pushed is dropped and counted.

use core::sync::atomic::{AtomicU32, Ordering};

use heapless::spsc::{Consumer, Producer, Queue};

use crate::state::{Pulse, PULSES_BUFFER_LEN};
use crate::time::{TimeDelta, Timestamp};

/// The spsc queue keeps one slot free to tell full from empty.
const QUEUE_LEN: usize = PULSES_BUFFER_LEN + 1;

pub struct PulseCircularBuffer {
    queue: Queue<Pulse, QUEUE_LEN>,
    dropped: AtomicU32,
}

impl PulseCircularBuffer {
    pub const fn new() -> Self {
        Self {
            queue: Queue::new(),
            dropped: AtomicU32::new(0),
        }
    }

    /// Split into the interrupt-side and main-loop-side halves.
    pub fn split(&mut self) -> (PulseProducer<'_>, PulseConsumer<'_>) {
        let (tx, rx) = self.queue.split();
        let dropped = &self.dropped;
        (
            PulseProducer { tx, dropped },
            PulseConsumer { rx, dropped },
        )
    }
}

impl Default for PulseCircularBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Anything that accepts freshly captured pulses.
pub trait PulseSink {
    /// Returns false when the pulse was dropped.
    fn push(&mut self, pulse: Pulse) -> bool;

    fn enqueue_pulse(&mut self, input_idx: u32, start: Timestamp, len: TimeDelta) -> bool {
        self.push(Pulse {
            input_idx,
            start_time: start,
            pulse_len: len,
        })
    }
}

/// Interrupt-side half. Bounded time, lock free.
pub struct PulseProducer<'a> {
    tx: Producer<'a, Pulse>,
    dropped: &'a AtomicU32,
}

impl PulseProducer<'_> {
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl PulseSink for PulseProducer<'_> {
    fn push(&mut self, pulse: Pulse) -> bool {
        match self.tx.enqueue(pulse) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Main-loop half.
pub struct PulseConsumer<'a> {
    rx: Consumer<'a, Pulse>,
    dropped: &'a AtomicU32,
}

impl PulseConsumer<'_> {
    pub fn pop(&mut self) -> Option<Pulse> {
        self.rx.dequeue()
    }

    pub fn peek(&self) -> Option<&Pulse> {
        self.rx.peek()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.rx.capacity()
    }

    /// Pulses lost to overflow since start.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pulse(i: u32) -> Pulse {
        Pulse {
            input_idx: 0,
            start_time: Timestamp(i * 1000),
            pulse_len: TimeDelta(100),
        }
    }

    #[test]
    fn empty_buffer_pops_nothing() {
        let mut buf = PulseCircularBuffer::new();
        let (_tx, mut rx) = buf.split();
        assert!(rx.is_empty());
        assert_eq!(rx.peek(), None);
        assert_eq!(rx.pop(), None);
        assert_eq!(rx.dropped(), 0);
    }

    #[test]
    fn preserves_arrival_order() {
        let mut buf = PulseCircularBuffer::new();
        let (mut tx, mut rx) = buf.split();
        for i in 0..5 {
            assert!(tx.push(pulse(i)));
        }
        assert_eq!(rx.peek(), Some(&pulse(0)));
        for i in 0..5 {
            assert_eq!(rx.pop(), Some(pulse(i)));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn overflow_drops_newest_and_counts() {
        let mut buf = PulseCircularBuffer::new();
        let (mut tx, mut rx) = buf.split();
        assert_eq!(rx.capacity(), PULSES_BUFFER_LEN);
        let cap = PULSES_BUFFER_LEN as u32;

        for i in 0..cap + 5 {
            let accepted = tx.push(pulse(i));
            assert_eq!(accepted, i < cap);
        }
        assert_eq!(rx.dropped(), 5);
        assert_eq!(tx.dropped(), 5);

        for i in 0..cap {
            assert_eq!(rx.pop(), Some(pulse(i)));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn space_freed_by_pop_is_reused() {
        let mut buf = PulseCircularBuffer::new();
        let (mut tx, mut rx) = buf.split();
        let cap = rx.capacity() as u32;
        for i in 0..cap {
            tx.push(pulse(i));
        }
        assert!(!tx.push(pulse(cap)));
        assert_eq!(rx.pop(), Some(pulse(0)));
        assert!(tx.push(pulse(cap + 1)));
        assert_eq!(rx.len(), cap as usize);
        assert_eq!(rx.dropped(), 1);
    }
}
