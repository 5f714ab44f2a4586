//! Priority queue of messages waiting to be written to the hardware.

use bytes::Bytes;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use tokio::time::Instant;

/// A protocol-encoded message and the number of replies it provokes.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub message: Bytes,
    pub expected_replies: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Priority {
    /// Seconds since the buffer was created, minus the urgency bias
    due: f64,
    seq: u64,
}

impl Eq for Priority {}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .total_cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Entry {
    priority: Priority,
    message: PendingMessage,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority)
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Oldest-first queue; an urgency bias moves a message ahead by that many seconds.
///
/// The capacity is soft: pushing never fails, [`OutboundBuffer::is_full`]
/// only tells the auto-querier to hold back.
#[derive(Debug)]
pub struct OutboundBuffer {
    heap: BinaryHeap<Reverse<Entry>>,
    epoch: Instant,
    next_seq: u64,
    capacity: usize,
}

impl OutboundBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            epoch: Instant::now(),
            next_seq: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, message: PendingMessage, urgency_bias: f64, now: Instant) {
        let due = now.saturating_duration_since(self.epoch).as_secs_f64() - urgency_bias;
        let priority = Priority {
            due,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.heap.push(Reverse(Entry { priority, message }));
    }

    pub fn pop(&mut self) -> Option<PendingMessage> {
        self.heap.pop().map(|Reverse(entry)| entry.message)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.capacity
    }
}
