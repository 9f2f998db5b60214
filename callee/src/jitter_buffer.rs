//! Jitter buffer between the network receive path and playout.
//!
//! A bounded FIFO: packets come out in arrival order, and when the buffer
//! is full the newest packet is dropped so the receive path never waits
//! on a lagging consumer. Sequence-based ordering and loss accounting
//! live in [`crate::stats`], alongside delivery rather than in its way.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{debug, warn};

use voice_call_common::MediaPacket;

/// Shared single-writer/single-reader packet queue.
///
/// Wrap in an `Arc` to hand one end to the receive loop and the other
/// to the playout consumer. Neither operation blocks beyond the short
/// internal lock.
///
/// # Example
///
/// ```
/// use callee::jitter_buffer::JitterBuffer;
/// use voice_call_common::MediaPacket;
///
/// let buffer = JitterBuffer::new(2);
/// assert!(buffer.offer(MediaPacket::new(0, 0, 0, 0x1234, vec![1])));
/// assert!(buffer.offer(MediaPacket::new(0, 1, 160, 0x1234, vec![2])));
/// assert!(!buffer.offer(MediaPacket::new(0, 2, 320, 0x1234, vec![3])));
///
/// assert_eq!(buffer.take().map(|p| p.sequence()), Some(0));
/// ```
pub struct JitterBuffer {
    // ---
    capacity: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    queue: VecDeque<MediaPacket>,
    dropped: u64,
}

impl JitterBuffer {
    // ---
    /// Creates an empty buffer holding at most `capacity` packets.
    pub fn new(capacity: usize) -> Self {
        // ---
        Self {
            capacity,
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                dropped: 0,
            }),
        }
    }

    /// Stores `packet` if there is room.
    ///
    /// Returns `false` when the buffer was full and the packet was
    /// discarded. A full buffer is not an error.
    pub fn offer(&self, packet: MediaPacket) -> bool {
        // ---
        let mut inner = self.inner.lock();
        if inner.queue.len() >= self.capacity {
            inner.dropped += 1;
            if inner.dropped == 1 || inner.dropped % 100 == 0 {
                warn!(
                    "Jitter buffer full ({} packets), dropped seq={} ({} dropped so far)",
                    self.capacity,
                    packet.sequence(),
                    inner.dropped
                );
            }
            return false;
        }

        inner.queue.push_back(packet);
        true
    }

    /// Removes the oldest packet, or returns `None` right away when empty.
    pub fn take(&self) -> Option<MediaPacket> {
        // ---
        let packet = self.inner.lock().queue.pop_front();
        if let Some(p) = &packet {
            debug!("Playout seq={} ts={}", p.sequence(), p.timestamp());
        }
        packet
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Packets discarded because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }
}
