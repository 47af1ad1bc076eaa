//! Lock-free single-producer/single-consumer frame ring
//!
//! Each direction of a doorbell-transport channel is one `SharedRing`. The
//! producer owns `head`, the consumer owns `tail`; one slot is always left
//! empty to tell full from empty, so a ring of `N` slots holds `N - 1` frames.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{IpcError, MessageFrame, Result, SharedFrame};

/// Shared memory ring buffer of message frames
///
/// # Type Parameters
/// * `N` - Number of slots (must be power of 2)
///
/// # Lock-Free Guarantees
/// - Single producer, single consumer (SPSC)
/// - Wait-free for producer (if space available)
/// - Wait-free for consumer (if data available)
#[repr(C)]
pub struct SharedRing<const N: usize> {
    /// Frame slots
    slots: [SharedFrame; N],
    /// Head index (producer writes here)
    head: AtomicUsize,
    /// Tail index (consumer reads here)
    tail: AtomicUsize,
}

impl<const N: usize> SharedRing<N> {
    /// Create an empty ring
    ///
    /// # Panics
    /// Panics if N is not a power of 2
    pub fn new() -> Self {
        assert!(N.is_power_of_two(), "Ring buffer size must be power of 2");

        Self {
            slots: core::array::from_fn(|_| SharedFrame::new()),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Number of frames the ring can hold at once
    pub const fn capacity(&self) -> usize {
        N - 1
    }

    /// Push a frame (producer side, "write-advance")
    ///
    /// # Errors
    /// Returns `IpcError::BufferFull` if the ring is full; nothing is written
    pub fn push(&self, frame: &MessageFrame) -> Result<()> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        if (head + 1) % N == tail {
            return Err(IpcError::BufferFull { capacity: N - 1 });
        }

        self.slots[head].store(frame);

        // Release publishes the slot contents to the consumer
        self.head.store((head + 1) % N, Ordering::Release);
        Ok(())
    }

    /// Copy the oldest frame without consuming it (consumer side)
    ///
    /// # Errors
    /// Returns `IpcError::BufferEmpty` if there is nothing to read
    pub fn peek(&self) -> Result<MessageFrame> {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);

        if head == tail {
            return Err(IpcError::BufferEmpty);
        }

        Ok(self.slots[tail].load())
    }

    /// Consume the oldest frame (consumer side, "read-advance")
    ///
    /// # Errors
    /// Returns `IpcError::BufferEmpty` if there is nothing to read
    pub fn pop(&self) -> Result<MessageFrame> {
        let frame = self.peek()?;
        let tail = self.tail.load(Ordering::Relaxed);

        // Release tells the producer the slot may be reused
        self.tail.store((tail + 1) % N, Ordering::Release);
        Ok(frame)
    }

    /// Get current ring occupancy
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);

        if head >= tail {
            head - tail
        } else {
            N - tail + head
        }
    }

    /// Check if ring is empty
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Check if ring is full
    pub fn is_full(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head + 1) % N == tail
    }

    /// Rewind the producer index; only legal while the link is being reset
    pub fn reset_head(&self) {
        self.head.store(0, Ordering::Release);
    }

    /// Rewind the consumer index; only legal while the link is being reset
    pub fn reset_tail(&self) {
        self.tail.store(0, Ordering::Release);
    }
}

impl<const N: usize> Default for SharedRing<N> {
    fn default() -> Self {
        Self::new()
    }
}
