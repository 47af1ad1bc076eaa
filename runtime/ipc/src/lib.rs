//! BPMP shared memory - Frames, rings and channel state shared with the co-processor
//!
//! # Purpose
//! Defines everything that physically lives in memory visible to both the CPU
//! complex and the BPMP: the fixed-size message frame, the lock-free frame
//! rings used by the doorbell transport, and the 2-bit channel state register
//! used by the raw semaphore transport.
//!
//! # Integration Points
//! - Depends on: nothing beyond `core`/`alloc`
//! - Provides to: `bpmp-mailbox` (local side), `bpmp-mock` (remote side)
//! - IPC endpoints: none, this is the wire layer
//! - Capabilities required: a shared, cache-coherent memory region
//!
//! # Architecture
//! Frame contents are stored as `AtomicU32` words so that both sides can
//! touch the same memory without data races. Word accesses are relaxed;
//! publication happens through a release store on the owning state word
//! (ring head/tail or the state register) and is observed with an acquire load.
//!
//! # Memory Layout
//! | field | size | meaning |
//! |---|---|---|
//! | code  | 4 bytes, signed | request: message-type id; reply: status code |
//! | flags | 4 bytes | bit 0 = DO_ACK, bit 1 = RING_DOORBELL |
//! | data  | 120 bytes | message-specific payload, little-endian |

#![no_std]

#[cfg(test)]
extern crate std;

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use static_assertions::const_assert_eq;

pub mod ivc;
pub mod raw;
pub mod ring;
pub mod state;

pub use ivc::{IvcChannel, IvcEndpoint, IvcSharedArea, LinkState, Side};
pub use raw::RawSharedArea;
pub use ring::SharedRing;
pub use state::{ChannelState, StateRegister};

/// Largest payload a single frame can carry
pub const MAX_PAYLOAD: usize = 120;

/// Size of one frame in shared memory
pub const FRAME_SIZE: usize = 128;

const FRAME_WORDS: usize = FRAME_SIZE / 4;
const HEADER_WORDS: usize = 2;

const_assert_eq!(core::mem::size_of::<MessageFrame>(), FRAME_SIZE);
const_assert_eq!(MAX_PAYLOAD, (FRAME_WORDS - HEADER_WORDS) * 4);

/// IPC error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Payload does not fit in a frame
    PayloadTooLarge { len: usize },
    /// Ring buffer is full
    BufferFull { capacity: usize },
    /// Ring buffer is empty
    BufferEmpty,
    /// Channel index outside the shared area
    InvalidChannel { channel: usize },
    /// Channel state did not allow the requested transition
    InvalidTransition { channel: usize, from: ChannelState },
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcError::PayloadTooLarge { len } => {
                write!(f, "payload of {} bytes exceeds {} byte frame", len, MAX_PAYLOAD)
            }
            IpcError::BufferFull { capacity } => write!(f, "ring full ({} frames)", capacity),
            IpcError::BufferEmpty => write!(f, "ring empty"),
            IpcError::InvalidChannel { channel } => write!(f, "channel {} out of range", channel),
            IpcError::InvalidTransition { channel, from } => {
                write!(f, "channel {} cannot leave state {:?}", channel, from)
            }
        }
    }
}

pub type Result<T> = core::result::Result<T, IpcError>;

bitflags! {
    /// Frame flag word
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u32 {
        /// Remote must reply
        const DO_ACK = 1 << 0;
        /// Remote must ring the doorbell once the reply is written
        const RING_DOORBELL = 1 << 1;
    }
}

/// Local copy of one message frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MessageFrame {
    /// Message-type id on requests, status code on replies
    pub code: i32,
    pub flags: FrameFlags,
    pub data: [u8; MAX_PAYLOAD],
}

impl MessageFrame {
    /// An all-zero frame
    pub const fn empty() -> Self {
        Self {
            code: 0,
            flags: FrameFlags::empty(),
            data: [0; MAX_PAYLOAD],
        }
    }

    /// Build a frame, copying `payload` into the front of the data area
    ///
    /// # Errors
    /// Returns `IpcError::PayloadTooLarge` if `payload` exceeds `MAX_PAYLOAD`
    pub fn new(code: i32, flags: FrameFlags, payload: &[u8]) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD {
            return Err(IpcError::PayloadTooLarge { len: payload.len() });
        }
        let mut frame = Self::empty();
        frame.code = code;
        frame.flags = flags;
        frame.data[..payload.len()].copy_from_slice(payload);
        Ok(frame)
    }

    /// Little-endian u32 at byte `offset` of the payload
    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let bytes = self.data.get(offset..offset.checked_add(4)?)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl Default for MessageFrame {
    fn default() -> Self {
        Self::empty()
    }
}

/// One frame slot in shared memory
#[repr(C)]
pub struct SharedFrame {
    words: [AtomicU32; FRAME_WORDS],
}

impl SharedFrame {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU32 = AtomicU32::new(0);
        Self {
            words: [ZERO; FRAME_WORDS],
        }
    }

    /// Copy a local frame into shared memory
    ///
    /// Stores are relaxed. The writer must publish the frame with a release
    /// operation on the channel state afterwards.
    pub fn store(&self, frame: &MessageFrame) {
        self.words[0].store(frame.code as u32, Ordering::Relaxed);
        self.words[1].store(frame.flags.bits(), Ordering::Relaxed);
        for (word, chunk) in self.words[HEADER_WORDS..]
            .iter()
            .zip(frame.data.chunks_exact(4))
        {
            word.store(
                u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                Ordering::Relaxed,
            );
        }
    }

    /// Copy the shared frame into a local frame
    pub fn load(&self) -> MessageFrame {
        let mut frame = MessageFrame::empty();
        frame.code = self.code();
        frame.flags = self.flags();
        for (word, chunk) in self.words[HEADER_WORDS..]
            .iter()
            .zip(frame.data.chunks_exact_mut(4))
        {
            chunk.copy_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
        }
        frame
    }

    pub fn code(&self) -> i32 {
        self.words[0].load(Ordering::Relaxed) as i32
    }

    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_bits_truncate(self.words[1].load(Ordering::Relaxed))
    }

    /// Copy the first `out.len()` payload bytes into `out`
    pub fn read_data(&self, out: &mut [u8]) {
        let len = out.len().min(MAX_PAYLOAD);
        let frame = self.load();
        out[..len].copy_from_slice(&frame.data[..len]);
    }

    pub fn clear(&self) {
        for word in &self.words {
            word.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for SharedFrame {
    fn default() -> Self {
        Self::new()
    }
}

/// Contiguous block of frames allocated once for the lifetime of the mailbox
pub struct FrameRegion {
    frames: Box<[SharedFrame]>,
}

impl FrameRegion {
    pub fn new(count: usize) -> Self {
        let frames = (0..count).map(|_| SharedFrame::new()).collect();
        Self { frames }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&SharedFrame> {
        self.frames.get(slot)
    }
}

/// Counted reference to one frame inside a `FrameRegion`
#[derive(Clone)]
pub struct FrameRef {
    region: Arc<FrameRegion>,
    slot: usize,
}

impl FrameRef {
    /// # Errors
    /// Returns `IpcError::InvalidChannel` if `slot` is past the end of the region
    pub fn new(region: Arc<FrameRegion>, slot: usize) -> Result<Self> {
        if slot >= region.len() {
            return Err(IpcError::InvalidChannel { channel: slot });
        }
        Ok(Self { region, slot })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Deref for FrameRef {
    type Target = SharedFrame;

    fn deref(&self) -> &SharedFrame {
        // Bounds checked in `FrameRef::new`; regions never shrink.
        &self.region.frames[self.slot]
    }
}

impl fmt::Debug for FrameRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRef").field("slot", &self.slot).finish()
    }
}

/// Doorbell towards the other side of a channel
///
/// On hardware this is an HSP doorbell or semaphore interrupt; in simulation
/// it is whatever wakes the peer thread.
pub trait Doorbell: Send + Sync {
    fn ring(&self, channel: usize);
}

impl<F> Doorbell for F
where
    F: Fn(usize) + Send + Sync,
{
    fn ring(&self, channel: usize) {
        self(channel)
    }
}
