//! Channel state register for the raw semaphore transport
//!
//! Every channel owns two bits of a shared 32-bit register. The four values
//! are the only positions a channel can be in:
//!
//! ```text
//! Signalled --release--> Free            (local consumed a remote request)
//! Free      --queue----> Queued          (local wrote a request)
//! Queued    --ack------> Acked           (remote processed it)
//! Acked     --release--> Free            (local consumed the reply)
//! Acked     --force_free-> Free          (request carried no DO_ACK)
//! Free      --signal---> Signalled       (remote wrote a request)
//! ```
//!
//! The local side never produces `Signalled`; the remote side never leaves
//! `Acked`. Each transition is a single compare-and-swap on the whole word,
//! so a rejected transition leaves the register untouched.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::{IpcError, Result};

/// Channels addressable by one register (2 bits each)
pub const MAX_CHANNELS: usize = 16;

const STATE_MASK: u32 = 0b11;

/// Position of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelState {
    /// SL_SIGL: signalled by the remote, not yet read
    Signalled = 0b00,
    /// SL_QUED: enqueued by the local side, awaiting remote pickup
    Queued = 0b01,
    /// MA_FREE: free for a new local write
    Free = 0b10,
    /// MA_ACKD: acknowledged by the remote, reply ready
    Acked = 0b11,
}

impl ChannelState {
    pub const fn from_bits(bits: u32) -> Self {
        match bits & STATE_MASK {
            0b00 => ChannelState::Signalled,
            0b01 => ChannelState::Queued,
            0b10 => ChannelState::Free,
            _ => ChannelState::Acked,
        }
    }

    pub const fn bits(self) -> u32 {
        self as u32
    }
}

/// Shared 2-bit-per-channel state word
#[repr(C)]
pub struct StateRegister {
    bits: AtomicU32,
}

impl StateRegister {
    /// Register with every channel free
    pub const fn new() -> Self {
        Self {
            bits: AtomicU32::new(Self::all_free()),
        }
    }

    const fn all_free() -> u32 {
        let mut word = 0;
        let mut ch = 0;
        while ch < MAX_CHANNELS {
            word |= ChannelState::Free.bits() << (ch * 2);
            ch += 1;
        }
        word
    }

    fn shift(channel: usize) -> Result<u32> {
        if channel >= MAX_CHANNELS {
            return Err(IpcError::InvalidChannel { channel });
        }
        Ok((channel * 2) as u32)
    }

    /// Current state of `channel`
    pub fn state(&self, channel: usize) -> Result<ChannelState> {
        let shift = Self::shift(channel)?;
        Ok(ChannelState::from_bits(self.bits.load(Ordering::Acquire) >> shift))
    }

    /// Raw register contents
    pub fn snapshot(&self) -> u32 {
        self.bits.load(Ordering::Acquire)
    }

    /// Move `channel` to `to` if its current state is one of `from`
    fn transition(&self, channel: usize, from: &[ChannelState], to: ChannelState) -> Result<()> {
        let shift = Self::shift(channel)?;
        self.bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let current = ChannelState::from_bits(word >> shift);
                if from.contains(&current) {
                    Some((word & !(STATE_MASK << shift)) | (to.bits() << shift))
                } else {
                    None
                }
            })
            .map(|_| ())
            .map_err(|word| IpcError::InvalidTransition {
                channel,
                from: ChannelState::from_bits(word >> shift),
            })
    }

    /// Local: hand a freshly written request to the remote (Free -> Queued)
    pub fn queue(&self, channel: usize) -> Result<()> {
        self.transition(channel, &[ChannelState::Free], ChannelState::Queued)
    }

    /// Local: consume a remote request or reply (Signalled | Acked -> Free)
    pub fn release(&self, channel: usize) -> Result<()> {
        self.transition(
            channel,
            &[ChannelState::Signalled, ChannelState::Acked],
            ChannelState::Free,
        )
    }

    /// Local: return a channel whose request carried no DO_ACK
    ///
    /// The remote marks every processed request `Acked`, whether or not a
    /// reply was requested. Nobody will consume such a reply, so the sender
    /// flips the channel straight back to `Free`.
    pub fn force_free(&self, channel: usize) -> Result<()> {
        self.transition(channel, &[ChannelState::Acked], ChannelState::Free)
    }

    /// Remote: mark a queued request processed (Queued -> Acked)
    pub fn ack(&self, channel: usize) -> Result<()> {
        self.transition(channel, &[ChannelState::Queued], ChannelState::Acked)
    }

    /// Remote: post a request of its own (Free -> Signalled)
    pub fn signal(&self, channel: usize) -> Result<()> {
        self.transition(channel, &[ChannelState::Free], ChannelState::Signalled)
    }

    /// Remote boot: every channel back to Free
    pub fn reset(&self) {
        self.bits.store(Self::all_free(), Ordering::Release);
    }
}

impl Default for StateRegister {
    fn default() -> Self {
        Self::new()
    }
}
