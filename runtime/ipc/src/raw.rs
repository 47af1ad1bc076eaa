//! Shared area of the raw semaphore transport
//!
//! One state register, one "BPMP ready" bit, and a pair of frames per
//! channel. Frame naming is from the CPU's point of view: the inbound frame
//! is written by the remote, the outbound frame by the local side.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::state::MAX_CHANNELS;
use crate::{FrameRef, FrameRegion, IpcError, Result, StateRegister};

pub struct RawSharedArea {
    state: StateRegister,
    ready: AtomicBool,
    frames: Arc<FrameRegion>,
    channels: usize,
}

impl RawSharedArea {
    /// Allocate the area for `channels` channels
    ///
    /// # Errors
    /// Returns `IpcError::InvalidChannel` if the register cannot encode that many channels
    pub fn new(channels: usize) -> Result<Self> {
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(IpcError::InvalidChannel { channel: channels });
        }
        Ok(Self {
            state: StateRegister::new(),
            ready: AtomicBool::new(false),
            frames: Arc::new(FrameRegion::new(channels * 2)),
            channels,
        })
    }

    pub fn channel_count(&self) -> usize {
        self.channels
    }

    pub fn state(&self) -> &StateRegister {
        &self.state
    }

    /// Frame written by the remote on `channel`
    pub fn inbound_frame(&self, channel: usize) -> Result<FrameRef> {
        self.check(channel)?;
        FrameRef::new(self.frames.clone(), channel * 2)
    }

    /// Frame written by the local side on `channel`
    pub fn outbound_frame(&self, channel: usize) -> Result<FrameRef> {
        self.check(channel)?;
        FrameRef::new(self.frames.clone(), channel * 2 + 1)
    }

    /// Whether the remote has raised its ready bit
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Remote: raise or drop the ready bit
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    fn check(&self, channel: usize) -> Result<()> {
        if channel >= self.channels {
            return Err(IpcError::InvalidChannel { channel });
        }
        Ok(())
    }
}
