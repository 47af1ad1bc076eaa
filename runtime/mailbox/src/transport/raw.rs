//! Raw semaphore backend
//!
//! Channel state lives in a shared 2-bit-per-channel register, frames sit at
//! fixed offsets, and the remote advertises readiness with a single bit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bpmp_ipc::{ChannelState, Doorbell, FrameFlags, FrameRef, RawSharedArea};

use super::{ChannelFrames, Transport};
use crate::error::{MailboxError, Result, WaitPhase};

pub struct RawTransport {
    area: Arc<RawSharedArea>,
    doorbell: Arc<dyn Doorbell>,
    /// Outbound frames, cached for the no-ack check in `outbound_free`
    outbound: Box<[FrameRef]>,
}

impl RawTransport {
    pub fn new(area: Arc<RawSharedArea>, doorbell: Arc<dyn Doorbell>) -> Result<Self> {
        let outbound = (0..area.channel_count())
            .map(|ch| area.outbound_frame(ch))
            .collect::<core::result::Result<Vec<_>, _>>()?
            .into_boxed_slice();
        Ok(Self {
            area,
            doorbell,
            outbound,
        })
    }

    fn state(&self, channel: usize) -> Option<ChannelState> {
        self.area.state().state(channel).ok()
    }

    fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while !self.area.is_ready() {
            if Instant::now() >= deadline {
                log::error!("bpmp: remote ready bit never set");
                return Err(MailboxError::NotReady);
            }
            std::thread::yield_now();
        }
        Ok(())
    }
}

impl Transport for RawTransport {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn channel_count(&self) -> usize {
        self.area.channel_count()
    }

    fn map_channel(&self, channel: usize) -> Result<ChannelFrames> {
        Ok(ChannelFrames {
            inbound: self.area.inbound_frame(channel)?,
            outbound: self.area.outbound_frame(channel)?,
        })
    }

    /// A channel is free in `Free`, or in `Acked` when the last request did
    /// not ask for an ack. The latter is flipped back to `Free` here so
    /// fire-and-forget senders never have to release their own channel.
    fn outbound_free(&self, channel: usize) -> bool {
        match self.state(channel) {
            Some(ChannelState::Free) => true,
            Some(ChannelState::Acked) => {
                // Lazy free: the remote acks a no-ack post like any other
                // request, and nothing reads that reply. The channel stays
                // Acked until the next sender asks, which frees it here.
                let no_ack = self
                    .outbound
                    .get(channel)
                    .is_some_and(|frame| !frame.flags().contains(FrameFlags::DO_ACK));
                no_ack && self.area.state().force_free(channel).is_ok()
            }
            _ => false,
        }
    }

    fn inbound_signalled(&self, channel: usize) -> bool {
        self.state(channel) == Some(ChannelState::Signalled)
    }

    fn outbound_acked(&self, channel: usize) -> bool {
        self.state(channel) == Some(ChannelState::Acked)
    }

    fn signal_remote(&self, channel: usize) -> Result<()> {
        self.area
            .state()
            .queue(channel)
            .map_err(|_| MailboxError::ConsistencyFault { channel })
    }

    fn release_after_read(&self, channel: usize) -> Result<()> {
        self.area
            .state()
            .release(channel)
            .map_err(|_| MailboxError::ConsistencyFault { channel })
    }

    fn post_reply(&self, _channel: usize) -> Result<()> {
        // The release already moved the channel to Free; the remote reads
        // the outbound frame as soon as it sees that.
        Ok(())
    }

    fn ring_doorbell(&self, channel: usize) {
        self.doorbell.ring(channel);
    }

    fn handshake(&self, timeout: Duration) -> Result<()> {
        self.wait_ready(timeout).map_err(|err| {
            log::warn!("bpmp: raw handshake failed: {}", err);
            err
        })?;
        let busy = (0..self.channel_count())
            .filter(|&ch| self.state(ch) != Some(ChannelState::Free))
            .count();
        if busy > 0 {
            log::warn!("bpmp: {} channels not free after remote boot", busy);
        }
        log::info!(
            "bpmp: raw handshake complete, state {:#010x}",
            self.area.state().snapshot()
        );
        Ok(())
    }

    fn resume(&self, timeout: Duration) -> Result<()> {
        // Register contents survive a local suspend; only the remote's
        // readiness needs confirming.
        self.wait_ready(timeout)
            .map_err(|_| MailboxError::Timeout(WaitPhase::Handshake))
    }
}
