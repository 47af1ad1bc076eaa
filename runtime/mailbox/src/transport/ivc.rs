//! Ring/doorbell backend
//!
//! Every channel is a pair of single-frame rings. The core reads and writes
//! local staging frames; `signal_remote`/`post_reply` copy the outbound
//! staging frame into the transmit ring (write-advance) and the receive-side
//! queries copy the head of the receive ring into the inbound staging frame
//! without consuming it. `release_after_read` is the read-advance.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bpmp_ipc::{Doorbell, FrameRef, FrameRegion, IvcEndpoint, IvcSharedArea, Side};

use super::{ChannelFrames, Transport};
use crate::error::{MailboxError, Result, WaitPhase};

pub struct IvcTransport {
    area: Arc<IvcSharedArea>,
    doorbell: Arc<dyn Doorbell>,
    /// Two staging frames per channel: inbound at 2n, outbound at 2n + 1
    staging: Arc<FrameRegion>,
}

impl IvcTransport {
    pub fn new(area: Arc<IvcSharedArea>, doorbell: Arc<dyn Doorbell>) -> Self {
        let staging = Arc::new(FrameRegion::new(area.channel_count() * 2));
        Self {
            area,
            doorbell,
            staging,
        }
    }

    fn endpoint(&self, channel: usize) -> Option<IvcEndpoint<'_>> {
        self.area
            .channel(channel)
            .ok()
            .map(|ch| ch.endpoint(Side::Local))
    }

    /// Copy the head of the receive ring into the inbound staging frame
    fn stage_inbound(&self, channel: usize) -> bool {
        let Some(ep) = self.endpoint(channel) else {
            return false;
        };
        match (ep.rx().peek(), self.staging.get(channel * 2)) {
            (Ok(frame), Some(slot)) => {
                slot.store(&frame);
                true
            }
            _ => false,
        }
    }

    fn push_outbound(&self, channel: usize) -> Result<()> {
        let ep = self
            .endpoint(channel)
            .ok_or(MailboxError::ConsistencyFault { channel })?;
        let slot = self
            .staging
            .get(channel * 2 + 1)
            .ok_or(MailboxError::ConsistencyFault { channel })?;
        ep.tx()
            .push(&slot.load())
            .map_err(|_| MailboxError::ConsistencyFault { channel })
    }

    /// Drive the reset handshake on `channels` until both sides agree
    fn establish(&self, channels: &[usize], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut pending: Vec<usize> = channels.to_vec();

        while !pending.is_empty() {
            pending.retain(|&ch| {
                let Some(ep) = self.endpoint(ch) else {
                    return false;
                };
                let before = ep.link_state();
                ep.notified();
                if ep.link_state() != before {
                    self.doorbell.ring(ch);
                }
                !ep.is_established()
            });

            if pending.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                log::error!("bpmp: ivc channels {:?} never established", pending);
                return Err(MailboxError::NotReady);
            }
            std::thread::yield_now();
        }
        Ok(())
    }
}

impl Transport for IvcTransport {
    fn name(&self) -> &'static str {
        "ivc"
    }

    fn channel_count(&self) -> usize {
        self.area.channel_count()
    }

    fn map_channel(&self, channel: usize) -> Result<ChannelFrames> {
        if channel >= self.channel_count() {
            return Err(MailboxError::Ipc(bpmp_ipc::IpcError::InvalidChannel {
                channel,
            }));
        }
        Ok(ChannelFrames {
            inbound: FrameRef::new(self.staging.clone(), channel * 2)?,
            outbound: FrameRef::new(self.staging.clone(), channel * 2 + 1)?,
        })
    }

    fn outbound_free(&self, channel: usize) -> bool {
        self.endpoint(channel)
            .is_some_and(|ep| ep.is_established() && !ep.tx().is_full())
    }

    fn inbound_signalled(&self, channel: usize) -> bool {
        self.stage_inbound(channel)
    }

    fn outbound_acked(&self, channel: usize) -> bool {
        self.stage_inbound(channel)
    }

    fn signal_remote(&self, channel: usize) -> Result<()> {
        self.push_outbound(channel)
    }

    fn release_after_read(&self, channel: usize) -> Result<()> {
        let ep = self
            .endpoint(channel)
            .ok_or(MailboxError::ConsistencyFault { channel })?;
        ep.rx()
            .pop()
            .map(|_| ())
            .map_err(|_| MailboxError::ConsistencyFault { channel })
    }

    fn post_reply(&self, channel: usize) -> Result<()> {
        self.push_outbound(channel)
    }

    fn ring_doorbell(&self, channel: usize) {
        self.doorbell.ring(channel);
    }

    fn handshake(&self, timeout: Duration) -> Result<()> {
        let channels: Vec<usize> = (0..self.channel_count()).collect();
        for &ch in &channels {
            if let Some(ep) = self.endpoint(ch) {
                ep.reset();
            }
            self.doorbell.ring(ch);
        }
        self.establish(&channels, timeout)?;
        log::info!("bpmp: ivc handshake complete on {} channels", channels.len());
        Ok(())
    }

    fn resume(&self, timeout: Duration) -> Result<()> {
        let lost: Vec<usize> = (0..self.channel_count())
            .filter(|&ch| self.endpoint(ch).is_some_and(|ep| !ep.is_established()))
            .collect();
        if lost.is_empty() {
            return Ok(());
        }
        log::info!("bpmp: re-establishing ivc channels {:?}", lost);
        self.establish(&lost, timeout)
            .map_err(|_| MailboxError::Timeout(WaitPhase::Handshake))
    }
}
