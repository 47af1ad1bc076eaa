//! Remote half of each transport
//!
//! Everything the firmware does to the shared area lives here, so the
//! service loop in `lib.rs` stays transport-agnostic.

use std::sync::Arc;

use bpmp_ipc::{ChannelState, FrameFlags, IvcSharedArea, MessageFrame, RawSharedArea, Side};
use spin::Mutex;

/// Firmware-side view of a shared area
pub(crate) trait RemoteSide: Send + Sync {
    /// Firmware came up: reset shared state and advertise readiness
    fn boot(&self);

    /// Firmware went away
    fn shutdown(&self);

    /// One step of link negotiation; no-op where there is none
    fn sync_links(&self);

    /// Take the next local request on `channel`, once per request
    fn take_request(&self, channel: usize) -> Option<MessageFrame>;

    /// Finish a local request with a reply
    fn complete(&self, channel: usize, request_flags: FrameFlags, code: i32, data: &[u8]);

    /// Start a remote-initiated request on `channel`
    fn post_request(&self, channel: usize, frame: &MessageFrame) -> bool;

    /// Outcome of a remote-initiated request
    ///
    /// `None` while the local side still holds it; `Some(None)` when it was
    /// consumed without a reply frame.
    fn poll_reply(&self, channel: usize, wants_reply: bool) -> Option<Option<MessageFrame>>;
}

pub(crate) struct RawRemote {
    area: Arc<RawSharedArea>,
    /// Queued requests already handed to the service loop
    taken: Mutex<u32>,
}

impl RawRemote {
    pub fn new(area: Arc<RawSharedArea>) -> Self {
        Self {
            area,
            taken: Mutex::new(0),
        }
    }
}

impl RemoteSide for RawRemote {
    fn boot(&self) {
        *self.taken.lock() = 0;
        self.area.state().reset();
        self.area.set_ready(true);
        log::debug!("mock: raw firmware ready");
    }

    fn shutdown(&self) {
        self.area.set_ready(false);
    }

    fn sync_links(&self) {}

    fn take_request(&self, channel: usize) -> Option<MessageFrame> {
        if self.area.state().state(channel).ok()? != ChannelState::Queued {
            return None;
        }
        let mut taken = self.taken.lock();
        let bit = 1u32 << channel;
        if *taken & bit != 0 {
            return None;
        }
        *taken |= bit;
        Some(self.area.outbound_frame(channel).ok()?.load())
    }

    fn complete(&self, channel: usize, _request_flags: FrameFlags, code: i32, data: &[u8]) {
        *self.taken.lock() &= !(1u32 << channel);
        let Ok(frame) = MessageFrame::new(code, FrameFlags::empty(), data) else {
            log::error!("mock: oversized reply on channel {}", channel);
            return;
        };
        if let Ok(slot) = self.area.inbound_frame(channel) {
            slot.store(&frame);
        }
        // The raw protocol acks every request, reply wanted or not
        if let Err(err) = self.area.state().ack(channel) {
            log::warn!("mock: ack on channel {} failed: {}", channel, err);
        }
    }

    fn post_request(&self, channel: usize, frame: &MessageFrame) -> bool {
        match self.area.inbound_frame(channel) {
            Ok(slot) => slot.store(frame),
            Err(_) => return false,
        }
        self.area.state().signal(channel).is_ok()
    }

    fn poll_reply(&self, channel: usize, wants_reply: bool) -> Option<Option<MessageFrame>> {
        if self.area.state().state(channel).ok()? != ChannelState::Free {
            return None;
        }
        if !wants_reply {
            return Some(None);
        }
        Some(Some(self.area.outbound_frame(channel).ok()?.load()))
    }
}

pub(crate) struct IvcRemote {
    area: Arc<IvcSharedArea>,
}

impl IvcRemote {
    pub fn new(area: Arc<IvcSharedArea>) -> Self {
        Self { area }
    }

    fn reset_all(&self) {
        for ch in 0..self.area.channel_count() {
            if let Ok(channel) = self.area.channel(ch) {
                channel.endpoint(Side::Remote).reset();
            }
        }
    }
}

impl RemoteSide for IvcRemote {
    fn boot(&self) {
        self.reset_all();
        log::debug!("mock: ivc firmware ready");
    }

    fn shutdown(&self) {
        self.reset_all();
    }

    fn sync_links(&self) {
        for ch in 0..self.area.channel_count() {
            if let Ok(channel) = self.area.channel(ch) {
                channel.endpoint(Side::Remote).notified();
            }
        }
    }

    fn take_request(&self, channel: usize) -> Option<MessageFrame> {
        let ep = self.area.channel(channel).ok()?.endpoint(Side::Remote);
        if !ep.is_established() {
            return None;
        }
        ep.rx().pop().ok()
    }

    fn complete(&self, channel: usize, request_flags: FrameFlags, code: i32, data: &[u8]) {
        if !request_flags.contains(FrameFlags::DO_ACK) {
            return;
        }
        let Ok(frame) = MessageFrame::new(code, FrameFlags::empty(), data) else {
            log::error!("mock: oversized reply on channel {}", channel);
            return;
        };
        let Ok(ch) = self.area.channel(channel) else {
            return;
        };
        if ch.endpoint(Side::Remote).tx().push(&frame).is_err() {
            log::warn!("mock: reply ring full on channel {}", channel);
        }
    }

    fn post_request(&self, channel: usize, frame: &MessageFrame) -> bool {
        self.area
            .channel(channel)
            .is_ok_and(|ch| ch.endpoint(Side::Remote).tx().push(frame).is_ok())
    }

    fn poll_reply(&self, channel: usize, wants_reply: bool) -> Option<Option<MessageFrame>> {
        let ep = self.area.channel(channel).ok()?.endpoint(Side::Remote);
        if wants_reply {
            ep.rx().pop().ok().map(Some)
        } else if ep.tx().is_empty() {
            Some(None)
        } else {
            None
        }
    }
}
